//! Template-side store access

use std::sync::Arc;

use htc_core::StoreSnapshot;
use minijinja::value::{Object, Value};
use minijinja::{Error as MjError, ErrorKind, State};

/// Wrapper exposing a [`StoreSnapshot`] to templates as
/// `resources.<alias>` with `list()` and `get(keys...)` methods. `get`
/// accepts one to arity key components; fewer than arity is a prefix
/// fetch.
#[derive(Debug)]
pub struct StoreView {
    snapshot: StoreSnapshot,
}

impl StoreView {
    /// Wrap a snapshot.
    pub fn new(snapshot: StoreSnapshot) -> Self {
        Self { snapshot }
    }

    fn list_values(&self) -> Value {
        Value::from_iter(
            self.snapshot
                .list()
                .iter()
                .map(|payload| Value::from_serialize(payload.as_value())),
        )
    }

    fn get_values(&self, args: &[Value]) -> Result<Value, MjError> {
        let mut prefix = Vec::with_capacity(args.len());
        for arg in args {
            match arg.as_str() {
                Some(s) => prefix.push(s.to_string()),
                None => prefix.push(arg.to_string()),
            }
        }
        let hits = self.snapshot.get(&prefix).map_err(|e| {
            MjError::new(ErrorKind::InvalidOperation, format!("store get failed: {e}"))
        })?;
        Ok(Value::from_iter(
            hits.iter().map(|payload| Value::from_serialize(payload.as_value())),
        ))
    }
}

impl Object for StoreView {
    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, MjError> {
        match method {
            "list" => Ok(self.list_values()),
            "get" => self.get_values(args),
            other => Err(MjError::new(
                ErrorKind::UnknownMethod,
                format!("store views have no method {other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htc_core::WatchedObject;
    use minijinja::context;
    use serde_json::json;

    fn snapshot() -> StoreSnapshot {
        StoreSnapshot::from_objects(
            &["metadata.namespace".to_string(), "metadata.name".to_string()],
            vec![
                WatchedObject::new(json!({"metadata": {"namespace": "default", "name": "web"}})),
                WatchedObject::new(json!({"metadata": {"namespace": "default", "name": "api"}})),
            ],
        )
        .unwrap()
    }

    #[test]
    fn list_and_get_are_callable_from_templates() {
        let mut env = minijinja::Environment::new();
        env.add_template("t", "{{ store.list() | length }}:{{ store.get('default', 'api') | length }}")
            .unwrap();
        let rendered = env
            .get_template("t")
            .unwrap()
            .render(context! { store => Value::from_object(StoreView::new(snapshot())) })
            .unwrap();
        assert_eq!(rendered, "2:1");
    }

    #[test]
    fn prefix_get_from_template() {
        let mut env = minijinja::Environment::new();
        env.add_template("t", "{% for o in store.get('default') %}{{ o.metadata.name }} {% endfor %}")
            .unwrap();
        let rendered = env
            .get_template("t")
            .unwrap()
            .render(context! { store => Value::from_object(StoreView::new(snapshot())) })
            .unwrap();
        assert_eq!(rendered, "api web ");
    }
}
