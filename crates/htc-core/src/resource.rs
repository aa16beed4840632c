//! Opaque payload wrapper for dynamically-typed watched resources
//!
//! Watchers hand the stores arbitrary Kubernetes objects. Rather than
//! generating typed bindings per user-declared kind, the payload stays a
//! JSON value with accessor helpers, which is also the shape the template
//! context exposes.

use jsonpath::Selector;
use serde_json::Value;

use crate::error::{Error, Result};

/// A watched Kubernetes object, stored as raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedObject {
    value: Value,
}

impl WatchedObject {
    /// Wrap a JSON object received from a watch event.
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Borrow the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Consume the wrapper and return the JSON value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// `metadata.namespace`, if present.
    pub fn namespace(&self) -> Option<&str> {
        self.value.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    /// `metadata.name`, if present.
    pub fn name(&self) -> Option<&str> {
        self.value.pointer("/metadata/name").and_then(Value::as_str)
    }

    /// `metadata.uid`, if present.
    pub fn uid(&self) -> Option<&str> {
        self.value.pointer("/metadata/uid").and_then(Value::as_str)
    }

    /// `apiVersion`, if present.
    pub fn api_version(&self) -> Option<&str> {
        self.value.get("apiVersion").and_then(Value::as_str)
    }

    /// `kind`, if present.
    pub fn kind(&self) -> Option<&str> {
        self.value.get("kind").and_then(Value::as_str)
    }

    /// Identity used for update/delete in the stores. Cluster-scoped
    /// objects get an empty namespace component.
    pub fn ident(&self) -> (String, String) {
        (
            self.namespace().unwrap_or_default().to_string(),
            self.name().unwrap_or_default().to_string(),
        )
    }

    /// Evaluate one `indexBy` expression into a single key component.
    ///
    /// Expressions are JSONPath; a bare dotted path (`metadata.name`) is
    /// accepted and treated as rooted at the object. The first match wins
    /// and must be a scalar.
    pub fn extract_key(&self, path: &str) -> Result<String> {
        let (ns, name) = self.ident();
        let normalized = normalize_path(path);
        let selector = Selector::new(&normalized).map_err(|_| Error::JsonPath {
            path: path.to_string(),
            message: "not a valid JSONPath expression".to_string(),
        })?;
        let matched = selector.find(&self.value).next().ok_or_else(|| Error::KeyExtraction {
            path: path.to_string(),
            namespace: ns.clone(),
            name: name.clone(),
            message: "no match".to_string(),
        })?;
        scalar_to_key(matched).ok_or_else(|| Error::KeyExtraction {
            path: path.to_string(),
            namespace: ns,
            name,
            message: format!("matched a non-scalar value: {matched}"),
        })
    }

    /// Evaluate the full `indexBy` list into a key tuple.
    pub fn extract_keys(&self, paths: &[String]) -> Result<Vec<String>> {
        paths.iter().map(|p| self.extract_key(p)).collect()
    }

    /// Remove the given dotted paths from the payload in place.
    ///
    /// Used for `watchedResourcesIgnoreFields` (e.g. `metadata.managedFields`)
    /// so that noisy server-managed fields neither bloat the full store nor
    /// leak into templates. Missing paths are ignored.
    pub fn prune_fields(&mut self, paths: &[String]) {
        for path in paths {
            let segments = split_segments(path);
            if segments.is_empty() {
                continue;
            }
            remove_path(&mut self.value, &segments);
        }
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    }
}

fn scalar_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Split a dotted path into segments, keeping bracketed keys
/// (`metadata.labels['app.kubernetes.io/name']`) intact.
fn split_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;
    for ch in path.chars() {
        match ch {
            '[' => in_bracket = true,
            ']' => in_bracket = false,
            '\'' | '"' if in_bracket => {}
            '.' if !in_bracket => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn remove_path(value: &mut Value, segments: &[String]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut target = value;
    for segment in parents {
        match target.get_mut(segment.as_str()) {
            Some(next) => target = next,
            None => return,
        }
    }
    if let Value::Object(map) = target {
        map.remove(last.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn slice(ns: &str, name: &str, service: &str) -> WatchedObject {
        WatchedObject::new(json!({
            "apiVersion": "discovery.k8s.io/v1",
            "kind": "EndpointSlice",
            "metadata": {
                "namespace": ns,
                "name": name,
                "labels": { "kubernetes.io/service-name": service },
                "managedFields": [{"manager": "kubelet"}],
            },
        }))
    }

    #[test]
    fn accessors_read_metadata() {
        let obj = slice("default", "nginx-slice-1", "nginx");
        assert_eq!(obj.namespace(), Some("default"));
        assert_eq!(obj.name(), Some("nginx-slice-1"));
        assert_eq!(obj.kind(), Some("EndpointSlice"));
        assert_eq!(obj.ident(), ("default".to_string(), "nginx-slice-1".to_string()));
    }

    #[test]
    fn extract_keys_from_dotted_paths() {
        let obj = slice("default", "nginx-slice-1", "nginx");
        let keys = obj
            .extract_keys(&["metadata.namespace".to_string(), "metadata.name".to_string()])
            .unwrap();
        assert_eq!(keys, vec!["default", "nginx-slice-1"]);
    }

    #[test]
    fn extract_key_from_label_with_bracket_syntax() {
        let obj = slice("default", "nginx-slice-1", "nginx");
        let key = obj.extract_key("$.metadata.labels['kubernetes.io/service-name']").unwrap();
        assert_eq!(key, "nginx");
    }

    #[test]
    fn extract_key_missing_path_errors() {
        let obj = slice("default", "nginx-slice-1", "nginx");
        let err = obj.extract_key("metadata.annotations.missing").unwrap_err();
        assert!(matches!(err, Error::KeyExtraction { .. }));
    }

    #[test]
    fn prune_removes_managed_fields() {
        let mut obj = slice("default", "nginx-slice-1", "nginx");
        obj.prune_fields(&["metadata.managedFields".to_string()]);
        assert!(obj.as_value().pointer("/metadata/managedFields").is_none());
        assert_eq!(obj.name(), Some("nginx-slice-1"));
    }

    #[test]
    fn prune_ignores_missing_paths() {
        let mut obj = slice("default", "nginx-slice-1", "nginx");
        obj.prune_fields(&["status.not.there".to_string()]);
        assert_eq!(obj.namespace(), Some("default"));
    }

    #[test]
    fn split_segments_respects_brackets() {
        let segments = split_segments("metadata.labels['app.kubernetes.io/name']");
        assert_eq!(segments, vec!["metadata", "labels", "app.kubernetes.io/name"]);
    }
}
