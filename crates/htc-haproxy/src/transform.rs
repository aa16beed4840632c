//! JSON-based model transforms
//!
//! The parser's model and the Dataplane API bodies differ in two ways:
//! nulls must be omitted (the API treats absent and null differently), and
//! metadata is flat `{key: value}` on the parser side but nested
//! `{key: {"value": value}}` on the API side. A transform that cannot
//! produce a JSON object returns `None`, which the synchronizer treats as
//! the signal to fall back to a raw config push.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::Metadata;

/// Serialize a model into the Dataplane request body shape: nulls stripped,
/// metadata nested. `None` means the model is structurally incompatible —
/// a signal, not a panic.
pub fn to_api_model<T: Serialize>(model: &T) -> Option<Value> {
    let mut value = serde_json::to_value(model).ok()?;
    strip_nulls(&mut value);
    let Value::Object(ref mut map) = value else {
        return None;
    };
    if let Some(metadata) = map.remove("metadata") {
        let Value::Object(flat) = metadata else {
            return None;
        };
        let flat: BTreeMap<String, Value> = flat.into_iter().collect();
        map.insert("metadata".to_string(), metadata_to_api(&flat));
    }
    Some(value)
}

/// Flat `{key: value}` to the API's `{key: {"value": value}}`.
pub fn metadata_to_api(flat: &Metadata) -> Value {
    let mut nested = Map::new();
    for (key, value) in flat {
        let mut wrapper = Map::new();
        wrapper.insert("value".to_string(), value.clone());
        nested.insert(key.clone(), Value::Object(wrapper));
    }
    Value::Object(nested)
}

/// The API's nested metadata back to the parser's flat shape. `None` when
/// the input does not have the expected wrapper layout.
pub fn metadata_from_api(nested: &Value) -> Option<Metadata> {
    let map = nested.as_object()?;
    let mut flat = Metadata::new();
    for (key, wrapper) in map {
        let value = wrapper.as_object()?.get("value")?;
        flat.insert(key.clone(), value.clone());
    }
    Some(flat)
}

/// Recursively remove `null` members so the body matches the API's
/// field-omission semantics.
pub fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                strip_nulls(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_nulls(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Server;
    use serde_json::json;

    #[test]
    fn nulls_are_stripped_from_api_bodies() {
        let server = Server {
            name: "srv1".into(),
            address: "10.0.0.1".into(),
            port: Some(8080),
            ..Server::default()
        };
        let body = to_api_model(&server).unwrap();
        assert_eq!(body, json!({"name": "srv1", "address": "10.0.0.1", "port": 8080}));
    }

    #[test]
    fn metadata_round_trips_through_both_shapes() {
        let mut flat = Metadata::new();
        flat.insert("owner".into(), json!("team-edge"));
        flat.insert("weight".into(), json!(10));

        let nested = metadata_to_api(&flat);
        assert_eq!(
            nested,
            json!({"owner": {"value": "team-edge"}, "weight": {"value": 10}})
        );
        assert_eq!(metadata_from_api(&nested).unwrap(), flat);
    }

    #[test]
    fn server_metadata_is_nested_in_api_body() {
        let mut metadata = Metadata::new();
        metadata.insert("owner".into(), json!("team-edge"));
        let server = Server {
            name: "srv1".into(),
            address: "10.0.0.1".into(),
            metadata: Some(metadata),
            ..Server::default()
        };
        let body = to_api_model(&server).unwrap();
        assert_eq!(body["metadata"], json!({"owner": {"value": "team-edge"}}));
    }

    #[test]
    fn non_object_transform_is_a_nil_signal() {
        assert!(to_api_model(&"just a string").is_none());
        assert!(metadata_from_api(&json!({"bad": "flat"})).is_none());
    }

    #[test]
    fn strip_nulls_recurses_into_arrays() {
        let mut value = json!({"list": [{"a": 1, "b": null}], "n": null});
        strip_nulls(&mut value);
        assert_eq!(value, json!({"list": [{"a": 1}]}));
    }
}
