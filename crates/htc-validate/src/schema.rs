//! Phase 2: element-level schema validation
//!
//! Each structural element that has a Dataplane API schema is marshalled
//! to JSON (nulls stripped, metadata nested) and validated against the
//! version-appropriate embedded schema document. `allOf` compositions and
//! intra-document `$ref`s are resolved by the validator. All violations
//! are accumulated with element-path context before the phase fails.

use std::collections::HashMap;

use htc_haproxy::{to_api_model, Config, DataplaneVersion};
use jsonschema::Validator as SchemaValidator;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};

const SCHEMA_V3_0: &str = include_str!("schemas/v3_0.json");
const SCHEMA_V3_1: &str = include_str!("schemas/v3_1.json");
const SCHEMA_V3_2: &str = include_str!("schemas/v3_2.json");

/// Element kinds with a Dataplane schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ElementKind {
    Server,
    Bind,
    Acl,
    HttpRequestRule,
    HttpResponseRule,
    TcpRequestRule,
    BackendSwitchingRule,
    Filter,
    LogTarget,
    Capture,
    HttpCheck,
}

impl ElementKind {
    const ALL: [Self; 11] = [
        Self::Server,
        Self::Bind,
        Self::Acl,
        Self::HttpRequestRule,
        Self::HttpResponseRule,
        Self::TcpRequestRule,
        Self::BackendSwitchingRule,
        Self::Filter,
        Self::LogTarget,
        Self::Capture,
        Self::HttpCheck,
    ];

    fn definition(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Bind => "bind",
            Self::Acl => "acl",
            Self::HttpRequestRule => "http_request_rule",
            Self::HttpResponseRule => "http_response_rule",
            Self::TcpRequestRule => "tcp_request_rule",
            Self::BackendSwitchingRule => "backend_switching_rule",
            Self::Filter => "filter",
            Self::LogTarget => "log_target",
            Self::Capture => "capture",
            Self::HttpCheck => "http_check",
        }
    }
}

struct SchemaSet {
    validators: HashMap<ElementKind, SchemaValidator>,
}

impl SchemaSet {
    fn build(document: &str) -> Self {
        let definitions: Value =
            serde_json::from_str(document).expect("embedded schema document must parse");
        let mut validators = HashMap::new();
        for kind in ElementKind::ALL {
            // Root the validator at one definition; $ref and allOf resolve
            // against the full document.
            let schema = json!({
                "definitions": definitions["definitions"],
                "$ref": format!("#/definitions/{}", kind.definition()),
            });
            let validator = jsonschema::validator_for(&schema)
                .expect("embedded schema definition must compile");
            validators.insert(kind, validator);
        }
        Self { validators }
    }
}

static SCHEMAS: Lazy<HashMap<DataplaneVersion, SchemaSet>> = Lazy::new(|| {
    HashMap::from([
        (DataplaneVersion::V3_0, SchemaSet::build(SCHEMA_V3_0)),
        (DataplaneVersion::V3_1, SchemaSet::build(SCHEMA_V3_1)),
        (DataplaneVersion::V3_2, SchemaSet::build(SCHEMA_V3_2)),
    ])
});

/// Validate every schema-bearing element of the parsed config.
pub fn check(config: &Config, version: DataplaneVersion) -> Result<()> {
    let schemas = &SCHEMAS[&version];
    let mut errors = Vec::new();

    for frontend in &config.frontends {
        let at = format!("frontend {}", frontend.name);
        validate_all(schemas, ElementKind::Bind, &at, "bind", &frontend.binds, &mut errors);
        validate_all(schemas, ElementKind::Acl, &at, "acl", &frontend.acls, &mut errors);
        validate_all(
            schemas,
            ElementKind::HttpRequestRule,
            &at,
            "http-request rule",
            &frontend.http_request_rules,
            &mut errors,
        );
        validate_all(
            schemas,
            ElementKind::HttpResponseRule,
            &at,
            "http-response rule",
            &frontend.http_response_rules,
            &mut errors,
        );
        validate_all(
            schemas,
            ElementKind::TcpRequestRule,
            &at,
            "tcp-request rule",
            &frontend.tcp_request_rules,
            &mut errors,
        );
        validate_all(
            schemas,
            ElementKind::BackendSwitchingRule,
            &at,
            "use_backend rule",
            &frontend.backend_switching_rules,
            &mut errors,
        );
        validate_all(schemas, ElementKind::Capture, &at, "capture", &frontend.captures, &mut errors);
        validate_all(schemas, ElementKind::Filter, &at, "filter", &frontend.filters, &mut errors);
        validate_all(
            schemas,
            ElementKind::LogTarget,
            &at,
            "log target",
            &frontend.log_targets,
            &mut errors,
        );
    }

    for backend in &config.backends {
        let at = format!("backend {}", backend.name);
        for server in &backend.servers {
            validate_one(
                schemas,
                ElementKind::Server,
                &format!("{at}, server {}", server.name),
                server,
                &mut errors,
            );
        }
        validate_all(schemas, ElementKind::Acl, &at, "acl", &backend.acls, &mut errors);
        validate_all(
            schemas,
            ElementKind::HttpRequestRule,
            &at,
            "http-request rule",
            &backend.http_request_rules,
            &mut errors,
        );
        validate_all(
            schemas,
            ElementKind::HttpResponseRule,
            &at,
            "http-response rule",
            &backend.http_response_rules,
            &mut errors,
        );
        validate_all(
            schemas,
            ElementKind::HttpCheck,
            &at,
            "http-check",
            &backend.http_checks,
            &mut errors,
        );
        validate_all(schemas, ElementKind::Filter, &at, "filter", &backend.filters, &mut errors);
        validate_all(
            schemas,
            ElementKind::LogTarget,
            &at,
            "log target",
            &backend.log_targets,
            &mut errors,
        );
    }

    validate_all(
        schemas,
        ElementKind::LogTarget,
        "global",
        "log target",
        &config.global.log_targets,
        &mut errors,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Schema { errors })
    }
}

fn validate_all<T: Serialize>(
    schemas: &SchemaSet,
    kind: ElementKind,
    at: &str,
    label: &str,
    elements: &[T],
    errors: &mut Vec<String>,
) {
    for (index, element) in elements.iter().enumerate() {
        validate_one(schemas, kind, &format!("{at}, {label} {index}"), element, errors);
    }
}

fn validate_one<T: Serialize>(
    schemas: &SchemaSet,
    kind: ElementKind,
    path: &str,
    element: &T,
    errors: &mut Vec<String>,
) {
    let Some(body) = to_api_model(element) else {
        errors.push(format!("{path}: not representable as an API model"));
        return;
    };
    let validator = &schemas.validators[&kind];
    for violation in validator.iter_errors(&body) {
        let at = violation.instance_path.to_string();
        if at.is_empty() {
            errors.push(format!("{path}: {violation}"));
        } else {
            errors.push(format!("{path}: {violation} (at {at})"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htc_haproxy::parse;

    #[test]
    fn valid_config_passes_all_versions() {
        let config = parse(
            "global\n  maxconn 2000\nfrontend www\n  bind *:80\n  acl is_api path_beg /api\n  use_backend api if is_api\nbackend api\n  server srv1 10.0.0.1:8080 check weight 10\n",
        )
        .unwrap();
        for version in [DataplaneVersion::V3_0, DataplaneVersion::V3_1, DataplaneVersion::V3_2] {
            check(&config, version).unwrap();
        }
    }

    #[test]
    fn auth_realm_with_spaces_is_rejected() {
        let config = parse(
            "frontend www\n  http-request auth realm \"Invalid With Spaces\" if !authed\n",
        )
        .unwrap();
        let err = check(&config, DataplaneVersion::V3_0).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("auth_realm"), "error should name the field: {text}");
        assert!(text.contains("frontend www"));
    }

    #[test]
    fn out_of_range_server_weight_is_rejected_with_path() {
        let config = parse("backend api\n  server srv2 10.0.0.2:8080 weight 9999\n").unwrap();
        let err = check(&config, DataplaneVersion::V3_0).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("backend api, server srv2"));
        assert!(text.contains("weight"));
    }

    #[test]
    fn errors_accumulate_across_elements() {
        let config = parse(
            "backend api\n  server a 10.0.0.1:8080 weight 9999\n  server b 10.0.0.2:8080 rise 0\n",
        )
        .unwrap();
        match check(&config, DataplaneVersion::V3_0).unwrap_err() {
            Error::Schema { errors } => assert!(errors.len() >= 2, "got {errors:?}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn redirect_code_enum_widens_with_version() {
        let config = parse(
            "frontend www\n  http-request redirect location https://example.com code 308\n",
        )
        .unwrap();
        assert!(check(&config, DataplaneVersion::V3_0).is_err());
        assert!(check(&config, DataplaneVersion::V3_1).is_ok());
        assert!(check(&config, DataplaneVersion::V3_2).is_ok());
    }
}
