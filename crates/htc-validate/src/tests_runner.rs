//! Configured template unit tests
//!
//! Each test renders the spec against fixture stores and asserts on the
//! produced main configuration. These run after the three phases and in
//! webhook dry-runs; they never touch the cluster.

use std::collections::BTreeMap;

use htc_core::{StoreSnapshot, WatchedObject};
use htc_crd::HAProxyTemplateConfigSpec;
use htc_render::Renderer;
use tracing::debug;

use crate::error::{Error, Result};

/// Run every configured validation test.
pub fn run(spec: &HAProxyTemplateConfigSpec, haproxy_pods: &StoreSnapshot) -> Result<()> {
    let renderer = Renderer::new();
    for test in &spec.validation_tests {
        let mut stores = BTreeMap::new();
        for (alias, watched) in &spec.watched_resources {
            let objects: Vec<WatchedObject> = test
                .fixtures
                .get(alias)
                .map(|fixtures| fixtures.iter().cloned().map(WatchedObject::new).collect())
                .unwrap_or_default();
            let snapshot =
                StoreSnapshot::from_objects(&watched.index_by, objects).map_err(|e| Error::Test {
                    name: test.name.clone(),
                    message: format!("fixture for alias {alias:?}: {e}"),
                })?;
            stores.insert(alias.clone(), snapshot);
        }

        let artifact = renderer.render(spec, &stores, haproxy_pods).map_err(|e| Error::Test {
            name: test.name.clone(),
            message: format!("render failed: {e}"),
        })?;

        for expected in &test.expect_contains {
            if !artifact.main_config.contains(expected) {
                return Err(Error::Test {
                    name: test.name.clone(),
                    message: format!("rendered config does not contain {expected:?}"),
                });
            }
        }
        for unexpected in &test.expect_not_contains {
            if artifact.main_config.contains(unexpected) {
                return Err(Error::Test {
                    name: test.name.clone(),
                    message: format!("rendered config must not contain {unexpected:?}"),
                });
            }
        }
        debug!(test = %test.name, "validation test passed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use htc_crd::{
        CredentialsRef, PodSelector, StoreStrategy, Template, ValidationTest, WatchedResource,
    };
    use serde_json::json;

    fn spec() -> HAProxyTemplateConfigSpec {
        let mut watched = BTreeMap::new();
        watched.insert(
            "services".to_string(),
            WatchedResource {
                api_version: "v1".into(),
                resources: "services".into(),
                enable_validation_webhook: false,
                index_by: vec!["metadata.namespace".into(), "metadata.name".into()],
                label_selector: None,
                field_selector: None,
                namespace_selector: None,
                store: StoreStrategy::Full,
                cache_ttl_seconds: 300,
            },
        );
        HAProxyTemplateConfigSpec {
            pod_selector: PodSelector::default(),
            credentials: CredentialsRef { secret_name: "auth".into(), secret_namespace: None },
            watched_resources: watched,
            haproxy_config: Template {
                template: "global\n{% for svc in resources.services.list() %}# svc {{ svc.metadata.name }}\n{% endfor %}".into(),
                post_processors: Vec::new(),
            },
            maps: BTreeMap::new(),
            files: BTreeMap::new(),
            ssl_certificates: BTreeMap::new(),
            template_snippets: BTreeMap::new(),
            extra_context: BTreeMap::new(),
            validation_tests: Vec::new(),
            operational: Default::default(),
        }
    }

    fn fixture_test(expect: &str) -> ValidationTest {
        let mut fixtures = BTreeMap::new();
        fixtures.insert(
            "services".to_string(),
            vec![json!({"metadata": {"namespace": "default", "name": "web"}})],
        );
        ValidationTest {
            name: "renders-services".into(),
            description: None,
            fixtures,
            expect_contains: vec![expect.to_string()],
            expect_not_contains: vec![],
        }
    }

    #[test]
    fn passing_test_passes() {
        let mut spec = spec();
        spec.validation_tests.push(fixture_test("# svc web"));
        run(&spec, &StoreSnapshot::new(2)).unwrap();
    }

    #[test]
    fn failing_expectation_names_the_test() {
        let mut spec = spec();
        spec.validation_tests.push(fixture_test("# svc missing"));
        let err = run(&spec, &StoreSnapshot::new(2)).unwrap_err();
        match err {
            Error::Test { name, message } => {
                assert_eq!(name, "renders-services");
                assert!(message.contains("does not contain"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn expect_not_contains_is_enforced() {
        let mut spec = spec();
        let mut test = fixture_test("# svc web");
        test.expect_not_contains = vec!["# svc web".to_string()];
        spec.validation_tests.push(test);
        assert!(run(&spec, &StoreSnapshot::new(2)).is_err());
    }
}
