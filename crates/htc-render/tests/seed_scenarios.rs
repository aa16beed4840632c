//! End-to-end render scenarios over the public API

use std::collections::BTreeMap;

use htc_core::{checksum::content_checksum, StoreSnapshot};
use htc_crd::{
    CredentialsRef, HAProxyTemplateConfigSpec, PodSelector, StoreStrategy, Template,
    WatchedResource,
};
use htc_render::Renderer;

fn minimal_spec(template: &str) -> HAProxyTemplateConfigSpec {
    let mut watched = BTreeMap::new();
    watched.insert(
        "ingresses".to_string(),
        WatchedResource {
            api_version: "networking.k8s.io/v1".into(),
            resources: "ingresses".into(),
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
        haproxy_config: Template { template: template.into(), post_processors: Vec::new() },
        maps: BTreeMap::new(),
        files: BTreeMap::new(),
        ssl_certificates: BTreeMap::new(),
        template_snippets: BTreeMap::new(),
        extra_context: BTreeMap::new(),
        validation_tests: Vec::new(),
        operational: Default::default(),
    }
}

fn stores(spec: &HAProxyTemplateConfigSpec) -> BTreeMap<String, StoreSnapshot> {
    spec.watched_resources
        .iter()
        .map(|(alias, watched)| (alias.clone(), StoreSnapshot::new(watched.index_by.len())))
        .collect()
}

#[test]
fn minimal_config_with_no_ingresses_renders_the_default() {
    // One watched Ingress kind, no ingresses present: the filter default
    // fills in and the output is byte-exact.
    let spec = minimal_spec("global\n  maxconn {{ maxconn | default(2000) }}\n");
    let artifact = Renderer::new()
        .render(&spec, &stores(&spec), &StoreSnapshot::new(1))
        .unwrap();
    assert_eq!(artifact.main_config, "global\n  maxconn 2000\n");
}

#[test]
fn template_update_changes_output_and_checksum() {
    let before = minimal_spec("global\n  maxconn {{ maxconn | default(2000) }}\n");
    let after = minimal_spec("global\n  maxconn {{ maxconn | default(4000) }}\n");
    let renderer = Renderer::new();

    let first = renderer.render(&before, &stores(&before), &StoreSnapshot::new(1)).unwrap();
    let second = renderer.render(&after, &stores(&after), &StoreSnapshot::new(1)).unwrap();

    assert!(second.main_config.contains("maxconn 4000"));
    assert_ne!(first.checksum, second.checksum);
    // The artifact checksum is exactly the digest the per-pod deployment
    // status compares against.
    assert_eq!(second.checksum, content_checksum(&second.main_config));
}

#[test]
fn repeated_renders_are_byte_identical() {
    let spec = minimal_spec(
        "global\n  maxconn 2000\n{% for ing in resources.ingresses.list() %}# {{ ing.metadata.namespace }}/{{ ing.metadata.name }}\n{% endfor %}",
    );
    let renderer = Renderer::new();
    let stores = stores(&spec);
    let a = renderer.render(&spec, &stores, &StoreSnapshot::new(1)).unwrap();
    let b = renderer.render(&spec, &stores, &StoreSnapshot::new(1)).unwrap();
    assert_eq!(a.main_config, b.main_config);
    assert_eq!(a.checksum, b.checksum);
    assert_eq!(a.maps, b.maps);
}
