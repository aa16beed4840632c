//! The render pass

use std::collections::BTreeMap;

use htc_core::{RenderedArtifact, StoreSnapshot};
use htc_crd::{HAProxyTemplateConfigSpec, PostProcessor, Template};
use minijinja::value::Value;
use minijinja::Environment;
use tracing::debug;

use crate::context::StoreView;
use crate::error::{Error, Result};

/// Stateless renderer. One call renders the main configuration and every
/// auxiliary artifact independently against the same context.
pub struct Renderer;

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    /// Create a renderer.
    pub fn new() -> Self {
        Self
    }

    /// Render everything the spec declares against the given snapshots.
    pub fn render(
        &self,
        spec: &HAProxyTemplateConfigSpec,
        stores: &BTreeMap<String, StoreSnapshot>,
        haproxy_pods: &StoreSnapshot,
    ) -> Result<RenderedArtifact> {
        let env = build_environment(spec)?;
        let ctx = build_context(spec, stores, haproxy_pods);

        let main_config = render_one(&env, "haproxyConfig", &spec.haproxy_config, &ctx)?;
        let maps = render_group(&env, "map", &spec.maps, &ctx)?;
        let files = render_group(&env, "file", &spec.files, &ctx)?;
        let certs = render_group(&env, "cert", &spec.ssl_certificates, &ctx)?;

        debug!(
            maps = maps.len(),
            files = files.len(),
            certs = certs.len(),
            "rendered configuration artifacts"
        );
        Ok(RenderedArtifact::new(main_config, maps, files, certs))
    }
}

fn build_environment(spec: &HAProxyTemplateConfigSpec) -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    // Snippets are includable by bare name from any template.
    for (name, snippet) in &spec.template_snippets {
        env.add_template_owned(name.clone(), snippet.template.clone()).map_err(|source| {
            Error::Template { name: format!("snippet {name}"), source }
        })?;
    }
    Ok(env)
}

fn build_context(
    spec: &HAProxyTemplateConfigSpec,
    stores: &BTreeMap<String, StoreSnapshot>,
    haproxy_pods: &StoreSnapshot,
) -> Value {
    let mut ctx: BTreeMap<String, Value> = BTreeMap::new();

    // extraContext keys come first so the reserved keys win on collision.
    for (key, value) in &spec.extra_context {
        ctx.insert(key.clone(), Value::from_serialize(value));
    }

    let resources: BTreeMap<String, Value> = stores
        .iter()
        .map(|(alias, snapshot)| {
            (alias.clone(), Value::from_object(StoreView::new(snapshot.clone())))
        })
        .collect();
    ctx.insert("resources".to_string(), Value::from_iter(resources));

    let controller: BTreeMap<String, Value> = [(
        "haproxy_pods".to_string(),
        Value::from_object(StoreView::new(haproxy_pods.clone())),
    )]
    .into_iter()
    .collect();
    ctx.insert("controller".to_string(), Value::from_iter(controller));

    ctx.insert("template_snippets".to_string(), Value::from_serialize(&snippet_order(spec)));

    Value::from_iter(ctx)
}

/// Snippet names, ascending by priority, ties broken alphabetically.
fn snippet_order(spec: &HAProxyTemplateConfigSpec) -> Vec<String> {
    let mut names: Vec<(&String, i32)> = spec
        .template_snippets
        .iter()
        .map(|(name, snippet)| (name, snippet.priority))
        .collect();
    names.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    names.into_iter().map(|(name, _)| name.clone()).collect()
}

fn render_group(
    env: &Environment<'_>,
    kind: &str,
    templates: &BTreeMap<String, Template>,
    ctx: &Value,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (name, template) in templates {
        let rendered = render_one(env, &format!("{kind} {name}"), template, ctx)?;
        out.insert(name.clone(), rendered);
    }
    Ok(out)
}

fn render_one(
    env: &Environment<'_>,
    name: &str,
    template: &Template,
    ctx: &Value,
) -> Result<String> {
    let rendered = env
        .render_str(&template.template, ctx)
        .map_err(|source| Error::Template { name: name.to_string(), source })?;
    apply_post_processors(rendered, &template.post_processors)
}

fn apply_post_processors(mut text: String, processors: &[PostProcessor]) -> Result<String> {
    for processor in processors {
        match processor {
            PostProcessor::RegexReplace { pattern, replace } => {
                let re = regex::Regex::new(pattern).map_err(|source| Error::PostProcessor {
                    pattern: pattern.clone(),
                    source,
                })?;
                text = re.replace_all(&text, replace.as_str()).into_owned();
            }
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use htc_core::WatchedObject;
    use htc_crd::{CredentialsRef, PodSelector, Snippet, StoreStrategy, WatchedResource};
    use serde_json::json;

    fn spec_with_template(template: &str) -> HAProxyTemplateConfigSpec {
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

    fn empty_stores(spec: &HAProxyTemplateConfigSpec) -> BTreeMap<String, StoreSnapshot> {
        spec.watched_resources
            .iter()
            .map(|(alias, watched)| (alias.clone(), StoreSnapshot::new(watched.index_by.len())))
            .collect()
    }

    #[test]
    fn minimal_render_uses_filter_default() {
        let spec = spec_with_template("global\n  maxconn {{ maxconn | default(2000) }}\n");
        let stores = empty_stores(&spec);
        let artifact = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        assert_eq!(artifact.main_config, "global\n  maxconn 2000\n");
    }

    #[test]
    fn extra_context_feeds_top_level_keys() {
        let mut spec = spec_with_template("global\n  maxconn {{ maxconn | default(2000) }}\n");
        spec.extra_context.insert("maxconn".into(), json!(4000));
        let stores = empty_stores(&spec);
        let artifact = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        assert_eq!(artifact.main_config, "global\n  maxconn 4000\n");
    }

    #[test]
    fn render_is_deterministic() {
        let mut spec = spec_with_template(
            "global\n{% for ing in resources.ingresses.list() %}# {{ ing.metadata.name }}\n{% endfor %}",
        );
        spec.extra_context.insert("env".into(), json!("prod"));
        let mut stores = empty_stores(&spec);
        let snapshot = StoreSnapshot::from_objects(
            &["metadata.namespace".to_string(), "metadata.name".to_string()],
            vec![
                WatchedObject::new(json!({"metadata": {"namespace": "default", "name": "b"}})),
                WatchedObject::new(json!({"metadata": {"namespace": "default", "name": "a"}})),
            ],
        )
        .unwrap();
        stores.insert("ingresses".into(), snapshot);

        let renderer = Renderer::new();
        let first = renderer.render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        let second = renderer.render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        assert_eq!(first.main_config, second.main_config);
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.main_config, "global\n# a\n# b\n");
    }

    #[test]
    fn snippets_include_and_order_by_priority() {
        let mut spec = spec_with_template(
            "{% for name in template_snippets %}{% include name %}{% endfor %}",
        );
        spec.template_snippets.insert(
            "zz-first".into(),
            Snippet { template: "one\n".into(), priority: 10 },
        );
        spec.template_snippets.insert(
            "aa-last".into(),
            Snippet { template: "two\n".into(), priority: 900 },
        );
        spec.template_snippets.insert(
            "aa-mid".into(),
            Snippet { template: "mid\n".into(), priority: 10 },
        );
        let stores = empty_stores(&spec);
        let artifact = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        // Priority 10 ties break alphabetically: aa-mid before zz-first.
        assert_eq!(artifact.main_config, "mid\none\ntwo\n");
    }

    #[test]
    fn maps_render_independently() {
        let mut spec = spec_with_template("global\n");
        spec.maps.insert(
            "hosts.map".into(),
            Template {
                template: "{% for ing in resources.ingresses.list() %}{{ ing.metadata.name }} be\n{% endfor %}".into(),
                post_processors: Vec::new(),
            },
        );
        let mut stores = empty_stores(&spec);
        stores.insert(
            "ingresses".into(),
            StoreSnapshot::from_objects(
                &["metadata.namespace".to_string(), "metadata.name".to_string()],
                vec![WatchedObject::new(json!({"metadata": {"namespace": "default", "name": "web"}}))],
            )
            .unwrap(),
        );
        let artifact = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        assert_eq!(artifact.maps["hosts.map"], "web be\n");
    }

    #[test]
    fn regex_replace_post_processor_applies_in_order() {
        let mut spec = spec_with_template("global\n  maxconn 1000\n");
        spec.haproxy_config.post_processors = vec![
            PostProcessor::RegexReplace { pattern: "1000".into(), replace: "2000".into() },
            PostProcessor::RegexReplace { pattern: "maxconn 2000".into(), replace: "maxconn 3000".into() },
        ];
        let stores = empty_stores(&spec);
        let artifact = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap();
        assert_eq!(artifact.main_config, "global\n  maxconn 3000\n");
    }

    #[test]
    fn template_errors_carry_the_template_name() {
        let spec = spec_with_template("{% for %}");
        let stores = empty_stores(&spec);
        let err = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap_err();
        match err {
            Error::Template { name, .. } => assert_eq!(name, "haproxyConfig"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_post_processor_pattern_errors() {
        let mut spec = spec_with_template("global\n");
        spec.haproxy_config.post_processors =
            vec![PostProcessor::RegexReplace { pattern: "(".into(), replace: "x".into() }];
        let stores = empty_stores(&spec);
        let err = Renderer::new().render(&spec, &stores, &StoreSnapshot::new(2)).unwrap_err();
        assert!(matches!(err, Error::PostProcessor { .. }));
    }

    #[test]
    fn pod_store_is_reachable_as_controller_haproxy_pods() {
        let spec = spec_with_template(
            "# pods: {{ controller.haproxy_pods.list() | length }}\nglobal\n",
        );
        let stores = empty_stores(&spec);
        let pods = StoreSnapshot::from_objects(
            &["metadata.namespace".to_string(), "metadata.name".to_string()],
            vec![WatchedObject::new(json!({"metadata": {"namespace": "lb", "name": "haproxy-0"}}))],
        )
        .unwrap();
        let artifact = Renderer::new().render(&spec, &stores, &pods).unwrap();
        assert!(artifact.main_config.starts_with("# pods: 1\n"));
    }
}
