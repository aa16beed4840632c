//! Admission webhook
//!
//! Serves `POST /validate` over TLS on every replica. Each AdmissionReview
//! overlays the candidate object into frozen store snapshots, re-runs the
//! renderer and all three validation phases, and answers allow/deny with
//! the first error's text. The `ValidatingWebhookConfiguration` is created
//! by the controller on startup and removed on shutdown.
//!
//! k8s-openapi does not ship the admission review types, so the wire
//! structs are defined here.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use htc_core::{StoreSnapshot, WatchedObject};
use htc_crd::{HAProxyTemplateConfig, HAProxyTemplateConfigSpec};
use htc_validate::Validator;
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{Error, Result};

const WEBHOOK_NAME: &str = "haproxy-template-ic.github.io";

/// AdmissionReview envelope (v1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    /// `admission.k8s.io/v1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// `AdmissionReview`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// The request half, present on incoming reviews
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    /// The response half, present on outgoing reviews
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

/// The request half of an AdmissionReview.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Request uid, echoed in the response
    pub uid: String,
    /// `CREATE`, `UPDATE` or `DELETE`
    pub operation: String,
    /// Group/version/plural of the object
    pub resource: RequestResource,
    /// Object name (always set for DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Object namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The candidate object (absent on DELETE)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
}

/// GVR of the object under review.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestResource {
    /// API group, empty for core
    #[serde(default)]
    pub group: String,
    /// API version
    #[serde(default)]
    pub version: String,
    /// Plural resource name
    #[serde(default)]
    pub resource: String,
}

/// The response half of an AdmissionReview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Request uid this response answers
    pub uid: String,
    /// Whether the object is admitted
    pub allowed: bool,
    /// Denial details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl AdmissionResponse {
    fn allow(uid: String) -> Self {
        Self { uid, allowed: true, status: None }
    }

    fn deny(uid: String, message: String) -> Self {
        Self {
            uid,
            allowed: false,
            status: Some(Status { message: Some(message), ..Status::default() }),
        }
    }
}

/// State shared with the webhook handlers: the current config and live
/// store snapshots, maintained by the controller.
pub struct WebhookState {
    /// Current controller config, if one is loaded
    pub config: RwLock<Option<Arc<HAProxyTemplateConfig>>>,
    /// Snapshot provider backed by the watcher stores
    pub snapshots: RwLock<BTreeMap<String, StoreSnapshot>>,
    /// Snapshot of the HAProxy pod store
    pub pods: RwLock<StoreSnapshot>,
    /// Validator (sandbox + binary path)
    pub validator: Validator,
}

/// Router serving `POST /validate`.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/validate", post(validate_handler)).with_state(state)
}

async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    let response = match review.request {
        Some(request) => {
            let uid = request.uid.clone();
            match dry_run(&state, request).await {
                Ok(()) => AdmissionResponse::allow(uid),
                Err(e) => {
                    let message =
                        format!("admission webhook \"{WEBHOOK_NAME}\" denied the request: {e}");
                    debug!(%message, "denying admission");
                    AdmissionResponse::deny(uid, message)
                }
            }
        }
        None => AdmissionResponse::deny(
            String::new(),
            "missing request in AdmissionReview".to_string(),
        ),
    };
    Json(AdmissionReview {
        api_version: Some("admission.k8s.io/v1".to_string()),
        kind: Some("AdmissionReview".to_string()),
        request: None,
        response: Some(response),
    })
}

/// Run the full pipeline against the candidate. `Ok(())` admits.
async fn dry_run(state: &WebhookState, request: AdmissionRequest) -> Result<()> {
    let Some(config) = state.config.read().await.clone() else {
        // No config loaded yet; nothing to validate against.
        return Ok(());
    };

    // Candidate controller configs are validated as a whole replacement.
    if request.resource.group == htc_crd::API_GROUP
        && request.resource.resource == "haproxytemplateconfigs"
    {
        return dry_run_config(state, &request).await;
    }

    let Some((alias, watched)) = config.spec.watched_resources.iter().find(|(_, w)| {
        w.resources == request.resource.resource && w.enable_validation_webhook
    }) else {
        return Ok(());
    };

    let mut snapshots = state.snapshots.read().await.clone();
    let snapshot = snapshots
        .entry(alias.clone())
        .or_insert_with(|| StoreSnapshot::new(watched.index_by.len()));

    let ident = (
        request.namespace.clone().unwrap_or_default(),
        request.name.clone().unwrap_or_default(),
    );
    match request.operation.as_str() {
        "DELETE" => {
            snapshot.retain(|_, payload| payload.ident() != ident);
        }
        _ => {
            let Some(object) = request.object.clone() else {
                return Ok(());
            };
            let candidate = WatchedObject::new(object);
            let candidate_ident = candidate.ident();
            let keys = candidate.extract_keys(&watched.index_by).map_err(Error::Core)?;
            snapshot.retain(|_, payload| payload.ident() != candidate_ident);
            snapshot.push(keys, Arc::new(candidate));
            snapshot.sort();
        }
    }

    render_and_validate(state, &config.spec, &snapshots).await
}

async fn dry_run_config(state: &WebhookState, request: &AdmissionRequest) -> Result<()> {
    if request.operation == "DELETE" {
        return Ok(());
    }
    let Some(object) = request.object.clone() else {
        return Ok(());
    };
    let candidate: HAProxyTemplateConfig = serde_json::from_value(object)?;
    candidate.spec.validate()?;
    let snapshots = state.snapshots.read().await.clone();
    render_and_validate(state, &candidate.spec, &snapshots).await
}

async fn render_and_validate(
    state: &WebhookState,
    spec: &HAProxyTemplateConfigSpec,
    snapshots: &BTreeMap<String, StoreSnapshot>,
) -> Result<()> {
    let pods = state.pods.read().await.clone();
    let artifact = htc_render::Renderer::new().render(spec, snapshots, &pods)?;
    state
        .validator
        .validate(&artifact, &spec.operational.resource_dirs, htc_haproxy::DataplaneVersion::OLDEST)
        .await?;
    state.validator.run_validation_tests(spec, &pods)?;
    Ok(())
}

/// Serve the webhook over TLS, reloading the certificate when the mounted
/// secret rotates.
pub async fn serve(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    mut cert_updates: mpsc::Receiver<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let tls = RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| Error::WebhookCert(e.to_string()))?;

    let reload_tls = tls.clone();
    tokio::spawn(async move {
        while let Some((cert, key)) = cert_updates.recv().await {
            match reload_tls.reload_from_pem(cert, key).await {
                Ok(()) => info!("webhook certificate rotated"),
                Err(e) => warn!(error = %e, "webhook certificate rotation failed"),
            }
        }
    });

    info!(%addr, "admission webhook listening");
    axum_server::bind_rustls(addr, tls)
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| Error::WebhookCert(e.to_string()))
}

/// Create (or update) the `ValidatingWebhookConfiguration` covering the
/// controller CRD and every watched resource with the webhook enabled.
pub async fn ensure_configuration(
    client: &Client,
    config: &HAProxyTemplateConfig,
    service_namespace: &str,
    service_name: &str,
    port: u16,
    ca_bundle_pem: &[u8],
) -> Result<()> {
    let name = configuration_name(&config.name_any());
    let mut rules = vec![RuleWithOperations {
        api_groups: Some(vec![htc_crd::API_GROUP.to_string()]),
        api_versions: Some(vec![htc_crd::API_VERSION.to_string()]),
        resources: Some(vec!["haproxytemplateconfigs".to_string()]),
        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
        scope: Some("Namespaced".to_string()),
    }];
    for watched in config.spec.watched_resources.values() {
        if !watched.enable_validation_webhook {
            continue;
        }
        let (group, version) = match watched.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), watched.api_version.clone()),
        };
        rules.push(RuleWithOperations {
            api_groups: Some(vec![group]),
            api_versions: Some(vec![version]),
            resources: Some(vec![watched.resources.clone()]),
            operations: Some(vec![
                "CREATE".to_string(),
                "UPDATE".to_string(),
                "DELETE".to_string(),
            ]),
            scope: Some("*".to_string()),
        });
    }

    let configuration = ValidatingWebhookConfiguration {
        metadata: ObjectMeta { name: Some(name.clone()), ..ObjectMeta::default() },
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("validate.{WEBHOOK_NAME}"),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: "None".to_string(),
            failure_policy: Some("Fail".to_string()),
            timeout_seconds: Some(10),
            client_config: WebhookClientConfig {
                service: Some(ServiceReference {
                    namespace: service_namespace.to_string(),
                    name: service_name.to_string(),
                    path: Some("/validate".to_string()),
                    port: Some(i32::from(port)),
                }),
                // ByteString handles the base64 encoding on serialization.
                ca_bundle: Some(k8s_openapi::ByteString(ca_bundle_pem.to_vec())),
                url: None,
            },
            rules: Some(rules),
            ..ValidatingWebhook::default()
        }]),
    };

    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    api.patch(
        &name,
        &PatchParams::apply("haproxy-template-controller").force(),
        &Patch::Apply(&configuration),
    )
    .await?;
    info!(configuration = %name, "validating webhook configuration applied");
    Ok(())
}

/// Remove the webhook configuration (graceful shutdown).
pub async fn remove_configuration(client: &Client, config_name: &str) -> Result<()> {
    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let _ = api.delete(&configuration_name(config_name), &DeleteParams::default()).await;
    Ok(())
}

fn configuration_name(config_name: &str) -> String {
    format!("haproxy-template-controller-{config_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use htc_crd::{CredentialsRef, PodSelector, StoreStrategy, Template, WatchedResource};
    use serde_json::json;

    fn test_state(template: &str) -> Arc<WebhookState> {
        let mut watched = BTreeMap::new();
        watched.insert(
            "ingresses".to_string(),
            WatchedResource {
                api_version: "networking.k8s.io/v1".into(),
                resources: "ingresses".into(),
                enable_validation_webhook: true,
                index_by: vec!["metadata.namespace".into(), "metadata.name".into()],
                label_selector: None,
                field_selector: None,
                namespace_selector: None,
                store: StoreStrategy::Full,
                cache_ttl_seconds: 300,
            },
        );
        let spec = HAProxyTemplateConfigSpec {
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
        };
        let config = HAProxyTemplateConfig::new("edge", spec);
        let tmp = std::env::temp_dir().join(format!("htc-webhook-test-{}", std::process::id()));
        Arc::new(WebhookState {
            config: RwLock::new(Some(Arc::new(config))),
            snapshots: RwLock::new(BTreeMap::new()),
            pods: RwLock::new(StoreSnapshot::new(1)),
            validator: Validator { haproxy_bin: "true".to_string(), sandbox_root: tmp },
        })
    }

    fn ingress_request(realm: &str) -> AdmissionRequest {
        AdmissionRequest {
            uid: "uid-1".into(),
            operation: "CREATE".into(),
            resource: RequestResource {
                group: "networking.k8s.io".into(),
                version: "v1".into(),
                resource: "ingresses".into(),
            },
            name: Some("web".into()),
            namespace: Some("default".into()),
            object: Some(json!({
                "metadata": {
                    "namespace": "default",
                    "name": "web",
                    "annotations": {"auth-realm": realm},
                },
            })),
        }
    }

    #[tokio::test]
    async fn valid_candidate_is_allowed() {
        let state = test_state("global\n  maxconn 2000\n");
        let review = AdmissionReview {
            api_version: None,
            kind: None,
            request: Some(ingress_request("internal")),
            response: None,
        };
        let Json(out) = validate_handler(State(state), Json(review)).await;
        let response = out.response.unwrap();
        assert!(response.allowed);
        assert_eq!(response.uid, "uid-1");
    }

    #[tokio::test]
    async fn schema_violating_candidate_is_denied_with_field_name() {
        // The template turns the annotation into an auth realm; a realm
        // with spaces violates the dataplane schema.
        let template = "frontend www\n{% for ing in resources.ingresses.list() %}  http-request auth realm \"{{ ing.metadata.annotations['auth-realm'] }}\"\n{% endfor %}";
        let state = test_state(template);
        let review = AdmissionReview {
            api_version: None,
            kind: None,
            request: Some(ingress_request("Invalid With Spaces")),
            response: None,
        };
        let Json(out) = validate_handler(State(state), Json(review)).await;
        let response = out.response.unwrap();
        assert!(!response.allowed);
        let message = response.status.unwrap().message.unwrap();
        assert!(message.contains("admission webhook"), "message: {message}");
        assert!(message.contains("auth_realm"), "message: {message}");
    }

    #[tokio::test]
    async fn unrelated_resources_are_allowed() {
        let state = test_state("global\n");
        let mut request = ingress_request("x");
        request.resource.resource = "configmaps".into();
        let review = AdmissionReview {
            api_version: None,
            kind: None,
            request: Some(request),
            response: None,
        };
        let Json(out) = validate_handler(State(state), Json(review)).await;
        assert!(out.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn invalid_config_candidate_is_denied() {
        let state = test_state("global\n  maxconn 2000\n");
        let mut bad_config = serde_json::to_value(
            state.config.read().await.clone().unwrap().as_ref(),
        )
        .unwrap();
        bad_config["spec"]["haproxyConfig"]["template"] = json!("");
        let request = AdmissionRequest {
            uid: "uid-2".into(),
            operation: "UPDATE".into(),
            resource: RequestResource {
                group: htc_crd::API_GROUP.into(),
                version: htc_crd::API_VERSION.into(),
                resource: "haproxytemplateconfigs".into(),
            },
            name: Some("edge".into()),
            namespace: Some("default".into()),
            object: Some(bad_config),
        };
        let review = AdmissionReview {
            api_version: None,
            kind: None,
            request: Some(request),
            response: None,
        };
        let Json(out) = validate_handler(State(state), Json(review)).await;
        assert!(!out.response.unwrap().allowed);
    }
}
