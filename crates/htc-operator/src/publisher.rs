//! CRD publisher
//!
//! Projects rendered and deployment state into the output resources: one
//! `HAProxyCfg` per config, one `HAProxyMapFile` per rendered map, one
//! `Secret` per rendered certificate. Everything is owner-referenced to
//! the `HAProxyTemplateConfig` so deletion cascades. Only the leader
//! replica constructs a publisher.

use chrono::Utc;
use htc_core::RenderedArtifact;
use htc_crd::{
    invalid_name, map_file::parse_entries, upsert_condition, ArtifactMetadata, AuxiliaryFiles,
    Condition, DeploymentStatus, HAProxyCfg, HAProxyCfgSpec, HAProxyMapFile, HAProxyMapFileSpec,
    HAProxyTemplateConfig, ValidationStatus,
};
use htc_sync::{PodSyncReport, SyncOutcome};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::Result;

const MANAGER: &str = "haproxy-template-controller";
const OWNED_BY_LABEL: &str = "haproxy-template-ic.github.io/owned-by";

/// Writes the controller's output resources.
pub struct Publisher {
    client: Client,
}

impl Publisher {
    /// Publisher using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(MANAGER).force()
    }

    /// Publish a validated artifact: upsert the `HAProxyCfg`, map files
    /// and cert secrets, delete the `-invalid` sibling and stale children.
    pub async fn publish_valid(
        &self,
        owner: &HAProxyTemplateConfig,
        artifact: &RenderedArtifact,
        maps_dir: &str,
        config_file: &str,
    ) -> Result<()> {
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());
        let name = owner.name_any();
        let owner_ref = owner.controller_owner_ref(&());

        let mut labels = BTreeMap::new();
        labels.insert(OWNED_BY_LABEL.to_string(), name.clone());

        let map_names: Vec<String> =
            artifact.maps.keys().map(|m| map_resource_name(&name, m)).collect();
        let secret_names: Vec<String> =
            artifact.certs.keys().map(|c| cert_secret_name(&name, c)).collect();

        let cfg = HAProxyCfg {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: owner_ref.clone().map(|r| vec![r]),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: HAProxyCfgSpec {
                path: config_file.to_string(),
                content: artifact.main_config.clone(),
                checksum: artifact.checksum.clone(),
            },
            status: None,
        };
        let cfg_api: Api<HAProxyCfg> = Api::namespaced(self.client.clone(), &namespace);
        cfg_api.patch(&name, &Self::apply_params(), &Patch::Apply(&cfg)).await?;

        let status = json!({
            "status": {
                "auxiliaryFiles": AuxiliaryFiles {
                    map_files: map_names.clone(),
                    secrets: secret_names.clone(),
                },
                "metadata": ArtifactMetadata {
                    main_config_bytes: artifact.main_config.len() as u64,
                    map_count: artifact.maps.len() as u32,
                    cert_count: artifact.certs.len() as u32,
                    file_count: artifact.files.len() as u32,
                    rendered_at: Some(artifact.rendered_at),
                },
                "validationError": null,
            }
        });
        cfg_api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status)).await?;

        // The applied name is now valid; drop the failure sibling.
        let _ = cfg_api.delete(&invalid_name(&name), &DeleteParams::default()).await;

        let map_api: Api<HAProxyMapFile> = Api::namespaced(self.client.clone(), &namespace);
        for (map_name, content) in &artifact.maps {
            let resource_name = map_resource_name(&name, map_name);
            let map_file = HAProxyMapFile {
                metadata: ObjectMeta {
                    name: Some(resource_name.clone()),
                    namespace: Some(namespace.clone()),
                    owner_references: owner_ref.clone().map(|r| vec![r]),
                    labels: Some(labels.clone()),
                    ..ObjectMeta::default()
                },
                spec: HAProxyMapFileSpec {
                    map_name: map_name.clone(),
                    path: format!("{}/{}", maps_dir.trim_end_matches('/'), map_name),
                    entries: parse_entries(content),
                    checksum: htc_core::checksum::content_checksum(content),
                },
                status: None,
            };
            map_api
                .patch(&resource_name, &Self::apply_params(), &Patch::Apply(&map_file))
                .await?;
        }

        let secret_api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        for (cert_name, pem) in &artifact.certs {
            let resource_name = cert_secret_name(&name, cert_name);
            let mut string_data = BTreeMap::new();
            string_data.insert("tls.pem".to_string(), pem.clone());
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(resource_name.clone()),
                    namespace: Some(namespace.clone()),
                    owner_references: owner_ref.clone().map(|r| vec![r]),
                    labels: Some(labels.clone()),
                    ..ObjectMeta::default()
                },
                string_data: Some(string_data),
                ..Secret::default()
            };
            secret_api
                .patch(&resource_name, &Self::apply_params(), &Patch::Apply(&secret))
                .await?;
        }

        self.delete_stale(&namespace, &name, &map_names, &secret_names).await?;
        info!(config = %name, checksum = %artifact.checksum, "published runtime configuration");
        Ok(())
    }

    /// Publish the `-invalid` sibling carrying a validation failure.
    pub async fn publish_invalid(
        &self,
        owner: &HAProxyTemplateConfig,
        error_text: &str,
    ) -> Result<()> {
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());
        let name = invalid_name(&owner.name_any());
        let cfg = HAProxyCfg {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
                ..ObjectMeta::default()
            },
            spec: HAProxyCfgSpec {
                path: String::new(),
                content: String::new(),
                checksum: String::new(),
            },
            status: None,
        };
        let api: Api<HAProxyCfg> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &Self::apply_params(), &Patch::Apply(&cfg)).await?;
        let status = json!({"status": {"validationError": error_text}});
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status)).await?;
        warn!(config = %owner.name_any(), "published invalid runtime configuration");
        Ok(())
    }

    /// Reflect a validation outcome into the `HAProxyTemplateConfig`
    /// status.
    pub async fn update_config_status(
        &self,
        owner: &HAProxyTemplateConfig,
        validation: ValidationStatus,
        message: Option<String>,
    ) -> Result<()> {
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());
        let name = owner.name_any();
        let mut status = owner.status.clone().unwrap_or_default();
        status.observed_generation = owner.metadata.generation;
        status.last_validated = Some(Utc::now());
        status.validation_status = validation;
        status.validation_message = message.clone();

        let mut conditions = status.conditions.take().unwrap_or_default();
        upsert_condition(
            &mut conditions,
            Condition {
                type_: "Validated".to_string(),
                status: match validation {
                    ValidationStatus::Valid => "True",
                    ValidationStatus::Invalid => "False",
                    ValidationStatus::Unknown => "Unknown",
                }
                .to_string(),
                reason: Some(format!("{validation:?}")),
                message,
                last_transition_time: None,
            },
        );
        status.conditions = Some(conditions);

        let api: Api<HAProxyTemplateConfig> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({"status": status})),
        )
        .await?;
        Ok(())
    }

    /// Merge one pod's sync report into the `HAProxyCfg` and map file
    /// statuses.
    pub async fn record_pod_report(
        &self,
        owner: &HAProxyTemplateConfig,
        report: &PodSyncReport,
    ) -> Result<()> {
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());
        let name = owner.name_any();
        let cfg_api: Api<HAProxyCfg> = Api::namespaced(self.client.clone(), &namespace);
        if let Some(cfg) = cfg_api.get_opt(&name).await? {
            let mut status = cfg.status.unwrap_or_default();
            merge_report(&mut status.deployed_to_pods, report);
            cfg_api
                .patch_status(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"status": {"deployedToPods": status.deployed_to_pods}})),
                )
                .await?;
        }

        let map_api: Api<HAProxyMapFile> = Api::namespaced(self.client.clone(), &namespace);
        let owned = map_api.list(&ListParams::default().labels(&owned_selector(&name))).await?;
        for map_file in owned {
            let map_name = map_file.name_any();
            let mut status = map_file.status.unwrap_or_default();
            merge_report(&mut status.deployed_to_pods, report);
            map_api
                .patch_status(
                    &map_name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"status": {"deployedToPods": status.deployed_to_pods}})),
                )
                .await?;
        }
        Ok(())
    }

    /// Record a failed sync attempt for one pod.
    pub async fn record_pod_error(
        &self,
        owner: &HAProxyTemplateConfig,
        pod: &str,
        error_text: &str,
    ) -> Result<()> {
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());
        let name = owner.name_any();
        let cfg_api: Api<HAProxyCfg> = Api::namespaced(self.client.clone(), &namespace);
        if let Some(cfg) = cfg_api.get_opt(&name).await? {
            let mut status = cfg.status.unwrap_or_default();
            merge_error(&mut status.deployed_to_pods, pod, error_text);
            cfg_api
                .patch_status(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"status": {"deployedToPods": status.deployed_to_pods}})),
                )
                .await?;
        }
        Ok(())
    }

    /// Remove a terminated pod from every status list in the namespace.
    pub async fn remove_pod(&self, owner: &HAProxyTemplateConfig, pod: &str) -> Result<()> {
        let namespace = owner.namespace().unwrap_or_else(|| "default".to_string());
        let name = owner.name_any();
        let cfg_api: Api<HAProxyCfg> = Api::namespaced(self.client.clone(), &namespace);
        if let Some(cfg) = cfg_api.get_opt(&name).await? {
            let mut status = cfg.status.unwrap_or_default();
            status.deployed_to_pods.retain(|d| d.pod != pod);
            cfg_api
                .patch_status(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"status": {"deployedToPods": status.deployed_to_pods}})),
                )
                .await?;
        }
        let map_api: Api<HAProxyMapFile> = Api::namespaced(self.client.clone(), &namespace);
        for map_file in map_api.list(&ListParams::default().labels(&owned_selector(&name))).await? {
            let map_name = map_file.name_any();
            let mut status = map_file.status.unwrap_or_default();
            status.deployed_to_pods.retain(|d| d.pod != pod);
            map_api
                .patch_status(
                    &map_name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"status": {"deployedToPods": status.deployed_to_pods}})),
                )
                .await?;
        }
        debug!(pod, config = %name, "removed terminated pod from statuses");
        Ok(())
    }

    async fn delete_stale(
        &self,
        namespace: &str,
        owner_name: &str,
        keep_maps: &[String],
        keep_secrets: &[String],
    ) -> Result<()> {
        let selector = owned_selector(owner_name);
        let map_api: Api<HAProxyMapFile> = Api::namespaced(self.client.clone(), namespace);
        for map_file in map_api.list(&ListParams::default().labels(&selector)).await? {
            let name = map_file.name_any();
            if !keep_maps.contains(&name) {
                let _ = map_api.delete(&name, &DeleteParams::default()).await;
            }
        }
        let secret_api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        for secret in secret_api.list(&ListParams::default().labels(&selector)).await? {
            let name = secret.name_any();
            if !keep_secrets.contains(&name) {
                let _ = secret_api.delete(&name, &DeleteParams::default()).await;
            }
        }
        Ok(())
    }
}

fn owned_selector(owner_name: &str) -> String {
    format!("{OWNED_BY_LABEL}={owner_name}")
}

/// Resource name for one rendered map.
pub fn map_resource_name(owner: &str, map_name: &str) -> String {
    format!("{owner}-{}", sanitize(map_name))
}

/// Secret name for one rendered certificate.
pub fn cert_secret_name(owner: &str, cert_name: &str) -> String {
    format!("{owner}-cert-{}", sanitize(cert_name))
}

fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

/// Merge a sync report into a status list. Drift checks refresh
/// `lastCheckedAt` without touching `deployedAt`.
pub fn merge_report(list: &mut Vec<DeploymentStatus>, report: &PodSyncReport) {
    let now = Utc::now();
    let entry = match list.iter_mut().find(|d| d.pod == report.pod) {
        Some(entry) => entry,
        None => {
            list.push(DeploymentStatus { pod: report.pod.clone(), ..DeploymentStatus::default() });
            list.last_mut().expect("just pushed")
        }
    };
    entry.last_checked_at = Some(now);
    entry.sync_duration_millis = Some(report.duration.as_millis() as u64);
    entry.version_conflict_retries = report.version_conflict_retries;
    entry.operation_summary = Some(report.summary);
    match report.outcome {
        SyncOutcome::Applied | SyncOutcome::RawPushed => {
            entry.checksum = report.checksum.clone();
            entry.deployed_at = Some(now);
            entry.fallback_used = report.fallback_used;
            if report.reload_required {
                entry.last_reload_at = Some(now);
                entry.last_reload_id = report.reload_id.clone();
            }
            entry.last_error = None;
            entry.consecutive_errors = 0;
        }
        SyncOutcome::Converged => {
            entry.checksum = report.checksum.clone();
            entry.last_error = None;
            entry.consecutive_errors = 0;
        }
        SyncOutcome::Skipped => {}
    }
}

/// Record a failed attempt in a status list.
pub fn merge_error(list: &mut Vec<DeploymentStatus>, pod: &str, error_text: &str) {
    let entry = match list.iter_mut().find(|d| d.pod == pod) {
        Some(entry) => entry,
        None => {
            list.push(DeploymentStatus { pod: pod.to_string(), ..DeploymentStatus::default() });
            list.last_mut().expect("just pushed")
        }
    };
    entry.last_error = Some(error_text.to_string());
    entry.consecutive_errors += 1;
    entry.last_error_at = Some(Utc::now());
}
