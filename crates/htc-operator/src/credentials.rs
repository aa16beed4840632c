//! Dataplane credentials from the referenced secret

use htc_crd::CredentialsRef;
use htc_dataplane::Credentials;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::{Error, Result};

/// The four keys the credentials secret must carry.
#[derive(Debug, Clone)]
pub struct DataplaneCredentials {
    /// Production Dataplane endpoints
    pub production: Credentials,
    /// Validation sidecar endpoints (phase 3 with a sidecar sandbox)
    pub validation: Credentials,
}

/// Read and decode the credentials secret.
pub async fn load(
    client: &Client,
    default_namespace: &str,
    reference: &CredentialsRef,
) -> Result<DataplaneCredentials> {
    let namespace = reference.secret_namespace.as_deref().unwrap_or(default_namespace);
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get_opt(&reference.secret_name).await?.ok_or_else(|| Error::Credentials {
        name: reference.secret_name.clone(),
        message: format!("not found in namespace {namespace}"),
    })?;

    let key = |name: &str| -> Result<String> {
        let data = secret.data.as_ref().ok_or_else(|| Error::Credentials {
            name: reference.secret_name.clone(),
            message: "secret has no data".to_string(),
        })?;
        let bytes = data.get(name).ok_or_else(|| Error::Credentials {
            name: reference.secret_name.clone(),
            message: format!("missing key {name:?}"),
        })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| Error::Credentials {
            name: reference.secret_name.clone(),
            message: format!("key {name:?} is not UTF-8"),
        })
    };

    Ok(DataplaneCredentials {
        production: Credentials {
            username: key("dataplane_username")?,
            password: key("dataplane_password")?,
        },
        validation: Credentials {
            username: key("validation_username")?,
            password: key("validation_password")?,
        },
    })
}
