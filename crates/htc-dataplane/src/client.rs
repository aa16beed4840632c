//! The HTTP client proper

use std::time::Duration;

use htc_haproxy::DataplaneVersion;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::{CommitOutcome, StorageKind, Transaction};

const RELOAD_ID_HEADER: &str = "Reload-ID";
const CONFIG_VERSION_HEADER: &str = "Configuration-Version";

/// Basic-auth credentials for one Dataplane endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// Client for one HAProxy pod's Dataplane API.
#[derive(Clone)]
pub struct DataplaneClient {
    base_url: String,
    http: reqwest::Client,
    credentials: Credentials,
    version: DataplaneVersion,
}

impl DataplaneClient {
    /// Build a client for `host:port` with a per-request timeout.
    pub fn new(
        host: &str,
        port: u16,
        credentials: Credentials,
        version: DataplaneVersion,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::from)?;
        Ok(Self {
            base_url: format!("http://{host}:{port}/v3"),
            http,
            credentials,
            version,
        })
    }

    /// The API version this client speaks.
    pub fn version(&self) -> DataplaneVersion {
        self.version
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        trace!(%url, ?method, "dataplane request");
        self.http
            .request(method, url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
    }

    /// HAProxy version string from `/info`, used to pick the schema set.
    pub async fn haproxy_version(&self) -> Result<String> {
        let response = self.request(Method::GET, "info").send().await?;
        let body: Value = check(response).await?.json().await?;
        body.pointer("/haproxy/version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Decode("missing haproxy.version in /info".to_string()))
    }

    /// Current configuration version.
    pub async fn configuration_version(&self) -> Result<i64> {
        let response = self
            .request(Method::GET, "services/haproxy/configuration/version")
            .send()
            .await?;
        let body: Value = check(response).await?.json().await?;
        body.as_i64()
            .or_else(|| body.get("_version").and_then(Value::as_i64))
            .ok_or_else(|| Error::Decode("configuration version is not a number".to_string()))
    }

    /// Open a transaction against `version`.
    pub async fn open_transaction(&self, version: i64) -> Result<Transaction> {
        let response = self
            .request(Method::POST, "services/haproxy/transactions")
            .query(&[("version", version)])
            .send()
            .await?;
        let response = check(response).await?;
        let txn: Transaction = response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("transaction body: {e}")))?;
        debug!(id = %txn.id, version = txn.version, "opened dataplane transaction");
        Ok(txn)
    }

    /// Commit; 202 means HAProxy schedules a reload.
    pub async fn commit_transaction(&self, transaction: &Transaction) -> Result<CommitOutcome> {
        let response = self
            .request(
                Method::PUT,
                &format!("services/haproxy/transactions/{}", transaction.id),
            )
            .send()
            .await?;
        let status = response.status();
        let reload_id = header(&response, RELOAD_ID_HEADER);
        let response = check(response).await?;
        let version = header(&response, CONFIG_VERSION_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(transaction.version + 1);
        debug!(id = %transaction.id, version, reload = status == StatusCode::ACCEPTED, "committed transaction");
        Ok(CommitOutcome {
            version,
            reload_required: status == StatusCode::ACCEPTED,
            reload_id,
        })
    }

    /// Abort, discarding the transaction's edits. Safe to call on an
    /// already-closed transaction.
    pub async fn abort_transaction(&self, transaction: &Transaction) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("services/haproxy/transactions/{}", transaction.id),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    /// List a configuration collection inside the transaction.
    pub async fn list(&self, path: &str, transaction: &Transaction) -> Result<Vec<Value>> {
        let response = self
            .request(Method::GET, &format!("services/haproxy/configuration/{path}"))
            .query(&[("transaction_id", transaction.id.as_str())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: Value = check(response).await?.json().await?;
        Ok(unwrap_collection(body))
    }

    /// Read one configuration object; `None` when absent.
    pub async fn get_one(&self, path: &str, transaction: &Transaction) -> Result<Option<Value>> {
        let response = self
            .request(Method::GET, &format!("services/haproxy/configuration/{path}"))
            .query(&[("transaction_id", transaction.id.as_str())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check(response).await?.json().await?;
        Ok(Some(unwrap_data(body)))
    }

    /// Create an object in a collection.
    pub async fn create(&self, path: &str, body: &Value, transaction: &Transaction) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("services/haproxy/configuration/{path}"))
            .query(&[("transaction_id", transaction.id.as_str())])
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Replace an object.
    pub async fn replace(&self, path: &str, body: &Value, transaction: &Transaction) -> Result<()> {
        let response = self
            .request(Method::PUT, &format!("services/haproxy/configuration/{path}"))
            .query(&[("transaction_id", transaction.id.as_str())])
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Delete an object.
    pub async fn remove(&self, path: &str, transaction: &Transaction) -> Result<()> {
        let response = self
            .request(
                Method::DELETE,
                &format!("services/haproxy/configuration/{path}"),
            )
            .query(&[("transaction_id", transaction.id.as_str())])
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Push the whole configuration file, bypassing structured endpoints.
    /// The version check still applies so concurrent writers are detected.
    pub async fn raw_push(&self, config: &str, version: i64) -> Result<CommitOutcome> {
        let response = self
            .request(Method::POST, "services/haproxy/configuration/raw")
            .query(&[("version", version.to_string())])
            .header("content-type", "text/plain")
            .body(config.to_string())
            .send()
            .await?;
        let status = response.status();
        let reload_id = header(&response, RELOAD_ID_HEADER);
        let response = check(response).await?;
        let new_version = header(&response, CONFIG_VERSION_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(version + 1);
        debug!(version = new_version, "raw config push accepted");
        Ok(CommitOutcome {
            version: new_version,
            reload_required: status == StatusCode::ACCEPTED,
            reload_id,
        })
    }

    /// Names currently present in a storage family.
    pub async fn list_storage(&self, kind: StorageKind) -> Result<Vec<String>> {
        let response = self
            .request(Method::GET, &format!("services/haproxy/{}", kind.path()))
            .send()
            .await?;
        let body: Value = check(response).await?.json().await?;
        let names = unwrap_collection(body)
            .into_iter()
            .filter_map(|item| {
                item.get("storage_name")
                    .or_else(|| item.get("file"))
                    .or_else(|| item.get("description"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();
        Ok(names)
    }

    /// Create or replace a storage file.
    pub async fn put_storage(&self, kind: StorageKind, name: &str, content: &str) -> Result<()> {
        let path = format!("services/haproxy/{}/{name}", kind.path());
        let response = self
            .request(Method::PUT, &path)
            .header("content-type", "text/plain")
            .body(content.to_string())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // First upload: the file does not exist yet, create it.
            let response = self
                .request(Method::POST, &format!("services/haproxy/{}", kind.path()))
                .query(&[("name", name)])
                .header("content-type", "text/plain")
                .body(content.to_string())
                .send()
                .await?;
            check(response).await?;
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    /// Delete a storage file.
    pub async fn delete_storage(&self, kind: StorageKind, name: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("services/haproxy/{}/{name}", kind.path()))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Map a response to the error taxonomy; pass through success.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let conflict_version = header(&response, CONFIG_VERSION_HEADER).and_then(|v| v.parse().ok());
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, conflict_version, &body))
}

/// Status-code driven error taxonomy (pure, for testability).
fn classify(status: StatusCode, conflict_version: Option<i64>, body: &str) -> Error {
    if status == StatusCode::CONFLICT {
        let current = conflict_version
            .or_else(|| last_number(body))
            .unwrap_or_default();
        return Error::VersionConflict { current };
    }
    if status.is_server_error() {
        return Error::Transient { status: status.as_u16(), message: body.to_string() };
    }
    Error::Permanent { status: status.as_u16(), message: body.to_string() }
}

/// Last integer in a message like `"version mismatch, expected 43"`.
fn last_number(text: &str) -> Option<i64> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|chunk| !chunk.is_empty())
        .next_back()
        .and_then(|chunk| chunk.parse().ok())
}

/// Collections come back either bare or wrapped in `{_version, data}`.
fn unwrap_collection(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_carries_current_version_from_header() {
        let err = classify(StatusCode::CONFLICT, Some(43), "");
        assert!(matches!(err, Error::VersionConflict { current: 43 }));
    }

    #[test]
    fn conflict_falls_back_to_body_text() {
        let err = classify(StatusCode::CONFLICT, None, "version mismatch, expected 43");
        assert!(matches!(err, Error::VersionConflict { current: 43 }));
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify(StatusCode::BAD_GATEWAY, None, "upstream down");
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = classify(StatusCode::BAD_REQUEST, None, "bad body");
        assert!(matches!(err, Error::Permanent { status: 400, .. }));
    }

    #[test]
    fn collections_unwrap_both_shapes() {
        assert_eq!(unwrap_collection(json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(
            unwrap_collection(json!({"_version": 7, "data": [{"name": "a"}]})),
            vec![json!({"name": "a"})]
        );
        assert!(unwrap_collection(json!("nope")).is_empty());
    }

    #[test]
    fn single_objects_unwrap_data_envelope() {
        assert_eq!(unwrap_data(json!({"data": {"name": "a"}})), json!({"name": "a"}));
        assert_eq!(unwrap_data(json!({"name": "a"})), json!({"name": "a"}));
    }

    #[test]
    fn last_number_scans_messages() {
        assert_eq!(last_number("expected version 42, got 41"), Some(41));
        assert_eq!(last_number("no digits here"), None);
    }
}
