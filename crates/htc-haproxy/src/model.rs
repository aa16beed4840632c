//! Structured configuration model
//!
//! Field names and nesting follow the Dataplane API JSON schemas, so the
//! same structs deserialize live state from the API and serialize desired
//! state into request bodies. Directives outside the structured subset are
//! carried in each section's `extras` in source order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat metadata as the parser sees it (`# @meta key value` comments).
/// The API wraps each value in a `{"value": ...}` object; see
/// [`crate::transform::metadata_to_api`].
pub type Metadata = BTreeMap<String, Value>;

/// A complete parsed configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The `global` section.
    pub global: Global,
    /// The unnamed `defaults` section.
    pub defaults: Defaults,
    /// `frontend` sections in source order.
    pub frontends: Vec<Frontend>,
    /// `backend` sections in source order.
    pub backends: Vec<Backend>,
    /// `resolvers` sections.
    pub resolvers: Vec<Resolvers>,
    /// `peers` sections.
    pub peers: Vec<Peers>,
    /// `cache` sections.
    pub caches: Vec<Cache>,
    /// `userlist` sections.
    pub userlists: Vec<Userlist>,
    /// `mailers` sections.
    pub mailers: Vec<Mailers>,
    /// `ring` sections.
    pub rings: Vec<Ring>,
    /// `program` sections.
    pub programs: Vec<Program>,
    /// `fcgi-app` sections.
    pub fcgi_apps: Vec<FcgiApp>,
    /// `crt-store` sections.
    pub crt_stores: Vec<CrtStore>,
    /// `http-errors` sections.
    pub http_errors_sections: Vec<HttpErrorsSection>,
    /// `log-forward` sections.
    pub log_forwards: Vec<LogForward>,
}

impl Config {
    /// Look up a backend by name.
    pub fn backend(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Look up a frontend by name.
    pub fn frontend(&self, name: &str) -> Option<&Frontend> {
        self.frontends.iter().find(|f| f.name == name)
    }

    /// Whether any section carries directives outside the structured
    /// subset. Such configs can still be validated and raw-pushed, but not
    /// diffed element-wise.
    pub fn has_unstructured_directives(&self) -> bool {
        !self.global.extras.is_empty()
            || !self.defaults.extras.is_empty()
            || self.frontends.iter().any(|f| !f.extras.is_empty())
            || self.backends.iter().any(|b| !b.extras.is_empty())
    }
}

/// The `global` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Global {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chroot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidfile: Option<String>,
    /// `stats socket` runtime API path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_socket: Option<String>,
    /// `log` targets declared in `global`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_targets: Vec<LogTarget>,
    /// Directives outside the structured subset, in source order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// The unnamed `defaults` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<i64>,
    /// `timeout client`, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_timeout: Option<i64>,
    /// `timeout server`, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_timeout: Option<i64>,
    /// `timeout connect`, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<i64>,
    /// `timeout http-request`, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_request_timeout: Option<i64>,
    /// `retries`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_targets: Vec<LogTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_files: Vec<ErrorFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// `mode http` / `mode tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Http,
    Tcp,
}

/// A `frontend` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frontend {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<Bind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acls: Vec<Acl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_request_rules: Vec<HttpRequestRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_response_rules: Vec<HttpResponseRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp_request_rules: Vec<TcpRequestRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_switching_rules: Vec<BackendSwitchingRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captures: Vec<Capture>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_targets: Vec<LogTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `backend` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
    /// `option httpchk` parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httpchk_params: Option<HttpchkParams>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<Server>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_templates: Vec<ServerTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acls: Vec<Acl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_request_rules: Vec<HttpRequestRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_response_rules: Vec<HttpResponseRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_checks: Vec<HttpCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_targets: Vec<LogTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// `balance` algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub algorithm: String,
}

/// `option httpchk [METHOD URI [VERSION]]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpchkParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A `server` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    /// `enabled` / `disabled`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<bool>,
    /// `enabled` when the server speaks TLS upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rise: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fall: Option<i64>,
    /// Check interval, milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inter: Option<i64>,
    /// `disabled` marks the server administratively down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// A `server-template` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerTemplate {
    pub prefix: String,
    /// `num` or `low-high` range
    pub num_or_range: String,
    pub fqdn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
}

/// A `bind` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bind {
    /// Dataplane addresses binds by name; defaults to `addr:port`
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    /// `crt` path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_proxy: Option<bool>,
}

/// An `acl` line. Ordered; position matters for evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    pub acl_name: String,
    pub criterion: String,
    pub value: String,
}

/// An `http-request` rule. Ordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestRule {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_realm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdr_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdr_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redir_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redir_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redir_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

/// An `http-response` rule. Ordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseRule {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdr_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdr_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

/// A `tcp-request` rule. Ordered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpRequestRule {
    /// `connection`, `content` or `session`
    #[serde(rename = "type")]
    pub type_: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
}

/// A `use_backend` rule. Ordered; evaluated before `default_backend`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSwitchingRule {
    /// Target backend name
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
}

/// A `capture request|response header` declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    /// `request` or `response`
    #[serde(rename = "type")]
    pub type_: String,
    pub header: String,
    pub length: i64,
}

/// A `filter` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// `trace`, `compression`, `spoe`, ...
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoe_engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoe_config: Option<String>,
}

/// A `log` target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogTarget {
    pub address: String,
    pub facility: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// An `http-check` directive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpCheck {
    /// `send`, `expect`, `connect`, ...
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// An `errorfile` directive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFile {
    pub code: i64,
    pub file: String,
}

/// A `resolvers` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolvers {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<Nameserver>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `nameserver` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nameserver {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
}

/// A `peers` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Peers {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peer_entries: Vec<PeerEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `peer` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub address: String,
    pub port: i64,
}

/// A `cache` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cache {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_max_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `userlist` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Userlist {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
}

/// A `user` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Hashed unless `insecure-password` was used
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_password: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<String>,
}

/// A `group` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,
}

/// A `mailers` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mailers {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mailer_entries: Vec<MailerEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `mailer` line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailerEntry {
    pub name: String,
    pub address: String,
    pub port: i64,
}

/// A `ring` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ring {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `program` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// An `fcgi-app` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcgiApp {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docroot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// A `crt-store` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrtStore {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crt_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_base: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

/// An `http-errors` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorsSection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_files: Vec<ErrorFile>,
}

/// A `log-forward` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogForward {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<Bind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_targets: Vec<LogTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}
