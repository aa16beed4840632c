//! Reading live configuration state
//!
//! Fetches every section (and child collection) inside the transaction and
//! deserializes into the shared structured model, so the comparator works
//! on plain struct equality. Decode failures are surfaced as
//! [`Error::Decode`], which the executor treats as "fall back to raw".

use htc_dataplane::{DataplaneClient, Transaction};
use htc_haproxy::model::*;
use htc_haproxy::Config;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

async fn fetch_vec<T: DeserializeOwned>(
    client: &DataplaneClient,
    path: &str,
    txn: &Transaction,
) -> Result<Vec<T>> {
    let items = client.list(path, txn).await?;
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| Error::Decode {
                path: path.to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

async fn fetch_singleton<T: DeserializeOwned + Default>(
    client: &DataplaneClient,
    path: &str,
    txn: &Transaction,
) -> Result<T> {
    match client.get_one(path, txn).await? {
        Some(value) => serde_json::from_value(value).map_err(|e| Error::Decode {
            path: path.to_string(),
            message: e.to_string(),
        }),
        None => Ok(T::default()),
    }
}

/// Read the whole live configuration inside `txn`.
pub async fn read_live(client: &DataplaneClient, txn: &Transaction) -> Result<Config> {
    let mut config = Config {
        global: fetch_singleton(client, "global", txn).await?,
        defaults: fetch_singleton(client, "defaults", txn).await?,
        frontends: fetch_vec(client, "frontends", txn).await?,
        backends: fetch_vec(client, "backends", txn).await?,
        resolvers: fetch_vec(client, "resolvers", txn).await?,
        peers: fetch_vec(client, "peers", txn).await?,
        caches: fetch_vec(client, "caches", txn).await?,
        userlists: fetch_vec(client, "userlists", txn).await?,
        mailers: fetch_vec(client, "mailers", txn).await?,
        rings: fetch_vec(client, "rings", txn).await?,
        programs: fetch_vec(client, "programs", txn).await?,
        fcgi_apps: fetch_vec(client, "fcgi_apps", txn).await?,
        crt_stores: if client.version().supports_transactional_crt_stores() {
            fetch_vec(client, "crt_stores", txn).await?
        } else {
            Vec::new()
        },
        http_errors_sections: fetch_vec(client, "http_errors_sections", txn).await?,
        log_forwards: fetch_vec(client, "log_forwards", txn).await?,
    };

    for frontend in &mut config.frontends {
        let base = format!("frontends/{}", frontend.name);
        frontend.binds = fetch_vec(client, &format!("{base}/binds"), txn).await?;
        frontend.acls = fetch_vec(client, &format!("{base}/acls"), txn).await?;
        frontend.http_request_rules =
            fetch_vec(client, &format!("{base}/http_request_rules"), txn).await?;
        frontend.http_response_rules =
            fetch_vec(client, &format!("{base}/http_response_rules"), txn).await?;
        frontend.tcp_request_rules =
            fetch_vec(client, &format!("{base}/tcp_request_rules"), txn).await?;
        frontend.backend_switching_rules =
            fetch_vec(client, &format!("{base}/backend_switching_rules"), txn).await?;
        frontend.captures = fetch_vec(client, &format!("{base}/captures"), txn).await?;
        frontend.filters = fetch_vec(client, &format!("{base}/filters"), txn).await?;
        frontend.log_targets = fetch_vec(client, &format!("{base}/log_targets"), txn).await?;
    }

    for backend in &mut config.backends {
        let base = format!("backends/{}", backend.name);
        backend.servers = fetch_vec(client, &format!("{base}/servers"), txn).await?;
        backend.server_templates =
            fetch_vec(client, &format!("{base}/server_templates"), txn).await?;
        backend.acls = fetch_vec(client, &format!("{base}/acls"), txn).await?;
        backend.http_request_rules =
            fetch_vec(client, &format!("{base}/http_request_rules"), txn).await?;
        backend.http_response_rules =
            fetch_vec(client, &format!("{base}/http_response_rules"), txn).await?;
        backend.http_checks = fetch_vec(client, &format!("{base}/http_checks"), txn).await?;
        backend.filters = fetch_vec(client, &format!("{base}/filters"), txn).await?;
        backend.log_targets = fetch_vec(client, &format!("{base}/log_targets"), txn).await?;
    }

    for section in &mut config.resolvers {
        section.nameservers =
            fetch_vec(client, &format!("resolvers/{}/nameservers", section.name), txn).await?;
    }
    for section in &mut config.peers {
        section.peer_entries =
            fetch_vec(client, &format!("peers/{}/peer_entries", section.name), txn).await?;
    }
    for section in &mut config.mailers {
        section.mailer_entries =
            fetch_vec(client, &format!("mailers/{}/mailer_entries", section.name), txn).await?;
    }
    for section in &mut config.userlists {
        section.users =
            fetch_vec(client, &format!("userlists/{}/users", section.name), txn).await?;
        section.groups =
            fetch_vec(client, &format!("userlists/{}/groups", section.name), txn).await?;
    }

    Ok(config)
}
