//! Authenticated debug endpoints
//!
//! Exposes the current parsed config, the last rendered artifact and a
//! ring buffer of recent events. Guarded by a bearer token; unset token
//! means the server is not mounted at all.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use htc_core::{Event, RenderedArtifact};
use htc_crd::HAProxyTemplateConfig;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::RwLock;

const EVENT_BUFFER: usize = 256;

/// State behind the debug endpoints.
pub struct DebugState {
    /// Bearer token required on every request
    pub token: String,
    /// Current controller config
    pub config: RwLock<Option<Arc<HAProxyTemplateConfig>>>,
    /// Last successfully rendered artifact
    pub rendered: RwLock<Option<RenderedArtifact>>,
    events: Mutex<VecDeque<String>>,
}

impl DebugState {
    /// Fresh state with an empty ring buffer.
    pub fn new(token: String) -> Self {
        Self {
            token,
            config: RwLock::new(None),
            rendered: RwLock::new(None),
            events: Mutex::new(VecDeque::with_capacity(EVENT_BUFFER)),
        }
    }

    /// Append an event to the ring buffer.
    pub fn record_event(&self, event: &Event) {
        let mut events = self.events.lock();
        if events.len() >= EVENT_BUFFER {
            events.pop_front();
        }
        events.push_back(format!("{} {event:?}", chrono::Utc::now().to_rfc3339()));
    }

    fn recent_events(&self) -> Vec<String> {
        self.events.lock().iter().cloned().collect()
    }
}

fn authorized(state: &DebugState, headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.token)
}

async fn config_handler(
    State(state): State<Arc<DebugState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let config = state.config.read().await.clone();
    Json(json!({"config": config.as_deref()})).into_response()
}

async fn rendered_handler(
    State(state): State<Arc<DebugState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let rendered = state.rendered.read().await;
    match rendered.as_ref() {
        Some(artifact) => Json(json!({
            "checksum": artifact.checksum,
            "renderedAt": artifact.rendered_at,
            "mainConfig": artifact.main_config,
            "maps": artifact.maps,
            "files": artifact.files,
            "certNames": artifact.certs.keys().collect::<Vec<_>>(),
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn events_handler(
    State(state): State<Arc<DebugState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"events": state.recent_events()})).into_response()
}

/// Router for the debug port.
pub fn router(state: Arc<DebugState>) -> Router {
    Router::new()
        .route("/debug/config", get(config_handler))
        .route("/debug/rendered", get(rendered_handler))
        .route("/debug/events", get(events_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        }
        headers
    }

    #[tokio::test]
    async fn requests_without_token_are_unauthorized() {
        let state = Arc::new(DebugState::new("secret".into()));
        let response = events_handler(State(state), headers(None)).await.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let state = Arc::new(DebugState::new("secret".into()));
        let response =
            events_handler(State(state), headers(Some("nope"))).await.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn events_ring_buffer_caps_out() {
        let state = Arc::new(DebugState::new("secret".into()));
        for i in 0..(EVENT_BUFFER + 10) {
            state.record_event(&Event::ResourcesChanged { alias: format!("a{i}") });
        }
        assert_eq!(state.recent_events().len(), EVENT_BUFFER);
        let response =
            events_handler(State(state), headers(Some("secret"))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rendered_is_404_before_first_render() {
        let state = Arc::new(DebugState::new("secret".into()));
        let response =
            rendered_handler(State(state), headers(Some("secret"))).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
