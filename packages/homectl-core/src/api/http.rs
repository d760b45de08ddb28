//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the registry and the discovery
//! orchestrator.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::response::{api_accepted, api_ok, api_success};
use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::bridge::CommandOutcome;
use crate::error::{CoreError, CoreResult, DeviceError};
use crate::model::{Command, DeviceId};
use crate::protocol_constants::{HTTP_COMMAND_WAIT_SECS, SERVICE_ID};

/// Builds the API router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let trusted_origins = state.trusted_origins.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin = origin.to_str().unwrap_or("");
            trusted_origins
                .iter()
                .any(|allowed| origin.starts_with(allowed.as_str()))
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(false);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}", get(get_device))
        .route("/api/devices/{id}/commands", post(invoke_command))
        .route("/api/discovery/rescan", post(rescan))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    api_success(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "devices": state.registry.len(),
        "discovery": state.discovery.is_running(),
        "connections": state.ws_manager.connection_count(),
    }))
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    api_success(state.registry.snapshot())
}

async fn get_device(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> CoreResult<impl IntoResponse> {
    let id = DeviceId::parse(&raw_id)?;
    let snapshot = state
        .registry
        .get(&id)
        .ok_or_else(|| DeviceError::UnknownDevice(id.to_string()))?;
    Ok(api_success(snapshot))
}

#[derive(Debug, Deserialize)]
struct InvokeQuery {
    /// Wait for the outcome before replying (default: true).
    wait: Option<bool>,
}

/// Queues a command and, unless `?wait=false`, waits a bounded time for its
/// outcome.
///
/// - applied: `200` with the resulting state
/// - failed: the device error, mapped to its status code
/// - superseded or cancelled: `409`
/// - still running after the wait bound, or `wait=false`: `202`
async fn invoke_command(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<InvokeQuery>,
    body: Result<Json<Command>, JsonRejection>,
) -> CoreResult<Response> {
    let Json(command) = body.map_err(|e| CoreError::InvalidRequest(e.body_text()))?;
    let id = DeviceId::parse(&raw_id)?;

    let ticket = state.registry.invoke(&id, command)?;
    let queued = json!({
        "deviceId": id,
        "command": ticket.command(),
        "status": "queued",
    });

    if query.wait == Some(false) {
        return Ok(api_accepted(queued).into_response());
    }

    let wait = Duration::from_secs(HTTP_COMMAND_WAIT_SECS);
    match tokio::time::timeout(wait, ticket.outcome()).await {
        Ok(CommandOutcome::Failed { error }) => Err(error.into()),
        Ok(outcome @ CommandOutcome::Applied { .. }) => Ok(api_success(outcome).into_response()),
        Ok(outcome) => Ok((StatusCode::CONFLICT, Json(outcome)).into_response()),
        Err(_) => {
            log::debug!("[API] Command to {} still pending after {:?}", id, wait);
            Ok(api_accepted(queued).into_response())
        }
    }
}

async fn rescan(State(state): State<AppState>) -> CoreResult<impl IntoResponse> {
    state.discovery.rescan()?;
    Ok(api_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::adapters::testing::{MockAdapter, Step};
    use crate::adapters::AdapterSet;
    use crate::bridge::CommandBridge;
    use crate::discovery::{DiscoveryOrchestrator, DiscoverySettings, Sighting};
    use crate::events::EventBus;
    use crate::model::{Endpoint, Protocol};
    use crate::registry::{Registry, RegistrySettings};
    use crate::runtime::TokioSpawner;
    use crate::utils::now_millis;

    struct Fixture {
        state: AppState,
        adapter: Arc<MockAdapter>,
        bulb: DeviceId,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new(64));
        let adapter = Arc::new(MockAdapter::new(Protocol::Wiz));
        let mut adapters = AdapterSet::new();
        adapters.insert(adapter.clone());
        let registry = Registry::new(
            adapters,
            CommandBridge::new(2, Duration::from_secs(1)),
            bus.clone(),
            RegistrySettings {
                poll_interval: None,
                grace_period: Duration::from_secs(120),
                retry_delays: Vec::new(),
            },
            TokioSpawner::current(),
        );
        let discovery = DiscoveryOrchestrator::new(
            Vec::new(),
            registry.clone(),
            bus.clone(),
            DiscoverySettings {
                every: None,
                sighting_window: Duration::from_secs(30),
            },
        );

        let sighting = Sighting::new(
            Protocol::Wiz,
            "a8bb5006c3f1",
            "Desk",
            Endpoint::new("10.0.0.5", 38899),
        );
        registry.register(sighting.to_descriptor(now_millis())).unwrap();

        Fixture {
            state: AppState::builder()
                .registry(registry)
                .discovery(discovery)
                .event_bus(bus)
                .build(),
            adapter,
            bulb: sighting.id,
        }
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_device_count() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], SERVICE_ID);
        assert_eq!(body["devices"], 1);
    }

    #[tokio::test]
    async fn lists_and_fetches_devices() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::GET, "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["descriptor"]["id"], "wiz:a8bb5006c3f1");
        assert_eq!(body[0]["descriptor"]["displayName"], "Desk");

        let (status, body) =
            call(&f.state, Method::GET, "/api/devices/wiz:a8bb5006c3f1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["reachable"], true);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_json_errors() {
        let f = fixture();
        let (status, body) =
            call(&f.state, Method::GET, "/api/devices/wiz:ffffffffffff", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_device");
        assert_eq!(body["status"], 404);

        let (status, body) = call(&f.state, Method::GET, "/api/devices/hue:1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn command_waits_for_applied_state() {
        let f = fixture();
        let uri = format!("/api/devices/{}/commands", f.bulb);
        let (status, body) = call(
            &f.state,
            Method::POST,
            &uri,
            Some(json!({"command": "setBrightness", "level": 150})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["state"]["brightness"], 100);
        assert_eq!(f.adapter.applied().len(), 1);
    }

    #[tokio::test]
    async fn command_without_wait_is_accepted() {
        let f = fixture();
        f.adapter.script(&f.bulb, [Step::Delay(Duration::from_millis(200))]);
        let uri = format!("/api/devices/{}/commands?wait=false", f.bulb);
        let (status, body) = call(
            &f.state,
            Method::POST,
            &uri,
            Some(json!({"command": "setPower", "on": true})),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["command"]["command"], "setPower");
    }

    #[tokio::test]
    async fn rejected_commands_map_to_status_codes() {
        let f = fixture();
        let uri = format!("/api/devices/{}/commands", f.bulb);

        let (status, body) = call(
            &f.state,
            Method::POST,
            &uri,
            Some(json!({"command": "setVolume", "level": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unsupported_capability");

        let (status, body) = call(
            &f.state,
            Method::POST,
            &uri,
            Some(json!({"command": "setColor", "color": {"r": 300, "g": 0, "b": 0}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_argument");

        let (status, body) =
            call(&f.state, Method::POST, &uri, Some(json!({"command": "explode"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
        assert!(f.adapter.applied().is_empty());
    }

    #[tokio::test]
    async fn failed_command_returns_device_error() {
        let f = fixture();
        f.adapter.script(
            &f.bulb,
            [Step::Fail(DeviceError::ConfigurationError("missing key".into()))],
        );
        let uri = format!("/api/devices/{}/commands", f.bulb);
        let (status, body) = call(
            &f.state,
            Method::POST,
            &uri,
            Some(json!({"command": "setPower", "on": false})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "configuration_error");
    }

    #[tokio::test]
    async fn rescan_fails_once_discovery_is_stopped() {
        let f = fixture();
        let (status, body) = call(&f.state, Method::POST, "/api/discovery/rescan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        f.state.discovery.stop();
        let (status, body) = call(&f.state, Method::POST, "/api/discovery/rescan", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "discovery_failed");
    }
}
