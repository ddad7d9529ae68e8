/**
 * API LECTURE FLEETWATCH - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose aux collaborateurs (dashboard, scripts) les records persistés,
 * la vue agrégée des devices et le flux temps réel du Broadcaster.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes sous /api
 * - Historiques : device_id obligatoire, limit (100 par défaut), from/to RFC 3339
 * - /api/stream : Server-Sent Events, nom d'event = canal (telemetry/event/status)
 * - Erreurs JSON {"error": ...} : 400 paramètre invalide, 404 absent, 500 store
 *
 * L'authentification et l'administration restent hors du kernel.
 */

use crate::broadcaster::Broadcaster;
use crate::devices::{list_devices, DeviceView};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Record, RecordKind};
use crate::store::{RangeQuery, RecordStore, StoreError, DEFAULT_RANGE_LIMIT};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub broadcaster: Broadcaster,
    pub health: HealthTracker,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(e) => {
                error!(error = %e, "store read failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(|| async { Json(serde_json::json!({ "ok": true })) }))
        .route("/api/system/health", get(get_system_health))
        .route("/api/devices", get(get_devices))
        .route("/api/telemetry/latest", get(get_latest_telemetry))
        .route("/api/telemetry", get(get_telemetry))
        .route("/api/events", get(get_events))
        .route("/api/status", get(get_status))
        .route("/api/stream", get(stream))
        .with_state(app_state)
}

fn required_device_id(params: &HashMap<String, String>) -> Result<String, ApiError> {
    params
        .get("device_id")
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("device_id is required".into()))
}

fn parse_ts(params: &HashMap<String, String>, key: &str) -> Result<Option<OffsetDateTime>, ApiError> {
    params
        .get(key)
        .map(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|_| ApiError::BadRequest(format!("{key} must be an RFC 3339 timestamp")))
        })
        .transpose()
}

/// Construction de la fenêtre depuis les query params
fn range_query(params: &HashMap<String, String>) -> Result<RangeQuery, ApiError> {
    let limit = match params.get("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::BadRequest("limit must be a positive integer".into()))?,
        None => DEFAULT_RANGE_LIMIT,
    };
    Ok(RangeQuery {
        from: parse_ts(params, "from")?,
        to: parse_ts(params, "to")?,
        limit,
    })
}

fn history(app: &AppState, kind: RecordKind, params: &HashMap<String, String>) -> Result<Json<Vec<Record>>, ApiError> {
    let device_id = required_device_id(params)?;
    let query = range_query(params)?;
    Ok(Json(app.store.range(kind, &device_id, &query)?))
}

// GET /api/system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

// GET /api/devices
async fn get_devices(State(app): State<AppState>) -> Result<Json<Vec<DeviceView>>, ApiError> {
    Ok(Json(list_devices(app.store.as_ref())?))
}

// GET /api/telemetry/latest?device_id=
async fn get_latest_telemetry(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Record>, ApiError> {
    let device_id = required_device_id(&params)?;
    app.store
        .latest(RecordKind::Telemetry, &device_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no telemetry for {device_id}")))
}

// GET /api/telemetry
async fn get_telemetry(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Record>>, ApiError> {
    history(&app, RecordKind::Telemetry, &params)
}

// GET /api/events
async fn get_events(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Record>>, ApiError> {
    history(&app, RecordKind::Event, &params)
}

// GET /api/status
async fn get_status(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Record>>, ApiError> {
    history(&app, RecordKind::Status, &params)
}

// GET /api/stream (SSE) ; un observateur en retard saute les events perdus
async fn stream(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(app.broadcaster.subscribe()).filter_map(|msg| {
        let msg = msg.ok()?;
        Event::default()
            .event(msg.channel.as_str())
            .json_data(&msg.record)
            .ok()
            .map(Ok)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Presence;
    use crate::store::test_support::record;
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use time::macros::datetime;
    use time::Duration;
    use tower::ServiceExt;

    const T0: OffsetDateTime = datetime!(2025-06-01 08:00:00 UTC);

    fn app_with(store: Arc<MemoryStore>) -> (Router, Broadcaster) {
        let broadcaster = Broadcaster::new(16);
        let state = AppState {
            store,
            broadcaster: broadcaster.clone(),
            health: HealthTracker::new(),
        };
        (build_router(state), broadcaster)
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .append(&record(RecordKind::Telemetry, "car1", T0 + Duration::seconds(i), i))
                .unwrap();
        }
        store.append(&Record::transition("car", "car1", Presence::Online, T0)).unwrap();
        store.append(&record(RecordKind::Event, "car2", T0 + Duration::seconds(9), 0)).unwrap();
        store
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (app, _) = app_with(Arc::new(MemoryStore::new()));
        let (code, body) = get_json(app.clone(), "/api/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (code, body) = get_json(app, "/api/system/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["mqtt_status"], "connecting");
    }

    #[tokio::test]
    async fn test_devices_listing() {
        let (app, _) = app_with(seeded());
        let (code, body) = get_json(app, "/api/devices").await;
        assert_eq!(code, StatusCode::OK);
        let list = body.as_array().unwrap();
        assert_eq!(list[0]["device_id"], "car2");
        assert_eq!(list[0]["status"], "unknown");
        assert_eq!(list[1]["device_id"], "car1");
        assert_eq!(list[1]["status"], "online");
        assert_eq!(list[1]["last_ts"], "2025-06-01T08:00:04Z");
    }

    #[tokio::test]
    async fn test_latest_telemetry() {
        let (app, _) = app_with(seeded());
        let (code, body) = get_json(app.clone(), "/api/telemetry/latest?device_id=car1").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["n"], 4);
        assert_eq!(body["kind"], "telemetry");

        let (code, _) = get_json(app, "/api/telemetry/latest?device_id=ghost").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_window_and_limit() {
        let (app, _) = app_with(seeded());
        let (code, body) = get_json(
            app,
            "/api/telemetry?device_id=car1&limit=2&from=2025-06-01T08:00:01Z&to=2025-06-01T08:00:03Z",
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        let ns: Vec<i64> = body.as_array().unwrap().iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_history_rejects_bad_params() {
        let (app, _) = app_with(seeded());
        let (code, body) = get_json(app.clone(), "/api/events").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "device_id is required");

        let (code, _) = get_json(app.clone(), "/api/status?device_id=car1&from=yesterday").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = get_json(app, "/api/status?device_id=car1&limit=-1").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_emits_named_events() {
        let (app, broadcaster) = app_with(Arc::new(MemoryStore::new()));
        let res = app
            .oneshot(Request::builder().uri("/api/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "text/event-stream");

        broadcaster.publish(&record(RecordKind::Telemetry, "car1", T0, 42));
        let mut body = res.into_body().into_data_stream();
        let frame = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("event: telemetry"));
        assert!(text.contains("\"n\":42"));
    }
}
