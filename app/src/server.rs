//! HTTP API and websocket feed

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fermwatch_hal::actuator::SwitchState;
use fermwatch_hal::ingest::parse_http_payload;
use fermwatch_hal::{Clock, RawSample};
use fermwatch_sensors::control::{ControlError, ControllerStatus, DeviceRole};
use fermwatch_sensors::control_loop::ControlHandle;
use fermwatch_sensors::hub::BroadcastHub;
use fermwatch_sensors::{FusedReading, ReadingStore};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub ingest: mpsc::Sender<RawSample>,
    pub store: Arc<ReadingStore>,
    pub hub: Arc<BroadcastHub>,
    pub control: ControlHandle,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/api/samples/latest", get(samples_handler))
        .route("/api/readings", get(readings_handler))
        .route("/api/batches", get(batches_handler))
        .route("/api/batches/:id/control", get(control_handler))
        .route(
            "/api/batches/:id/override",
            post(set_override_handler).delete(clear_override_handler),
        )
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn serve(bind: &str, state: AppState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    tracing::info!(%bind, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

/// Errors returned to API clients as `{"error": ...}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Control(#[from] ControlError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Control(e) => match e {
                ControlError::UnknownBatch(_) => StatusCode::NOT_FOUND,
                ControlError::Inactive { .. }
                | ControlError::NoEntity(_)
                | ControlError::OverrideConflict { .. } => StatusCode::CONFLICT,
                ControlError::InvalidDuration { .. } | ControlError::UnknownRole(_) => StatusCode::BAD_REQUEST,
                ControlError::LoopStopped => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let sample = parse_http_payload(&body, state.clock.now()).map_err(|e| {
        tracing::warn!(error = %e, "Rejected ingest payload");
        ApiError::BadRequest(e.to_string())
    })?;
    tracing::debug!(device_id = %sample.device_id, "Ingested sample");
    state
        .ingest
        .send(sample)
        .await
        .map_err(|_| ApiError::Unavailable("ingest pipeline stopped".to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

async fn samples_handler(State(state): State<AppState>) -> Json<Vec<RawSample>> {
    Json(state.store.samples())
}

async fn readings_handler(State(state): State<AppState>) -> Json<Vec<FusedReading>> {
    Json(state.store.readings())
}

async fn batches_handler(State(state): State<AppState>) -> Result<Json<Vec<ControllerStatus>>, ApiError> {
    Ok(Json(state.control.list().await?))
}

async fn control_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<ControllerStatus>, ApiError> {
    Ok(Json(state.control.status(&batch_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub device: String,
    pub state: SwitchState,
    pub minutes: i64,
}

async fn set_override_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Json(request): Json<OverrideRequest>,
) -> Result<Json<ControllerStatus>, ApiError> {
    let role: DeviceRole = request.device.parse()?;
    let duration = chrono::Duration::try_minutes(request.minutes)
        .ok_or_else(|| ApiError::BadRequest(format!("override of {} minutes is out of range", request.minutes)))?;
    let status = state
        .control
        .set_override(&batch_id, role, request.state, duration)
        .await?;
    Ok(Json(status))
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearQuery {
    pub device: Option<String>,
}

async fn clear_override_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<ControllerStatus>, ApiError> {
    let role = query.device.as_deref().map(str::parse::<DeviceRole>).transpose()?;
    Ok(Json(state.control.clear_override(&batch_id, role).await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<BroadcastHub>) {
    let mut subscription = hub.subscribe();
    let id = subscription.id();
    tracing::info!(subscriber = id, "Websocket client connected");

    loop {
        tokio::select! {
            message = subscription.recv() => {
                // None: the hub dropped us for lagging
                let Some(message) = message else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode hub message");
                        continue;
                    }
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(id);
    tracing::info!(subscriber = id, "Websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fermwatch_hal::ManualClock;
    use fermwatch_sensors::control::ControllerConfig;
    use fermwatch_sensors::control_loop::ControlLoop;
    use fermwatch_sensors::linker::{BatchLinker, BatchRecord, BatchStatus, StaticBatchDirectory};
    use fermwatch_hal::actuator::MockSurface;

    struct Harness {
        state: AppState,
        samples: mpsc::Receiver<RawSample>,
        shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 10, 6, 12, 0, 0).unwrap()));
        let batch = BatchRecord {
            id: "ipa-7".into(),
            status: BatchStatus::Fermenting,
            device_id: Some("ispindel:cellar".into()),
            target_temp_c: Some(19.0),
            heater_entity: Some("switch.heat".into()),
            cooler_entity: Some("switch.cool".into()),
            ..Default::default()
        };
        let linker = Arc::new(BatchLinker::new(
            Arc::new(StaticBatchDirectory::new(vec![batch])),
            clock.clone(),
            chrono::Duration::minutes(5),
        ));
        let store = Arc::new(ReadingStore::new());
        let (control, handle) = ControlLoop::new(
            ControllerConfig::default(),
            linker,
            store.clone(),
            Arc::new(MockSurface::new()),
            clock.clone(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(control.run(shutdown_rx));

        let (ingest, samples) = mpsc::channel(8);
        Harness {
            state: AppState {
                ingest,
                store,
                hub: Arc::new(BroadcastHub::new(8)),
                control: handle,
                clock,
            },
            samples,
            shutdown,
        }
    }

    #[tokio::test]
    async fn ingest_forwards_parsed_samples() {
        let mut h = harness();
        let body = Bytes::from_static(br#"{"name":"cellar","ID":1234,"gravity":1.031,"temperature":18.5}"#);
        let status = ingest_handler(State(h.state.clone()), body).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let sample = h.samples.recv().await.unwrap();
        assert_eq!(sample.device_id, "ispindel:cellar");
        assert_eq!(sample.temp_raw, 18.5);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test]
    async fn malformed_ingest_is_a_bad_request() {
        let h = harness();
        let err = ingest_handler(State(h.state.clone()), Bytes::from_static(b"{\"gravity\":1.0}"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test]
    async fn override_round_trip_through_the_control_loop() {
        let h = harness();
        // let the first tick create the controller
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let request = OverrideRequest { device: "cooler".into(), state: SwitchState::On, minutes: 30 };
        let status = set_override_handler(State(h.state.clone()), Path("ipa-7".into()), Json(request))
            .await
            .unwrap();
        assert!(status.0.state.cooler_override.is_some());

        let cleared = clear_override_handler(
            State(h.state.clone()),
            Path("ipa-7".into()),
            Query(ClearQuery { device: Some("cooler".into()) }),
        )
        .await
        .unwrap();
        assert!(cleared.0.state.cooler_override.is_none());

        let missing = control_handler(State(h.state.clone()), Path("nope".into())).await.unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let h = harness();
        let request = OverrideRequest { device: "fan".into(), state: SwitchState::On, minutes: 5 };
        let err = set_override_handler(State(h.state.clone()), Path("ipa-7".into()), Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let _ = h.shutdown.send(true);
    }

    #[tokio::test]
    async fn out_of_range_override_is_rejected() {
        let h = harness();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        for minutes in [i64::MAX, i64::MIN, 0, 100_000] {
            let request = OverrideRequest { device: "heater".into(), state: SwitchState::On, minutes };
            let err = set_override_handler(State(h.state.clone()), Path("ipa-7".into()), Json(request))
                .await
                .unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{} minutes", minutes);
        }
        let _ = h.shutdown.send(true);
    }

    #[test]
    fn control_errors_map_to_statuses() {
        let conflict = ApiError::from(ControlError::OverrideConflict {
            requested: DeviceRole::Heater,
            other: DeviceRole::Cooler,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(ControlError::LoopStopped).status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
