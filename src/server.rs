//! HTTP and WebSocket surface of the bridge.
//!
//! REST endpoints admit, cancel and inspect runs; `/ws/{run_id}` attaches a
//! client to a run's event stream. A socket sends `connection_ack`, replays
//! the backlog, then follows live events, while client frames (`input`,
//! `ping`) are routed back through the hub. Closing the socket never touches
//! the child process.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::ServerSettings;
use crate::events::BridgeEvent;
use crate::hub::BroadcastHub;
use crate::scheduler::{
    Admission, CancelOutcome, QueuePlacement, RunScheduler, SchedulerError, SessionLauncher,
};

pub struct AppState<L: SessionLauncher> {
    pub scheduler: Arc<RunScheduler<L>>,
    pub hub: Arc<BroadcastHub>,
}

/// Bind and serve until ctrl-c, then terminate remaining children.
pub async fn serve<L: SessionLauncher>(
    settings: &ServerSettings,
    state: Arc<AppState<L>>,
) -> Result<()> {
    let listener = TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", settings.host, settings.port))?;
    let local = listener
        .local_addr()
        .context("failed to resolve bound address")?;
    info!(addr = %local, "bridge listening");

    let scheduler = state.scheduler.clone();
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server exited unexpectedly")?;

    info!("shutting down");
    scheduler.shutdown().await;
    Ok(())
}

pub fn build_router<L: SessionLauncher>(state: Arc<AppState<L>>) -> Router {
    Router::new()
        .route("/runs/{run_id}", post(start_run::<L>))
        .route("/runs/{run_id}/cancel", delete(cancel_run::<L>))
        .route("/runs/{run_id}/queue-status", get(queue_status::<L>))
        .route("/system/status", get(system_status::<L>))
        .route("/health", get(health))
        .route("/ws/{run_id}", get(ws_upgrade::<L>))
        .with_state(state)
}

async fn start_run<L: SessionLauncher>(
    State(state): State<Arc<AppState<L>>>,
    Path(run_id): Path<String>,
    job: Option<Json<Value>>,
) -> Response {
    let job = job.map(|Json(job)| job).unwrap_or(Value::Null);
    match state.scheduler.admit(&run_id, job) {
        Admission::Started => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "started", "run_id": run_id})),
        )
            .into_response(),
        Admission::Queued {
            position,
            estimated_wait_minutes,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "queued",
                "run_id": run_id,
                "queue_position": position,
                "estimated_wait_minutes": estimated_wait_minutes,
            })),
        )
            .into_response(),
        Admission::AlreadyRunning => (
            StatusCode::OK,
            Json(json!({"status": "already_running", "run_id": run_id})),
        )
            .into_response(),
        Admission::AlreadyQueued { position } => (
            StatusCode::OK,
            Json(json!({
                "status": "already_queued",
                "run_id": run_id,
                "queue_position": position,
            })),
        )
            .into_response(),
    }
}

async fn cancel_run<L: SessionLauncher>(
    State(state): State<Arc<AppState<L>>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.scheduler.cancel(&run_id) {
        Ok(CancelOutcome::Active) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Run {run_id} is being terminated"),
            })),
        )
            .into_response(),
        Ok(CancelOutcome::Queued) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Run {run_id} removed from queue"),
            })),
        )
            .into_response(),
        Err(err @ SchedulerError::AlreadyCancelled(_)) => (
            StatusCode::OK,
            Json(json!({"success": false, "message": err.to_string()})),
        )
            .into_response(),
        Err(err @ SchedulerError::UnknownRun(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": err.to_string()})),
        )
            .into_response(),
    }
}

async fn queue_status<L: SessionLauncher>(
    State(state): State<Arc<AppState<L>>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.scheduler.placement(&run_id) {
        QueuePlacement::Active => (
            StatusCode::OK,
            Json(json!({"run_id": run_id, "status": "running"})),
        )
            .into_response(),
        QueuePlacement::Queued {
            position,
            estimated_wait_minutes,
        } => (
            StatusCode::OK,
            Json(json!({
                "run_id": run_id,
                "status": "queued",
                "queue_position": position,
                "estimated_wait_minutes": estimated_wait_minutes,
            })),
        )
            .into_response(),
        QueuePlacement::Unknown => (
            StatusCode::NOT_FOUND,
            Json(json!({"run_id": run_id, "status": "not_found"})),
        )
            .into_response(),
    }
}

async fn system_status<L: SessionLauncher>(
    State(state): State<Arc<AppState<L>>>,
) -> Json<Value> {
    let status = state.scheduler.status();
    let available_slots = status.max_concurrent.saturating_sub(status.active_runs);
    Json(json!({
        "active_runs": status.active_runs,
        "max_concurrent": status.max_concurrent,
        "queued_runs": status.queued_runs,
        "total_load": status.active_runs + status.queued_runs,
        "available_slots": available_slots,
        "status": if available_slots == 0 { "at_capacity" } else { "available" },
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "drover-bridge"}))
}

async fn ws_upgrade<L: SessionLauncher>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<L>>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_socket(socket, hub, run_id))
}

async fn run_socket(socket: WebSocket, hub: Arc<BroadcastHub>, run_id: String) {
    info!(run_id, "websocket connected");
    let (mut sink, mut stream) = socket.split();

    let ack = BridgeEvent::ConnectionAck {
        run_id: run_id.clone(),
    };
    if send_event(&mut sink, &ack).await.is_err() {
        return;
    }
    // Subscribing after the ack puts the backlog between ack and live events.
    let mut events = hub.subscribe(&run_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = client_reply(&hub, &run_id, text.as_str()) {
                            if send_event(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(run_id, %err, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }
    info!(run_id, "websocket disconnected");
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &BridgeEvent,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(event.wire_text().into())).await
}

/// Handle one client frame. A `Some` reply goes back on this connection only;
/// input frames are forwarded to the session and produce no reply.
fn client_reply(hub: &BroadcastHub, run_id: &str, text: &str) -> Option<BridgeEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            return Some(BridgeEvent::Error {
                error: format!("malformed client message: {err}"),
            });
        }
    };
    match value.get("type").and_then(Value::as_str) {
        Some("input") => match value.get("data").and_then(Value::as_str) {
            Some(data) => {
                if hub.send_input(run_id, data.to_string()) {
                    None
                } else {
                    Some(BridgeEvent::Error {
                        error: "no session is accepting input".to_string(),
                    })
                }
            }
            None => Some(BridgeEvent::Error {
                error: "input message missing data".to_string(),
            }),
        },
        Some("ping") => Some(BridgeEvent::Pong),
        Some(other) => Some(BridgeEvent::Error {
            error: format!("unknown message type: {other}"),
        }),
        None => Some(BridgeEvent::Error {
            error: "client message missing type".to_string(),
        }),
    }
}
