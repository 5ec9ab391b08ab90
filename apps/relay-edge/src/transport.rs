use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_proto::ClientFrame;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{origin_allowed, ConnectInfo};
use crate::link::{ClientLink, Outbound};
use crate::worker::{ChannelStats, TransportEvent, WorkerHandle};

/// Query parameter a reconnecting client uses to keep its socket id.
pub const SOCKET_ID_PARAM: &str = "sid";

pub struct AppState {
    pub worker: WorkerHandle,
    pub allowed_origins: Vec<String>,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    worker_id: String,
    active_sessions: usize,
    channels: Vec<ChannelStats>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/:channel", get(ws_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "workerId": state.worker.worker_id() }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.worker.stats().await {
        Some(channels) => Json(StatsResponse {
            worker_id: state.worker.worker_id().to_string(),
            active_sessions: channels.iter().map(|stats| stats.sessions).sum(),
            channels,
        })
        .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let channel = format!("/{channel}");
    if !state.worker.serves(&channel) {
        debug!(%channel, "upgrade for unserved channel");
        return StatusCode::NOT_FOUND.into_response();
    }
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if !origin_allowed(&state.allowed_origins, origin.as_deref()) {
        warn!(?origin, %channel, "connection attempt from invalid origin");
        counter!("relay_edge_origin_rejected_total", 1, "channel" => channel);
        return (StatusCode::FORBIDDEN, "Forbidden: Invalid Origin").into_response();
    }

    let socket_id = query
        .get(SOCKET_ID_PARAM)
        .filter(|sid| !sid.is_empty())
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let info = ConnectInfo {
        socket_id,
        channel,
        origin,
        query,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, info))
}

#[instrument(
    name = "client_session",
    skip_all,
    fields(channel = %info.channel, socket_id = %info.socket_id)
)]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, info: ConnectInfo) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = ClientLink::new(info.socket_id.clone(), Uuid::new_v4(), tx);
    let channel = info.channel.clone();

    let connected = TransportEvent::Connected {
        channel: channel.clone(),
        link: link.clone(),
        info,
    };
    if !state.worker.send(connected) {
        warn!(socket_id = %link.socket_id(), "worker stopped; refusing connection");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }
    info!(
        %channel,
        socket_id = %link.socket_id(),
        connection = %link.connection(),
        "client connected"
    );

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(error = %err, "failed to encode server frame");
                        continue;
                    }
                },
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    socket_id = %link.socket_id(),
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        };
        if let Some(event) = frame_to_event(&link, &channel, &payload) {
            if !state.worker.send(event) {
                break;
            }
        }
    }

    state.worker.send(TransportEvent::Disconnected {
        channel: channel.clone(),
        socket_id: link.socket_id().to_string(),
        connection: link.connection(),
    });
    writer.abort();
    info!(%channel, socket_id = %link.socket_id(), "client disconnected");
}

/// Turn one client frame into a worker event. Protocol errors are logged
/// and yield `None`.
pub(crate) fn frame_to_event(
    link: &ClientLink,
    channel: &str,
    payload: &[u8],
) -> Option<TransportEvent> {
    let frame: ClientFrame = match serde_json::from_slice(payload) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(socket_id = %link.socket_id(), error = %err, "discarding malformed client frame");
            return None;
        }
    };
    let event = match frame {
        ClientFrame::Event {
            event,
            args,
            ack_id,
        } => {
            let event = match event {
                Value::String(event) => event,
                other => {
                    warn!(
                        socket_id = %link.socket_id(),
                        event = %other,
                        "event name is not a string; discarded"
                    );
                    return None;
                }
            };
            TransportEvent::Event {
                channel: channel.to_string(),
                socket_id: link.socket_id().to_string(),
                connection: link.connection(),
                event,
                args,
                ack: ack_id.map(|ack_id| link.ack_fn(ack_id)),
            }
        }
        ClientFrame::Ack { ack_id, args } => TransportEvent::Ack {
            channel: channel.to_string(),
            socket_id: link.socket_id().to_string(),
            connection: link.connection(),
            ack_id,
            args,
        },
    };
    Some(event)
}
