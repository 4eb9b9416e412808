//! Canvas event stream over WebSocket.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

use superplane::{DomainKind, Hub, HubConfig};

use crate::auth::session_token;
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Upgrade to a WebSocket carrying the canvas's events. Needs stage read on
/// the canvas.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(canvas_id): Path<Uuid>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let token = session_token(&headers).ok_or(ApiError::Unauthenticated)?;
    let claims = state
        .core
        .signer
        .validate(token)
        .map_err(|_| ApiError::Unauthenticated)?;
    state
        .core
        .enforcer
        .require(&claims.sub, DomainKind::Canvas, &canvas_id.to_string(), "stage", "read")?;

    let hub = state.core.hub.clone();
    let config = hub.config().clone();
    Ok(upgrade
        .max_message_size(config.max_message_size)
        .on_upgrade(move |socket| pump(socket, hub, config, canvas_id)))
}

async fn pump(socket: WebSocket, hub: Arc<Hub>, config: HubConfig, canvas_id: Uuid) {
    let mut subscription = hub.register(canvas_id);
    let client_id = subscription.client_id;
    let (mut sink, mut stream) = socket.split();

    let mut ping = interval(config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            message = subscription.receiver.recv() => {
                // The hub drops slow clients by closing their channel.
                let Some(message) = message else { break };
                let frame = Message::Text(message.to_string().into());
                if !matches!(timeout(config.write_wait, sink.send(frame)).await, Ok(Ok(()))) {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > config.pong_wait {
                    debug!(%client_id, "pong timeout");
                    break;
                }
                if !matches!(timeout(config.write_wait, sink.send(Message::Ping(Bytes::new()))).await, Ok(Ok(()))) {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Inbound frames are only liveness signals.
                Some(Ok(_)) => last_seen = Instant::now(),
            },
        }
    }

    hub.unregister(client_id);
    let _ = sink.close().await;
    debug!(%client_id, %canvas_id, "websocket closed");
}
