//! WebSocket bridge: `/ws/scan/{id}` ↔ hub topic `job:<id>`.
//!
//! The socket gets an initial `connected` message, then every event the
//! hub publishes after registration. Keep-alive pings go out on the
//! configured interval; a peer silent past the idle timeout is dropped.
//! If the hub evicts the subscription (slow consumer) the receiver
//! closes and so does the socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::debug;

use zero_core::events::ScanEvent;
use zero_core::hub::job_topic;

use crate::AppState;
use crate::error::ApiError;

pub async fn scan_stream(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    if state.queue.get(&id).is_err() {
        return ApiError::not_found(format!("unknown job {id}")).into_response();
    }
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = pump(socket, state, id).await {
            debug!(error = %e, "scan stream closed");
        }
    })
}

async fn pump(mut socket: WebSocket, state: AppState, job_id: String) -> Result<(), axum::Error> {
    let topic = job_topic(&job_id);
    let mut subscription = state.hub.subscribe(&topic);

    let connected = ScanEvent::Connected {
        job_id: job_id.clone(),
        topic: topic.clone(),
    };
    if let Ok(text) = serde_json::to_string(&connected) {
        socket.send(Message::Text(text.into())).await?;
    }

    let ping_every = Duration::from_secs(state.config.hub.ping_interval_secs.max(1));
    let idle_cap = Duration::from_secs(state.config.hub.idle_timeout_secs.max(1));
    let mut keepalive = tokio::time::interval(ping_every);
    keepalive.tick().await; // the first tick fires immediately
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            event = subscription.rx.recv() => match event {
                Some(text) => socket.send(Message::Text(text.into())).await?,
                // Evicted by the hub: we fell behind, close out
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(message)) => {
                    last_activity = Instant::now();
                    match message {
                        Message::Text(text) if is_client_ping(text.as_str()) => {
                            if let Ok(pong) = serde_json::to_string(&ScanEvent::Pong) {
                                socket.send(Message::Text(pong.into())).await?;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                Some(Err(_)) | None => break,
            },
            _ = keepalive.tick() => {
                socket.send(Message::Ping(Vec::new().into())).await?;
            }
            () = tokio::time::sleep_until(last_activity + idle_cap) => {
                debug!(job_id, "idle peer dropped");
                break;
            }
        }
    }

    state.hub.unsubscribe(subscription.id);
    let _ = socket.send(Message::Close(None)).await;
    Ok(())
}

fn is_client_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .map(|value| value["type"] == "ping")
        .unwrap_or(false)
}
