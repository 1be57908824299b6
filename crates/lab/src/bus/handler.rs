//! WebSocket handler for bus client connections.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;

use crate::api::state::AppState;
use lab_protocol::{
    BrowserInputEvent, ChannelKind, ChannelPath, ClientMessage, ServerMessage, SetTypingEvent,
};

use super::snapshots::{authorize, load_snapshot};
use super::ConnId;

type WsSink = SplitSink<WebSocket, Message>;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize bus message: {}", e);
            true
        }
    }
}

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let (conn_id, mut queue) = state.bus.register_connection();
    let (mut sink, mut stream) = socket.split();
    info!("Bus client {} connected", conn_id);

    loop {
        tokio::select! {
            // Fan-out traffic queued for this connection.
            queued = queue.recv() => {
                match queued {
                    Some(message) => {
                        if !send(&mut sink, &message).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Client traffic.
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = serde_json::from_str::<ClientMessage>(text.as_str());
                        match parsed {
                            Ok(message) => {
                                handle_client_message(&state, conn_id, message, &mut sink).await;
                            }
                            Err(e) => {
                                // Malformed traffic is dropped, not fatal.
                                debug!("Ignoring malformed bus message from {}: {}", conn_id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Bus client {} socket error: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    // Drop subscriptions and fire last-unsubscribe hooks.
    for (path, _now_empty) in state.bus.unregister_connection(conn_id) {
        fire_unsubscribe_hook(&state, &path);
    }
    info!("Bus client {} disconnected", conn_id);
}

async fn handle_client_message(
    state: &AppState,
    conn_id: ConnId,
    message: ClientMessage,
    sink: &mut WsSink,
) {
    match message {
        ClientMessage::Ping => {
            send(sink, &ServerMessage::Pong).await;
        }

        ClientMessage::Subscribe { channel } => {
            let path = match ChannelPath::parse(&channel) {
                Ok(path) => path,
                Err(e) => {
                    send(
                        sink,
                        &ServerMessage::Error {
                            channel,
                            error: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            };

            if !authorize(state, &path) {
                send(
                    sink,
                    &ServerMessage::Error {
                        channel,
                        error: "Unauthorized".to_string(),
                    },
                )
                .await;
                return;
            }

            // A second subscribe on the same path would violate the
            // one-snapshot guarantee; ignore it.
            if state.bus.is_subscribed(conn_id, &path) {
                return;
            }

            // Register first so deltas start queueing; anything queued
            // during the snapshot load drains after the snapshot because
            // this task owns both the queue and the sink.
            state.bus.subscribe(conn_id, path);

            match load_snapshot(state, &path).await {
                Ok(data) => {
                    send(sink, &ServerMessage::Snapshot { channel, data }).await;
                    fire_subscribe_hook(state, &path);
                }
                Err(e) => {
                    state.bus.unsubscribe(conn_id, &path);
                    send(
                        sink,
                        &ServerMessage::Error {
                            channel,
                            error: e.to_string(),
                        },
                    )
                    .await;
                }
            }
        }

        ClientMessage::Unsubscribe { channel } => {
            let Ok(path) = ChannelPath::parse(&channel) else {
                return;
            };
            if state.bus.is_subscribed(conn_id, &path) {
                state.bus.unsubscribe(conn_id, &path);
                fire_unsubscribe_hook(state, &path);
            }
        }

        ClientMessage::Event { channel, data } => {
            let Ok(path) = ChannelPath::parse(&channel) else {
                return;
            };
            if !state.bus.is_subscribed(conn_id, &path) {
                send(
                    sink,
                    &ServerMessage::Error {
                        channel,
                        error: "Not subscribed".to_string(),
                    },
                )
                .await;
                return;
            }

            if let Err(error) = handle_channel_event(state, &path, data).await {
                send(sink, &ServerMessage::Error { channel, error }).await;
            }
        }
    }
}

/// Dispatch a client event to its channel's handler.
async fn handle_channel_event(
    state: &AppState,
    path: &ChannelPath,
    data: Value,
) -> Result<(), String> {
    let session_id = path.param.map(|p| p.to_string()).unwrap_or_default();

    match path.kind {
        ChannelKind::SessionTyping => {
            let event: SetTypingEvent =
                serde_json::from_value(data).map_err(|e| e.to_string())?;
            let SetTypingEvent::SetTyping { user_id, typing } = event;
            if state.typing.set_typing(&session_id, &user_id, typing) {
                state.bus.publish_event(
                    ChannelKind::SessionTyping,
                    path.param,
                    serde_json::json!(state.typing.snapshot(&session_id)),
                );
            }
            Ok(())
        }

        ChannelKind::SessionBrowserInput => {
            let event: BrowserInputEvent =
                serde_json::from_value(data).map_err(|e| e.to_string())?;
            let reply = state
                .browser
                .execute_command(&session_id, event.command)
                .await
                .map_err(|e| e.to_string())?;
            state.bus.publish_event(
                ChannelKind::SessionBrowserInput,
                path.param,
                serde_json::to_value(&reply).map_err(|e| e.to_string())?,
            );
            Ok(())
        }

        _ => Err("Channel does not accept client events".to_string()),
    }
}

/// The browser channels are viewer-reference-counted: every frames
/// subscriber counts as one viewer.
fn fire_subscribe_hook(state: &AppState, path: &ChannelPath) {
    if path.kind == ChannelKind::SessionBrowserFrames {
        if let Some(param) = path.param {
            state.browser.subscribe(&param.to_string());
        }
    }
}

fn fire_unsubscribe_hook(state: &AppState, path: &ChannelPath) {
    if path.kind == ChannelKind::SessionBrowserFrames {
        if let Some(param) = path.param {
            state.browser.unsubscribe(&param.to_string());
        }
    }
}
