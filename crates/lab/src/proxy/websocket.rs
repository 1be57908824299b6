//! Bidirectional WebSocket relay for proxied connections.
//!
//! The client side is upgraded before the upstream connection exists;
//! frames the client sends in that window are buffered and flushed in
//! order once the upstream leg is up.

use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// Give a cold upstream this long to start accepting.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn to_upstream(msg: AxumMessage) -> Option<TungsteniteMessage> {
    match msg {
        AxumMessage::Text(text) => Some(TungsteniteMessage::Text(text.to_string().into())),
        AxumMessage::Binary(data) => Some(TungsteniteMessage::Binary(data)),
        AxumMessage::Ping(data) => Some(TungsteniteMessage::Ping(data)),
        AxumMessage::Pong(data) => Some(TungsteniteMessage::Pong(data)),
        AxumMessage::Close(_) => Some(TungsteniteMessage::Close(None)),
    }
}

fn to_client(msg: TungsteniteMessage) -> Option<AxumMessage> {
    match msg {
        TungsteniteMessage::Text(text) => Some(AxumMessage::Text(text.to_string().into())),
        TungsteniteMessage::Binary(data) => Some(AxumMessage::Binary(data)),
        TungsteniteMessage::Ping(data) => Some(AxumMessage::Ping(data)),
        TungsteniteMessage::Pong(data) => Some(AxumMessage::Pong(data)),
        TungsteniteMessage::Close(_) => Some(AxumMessage::Close(None)),
        TungsteniteMessage::Frame(_) => None,
    }
}

/// Relay between an upgraded client socket and `target_url`.
pub async fn bridge_websocket(client_socket: WebSocket, target_url: String) -> anyhow::Result<()> {
    let (mut client_tx, mut client_rx) = client_socket.split();

    // Connect the upstream leg while buffering client frames.
    let mut buffered: Vec<TungsteniteMessage> = Vec::new();
    let mut connect = Box::pin(tokio::time::timeout(
        CONNECT_TIMEOUT,
        connect_async(target_url.clone()),
    ));

    let server_socket = loop {
        tokio::select! {
            result = &mut connect => {
                let (socket, _) = result
                    .map_err(|_| anyhow::anyhow!("upstream {} did not accept within {:?}", target_url, CONNECT_TIMEOUT))?
                    .map_err(|e| anyhow::anyhow!("upstream {} connect failed: {}", target_url, e))?;
                break socket;
            }
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(AxumMessage::Close(_))) | None => {
                        debug!("Client closed before upstream {} connected", target_url);
                        return Ok(());
                    }
                    Some(Ok(msg)) => {
                        if let Some(forward) = to_upstream(msg) {
                            buffered.push(forward);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    };

    let (mut server_tx, mut server_rx) = server_socket.split();

    // Flush the frames that arrived during connect, in order.
    if !buffered.is_empty() {
        debug!(
            "Flushing {} buffered frame(s) to {}",
            buffered.len(),
            target_url
        );
        for frame in buffered.drain(..) {
            server_tx.send(frame).await?;
        }
    }

    let client_to_server = async {
        while let Some(msg) = client_rx.next().await {
            let msg = msg?;
            if let Some(forward) = to_upstream(msg) {
                server_tx.send(forward).await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let server_to_client = async {
        while let Some(msg) = server_rx.next().await {
            let msg = msg?;
            if let Some(forward) = to_client(msg) {
                client_tx.send(forward).await?;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_server => result?,
        result = server_to_client => result?,
    }

    Ok(())
}
