//! Frame cache and the per-session frame pump.
//!
//! The daemon streams screencast frames over a WebSocket on the session's
//! stream port. The pump relays them onto the `sessionBrowserFrames`
//! channel and memoizes the newest one so a viewer joining mid-stream is
//! never blank while the daemon warms.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bus::ChannelBus;
use lab_protocol::ChannelKind;

/// Give a daemon this long to open its stream socket.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The memoized last frame for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedFrame {
    /// Frame payload; binary frames are base64-encoded.
    pub last_frame: String,
    pub timestamp: String,
}

/// Last-frame-per-session cache.
#[derive(Default)]
pub struct FrameCache {
    inner: DashMap<String, CachedFrame>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session_id: &str, frame: String) -> CachedFrame {
        let cached = CachedFrame {
            last_frame: frame,
            timestamp: Utc::now().to_rfc3339(),
        };
        self.inner.insert(session_id.to_string(), cached.clone());
        cached
    }

    pub fn get(&self, session_id: &str) -> Option<CachedFrame> {
        self.inner.get(session_id).map(|f| f.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.inner.remove(session_id);
    }
}

/// Relay frames from the daemon's stream socket onto the bus until the
/// socket closes or the task is aborted.
pub(crate) fn spawn_frame_pump(
    session_id: String,
    stream_port: u16,
    cache: Arc<FrameCache>,
    bus: Arc<ChannelBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let target_url = format!("ws://127.0.0.1:{}", stream_port);
        let channel_param = Uuid::parse_str(&session_id).ok();

        // The daemon may still be binding its socket; retry briefly.
        let start = tokio::time::Instant::now();
        let mut attempts: u32 = 0;
        let socket = loop {
            attempts += 1;
            match connect_async(&target_url).await {
                Ok((socket, _)) => break socket,
                Err(err) => {
                    if start.elapsed() >= STREAM_CONNECT_TIMEOUT {
                        warn!(
                            "Frame stream for session {} not available after {} attempts: {}",
                            session_id, attempts, err
                        );
                        return;
                    }
                    let backoff = Duration::from_millis((attempts.min(20) as u64) * 100);
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        debug!(
            "Frame pump connected for session {} on port {}",
            session_id, stream_port
        );

        let (_, mut stream) = socket.split();
        while let Some(message) = stream.next().await {
            let payload = match message {
                Ok(Message::Binary(data)) => {
                    base64::engine::general_purpose::STANDARD.encode(&data)
                }
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            let cached = cache.set(&session_id, payload);
            if let Some(param) = channel_param {
                bus.publish_event(
                    ChannelKind::SessionBrowserFrames,
                    Some(param),
                    json!({
                        "lastFrame": cached.last_frame,
                        "timestamp": cached.timestamp,
                    }),
                );
            }
        }

        debug!("Frame pump for session {} ended", session_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keeps_newest_frame() {
        let cache = FrameCache::new();
        cache.set("s1", "frame-a".to_string());
        cache.set("s1", "frame-b".to_string());
        assert_eq!(cache.get("s1").unwrap().last_frame, "frame-b");

        cache.remove("s1");
        assert!(cache.get("s1").is_none());
    }
}
