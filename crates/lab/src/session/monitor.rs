//! Container event monitor.
//!
//! One long-running task consumes the provider's event stream and folds
//! observed container state back into the store, publishing a delta for
//! every change. The stream is reconnected with exponential backoff; the
//! monitor itself never exits until cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::ChannelBus;
use crate::logs::LogRegistry;
use crate::sandbox::{ProviderEvent, SandboxProvider, SESSION_LABEL};
use lab_protocol::{ChannelKind, Delta};

use super::models::ContainerStatus;
use super::repository::SessionRepository;

/// Initial reconnect backoff.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Map a provider action to the status it implies, if any.
fn status_for_action(action: &str) -> Option<ContainerStatus> {
    // Health actions arrive as "health_status: unhealthy".
    if action.starts_with("health_status") {
        return if action.contains("unhealthy") {
            Some(ContainerStatus::Error)
        } else {
            None
        };
    }

    match action {
        "start" => Some(ContainerStatus::Running),
        "stop" | "die" | "kill" => Some(ContainerStatus::Stopped),
        "restart" => Some(ContainerStatus::Starting),
        "oom" => Some(ContainerStatus::Error),
        _ => None,
    }
}

/// Normalizes provider events into session-scoped status deltas.
pub struct ContainerEventMonitor {
    provider: Arc<dyn SandboxProvider>,
    repo: SessionRepository,
    bus: Arc<ChannelBus>,
    logs: Arc<LogRegistry>,
}

impl ContainerEventMonitor {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        repo: SessionRepository,
        bus: Arc<ChannelBus>,
        logs: Arc<LogRegistry>,
    ) -> Self {
        Self {
            provider,
            repo,
            bus,
            logs,
        }
    }

    /// Consume the event stream until cancelled, reconnecting on failure.
    pub async fn run(self, token: CancellationToken) {
        let mut backoff = BACKOFF_INITIAL;

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.provider.stream_events(SESSION_LABEL).await {
                Ok(mut stream) => {
                    info!("Container event monitor connected");
                    backoff = BACKOFF_INITIAL;

                    loop {
                        tokio::select! {
                            event = stream.next() => {
                                match event {
                                    Some(event) => self.handle_event(event).await,
                                    None => {
                                        warn!("Container event stream closed");
                                        break;
                                    }
                                }
                            }
                            _ = token.cancelled() => {
                                info!("Container event monitor stopping");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Container event stream failed to open: {}", e);
                }
            }

            debug!("Reconnecting container event stream in {:?}", backoff);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = token.cancelled() => return,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    async fn handle_event(&self, event: ProviderEvent) {
        let Some(status) = status_for_action(&event.action) else {
            return;
        };
        let Some(session_id) = event.attributes.get(SESSION_LABEL) else {
            // Filter should prevent this; tolerate anyway.
            return;
        };

        let container = match self.repo.find_container_by_runtime_id(&event.runtime_id).await {
            Ok(Some(container)) => container,
            Ok(None) => {
                debug!(
                    "Event for unknown runtime {} (session {})",
                    event.runtime_id, session_id
                );
                return;
            }
            Err(e) => {
                error!("Failed to look up container {}: {}", event.runtime_id, e);
                return;
            }
        };

        let error_message = match status {
            ContainerStatus::Error => Some(format!("provider reported {}", event.action)),
            _ => None,
        };

        if let Err(e) = self
            .repo
            .update_container_status(&container.id, status, error_message.as_deref())
            .await
        {
            error!("Failed to update container {} status: {}", container.id, e);
            return;
        }

        debug!(
            "Container {} ({}) -> {} on {}",
            container.hostname, event.runtime_id, status, event.action
        );

        let entry = self.logs.append(
            session_id,
            &container.hostname,
            format!("{} ({})", event.action, status),
        );

        if let Ok(param) = Uuid::parse_str(session_id) {
            if let Ok(Some(updated)) = self.repo.get_container(&container.id).await {
                self.bus.publish_delta(
                    ChannelKind::SessionContainers,
                    Some(param),
                    Delta::update(&updated),
                );
            }
            self.bus
                .publish_delta(ChannelKind::SessionLogs, Some(param), Delta::append(&entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_mapping_matches_design() {
        assert_eq!(status_for_action("start"), Some(ContainerStatus::Running));
        assert_eq!(status_for_action("stop"), Some(ContainerStatus::Stopped));
        assert_eq!(status_for_action("die"), Some(ContainerStatus::Stopped));
        assert_eq!(status_for_action("kill"), Some(ContainerStatus::Stopped));
        assert_eq!(status_for_action("restart"), Some(ContainerStatus::Starting));
        assert_eq!(status_for_action("oom"), Some(ContainerStatus::Error));
        assert_eq!(
            status_for_action("health_status: unhealthy"),
            Some(ContainerStatus::Error)
        );
        assert_eq!(status_for_action("health_status: healthy"), None);
        assert_eq!(status_for_action("exec_create"), None);
        assert_eq!(status_for_action("attach"), None);
    }
}
