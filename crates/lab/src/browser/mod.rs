//! Browser daemon orchestration.
//!
//! A desired/actual reconciler keyed by session: viewers flip the desired
//! state, the reconcile loop drives the daemon toward it through the
//! [`DaemonController`] seam, and every transition is published as a patch
//! on `sessionBrowserState/{uuid}`.

mod controller;
mod error;
mod frames;
mod models;
mod orchestrator;
mod repository;

pub use controller::{
    CommandReply, DaemonController, DaemonStatus, HttpDaemonController, StartReply,
};
pub use error::{BrowserError, BrowserResult};
pub use frames::{CachedFrame, FrameCache};
pub use models::{
    select_action, Action, ActualState, BrowserSessionState, DesiredState,
};
pub use orchestrator::{BrowserOrchestrator, BrowserOrchestratorConfig, ReconcileFailure};
pub use repository::BrowserStateRepository;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Mutex;

    use crate::bus::ChannelBus;
    use crate::db::Database;
    use crate::ports::{PortAllocator, PortKind, PortReservationRepository};

    use super::*;

    /// Scripted fake daemon controller.
    #[derive(Default)]
    struct FakeController {
        /// When true, every start attempt fails.
        fail_starts: bool,
        start_calls: AtomicUsize,
        /// session -> daemon status.
        statuses: Mutex<HashMap<String, DaemonStatus>>,
        current_url: Mutex<Option<String>>,
    }

    impl FakeController {
        fn healthy_after_start() -> Self {
            Self::default()
        }

        fn always_failing() -> Self {
            Self {
                fail_starts: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl DaemonController for FakeController {
        async fn start(
            &self,
            session_id: &str,
            stream_port: u16,
            _url: Option<&str>,
        ) -> BrowserResult<StartReply> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_starts {
                return Err(BrowserError::DaemonStartFailed {
                    session_id: session_id.to_string(),
                    detail: "no executable".to_string(),
                });
            }
            self.statuses.lock().await.insert(
                session_id.to_string(),
                DaemonStatus {
                    running: true,
                    ready: true,
                    port: stream_port,
                },
            );
            Ok(StartReply { port: stream_port })
        }

        async fn stop(&self, session_id: &str) -> BrowserResult<()> {
            self.statuses.lock().await.remove(session_id);
            Ok(())
        }

        async fn navigate(&self, _session_id: &str, _url: &str) -> BrowserResult<()> {
            Ok(())
        }

        async fn get_status(&self, session_id: &str) -> BrowserResult<Option<DaemonStatus>> {
            Ok(self.statuses.lock().await.get(session_id).cloned())
        }

        async fn get_current_url(&self, _session_id: &str) -> BrowserResult<Option<String>> {
            Ok(self.current_url.lock().await.clone())
        }

        async fn launch(&self, _session_id: &str) -> BrowserResult<()> {
            Ok(())
        }

        async fn is_healthy(&self) -> bool {
            true
        }

        async fn execute_command(
            &self,
            _session_id: &str,
            command: Value,
        ) -> BrowserResult<CommandReply> {
            Ok(CommandReply {
                id: command["id"].as_str().unwrap_or("cmd").to_string(),
                success: true,
                data: None,
                error: None,
            })
        }
    }

    async fn setup(
        controller: Arc<FakeController>,
        max_retries: i64,
    ) -> (Arc<BrowserOrchestrator>, String, Database) {
        let db = Database::in_memory().await.unwrap();
        let project = crate::project::ProjectRepository::new(db.pool().clone())
            .create(&crate::project::NewProject {
                name: "p".to_string(),
                system_prompt: None,
                pool_size: None,
                containers: vec![],
            })
            .await
            .unwrap();
        let session = crate::session::SessionRepository::new(db.pool().clone())
            .create(&project.id, None, crate::session::SessionStatus::Running)
            .await
            .unwrap();

        let reservations = PortReservationRepository::new(db.pool().clone());
        let ports = Arc::new(PortAllocator::new(9300, 9310, reservations.clone()));
        let orchestrator = BrowserOrchestrator::new(
            BrowserStateRepository::new(db.pool().clone()),
            reservations,
            controller,
            ports,
            Arc::new(ChannelBus::new()),
            BrowserOrchestratorConfig {
                max_retries,
                ..Default::default()
            },
        );
        (orchestrator, session.id, db)
    }

    #[tokio::test]
    async fn reconciles_to_running_within_two_passes() {
        let controller = Arc::new(FakeController::healthy_after_start());
        let (orchestrator, session_id, _db) = setup(controller, 3).await;

        // Desired running, actual stopped.
        let mut state = orchestrator.state(&session_id).await.unwrap();
        state.desired = DesiredState::Running;
        orchestrator
            .repo_for_tests()
            .save(&state)
            .await
            .unwrap();

        // Tick 1: StartDaemon -> starting. Tick 2: WaitForReady -> running.
        orchestrator.reconcile(&session_id).await.unwrap();
        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Starting);
        let port = state.stream_port.unwrap() as u16;
        assert!((9300..=9310).contains(&port));

        orchestrator.reconcile(&session_id).await.unwrap();
        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Running);
        assert!(state.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn stop_releases_port_and_resets_counters() {
        let controller = Arc::new(FakeController::healthy_after_start());
        let (orchestrator, session_id, _db) = setup(controller.clone(), 3).await;

        let mut state = orchestrator.state(&session_id).await.unwrap();
        state.desired = DesiredState::Running;
        orchestrator.repo_for_tests().save(&state).await.unwrap();
        orchestrator.reconcile(&session_id).await.unwrap();
        orchestrator.reconcile(&session_id).await.unwrap();

        let running = orchestrator.state(&session_id).await.unwrap();
        let port = running.stream_port.unwrap() as u16;

        *controller.current_url.lock().await = Some("https://example.test/docs".to_string());

        let mut state = orchestrator.state(&session_id).await.unwrap();
        state.desired = DesiredState::Stopped;
        orchestrator.repo_for_tests().save(&state).await.unwrap();
        orchestrator.reconcile(&session_id).await.unwrap();

        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Stopped);
        assert_eq!(state.stream_port, None);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.last_url.as_deref(), Some("https://example.test/docs"));
        assert!(!orchestrator.ports_for_tests().is_allocated(port, PortKind::Stream).await);
    }

    #[tokio::test]
    async fn retry_cap_yields_exactly_max_start_attempts() {
        let controller = Arc::new(FakeController::always_failing());
        let (orchestrator, session_id, _db) = setup(controller.clone(), 3).await;

        let mut state = orchestrator.state(&session_id).await.unwrap();
        state.desired = DesiredState::Running;
        orchestrator.repo_for_tests().save(&state).await.unwrap();

        // Each failed attempt parks in error; the next tick resets and
        // retries while budget remains. Run plenty of ticks.
        for _ in 0..12 {
            let _ = orchestrator.reconcile(&session_id).await;
        }

        assert_eq!(controller.start_calls.load(Ordering::SeqCst), 3);
        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Error);
        assert_eq!(state.retry_count, 3);
        assert!(state.error_message.is_some());
        assert_eq!(state.stream_port, None);

        // Explicit reset reopens the budget.
        orchestrator.reset(&session_id).await.unwrap();
        let _ = orchestrator.reconcile(&session_id).await;
        assert_eq!(controller.start_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn settled_state_is_a_fixpoint() {
        let controller = Arc::new(FakeController::healthy_after_start());
        let (orchestrator, session_id, _db) = setup(controller.clone(), 3).await;

        orchestrator.reconcile(&session_id).await.unwrap();
        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Stopped);
        assert_eq!(state.desired, DesiredState::Stopped);
        assert_eq!(controller.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn viewer_refcount_drives_desired_state_with_debounce() {
        let controller = Arc::new(FakeController::healthy_after_start());
        let (orchestrator, session_id, _db) = setup(controller, 3).await;

        // Shrink the debounce for the test.
        let orchestrator = {
            let config = BrowserOrchestratorConfig {
                cleanup_delay: std::time::Duration::from_millis(50),
                ..Default::default()
            };
            BrowserOrchestrator::new(
                orchestrator.repo_for_tests().clone(),
                PortReservationRepository::new(_db.pool().clone()),
                Arc::new(FakeController::healthy_after_start()),
                orchestrator.ports_for_tests().clone(),
                Arc::new(ChannelBus::new()),
                config,
            )
        };

        orchestrator.subscribe(&session_id);
        // The subscribe task flips desired and reconciles in background.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if orchestrator.state(&session_id).await.unwrap().desired == DesiredState::Running {
                break;
            }
        }
        assert_eq!(
            orchestrator.state(&session_id).await.unwrap().desired,
            DesiredState::Running
        );

        // Drive to running.
        orchestrator.reconcile(&session_id).await.unwrap();
        orchestrator.reconcile(&session_id).await.unwrap();
        assert_eq!(
            orchestrator.state(&session_id).await.unwrap().actual,
            ActualState::Running
        );

        // A bounce (leave + rejoin inside the debounce window) keeps the
        // browser desired.
        orchestrator.unsubscribe(&session_id);
        orchestrator.subscribe(&session_id);
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(
            orchestrator.state(&session_id).await.unwrap().desired,
            DesiredState::Running
        );

        // A real leave flips desired after the delay and the reconciler
        // winds the daemon down.
        orchestrator.unsubscribe(&session_id);
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if orchestrator.state(&session_id).await.unwrap().desired == DesiredState::Stopped {
                break;
            }
        }
        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.desired, DesiredState::Stopped);

        orchestrator.reconcile(&session_id).await.unwrap();
        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Stopped);
        assert_eq!(state.stream_port, None);
    }

    #[tokio::test]
    async fn crash_during_running_resets_to_stopped() {
        let controller = Arc::new(FakeController::healthy_after_start());
        let (orchestrator, session_id, _db) = setup(controller.clone(), 3).await;

        let mut state = orchestrator.state(&session_id).await.unwrap();
        state.desired = DesiredState::Running;
        orchestrator.repo_for_tests().save(&state).await.unwrap();
        orchestrator.reconcile(&session_id).await.unwrap();
        orchestrator.reconcile(&session_id).await.unwrap();

        // Simulate a daemon crash.
        controller.statuses.lock().await.clear();
        orchestrator.reconcile(&session_id).await.unwrap();

        let state = orchestrator.state(&session_id).await.unwrap();
        assert_eq!(state.actual, ActualState::Stopped);
        assert_eq!(state.stream_port, None);
    }
}
