//! Desired/actual reconciler for per-session browser daemons.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::ChannelBus;
use crate::ports::{PortAllocator, PortKind, PortReservationRepository};
use lab_protocol::{ChannelKind, Delta};

use super::controller::{CommandReply, DaemonController};
use super::error::BrowserResult;
use super::frames::{spawn_frame_pump, FrameCache};
use super::models::{select_action, Action, ActualState, BrowserSessionState, DesiredState};
use super::repository::BrowserStateRepository;

/// Capacity of the error listener channel.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct BrowserOrchestratorConfig {
    pub reconcile_interval: Duration,
    pub cleanup_delay: Duration,
    pub max_retries: i64,
}

impl Default for BrowserOrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            cleanup_delay: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Reconciliation failures surfaced to error listeners after a sweep.
#[derive(Debug, Clone)]
pub struct ReconcileFailure {
    pub session_id: String,
    pub message: String,
}

/// The browser orchestrator: holds desired/actual state per session and
/// drives the daemon toward it.
pub struct BrowserOrchestrator {
    repo: BrowserStateRepository,
    reservations: PortReservationRepository,
    controller: Arc<dyn DaemonController>,
    ports: Arc<PortAllocator>,
    bus: Arc<ChannelBus>,
    config: BrowserOrchestratorConfig,
    frames: Arc<FrameCache>,
    /// Per-session reconcile serialization.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Viewer reference counts.
    viewers: DashMap<String, usize>,
    /// Debounce generation per session; a new subscribe invalidates any
    /// armed cleanup timer.
    cleanup_generation: DashMap<String, u64>,
    /// Running frame pumps.
    pumps: DashMap<String, JoinHandle<()>>,
    error_tx: broadcast::Sender<Vec<ReconcileFailure>>,
}

impl BrowserOrchestrator {
    pub fn new(
        repo: BrowserStateRepository,
        reservations: PortReservationRepository,
        controller: Arc<dyn DaemonController>,
        ports: Arc<PortAllocator>,
        bus: Arc<ChannelBus>,
        config: BrowserOrchestratorConfig,
    ) -> Arc<Self> {
        let (error_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Arc::new(Self {
            repo,
            reservations,
            controller,
            ports,
            bus,
            config,
            frames: Arc::new(FrameCache::new()),
            locks: DashMap::new(),
            viewers: DashMap::new(),
            cleanup_generation: DashMap::new(),
            pumps: DashMap::new(),
            error_tx,
        })
    }

    /// Listen for per-sweep reconciliation failures.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Vec<ReconcileFailure>> {
        self.error_tx.subscribe()
    }

    pub fn frame_cache(&self) -> Arc<FrameCache> {
        self.frames.clone()
    }

    /// Current state for a session (initial state when none persisted).
    pub async fn state(&self, session_id: &str) -> BrowserResult<BrowserSessionState> {
        Ok(self
            .repo
            .get(session_id)
            .await?
            .unwrap_or_else(|| BrowserSessionState::initial(session_id)))
    }

    // ------------------------------------------------------------------
    // Viewer reference counting
    // ------------------------------------------------------------------

    /// A viewer joined. The first viewer flips `desired` to running.
    pub fn subscribe(self: &Arc<Self>, session_id: &str) {
        let count = {
            let mut entry = self.viewers.entry(session_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.bump_generation(session_id);
        debug!("Browser viewer joined session {} (count {})", session_id, count);

        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if count == 1 {
                if let Err(e) = this.set_desired(&session_id, DesiredState::Running).await {
                    warn!("Failed to mark browser desired for {}: {}", session_id, e);
                    return;
                }
                // Lazily materialize the viewport; the daemon treats this
                // as advisory.
                if let Err(e) = this.controller.launch(&session_id).await {
                    debug!("Browser launch hint for {} failed: {}", session_id, e);
                }
            }
            if let Err(e) = this.reconcile(&session_id).await {
                warn!("Reconcile after subscribe failed for {}: {}", session_id, e);
            }
        });
    }

    /// A viewer left. The last leave arms the cleanup debounce timer.
    pub fn unsubscribe(self: &Arc<Self>, session_id: &str) {
        let count = {
            let Some(mut entry) = self.viewers.get_mut(session_id) else {
                return;
            };
            *entry = entry.saturating_sub(1);
            *entry
        };
        debug!("Browser viewer left session {} (count {})", session_id, count);
        if count > 0 {
            return;
        }

        let generation = self.bump_generation(session_id);
        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.cleanup_delay).await;

            // A reload re-subscribed in the meantime; stand down.
            let stale = this
                .cleanup_generation
                .get(&session_id)
                .map(|g| *g != generation)
                .unwrap_or(true);
            let viewers = this.viewers.get(&session_id).map(|v| *v).unwrap_or(0);
            if stale || viewers > 0 {
                return;
            }

            if let Err(e) = this.set_desired(&session_id, DesiredState::Stopped).await {
                warn!("Failed to mark browser undesired for {}: {}", session_id, e);
                return;
            }
            if let Err(e) = this.reconcile(&session_id).await {
                warn!("Reconcile after unsubscribe failed for {}: {}", session_id, e);
            }
        });
    }

    fn bump_generation(&self, session_id: &str) -> u64 {
        let mut entry = self.cleanup_generation.entry(session_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    async fn set_desired(&self, session_id: &str, desired: DesiredState) -> BrowserResult<()> {
        let mut state = self.state(session_id).await?;
        if state.desired == desired {
            return Ok(());
        }
        state.desired = desired;
        self.repo.save(&state).await?;
        self.publish_state(&state);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Reconcile one session, serialized per session id.
    pub async fn reconcile(&self, session_id: &str) -> BrowserResult<()> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut state = self.state(session_id).await?;
        let action = select_action(
            state.desired,
            state.actual,
            state.retry_count,
            self.config.max_retries,
        );

        if action != Action::NoOp {
            debug!(
                "Reconciling browser for {}: desired={} actual={} -> {:?}",
                session_id, state.desired, state.actual, action
            );
        }

        match action {
            Action::NoOp => Ok(()),
            Action::StartDaemon => self.start_daemon(&mut state).await,
            Action::WaitForReady => self.wait_for_ready(&mut state).await,
            Action::CheckAlive => self.check_alive(&mut state).await,
            Action::ResetToStopped => {
                state.actual = ActualState::Stopped;
                self.repo.save(&state).await?;
                self.publish_state(&state);
                Ok(())
            }
            Action::StopDaemon => self.stop_daemon(&mut state).await,
            Action::WaitForStopped => self.wait_for_stopped(&mut state).await,
        }
    }

    async fn start_daemon(&self, state: &mut BrowserSessionState) -> BrowserResult<()> {
        let session_id = state.session_id.clone();

        // Reuse a surviving reservation (crash recovery), else allocate.
        let port = match self
            .reservations
            .find_for_session(&session_id, PortKind::Stream)
            .await?
        {
            Some(port) => {
                self.ports.reserve(port, PortKind::Stream).await;
                port
            }
            None => self.ports.allocate(&session_id, PortKind::Stream).await?,
        };

        state.retry_count += 1;
        state.stream_port = Some(port as i64);
        state.actual = ActualState::Starting;
        state.error_message = None;
        self.repo.save(state).await?;
        self.publish_state(state);

        info!(
            "Starting browser daemon for session {} on stream port {} (attempt {})",
            session_id, port, state.retry_count
        );

        match self
            .controller
            .start(&session_id, port, state.last_url.as_deref())
            .await
        {
            Ok(reply) => {
                if reply.port != port {
                    warn!(
                        "Daemon for {} reported port {} instead of {}",
                        session_id, reply.port, port
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.ports.release(port, PortKind::Stream).await?;
                state.stream_port = None;
                state.actual = ActualState::Error;
                state.error_message = Some(e.to_string());
                self.repo.save(state).await?;
                self.publish_state(state);
                Err(e)
            }
        }
    }

    async fn wait_for_ready(&self, state: &mut BrowserSessionState) -> BrowserResult<()> {
        let session_id = state.session_id.clone();
        match self.controller.get_status(&session_id).await? {
            None => {
                // The daemon vanished while starting; fall back to stopped
                // and let the next tick re-issue a start if still desired.
                self.release_stream_port(state).await?;
                state.actual = ActualState::Stopped;
                self.repo.save(state).await?;
                self.publish_state(state);
                Ok(())
            }
            Some(status) if status.ready => {
                state.actual = ActualState::Running;
                state.error_message = None;
                state.last_heartbeat_at = Some(Utc::now().to_rfc3339());
                self.repo.save(state).await?;
                self.publish_state(state);
                self.start_pump(state);

                if let Some(url) = state.last_url.clone() {
                    if let Err(e) = self.controller.navigate(&session_id, &url).await {
                        warn!("Initial navigation for {} failed: {}", session_id, e);
                        state.error_message = Some(e.to_string());
                        self.repo.save(state).await?;
                        self.publish_state(state);
                    }
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    async fn check_alive(&self, state: &mut BrowserSessionState) -> BrowserResult<()> {
        let session_id = state.session_id.clone();
        let status = self.controller.get_status(&session_id).await?;
        let alive = status.as_ref().is_some_and(|s| s.running);

        if alive {
            state.last_heartbeat_at = Some(Utc::now().to_rfc3339());
            // Heartbeats are persisted but not broadcast; they would drown
            // the channel.
            self.repo.save(state).await?;
            return Ok(());
        }

        warn!("Browser daemon for session {} is gone; resetting", session_id);
        self.stop_pump(&session_id);
        self.release_stream_port(state).await?;
        state.actual = ActualState::Stopped;
        self.repo.save(state).await?;
        self.publish_state(state);
        Ok(())
    }

    async fn stop_daemon(&self, state: &mut BrowserSessionState) -> BrowserResult<()> {
        let session_id = state.session_id.clone();

        // Preserve where the user was for the next start.
        if let Ok(Some(url)) = self.controller.get_current_url(&session_id).await {
            if !url.trim().is_empty() {
                state.last_url = Some(url);
            }
        }

        state.actual = ActualState::Stopping;
        self.repo.save(state).await?;
        self.publish_state(state);
        self.stop_pump(&session_id);

        match self.controller.stop(&session_id).await {
            Ok(()) => {
                self.release_stream_port(state).await?;
                state.actual = ActualState::Stopped;
                state.retry_count = 0;
                state.error_message = None;
                self.repo.save(state).await?;
                self.publish_state(state);
                info!("Browser daemon for session {} stopped", session_id);
                Ok(())
            }
            Err(e) => {
                // Stay in stopping; WaitForStopped polls until the daemon
                // is confirmed gone.
                state.error_message = Some(e.to_string());
                self.repo.save(state).await?;
                self.publish_state(state);
                Err(e)
            }
        }
    }

    async fn wait_for_stopped(&self, state: &mut BrowserSessionState) -> BrowserResult<()> {
        let session_id = state.session_id.clone();
        let status = self.controller.get_status(&session_id).await?;
        let gone = match status {
            None => true,
            Some(status) => !status.running,
        };

        if gone {
            self.stop_pump(&session_id);
            self.release_stream_port(state).await?;
            state.actual = ActualState::Stopped;
            state.retry_count = 0;
            state.error_message = None;
            self.repo.save(state).await?;
            self.publish_state(state);
        }
        Ok(())
    }

    /// Explicit operator reset for a session parked in error.
    pub async fn reset(&self, session_id: &str) -> BrowserResult<()> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut state = self.state(session_id).await?;
        state.actual = ActualState::Stopped;
        state.retry_count = 0;
        state.error_message = None;
        self.repo.save(&state).await?;
        self.publish_state(&state);
        Ok(())
    }

    /// Unconditional teardown used by session destruction.
    pub async fn force_stop(&self, session_id: &str) -> BrowserResult<()> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        self.stop_pump(session_id);
        if let Err(e) = self.controller.stop(session_id).await {
            debug!("Force-stop of daemon for {} reported: {}", session_id, e);
        }

        if let Some(mut state) = self.repo.get(session_id).await? {
            self.release_stream_port(&mut state).await?;
        }
        self.repo.delete(session_id).await?;
        self.frames.remove(session_id);
        self.viewers.remove(session_id);
        self.cleanup_generation.remove(session_id);
        self.locks.remove(session_id);
        Ok(())
    }

    /// Pass a client command through to the daemon.
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: Value,
    ) -> BrowserResult<CommandReply> {
        self.controller.execute_command(session_id, command).await
    }

    // ------------------------------------------------------------------
    // Sweep loop
    // ------------------------------------------------------------------

    /// Reconcile every known session once. Per-session failures are
    /// collected and surfaced to error listeners; the sweep never aborts.
    pub async fn reconcile_all(&self, token: &CancellationToken) {
        let states = match self.repo.list().await {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to list browser states: {}", e);
                return;
            }
        };

        let mut failures = Vec::new();
        for state in states {
            if token.is_cancelled() {
                break;
            }
            if let Err(e) = self.reconcile(&state.session_id).await {
                failures.push(ReconcileFailure {
                    session_id: state.session_id.clone(),
                    message: e.to_string(),
                });
            }
        }

        if !failures.is_empty() {
            warn!("Browser reconcile sweep had {} failure(s)", failures.len());
            let _ = self.error_tx.send(failures);
        }
    }

    /// The reconcile loop. Runs until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Browser reconciler running every {:?}",
            self.config.reconcile_interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile_all(&token).await;
                }
                _ = token.cancelled() => {
                    info!("Browser reconciler stopping");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn release_stream_port(&self, state: &mut BrowserSessionState) -> BrowserResult<()> {
        if let Some(port) = state.stream_port.take() {
            self.ports.release(port as u16, PortKind::Stream).await?;
        }
        Ok(())
    }

    fn start_pump(&self, state: &BrowserSessionState) {
        let Some(port) = state.stream_port else {
            return;
        };
        self.stop_pump(&state.session_id);
        let handle = spawn_frame_pump(
            state.session_id.clone(),
            port as u16,
            self.frames.clone(),
            self.bus.clone(),
        );
        self.pumps.insert(state.session_id.clone(), handle);
    }

    fn stop_pump(&self, session_id: &str) {
        if let Some((_, handle)) = self.pumps.remove(session_id) {
            handle.abort();
        }
    }

    fn publish_state(&self, state: &BrowserSessionState) {
        let Ok(param) = Uuid::parse_str(&state.session_id) else {
            return;
        };
        self.bus.publish_delta(
            ChannelKind::SessionBrowserState,
            Some(param),
            Delta::patch(state),
        );
    }
}

#[cfg(test)]
impl BrowserOrchestrator {
    pub(crate) fn repo_for_tests(&self) -> &BrowserStateRepository {
        &self.repo
    }

    pub(crate) fn ports_for_tests(&self) -> &Arc<PortAllocator> {
        &self.ports
    }
}
