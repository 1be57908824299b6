//! Browser session state machine.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// What the viewers want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Stopped,
    Running,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::Stopped => write!(f, "stopped"),
            DesiredState::Running => write!(f, "running"),
        }
    }
}

impl std::str::FromStr for DesiredState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(DesiredState::Stopped),
            "running" => Ok(DesiredState::Running),
            other => Err(format!("unknown desired state: {}", other)),
        }
    }
}

impl TryFrom<String> for DesiredState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// What the daemon is actually doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ActualState {
    /// States in which the session holds its stream port.
    pub fn holds_port(&self) -> bool {
        matches!(
            self,
            ActualState::Starting | ActualState::Running | ActualState::Stopping
        )
    }
}

impl std::fmt::Display for ActualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActualState::Stopped => write!(f, "stopped"),
            ActualState::Starting => write!(f, "starting"),
            ActualState::Running => write!(f, "running"),
            ActualState::Stopping => write!(f, "stopping"),
            ActualState::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ActualState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ActualState::Stopped),
            "starting" => Ok(ActualState::Starting),
            "running" => Ok(ActualState::Running),
            "stopping" => Ok(ActualState::Stopping),
            "error" => Ok(ActualState::Error),
            other => Err(format!("unknown actual state: {}", other)),
        }
    }
}

impl TryFrom<String> for ActualState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Durable reconciliation state for one session's browser.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionState {
    pub session_id: String,
    #[sqlx(try_from = "String")]
    pub desired: DesiredState,
    #[sqlx(try_from = "String")]
    pub actual: ActualState,
    pub stream_port: Option<i64>,
    pub last_url: Option<String>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub last_heartbeat_at: Option<String>,
}

impl BrowserSessionState {
    /// Fresh state for a session with no browser history.
    pub fn initial(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            desired: DesiredState::Stopped,
            actual: ActualState::Stopped,
            stream_port: None,
            last_url: None,
            retry_count: 0,
            error_message: None,
            last_heartbeat_at: None,
        }
    }
}

/// The reconciler's next move for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartDaemon,
    WaitForReady,
    CheckAlive,
    ResetToStopped,
    StopDaemon,
    WaitForStopped,
    NoOp,
}

/// Pure action selection over `desired x actual`.
///
/// A session whose retry budget is exhausted is parked in `error` until an
/// explicit reset; the reconciler never restarts it on its own.
pub fn select_action(
    desired: DesiredState,
    actual: ActualState,
    retry_count: i64,
    max_retries: i64,
) -> Action {
    if actual == ActualState::Error {
        return if desired == DesiredState::Running && retry_count < max_retries {
            Action::ResetToStopped
        } else {
            Action::NoOp
        };
    }

    match (desired, actual) {
        (DesiredState::Running, ActualState::Stopped) => Action::StartDaemon,
        (DesiredState::Running, ActualState::Starting) => Action::WaitForReady,
        (DesiredState::Running, ActualState::Running) => Action::CheckAlive,
        (DesiredState::Running, ActualState::Stopping) => Action::WaitForStopped,
        (DesiredState::Stopped, ActualState::Running) => Action::StopDaemon,
        (DesiredState::Stopped, ActualState::Starting) => Action::StopDaemon,
        (DesiredState::Stopped, ActualState::Stopping) => Action::WaitForStopped,
        (DesiredState::Stopped, ActualState::Stopped) => Action::NoOp,
        // Error rows are handled above.
        (_, ActualState::Error) => Action::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_table_matches_design() {
        use ActualState as A;
        use DesiredState as D;

        assert_eq!(select_action(D::Running, A::Stopped, 0, 3), Action::StartDaemon);
        assert_eq!(select_action(D::Running, A::Starting, 0, 3), Action::WaitForReady);
        assert_eq!(select_action(D::Running, A::Running, 0, 3), Action::CheckAlive);
        assert_eq!(select_action(D::Stopped, A::Running, 0, 3), Action::StopDaemon);
        assert_eq!(select_action(D::Stopped, A::Starting, 0, 3), Action::StopDaemon);
        assert_eq!(select_action(D::Stopped, A::Stopping, 0, 3), Action::WaitForStopped);
        assert_eq!(select_action(D::Stopped, A::Stopped, 0, 3), Action::NoOp);
    }

    #[test]
    fn error_state_resets_while_budget_remains() {
        use ActualState as A;
        use DesiredState as D;

        assert_eq!(select_action(D::Running, A::Error, 2, 3), Action::ResetToStopped);
        assert_eq!(select_action(D::Running, A::Error, 3, 3), Action::NoOp);
        assert_eq!(select_action(D::Stopped, A::Error, 0, 3), Action::NoOp);
    }

    #[test]
    fn settled_state_produces_no_actions() {
        use ActualState as A;
        use DesiredState as D;

        assert_eq!(select_action(D::Stopped, A::Stopped, 0, 3), Action::NoOp);
        // desired == actual == running still checks liveness; that is the
        // only observation-only action in a settled state.
        assert_eq!(select_action(D::Running, A::Running, 0, 3), Action::CheckAlive);
    }

    #[test]
    fn port_holding_states() {
        assert!(!ActualState::Stopped.holds_port());
        assert!(ActualState::Starting.holds_port());
        assert!(ActualState::Running.holds_port());
        assert!(ActualState::Stopping.holds_port());
        assert!(!ActualState::Error.holds_port());
    }
}
