//! The closed set of bus channels and their resolved paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error produced when a channel path string cannot be resolved.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelPathError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("channel {0} requires a uuid parameter")]
    MissingParam(&'static str),
    #[error("channel {0} takes no parameter")]
    UnexpectedParam(&'static str),
    #[error("invalid uuid parameter: {0}")]
    InvalidParam(String),
}

/// Every channel a client can subscribe to.
///
/// The wire name is the camelCase path segment before the optional
/// `/{uuid}` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    Projects,
    Sessions,
    SessionMetadata,
    SessionContainers,
    SessionTyping,
    SessionChangedFiles,
    SessionTasks,
    SessionBranches,
    SessionLinks,
    SessionLogs,
    SessionMessages,
    SessionAcpEvents,
    SessionBrowserState,
    SessionBrowserFrames,
    SessionBrowserInput,
    OrchestrationStatus,
    SessionComplete,
}

impl ChannelKind {
    /// Wire name of the channel (the path prefix).
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Projects => "projects",
            ChannelKind::Sessions => "sessions",
            ChannelKind::SessionMetadata => "sessionMetadata",
            ChannelKind::SessionContainers => "sessionContainers",
            ChannelKind::SessionTyping => "sessionTyping",
            ChannelKind::SessionChangedFiles => "sessionChangedFiles",
            ChannelKind::SessionTasks => "sessionTasks",
            ChannelKind::SessionBranches => "sessionBranches",
            ChannelKind::SessionLinks => "sessionLinks",
            ChannelKind::SessionLogs => "sessionLogs",
            ChannelKind::SessionMessages => "sessionMessages",
            ChannelKind::SessionAcpEvents => "sessionAcpEvents",
            ChannelKind::SessionBrowserState => "sessionBrowserState",
            ChannelKind::SessionBrowserFrames => "sessionBrowserFrames",
            ChannelKind::SessionBrowserInput => "sessionBrowserInput",
            ChannelKind::OrchestrationStatus => "orchestrationStatus",
            ChannelKind::SessionComplete => "sessionComplete",
        }
    }

    /// Whether the channel path carries a `{uuid}` parameter.
    pub fn takes_param(&self) -> bool {
        !matches!(self, ChannelKind::Projects | ChannelKind::Sessions)
    }

    fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "projects" => ChannelKind::Projects,
            "sessions" => ChannelKind::Sessions,
            "sessionMetadata" => ChannelKind::SessionMetadata,
            "sessionContainers" => ChannelKind::SessionContainers,
            "sessionTyping" => ChannelKind::SessionTyping,
            "sessionChangedFiles" => ChannelKind::SessionChangedFiles,
            "sessionTasks" => ChannelKind::SessionTasks,
            "sessionBranches" => ChannelKind::SessionBranches,
            "sessionLinks" => ChannelKind::SessionLinks,
            "sessionLogs" => ChannelKind::SessionLogs,
            "sessionMessages" => ChannelKind::SessionMessages,
            "sessionAcpEvents" => ChannelKind::SessionAcpEvents,
            "sessionBrowserState" => ChannelKind::SessionBrowserState,
            "sessionBrowserFrames" => ChannelKind::SessionBrowserFrames,
            "sessionBrowserInput" => ChannelKind::SessionBrowserInput,
            "orchestrationStatus" => ChannelKind::OrchestrationStatus,
            "sessionComplete" => ChannelKind::SessionComplete,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved subscription target: a channel kind plus its parameter.
///
/// For session-scoped channels the parameter is the session id; for
/// `orchestrationStatus` it is the orchestration request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelPath {
    pub kind: ChannelKind,
    pub param: Option<Uuid>,
}

impl ChannelPath {
    /// A parameterless channel path.
    pub fn global(kind: ChannelKind) -> Self {
        Self { kind, param: None }
    }

    /// A parameterized channel path.
    pub fn scoped(kind: ChannelKind, param: Uuid) -> Self {
        Self {
            kind,
            param: Some(param),
        }
    }

    /// Parse a resolved path string such as `sessions` or
    /// `sessionMessages/0f1e...`.
    pub fn parse(raw: &str) -> Result<Self, ChannelPathError> {
        let (name, param) = match raw.split_once('/') {
            Some((name, rest)) => (name, Some(rest)),
            None => (raw, None),
        };

        let kind = ChannelKind::from_name(name)
            .ok_or_else(|| ChannelPathError::UnknownChannel(name.to_string()))?;

        match (kind.takes_param(), param) {
            (true, Some(raw_param)) => {
                let uuid = Uuid::parse_str(raw_param)
                    .map_err(|_| ChannelPathError::InvalidParam(raw_param.to_string()))?;
                Ok(Self::scoped(kind, uuid))
            }
            (true, None) => Err(ChannelPathError::MissingParam(kind.name())),
            (false, None) => Ok(Self::global(kind)),
            (false, Some(_)) => Err(ChannelPathError::UnexpectedParam(kind.name())),
        }
    }
}

impl std::fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.param {
            Some(param) => write!(f, "{}/{}", self.kind.name(), param),
            None => f.write_str(self.kind.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_channels() {
        let path = ChannelPath::parse("sessions").unwrap();
        assert_eq!(path.kind, ChannelKind::Sessions);
        assert!(path.param.is_none());
    }

    #[test]
    fn parses_scoped_channels() {
        let id = Uuid::new_v4();
        let raw = format!("sessionMessages/{}", id);
        let path = ChannelPath::parse(&raw).unwrap();
        assert_eq!(path.kind, ChannelKind::SessionMessages);
        assert_eq!(path.param, Some(id));
        assert_eq!(path.to_string(), raw);
    }

    #[test]
    fn rejects_missing_param() {
        assert_eq!(
            ChannelPath::parse("sessionContainers"),
            Err(ChannelPathError::MissingParam("sessionContainers"))
        );
    }

    #[test]
    fn rejects_param_on_global_channel() {
        let raw = format!("sessions/{}", Uuid::new_v4());
        assert_eq!(
            ChannelPath::parse(&raw),
            Err(ChannelPathError::UnexpectedParam("sessions"))
        );
    }

    #[test]
    fn rejects_unknown_channel() {
        assert!(matches!(
            ChannelPath::parse("nope"),
            Err(ChannelPathError::UnknownChannel(_))
        ));
    }

    #[test]
    fn rejects_malformed_uuid() {
        assert!(matches!(
            ChannelPath::parse("sessionLogs/not-a-uuid"),
            Err(ChannelPathError::InvalidParam(_))
        ));
    }
}
