//! Provider event stream types.

use std::collections::HashMap;

use serde::Deserialize;

/// A normalized container event from the provider.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    /// Provider action ("start", "die", "oom", "health_status: unhealthy", ...).
    pub action: String,
    /// Runtime id of the affected container.
    pub runtime_id: String,
    /// Event attributes (labels, names).
    pub attributes: HashMap<String, String>,
}

/// Raw JSON line emitted by `events --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: RawActor,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl RawEvent {
    /// Keep only container events; the stream filter also matches networks.
    pub(crate) fn into_event(self) -> Option<ProviderEvent> {
        if self.kind != "container" {
            return None;
        }
        Some(ProviderEvent {
            action: self.action,
            runtime_id: self.actor.id,
            attributes: self.actor.attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_container_event() {
        let raw = r#"{"Type":"container","Action":"die","Actor":{"ID":"abc123","Attributes":{"lab.session":"s1","exitCode":"137"}}}"#;
        let event: RawEvent = serde_json::from_str(raw).unwrap();
        let event = event.into_event().unwrap();
        assert_eq!(event.action, "die");
        assert_eq!(event.runtime_id, "abc123");
        assert_eq!(event.attributes.get("lab.session").unwrap(), "s1");
    }

    #[test]
    fn drops_non_container_events() {
        let raw = r#"{"Type":"network","Action":"connect","Actor":{"ID":"net1","Attributes":{}}}"#;
        let event: RawEvent = serde_json::from_str(raw).unwrap();
        assert!(event.into_event().is_none());
    }
}
