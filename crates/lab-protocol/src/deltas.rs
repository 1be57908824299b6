//! Generic delta shapes clients fold into their local channel snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An incremental update to a channel's snapshot.
///
/// Array channels use `add`/`remove`/`update` (and `append` for streaming
/// message fragments); object channels use `patch`. Item fields are
/// flattened into the delta object so the client sees
/// `{"type":"add","id":...,...}` rather than a nested wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Delta {
    /// Append an item to an array snapshot.
    Add {
        #[serde(flatten)]
        item: Value,
    },
    /// Remove the item with a matching `id`.
    Remove {
        #[serde(flatten)]
        item: Value,
    },
    /// Shallow-merge onto the existing item with a matching `id`.
    Update {
        #[serde(flatten)]
        item: Value,
    },
    /// Append a streaming fragment to a message channel.
    Append { message: Value },
    /// Shallow-merge fields onto an object snapshot.
    Patch {
        #[serde(flatten)]
        fields: Value,
    },
}

impl Delta {
    /// Build an `add` delta from any serializable item.
    pub fn add<T: Serialize>(item: &T) -> Self {
        Delta::Add {
            item: serde_json::to_value(item).unwrap_or(Value::Null),
        }
    }

    /// Build a `remove` delta carrying just the item id.
    pub fn remove(id: impl std::fmt::Display) -> Self {
        Delta::Remove {
            item: serde_json::json!({ "id": id.to_string() }),
        }
    }

    /// Build an `update` delta from any serializable item.
    pub fn update<T: Serialize>(item: &T) -> Self {
        Delta::Update {
            item: serde_json::to_value(item).unwrap_or(Value::Null),
        }
    }

    /// Build an `append` delta for a streaming message fragment.
    pub fn append<T: Serialize>(message: &T) -> Self {
        Delta::Append {
            message: serde_json::to_value(message).unwrap_or(Value::Null),
        }
    }

    /// Build a `patch` delta from any serializable field set.
    pub fn patch<T: Serialize>(fields: &T) -> Self {
        Delta::Patch {
            fields: serde_json::to_value(fields).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_flattens_item_fields() {
        let delta = Delta::add(&json!({"id": "abc", "status": "running"}));
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value["type"], "add");
        assert_eq!(value["id"], "abc");
        assert_eq!(value["status"], "running");
    }

    #[test]
    fn remove_carries_id() {
        let value = serde_json::to_value(Delta::remove("abc")).unwrap();
        assert_eq!(value["type"], "remove");
        assert_eq!(value["id"], "abc");
    }

    #[test]
    fn patch_flattens_fields() {
        let delta = Delta::patch(&json!({"actual": "running", "streamPort": 9301}));
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(value["type"], "patch");
        assert_eq!(value["actual"], "running");
        assert_eq!(value["streamPort"], 9301);
    }
}
