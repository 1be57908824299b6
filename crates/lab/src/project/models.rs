//! Project data models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user-managed project: the template sessions are spawned from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Optional system prompt prepended to the agent prompt.
    pub system_prompt: Option<String>,
    /// Number of warm pooled sessions to keep available.
    pub pool_size: i64,
    pub created_at: String,
}

/// A container the project wants in every session cluster.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefinition {
    pub id: String,
    pub project_id: String,
    pub image: String,
    /// Environment template as a JSON object string; `${SESSION_ID}` is
    /// substituted at spawn time.
    pub env_template: String,
    pub hostname: Option<String>,
    /// Declared container ports.
    #[sqlx(skip)]
    #[serde(default)]
    pub ports: Vec<ContainerPortSpec>,
}

impl ContainerDefinition {
    /// Render the env template for a session.
    pub fn render_env(&self, session_id: &str) -> HashMap<String, String> {
        let parsed: HashMap<String, String> =
            serde_json::from_str(&self.env_template).unwrap_or_default();
        parsed
            .into_iter()
            .map(|(k, v)| (k, v.replace("${SESSION_ID}", session_id)))
            .collect()
    }
}

/// A declared port on a container definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPortSpec {
    pub container_id: String,
    pub port: i64,
    pub protocol: String,
}

/// Request body for creating a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub pool_size: Option<i64>,
    #[serde(default)]
    pub containers: Vec<NewContainerDefinition>,
}

/// Container definition within a [`NewProject`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContainerDefinition {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_template_substitutes_session_id() {
        let def = ContainerDefinition {
            id: "d1".to_string(),
            project_id: "p1".to_string(),
            image: "app:1".to_string(),
            env_template: r#"{"WORKSPACE":"/workspaces/${SESSION_ID}","PORT":"3000"}"#.to_string(),
            hostname: None,
            ports: vec![],
        };
        let env = def.render_env("abc");
        assert_eq!(env.get("WORKSPACE").unwrap(), "/workspaces/abc");
        assert_eq!(env.get("PORT").unwrap(), "3000");
    }

    #[test]
    fn malformed_template_renders_empty() {
        let def = ContainerDefinition {
            id: "d1".to_string(),
            project_id: "p1".to_string(),
            image: "app:1".to_string(),
            env_template: "not json".to_string(),
            hostname: None,
            ports: vec![],
        };
        assert!(def.render_env("abc").is_empty());
    }
}
