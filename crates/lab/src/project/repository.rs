//! Project database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{ContainerDefinition, ContainerPortSpec, NewProject, Project};

/// Repository for projects and container definitions.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a project with its container definitions.
    pub async fn create(&self, new: &NewProject) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: new.name.clone(),
            system_prompt: new.system_prompt.clone(),
            pool_size: new.pool_size.unwrap_or(0),
            created_at: Utc::now().to_rfc3339(),
        };

        let mut tx = self.pool.begin().await.context("opening transaction")?;

        sqlx::query(
            "INSERT INTO projects (id, name, system_prompt, pool_size, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.system_prompt)
        .bind(project.pool_size)
        .bind(&project.created_at)
        .execute(&mut *tx)
        .await
        .context("inserting project")?;

        for def in &new.containers {
            let def_id = Uuid::new_v4().to_string();
            let env_template =
                serde_json::to_string(&def.env).context("serializing env template")?;
            sqlx::query(
                "INSERT INTO container_definitions (id, project_id, image, env_template, hostname) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&def_id)
            .bind(&project.id)
            .bind(&def.image)
            .bind(&env_template)
            .bind(&def.hostname)
            .execute(&mut *tx)
            .await
            .context("inserting container definition")?;

            for port in &def.ports {
                sqlx::query(
                    "INSERT INTO container_ports (container_id, port, protocol) VALUES (?, ?, 'tcp')",
                )
                .bind(&def_id)
                .bind(*port as i64)
                .execute(&mut *tx)
                .await
                .context("inserting container port")?;
            }
        }

        tx.commit().await.context("committing project")?;
        Ok(project)
    }

    /// Get a project by id.
    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, name, system_prompt, pool_size, created_at FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching project")?;

        Ok(project)
    }

    /// List all projects.
    pub async fn list(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT id, name, system_prompt, pool_size, created_at FROM projects ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing projects")?;

        Ok(projects)
    }

    /// List projects with a warm pool configured.
    pub async fn list_pooled(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT id, name, system_prompt, pool_size, created_at FROM projects WHERE pool_size > 0",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing pooled projects")?;

        Ok(projects)
    }

    /// Container definitions for a project, ports included.
    pub async fn definitions(&self, project_id: &str) -> Result<Vec<ContainerDefinition>> {
        let mut defs = sqlx::query_as::<_, ContainerDefinition>(
            "SELECT id, project_id, image, env_template, hostname FROM container_definitions WHERE project_id = ? ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("fetching container definitions")?;

        for def in &mut defs {
            def.ports = sqlx::query_as::<_, ContainerPortSpec>(
                "SELECT container_id, port, protocol FROM container_ports WHERE container_id = ? ORDER BY port",
            )
            .bind(&def.id)
            .fetch_all(&self.pool)
            .await
            .context("fetching container ports")?;
        }

        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::project::models::NewContainerDefinition;

    #[tokio::test]
    async fn create_and_read_back() {
        let db = Database::in_memory().await.unwrap();
        let repo = ProjectRepository::new(db.pool().clone());

        let project = repo
            .create(&NewProject {
                name: "web".to_string(),
                system_prompt: Some("be helpful".to_string()),
                pool_size: Some(2),
                containers: vec![NewContainerDefinition {
                    image: "node:22".to_string(),
                    ports: vec![3000, 9229],
                    env: Default::default(),
                    hostname: None,
                }],
            })
            .await
            .unwrap();

        let fetched = repo.get(&project.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.pool_size, 2);

        let defs = repo.definitions(&project.id).await.unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].image, "node:22");
        assert_eq!(defs[0].ports.len(), 2);
        assert_eq!(defs[0].ports[0].port, 3000);
    }
}
