//! Projects and their container definitions.

mod models;
mod repository;

pub use models::{ContainerDefinition, ContainerPortSpec, NewProject, Project};
pub use repository::ProjectRepository;
