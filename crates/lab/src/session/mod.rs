//! Session orchestration: create, pool, claim, and destroy session
//! clusters.

mod models;
mod monitor;
mod repository;
mod service;

pub use models::{
    container_hostname, network_name, ContainerStatus, CreateSessionRequest, Session,
    SessionContainer, SessionDetail, SessionStatus, UpdateSessionRequest,
};
pub use monitor::ContainerEventMonitor;
pub use repository::SessionRepository;
pub use service::{SessionError, SessionService};
