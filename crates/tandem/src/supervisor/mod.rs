//! Process and transport supervision.
//!
//! Decides whether the orchestrator runs in this process or in a supervised
//! sidecar, and gives clients one interface over both.

mod backend;
mod env;
mod sidecar;

pub use backend::{
    BackendMode, EventStream, InProcessBackend, OrchestratorBackend, SidecarBackend,
    connect_backend, error_from_status,
};
pub use env::SidecarEnv;
pub use sidecar::{READY_PREFIX, SidecarSupervisor, parse_ready_line};
