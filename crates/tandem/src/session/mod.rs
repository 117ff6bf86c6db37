//! Sessions: persistence, the live registry and run orchestration.

mod models;
mod registry;
mod repository;
mod service;

pub use models::{CreateSessionOptions, SessionHistory, SessionPatch, SessionRow};
pub use registry::SessionRegistry;
pub use repository::SessionRepository;
pub use service::{ContinueRequest, RunStream, SessionService, StartRequest};
