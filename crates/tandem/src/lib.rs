//! Tandem
//!
//! Provider-agnostic coordinator for cancellable agent conversations: one
//! session model and one canonical event stream over the CLI query provider
//! and the thread API provider, with human-in-the-loop tool permissions and
//! reliable stop.

pub mod api;
pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod permission;
pub mod runner;
pub mod session;
pub mod supervisor;

use std::sync::Arc;

use log::info;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::Result;
use crate::hub::EventHub;
use crate::permission::PermissionBroker;
use crate::runner::RunnerSet;
use crate::session::{SessionRegistry, SessionRepository, SessionService};

/// Open the configured database and wire the in-process session service.
pub async fn build_service(config: &AppConfig) -> Result<Arc<SessionService>> {
    let db_path = config.database_path()?;
    info!("Database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;

    let repo = SessionRepository::new(database.pool().clone());
    let registry = Arc::new(SessionRegistry::new(repo, Arc::new(PermissionBroker::new())));
    Ok(Arc::new(SessionService::new(
        registry,
        RunnerSet::from_config(config),
        EventHub::new(),
    )))
}
