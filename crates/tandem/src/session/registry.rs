//! Session registry.
//!
//! The single writer of record for sessions and their messages. Durable state
//! lives in SQLite; a live index holds one async mutex per loaded session so
//! that mutations of one session are serialised while different sessions
//! never contend.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use tandem_protocol::{SessionInfo, SessionStatus, StreamMessage};

use super::models::{CreateSessionOptions, SessionHistory, SessionPatch};
use super::repository::SessionRepository;
use crate::error::{Result, TandemError};
use crate::permission::PermissionBroker;

/// `None` once the session has been deleted.
type LiveSession = Arc<Mutex<Option<SessionInfo>>>;

/// Durable session store with per-session serialisation.
#[derive(Debug)]
pub struct SessionRegistry {
    repo: SessionRepository,
    live: DashMap<String, LiveSession>,
    permissions: Arc<PermissionBroker>,
}

impl SessionRegistry {
    pub fn new(repo: SessionRepository, permissions: Arc<PermissionBroker>) -> Self {
        Self {
            repo,
            live: DashMap::new(),
            permissions,
        }
    }

    pub fn permissions(&self) -> &Arc<PermissionBroker> {
        &self.permissions
    }

    /// Live handle for `id`, loading it from storage on first use.
    async fn live_session(&self, id: &str) -> Result<Option<LiveSession>> {
        if let Some(entry) = self.live.get(id) {
            return Ok(Some(Arc::clone(entry.value())));
        }
        let Some(session) = self.repo.get(id).await? else {
            return Ok(None);
        };
        // Another task may have loaded it meanwhile; keep whichever got in first.
        let entry = self
            .live
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Some(session))));
        Ok(Some(Arc::clone(entry.value())))
    }

    /// Create and persist a new idle session.
    pub async fn create(&self, options: CreateSessionOptions) -> Result<SessionInfo> {
        if let Some(external_id) = options.external_id.as_deref() {
            if let Some(existing) = self.repo.get_by_external_id(external_id).await? {
                return Err(TandemError::validation(format!(
                    "external id {} is already bound to session {}",
                    external_id, existing.id
                )));
            }
        }

        let now = Utc::now();
        let session = SessionInfo {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: options.external_id,
            title: options.title,
            cwd: options.cwd.filter(|cwd| !cwd.trim().is_empty()),
            status: SessionStatus::Idle,
            provider: options.provider,
            model: options.model,
            resume_token: None,
            last_prompt: options.prompt,
            allowed_tools: options.allowed_tools,
            metadata: options.metadata,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.repo.create(&session).await {
            // A concurrent create may bind the same external id first.
            if is_unique_violation(&e) {
                return Err(TandemError::validation(format!(
                    "external id {} is already bound to another session",
                    session.external_id.as_deref().unwrap_or_default()
                )));
            }
            return Err(e.into());
        }
        self.live.insert(
            session.id.clone(),
            Arc::new(Mutex::new(Some(session.clone()))),
        );
        info!(
            "Created session {} ({}, provider {})",
            session.id, session.title, session.provider
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionInfo>> {
        let Some(live) = self.live_session(id).await? else {
            return Ok(None);
        };
        let session = live.lock().await.clone();
        Ok(session)
    }

    /// Resolve either an internal session id or an external id.
    pub async fn get_by_tracking_id(&self, key: &str) -> Result<Option<SessionInfo>> {
        if let Some(session) = self.get(key).await? {
            return Ok(Some(session));
        }
        match self.repo.get_by_external_id(key).await? {
            Some(session) => self.get(&session.id).await,
            None => Ok(None),
        }
    }

    pub async fn find_by_resume_token(&self, token: &str) -> Result<Option<SessionInfo>> {
        match self.repo.find_by_resume_token(token).await? {
            Some(session) => self.get(&session.id).await,
            None => Ok(None),
        }
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        Ok(self.repo.list().await?)
    }

    pub async fn list_recent_cwds(&self, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self.repo.recent_cwds(limit).await?)
    }

    /// Session, ordered messages and outstanding permission requests.
    pub async fn history(&self, id: &str) -> Result<Option<SessionHistory>> {
        let Some(live) = self.live_session(id).await? else {
            return Ok(None);
        };
        let guard = live.lock().await;
        let Some(session) = guard.clone() else {
            return Ok(None);
        };

        let payloads = self.repo.messages(id).await?;
        drop(guard);

        let messages = payloads
            .iter()
            .filter_map(|payload| match serde_json::from_str::<StreamMessage>(payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping unreadable message in session {}: {}", id, e);
                    None
                }
            })
            .collect();

        Ok(Some(SessionHistory {
            pending_permissions: self.permissions.pending(id),
            session,
            messages,
        }))
    }

    /// Merge `patch` into the session and persist it.
    ///
    /// Returns `None` when the session is unknown.
    pub async fn update(&self, id: &str, patch: SessionPatch) -> Result<Option<SessionInfo>> {
        let Some(live) = self.live_session(id).await? else {
            return Ok(None);
        };
        let mut guard = live.lock().await;
        let Some(current) = guard.as_ref() else {
            return Ok(None);
        };

        let mut next = current.clone();
        if let Some(status) = patch.status {
            if status != current.status && !current.status.can_transition_to(status) {
                warn!(
                    "Session {} status {} -> {} is outside the run lifecycle",
                    id, current.status, status
                );
            }
        }
        patch.apply(&mut next);

        if !self.repo.save(&next).await? {
            return Ok(None);
        }
        *guard = Some(next.clone());
        debug!("Updated session {} (status {})", id, next.status);
        Ok(Some(next))
    }

    /// Append a message to the session's history.
    ///
    /// Returns `false` for an unknown session or when the message's `uuid`
    /// was already recorded.
    pub async fn record_message(&self, id: &str, message: &StreamMessage) -> Result<bool> {
        let Some(live) = self.live_session(id).await? else {
            return Ok(false);
        };
        let guard = live.lock().await;
        if guard.is_none() {
            return Ok(false);
        }

        let payload = serde_json::to_string(message)
            .map_err(|e| TandemError::Storage(anyhow::Error::new(e).context("encoding message")))?;
        let inserted = self
            .repo
            .append_message(id, message.uuid(), &payload)
            .await?;
        if !inserted {
            debug!(
                "Message {:?} already recorded for session {}",
                message.uuid(),
                id
            );
        }
        Ok(inserted)
    }

    /// Remove a session and all of its messages.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(live) = self.live_session(id).await? else {
            return Ok(false);
        };
        let mut guard = live.lock().await;
        if guard.is_none() {
            return Ok(false);
        }

        let removed = self.repo.delete(id).await?;
        *guard = None;
        self.live.remove(id);
        if removed {
            info!("Deleted session {}", id);
        }
        Ok(removed)
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(sqlx::Error::as_database_error)
        .is_some_and(|db| db.is_unique_violation())
}
