//! Canonical protocol types for Tandem agent conversations.
//!
//! Every provider runner, whatever its native vocabulary, produces the types in
//! this crate:
//!
//! ```text
//! Client <--[canonical events]--> tandem <--[canonical messages]--> Runner(s)
//!                                                                     |
//!                                                              Provider backend
//!                                                              (claude, codex)
//! ```
//!
//! ## Design Principles
//!
//! 1. **Messages are persistent, events are ephemeral.** `StreamMessage`s are
//!    appended to a session's history; `ServerEvent`s only drive clients.
//! 2. **Provider-neutral.** Clients never see a provider's native event shape.
//! 3. **Statuses form a per-run path.** `idle -> running -> {completed, error, idle}`.

pub mod events;
pub mod messages;
pub mod session;

pub use events::{PendingPermission, ServerEvent};
pub use messages::{ContentBlock, StreamMessage, Usage};
pub use session::{PermissionDecision, Provider, SessionInfo, SessionStatus};
