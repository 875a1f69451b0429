//! Per-item learning sessions and the orchestrator that drives them.

pub mod actions;
pub mod card;
pub mod coaching;
pub mod context;
pub mod orchestrator;
pub mod stage;
pub mod timer;
pub mod transcript;

use serde::Serialize;
use thiserror::Error;

use crate::services::catalog::ItemId;
use crate::storage::StorageError;
use actions::RegistryError;

pub use orchestrator::{ActiveItem, SessionOrchestrator, SessionSnapshot, TurnReport, TurnStatus};

/// Startup failures. Once loaded, the orchestrator surface never fails.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("action registry: {0}")]
    Registry(#[from] RegistryError),
}

/// A fault the orchestrator absorbed while handling a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoveredFault {
    /// Stored memory state was out of domain and got clamped on review.
    ModelFault { item_id: ItemId },
    UnknownAction { name: String },
    /// A registered action was called with bad arguments or refused to run.
    ActionRejected { name: String, reason: String },
    /// The turn resolved after the active item changed; its effects were dropped.
    StaleEffect,
    CollaboratorUnavailable { reason: String },
    /// An effect repeated the preceding transcript entry and was folded into it.
    DuplicateOutcome,
}
