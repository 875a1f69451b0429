//! The AI side of a turn: streams tokens while it works and finishes with the
//! full text plus at most one requested action.

pub mod openai;
pub mod prompt;
pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::services::catalog::CatalogItem;
use crate::session::coaching::ProactiveTopic;
use crate::session::stage::{InteractionOutcome, Stage};
use crate::session::transcript::Message;

pub use openai::{OpenAiCollaborator, OpenAiConfig};
pub use scripted::{ScriptedCollaborator, ScriptedTurn, TurnGate};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator not configured: {0}")]
    NotConfigured(&'static str),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: reqwest::StatusCode, body: String },
    #[error("JSON decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream ended without a response")]
    EmptyResponse,
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Why this turn is being requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnDirective {
    UserMessage { text: String },
    InteractionResult { step: Stage, outcome: InteractionOutcome },
    Proactive { topic: ProactiveTopic },
    AutoContinue,
    StageEntered { stage: Stage },
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub item: CatalogItem,
    pub stage: Stage,
    pub transcript: Vec<Message>,
    pub directive: TurnDirective,
    /// Tool definitions for the registered actions.
    pub tools: Vec<Value>,
    /// When false the collaborator is asked for plain text only.
    pub allow_actions: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestedAction {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnResponse {
    pub final_text: String,
    pub action: Option<RequestedAction>,
}

#[async_trait]
pub trait Collaborator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Streams tokens in arrival order on `tokens`; a closed receiver is not an
    /// error.
    async fn stream_turn(
        &self,
        request: TurnRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> Result<TurnResponse, CollaboratorError>;
}
