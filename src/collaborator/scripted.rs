use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::{Collaborator, CollaboratorError, RequestedAction, TurnDirective, TurnRequest, TurnResponse};
use crate::session::coaching::ProactiveTopic;
use crate::session::stage::{InteractionOutcome, Stage};

/// One canned collaborator turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedTurn {
    Reply { tokens: Vec<String> },
    Action { tokens: Vec<String>, name: String, arguments: Value },
    Fail(String),
}

impl ScriptedTurn {
    pub fn reply(text: &str) -> Self {
        ScriptedTurn::Reply { tokens: tokenize(text) }
    }

    pub fn action(name: &str, arguments: Value) -> Self {
        Self::action_with_text("", name, arguments)
    }

    pub fn action_with_text(text: &str, name: &str, arguments: Value) -> Self {
        ScriptedTurn::Action {
            tokens: tokenize(text),
            name: name.to_string(),
            arguments,
        }
    }

    pub fn fail(reason: &str) -> Self {
        ScriptedTurn::Fail(reason.to_string())
    }
}

/// Splits text into word-sized tokens that concatenate back to the input.
fn tokenize(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

/// Test-side handle for a turn held in flight.
pub struct TurnGate {
    entered: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl TurnGate {
    /// Resolves once the held turn has streamed its tokens and is waiting.
    pub async fn entered(&mut self) {
        let _ = (&mut self.entered).await;
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

struct HeldTurn {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Offline collaborator. Plays queued turns in order; with an empty queue it
/// answers from the item's catalog data.
#[derive(Default)]
pub struct ScriptedCollaborator {
    script: Mutex<VecDeque<ScriptedTurn>>,
    held: Mutex<Option<HeldTurn>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        let collaborator = Self::new();
        collaborator.script.lock().extend(turns);
        collaborator
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.script.lock().push_back(turn);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }

    /// The next turn streams its tokens, then waits for [`TurnGate::release`]
    /// before returning.
    pub fn hold_next_turn(&self) -> TurnGate {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.held.lock() = Some(HeldTurn {
            entered: entered_tx,
            release: release_rx,
        });
        TurnGate {
            entered: entered_rx,
            release: release_tx,
        }
    }
}

#[async_trait]
impl Collaborator for ScriptedCollaborator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream_turn(
        &self,
        request: TurnRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> Result<TurnResponse, CollaboratorError> {
        self.requests.lock().push(request.clone());
        let turn = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| offline_turn(&request));
        let held = self.held.lock().take();

        let streamed = match &turn {
            ScriptedTurn::Reply { tokens: parts } | ScriptedTurn::Action { tokens: parts, .. } => {
                for part in parts {
                    let _ = tokens.send(part.clone());
                    tokio::task::yield_now().await;
                }
                parts.concat()
            }
            ScriptedTurn::Fail(_) => String::new(),
        };

        if let Some(held) = held {
            let _ = held.entered.send(());
            let _ = held.release.await;
        }

        match turn {
            ScriptedTurn::Reply { .. } => Ok(TurnResponse {
                final_text: streamed,
                action: None,
            }),
            ScriptedTurn::Action { name, arguments, .. } => Ok(TurnResponse {
                final_text: streamed,
                action: Some(RequestedAction { name, arguments }),
            }),
            ScriptedTurn::Fail(reason) => Err(CollaboratorError::Unavailable(reason)),
        }
    }
}

fn offline_turn(request: &TurnRequest) -> ScriptedTurn {
    let item = &request.item;
    let word = &item.word;
    let text = match &request.directive {
        TurnDirective::UserMessage { .. } if request.stage == Stage::Introduction => format!(
            "\"{word}\" means {}. Say \"got it\" when you're ready to move on.",
            item.definition
        ),
        TurnDirective::UserMessage { .. } => format!("Nice! Keep practising \"{word}\"."),
        TurnDirective::InteractionResult { outcome: InteractionOutcome::Passed, .. } => "Well done!".to_string(),
        TurnDirective::InteractionResult { outcome: InteractionOutcome::Failed, .. } => {
            "Not quite. Give it another try.".to_string()
        }
        TurnDirective::Proactive { topic } => match topic {
            ProactiveTopic::UsageExample => format!("Here's another one: {}", item.example_sentence),
            ProactiveTopic::CulturalFact => format!("In plain English, \"{word}\" is {}.", item.definition_en),
            ProactiveTopic::Collocation => format!("Try using \"{word}\" in a sentence about your day."),
            ProactiveTopic::MemoryHook => format!("Memory hook: {}", item.spelling_hint),
            ProactiveTopic::Etymology => format!("Every word has a story, and \"{word}\" is no exception."),
        },
        TurnDirective::AutoContinue => format!("{} ({})", item.example_sentence, item.example_translation),
        TurnDirective::StageEntered { stage } => match stage {
            Stage::Introduction => format!("Let's meet \"{word}\"."),
            Stage::RecognitionCheck => "Quick check: pick the right meaning.".to_string(),
            Stage::ProductionCheck => "Now try spelling it.".to_string(),
            Stage::FreeProduction => "Last step: write your own sentence.".to_string(),
            Stage::Completed => format!("You've got \"{word}\" down!"),
        },
    };
    ScriptedTurn::reply(&text)
}
