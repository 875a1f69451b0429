use serde::{Deserialize, Serialize};

use super::{TurnDirective, TurnRequest};
use crate::session::stage::{InteractionOutcome, Stage};
use crate::session::transcript::Message;

const MAX_HISTORY: usize = 30;

const SYSTEM_PROMPT: &str = "You are a warm, concise vocabulary coach. Keep replies short. \
Use the provided tools only when they clearly help the learner.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub fn build_messages(request: &TurnRequest) -> Vec<ChatMessage> {
    let item = &request.item;
    let mut messages = vec![
        ChatMessage::new("system", SYSTEM_PROMPT),
        ChatMessage::new(
            "system",
            format!(
                "[Context]\nTarget word: \"{}\" ({})\nCurrent step: {}",
                item.word,
                item.definition,
                request.stage.as_str()
            ),
        ),
    ];

    let skip = request.transcript.len().saturating_sub(MAX_HISTORY);
    messages.extend(request.transcript.iter().skip(skip).filter_map(history_entry));

    if let Some(instruction) = directive_instruction(&request.directive, request.allow_actions) {
        messages.push(ChatMessage::new("system", instruction));
    }
    messages
}

fn history_entry(message: &Message) -> Option<ChatMessage> {
    if message.is_placeholder() && message.card.is_none() && message.action.is_none() {
        return None;
    }
    let mut content = message.content.clone();
    if let Some(card) = &message.card {
        push_line(&mut content, &format!("[{} card shown]", card.kind()));
    }
    if let Some(action) = &message.action {
        push_line(&mut content, &format!("[called {} {}]", action.name, action.arguments));
    }
    Some(ChatMessage::new(message.role.as_str(), content))
}

fn push_line(content: &mut String, line: &str) {
    if !content.is_empty() {
        content.push('\n');
    }
    content.push_str(line);
}

fn directive_instruction(directive: &TurnDirective, allow_actions: bool) -> Option<String> {
    let mut instruction = match directive {
        TurnDirective::UserMessage { .. } => return None,
        TurnDirective::InteractionResult { step, outcome } => {
            let verdict = match outcome {
                InteractionOutcome::Passed => "passed",
                InteractionOutcome::Failed => "did not pass",
            };
            format!("[The learner {verdict} the {} step. Respond briefly.]", step.as_str())
        }
        TurnDirective::Proactive { topic } => format!(
            "[The learner has been quiet. {} Start naturally; do not ask whether they are there.]",
            topic.hint()
        ),
        TurnDirective::AutoContinue => "[Auto mode: continue teaching with one new point.]".to_string(),
        TurnDirective::StageEntered { stage } => match stage {
            Stage::Completed => "[All steps are done. Congratulate the learner in one sentence.]".to_string(),
            stage => format!("[The {} step just started. Introduce it in one sentence.]", stage.as_str()),
        },
    };
    if !allow_actions {
        instruction.push_str(" [Reply in text only; do not call tools.]");
    }
    Some(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::Catalog;
    use crate::session::coaching::ProactiveTopic;
    use crate::session::transcript::{ItemSession, NewMessage, PLACEHOLDER};
    use chrono::{TimeZone, Utc};

    fn request(directive: TurnDirective, allow_actions: bool) -> TurnRequest {
        let catalog = Catalog::builtin();
        let mut session = ItemSession::new("pragmatic", Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        session.append(NewMessage::user("what does it mean?"));
        session.append(NewMessage::assistant(PLACEHOLDER));
        TurnRequest {
            item: catalog.get("pragmatic").unwrap().clone(),
            stage: session.stage(),
            transcript: session.transcript.clone(),
            directive,
            tools: Vec::new(),
            allow_actions,
        }
    }

    #[test]
    fn placeholders_are_left_out_of_history() {
        let messages = build_messages(&request(
            TurnDirective::UserMessage { text: "what does it mean?".into() },
            true,
        ));
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].role, "user");
        assert!(messages[1].content.contains("pragmatic"));
    }

    #[test]
    fn proactive_turns_carry_topic_and_text_only_hint() {
        let messages = build_messages(&request(
            TurnDirective::Proactive { topic: ProactiveTopic::Collocation },
            false,
        ));
        let last = messages.last().unwrap();
        assert_eq!(last.role, "system");
        assert!(last.content.contains("collocation"));
        assert!(last.content.contains("do not call tools"));
    }
}
