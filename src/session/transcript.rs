use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::services::catalog::ItemId;
use crate::session::card::CardPayload;
use crate::session::coaching::ProactiveTopic;
use crate::session::stage::{MasteryFlags, Stage, StageMachine};

pub type MessageId = String;

/// Content of the in-flight bubble before the first streamed token arrives.
pub const PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A collaborator-issued action as it was executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Stage>,
}

impl Message {
    pub fn is_placeholder(&self) -> bool {
        self.content.is_empty() || self.content == PLACEHOLDER
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub card: Option<CardPayload>,
    pub action: Option<ActionRecord>,
    pub step: Option<Stage>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            card: None,
            action: None,
            step: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn card(card: CardPayload) -> Self {
        Self::new(Role::Assistant, "").with_card(card)
    }

    pub fn with_card(mut self, card: CardPayload) -> Self {
        self.card = Some(card);
        self
    }

    pub fn with_action(mut self, action: ActionRecord) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_step(mut self, step: Stage) -> Self {
        self.step = Some(step);
        self
    }

    /// Same role, content and structured payload.
    pub fn duplicates(&self, existing: &Message) -> bool {
        self.role == existing.role
            && self.content == existing.content
            && self.card == existing.card
            && self.action == existing.action
    }

    fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            role: self.role,
            content: self.content,
            card: self.card,
            action: self.action,
            step: self.step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(MessageId),
    /// Suppressed; carries the id of the identical preceding message.
    Duplicate(MessageId),
}

impl AppendOutcome {
    pub fn id(&self) -> &MessageId {
        match self {
            AppendOutcome::Appended(id) | AppendOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

/// Study state for one item, kept for the whole learning run so it can resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSession {
    pub item_id: ItemId,
    pub machine: StageMachine,
    pub transcript: Vec<Message>,
    #[serde(default)]
    pub proactive_rounds: u32,
    #[serde(default)]
    pub last_topic: Option<ProactiveTopic>,
    pub created_at: DateTime<Utc>,
}

impl ItemSession {
    pub fn new(item_id: impl Into<ItemId>, now: DateTime<Utc>) -> Self {
        let item_id = item_id.into();
        let greeting = NewMessage::assistant(format!("Let's learn \"{item_id}\" together!"))
            .with_step(Stage::Introduction)
            .into_message(new_message_id());
        Self {
            item_id,
            machine: StageMachine::new(),
            transcript: vec![greeting],
            proactive_rounds: 0,
            last_topic: None,
            created_at: now,
        }
    }

    pub fn stage(&self) -> Stage {
        self.machine.stage()
    }

    pub fn mastery(&self) -> MasteryFlags {
        self.machine.mastery()
    }

    pub fn last(&self) -> Option<&Message> {
        self.transcript.last()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.transcript.iter().find(|m| m.id == id)
    }

    /// Appends unless identical to the immediately preceding message.
    pub fn append(&mut self, message: NewMessage) -> AppendOutcome {
        if let Some(last) = self.transcript.last() {
            if message.duplicates(last) {
                return AppendOutcome::Duplicate(last.id.clone());
            }
        }
        let id = new_message_id();
        self.transcript.push(message.into_message(id.clone()));
        AppendOutcome::Appended(id)
    }

    /// Rewrites a message's content in place; `false` if the id is unknown.
    pub fn update_content(&mut self, id: &str, update: impl FnOnce(&str) -> String) -> bool {
        match self.transcript.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.content = update(&message.content);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let pos = self.transcript.iter().position(|m| m.id == id)?;
        Some(self.transcript.remove(pos))
    }

    /// If the message `id` is the last entry and duplicates the one before it,
    /// removes it and returns the surviving id.
    pub fn collapse_trailing_duplicate(&mut self, id: &str) -> Option<MessageId> {
        let len = self.transcript.len();
        if len < 2 || self.transcript[len - 1].id != id {
            return None;
        }
        let (prev, last) = (&self.transcript[len - 2], &self.transcript[len - 1]);
        let same = prev.role == last.role
            && prev.content == last.content
            && prev.card == last.card
            && prev.action == last.action;
        if !same {
            return None;
        }
        let keep = prev.id.clone();
        self.transcript.pop();
        Some(keep)
    }
}

fn new_message_id() -> MessageId {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn session() -> ItemSession {
        ItemSession::new("ephemeral", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn new_session_starts_with_greeting() {
        let s = session();
        assert_eq!(s.transcript.len(), 1);
        assert_eq!(s.stage(), Stage::Introduction);
        assert!(s.last().unwrap().content.contains("ephemeral"));
    }

    #[test]
    fn identical_consecutive_message_is_suppressed() {
        let mut s = session();
        let first = s.append(NewMessage::assistant("Nice work!"));
        let second = s.append(NewMessage::assistant("Nice work!"));
        assert!(second.is_duplicate());
        assert_eq!(first.id(), second.id());
        assert_eq!(s.transcript.len(), 2);

        // Different role or payload is not a duplicate.
        assert!(!s.append(NewMessage::user("Nice work!")).is_duplicate());
        let with_action = NewMessage::assistant("Nice work!").with_action(ActionRecord {
            name: "next_item".into(),
            arguments: json!({}),
        });
        assert!(!s.append(with_action.clone()).is_duplicate());
        assert!(s.append(with_action).is_duplicate());
    }

    #[test]
    fn non_adjacent_repeats_are_kept() {
        let mut s = session();
        s.append(NewMessage::assistant("a"));
        s.append(NewMessage::assistant("b"));
        assert!(!s.append(NewMessage::assistant("a")).is_duplicate());
    }

    #[test]
    fn streaming_edits_update_and_remove() {
        let mut s = session();
        let id = s.append(NewMessage::assistant(PLACEHOLDER)).id().clone();
        assert!(s.message(&id).unwrap().is_placeholder());
        assert!(s.update_content(&id, |_| "Hel".to_string()));
        assert!(s.update_content(&id, |prev| format!("{prev}lo")));
        assert_eq!(s.message(&id).unwrap().content, "Hello");
        assert!(!s.update_content("missing", |_| String::new()));
        assert!(s.remove(&id).is_some());
        assert!(s.message(&id).is_none());
    }

    #[test]
    fn collapse_trailing_duplicate_keeps_earlier_id() {
        let mut s = session();
        let earlier = s.append(NewMessage::assistant("Same text")).id().clone();
        let streamed = s.append(NewMessage::assistant(PLACEHOLDER)).id().clone();
        s.update_content(&streamed, |_| "Same text".to_string());

        assert_eq!(s.collapse_trailing_duplicate(&streamed), Some(earlier));
        assert_eq!(s.transcript.len(), 2);
        assert_eq!(s.collapse_trailing_duplicate("other"), None);
    }

    #[test]
    fn session_serializes_as_plain_data() {
        let mut s = session();
        s.append(NewMessage::user("got it").with_step(Stage::Introduction));
        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["itemId"], "ephemeral");
        assert_eq!(value["machine"]["stage"], "introduction");
        let back: ItemSession = serde_json::from_value(value).unwrap();
        assert_eq!(back, s);
    }
}
