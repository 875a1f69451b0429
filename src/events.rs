use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::services::catalog::ItemId;
use crate::session::card::CardPayload;
use crate::session::coaching::QuickReply;
use crate::session::stage::Stage;
use crate::session::transcript::{Message, MessageId};

const CHANNEL_CAPACITY: usize = 1024;

/// Everything the presentation layer needs to mirror the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionEvent {
    #[serde(rename = "MESSAGE_APPENDED")]
    MessageAppended { item_id: ItemId, message: Message },

    #[serde(rename = "MESSAGE_UPDATED")]
    MessageUpdated { item_id: ItemId, message_id: MessageId, content: String },

    #[serde(rename = "MESSAGE_REMOVED")]
    MessageRemoved { item_id: ItemId, message_id: MessageId },

    #[serde(rename = "CARD_RENDERED")]
    CardRendered { item_id: ItemId, message_id: MessageId, card: CardPayload },

    #[serde(rename = "PRONUNCIATION_REQUESTED")]
    PronunciationRequested { item_id: ItemId, word: String },

    #[serde(rename = "STAGE_CHANGED")]
    StageChanged { item_id: ItemId, from: Stage, to: Stage },

    #[serde(rename = "ITEM_ACTIVATED")]
    ItemActivated { item_id: ItemId, generation: u64, resumed: bool },

    #[serde(rename = "TYPING_CHANGED")]
    TypingChanged { is_typing: bool },

    #[serde(rename = "QUICK_REPLIES")]
    QuickReplies { item_id: ItemId, replies: Vec<QuickReply> },

    #[serde(rename = "COUNTDOWN_STARTED")]
    CountdownStarted { item_id: ItemId, seconds: u64, next_item_id: Option<ItemId> },

    #[serde(rename = "COUNTDOWN_CANCELLED")]
    CountdownCancelled { item_id: ItemId },

    #[serde(rename = "AUTO_ADVANCE_CHANGED")]
    AutoAdvanceChanged { enabled: bool },

    #[serde(rename = "DATA_RESET")]
    DataReset,
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::MessageAppended { .. } => "MESSAGE_APPENDED",
            SessionEvent::MessageUpdated { .. } => "MESSAGE_UPDATED",
            SessionEvent::MessageRemoved { .. } => "MESSAGE_REMOVED",
            SessionEvent::CardRendered { .. } => "CARD_RENDERED",
            SessionEvent::PronunciationRequested { .. } => "PRONUNCIATION_REQUESTED",
            SessionEvent::StageChanged { .. } => "STAGE_CHANGED",
            SessionEvent::ItemActivated { .. } => "ITEM_ACTIVATED",
            SessionEvent::TypingChanged { .. } => "TYPING_CHANGED",
            SessionEvent::QuickReplies { .. } => "QUICK_REPLIES",
            SessionEvent::CountdownStarted { .. } => "COUNTDOWN_STARTED",
            SessionEvent::CountdownCancelled { .. } => "COUNTDOWN_CANCELLED",
            SessionEvent::AutoAdvanceChanged { .. } => "AUTO_ADVANCE_CHANGED",
            SessionEvent::DataReset => "DATA_RESET",
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            SessionEvent::MessageAppended { item_id, .. }
            | SessionEvent::MessageUpdated { item_id, .. }
            | SessionEvent::MessageRemoved { item_id, .. }
            | SessionEvent::CardRendered { item_id, .. }
            | SessionEvent::PronunciationRequested { item_id, .. }
            | SessionEvent::StageChanged { item_id, .. }
            | SessionEvent::ItemActivated { item_id, .. }
            | SessionEvent::QuickReplies { item_id, .. }
            | SessionEvent::CountdownStarted { item_id, .. }
            | SessionEvent::CountdownCancelled { item_id } => Some(item_id),
            SessionEvent::TypingChanged { .. } | SessionEvent::AutoAdvanceChanged { .. } | SessionEvent::DataReset => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub event: SessionEvent,
}

/// Fan-out of presentation events. Publishing never blocks and never fails;
/// with no subscribers events are dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(event_type = event.event_type(), sequence, "event published");
        let _ = self.sender.send(EventEnvelope { sequence, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
