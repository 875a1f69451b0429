use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::services::catalog::ItemId;
use crate::session::transcript::{ItemSession, MessageId};

/// Identity of one activation. Any async effect carries the token it was
/// started under and is dropped if that token is no longer live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationToken {
    pub item_id: ItemId,
    pub generation: u64,
}

/// Mutable session state shared by the orchestrator. Plain data; callers keep
/// it behind a lock and never hold that lock across an await.
#[derive(Debug, Default)]
pub struct SessionContext {
    active: Option<ActivationToken>,
    sessions: HashMap<ItemId, ItemSession>,
    auto_advance: bool,
    in_flight: bool,
    streaming: Option<(ActivationToken, MessageId)>,
    generation: u64,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds from persisted state. The restored active item gets a fresh
    /// token.
    pub fn restore(
        sessions: HashMap<ItemId, ItemSession>,
        active_item: Option<ItemId>,
        auto_advance: bool,
    ) -> Self {
        let mut context = Self {
            sessions,
            auto_advance,
            ..Self::default()
        };
        if let Some(item_id) = active_item {
            context.generation = 1;
            context.active = Some(ActivationToken { item_id, generation: 1 });
        }
        context
    }

    /// Makes `item_id` active under a new generation, creating its session on
    /// first use. Returns the token and whether the session was created.
    pub fn activate(&mut self, item_id: &str, now: DateTime<Utc>) -> (ActivationToken, bool) {
        self.abandon_streaming();
        self.generation = self.generation.wrapping_add(1);
        let token = ActivationToken {
            item_id: item_id.to_string(),
            generation: self.generation,
        };
        let created = !self.sessions.contains_key(item_id);
        if created {
            self.sessions
                .insert(item_id.to_string(), ItemSession::new(item_id, now));
        }
        self.active = Some(token.clone());
        (token, created)
    }

    pub fn active(&self) -> Option<&ActivationToken> {
        self.active.as_ref()
    }

    pub fn active_item_id(&self) -> Option<&str> {
        self.active.as_ref().map(|token| token.item_id.as_str())
    }

    pub fn is_live(&self, token: &ActivationToken) -> bool {
        self.active.as_ref() == Some(token)
    }

    /// Runs `f` against the session of `token` only if it is still the live
    /// activation.
    pub fn with_live_session<R>(
        &mut self,
        token: &ActivationToken,
        f: impl FnOnce(&mut ItemSession) -> R,
    ) -> Option<R> {
        if !self.is_live(token) {
            return None;
        }
        self.sessions.get_mut(&token.item_id).map(f)
    }

    pub fn active_session(&self) -> Option<&ItemSession> {
        self.active
            .as_ref()
            .and_then(|token| self.sessions.get(&token.item_id))
    }

    pub fn session(&self, item_id: &str) -> Option<&ItemSession> {
        self.sessions.get(item_id)
    }

    pub fn sessions(&self) -> &HashMap<ItemId, ItemSession> {
        &self.sessions
    }

    /// Records the message a live turn is streaming into.
    pub fn set_streaming(&mut self, token: &ActivationToken, message_id: MessageId) {
        if self.is_live(token) {
            self.streaming = Some((token.clone(), message_id));
        }
    }

    pub fn clear_streaming(&mut self, token: &ActivationToken) {
        if self.streaming.as_ref().is_some_and(|(owner, _)| owner == token) {
            self.streaming = None;
        }
    }

    /// Drops a bare placeholder left by a turn that is about to go stale.
    /// Partial text already streamed stays as it is.
    fn abandon_streaming(&mut self) {
        let Some((token, message_id)) = self.streaming.take() else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&token.item_id) {
            if session.message(&message_id).is_some_and(|m| m.is_placeholder()) {
                session.remove(&message_id);
            }
        }
    }

    /// Claims the single collaborator slot; `false` if a turn is in flight.
    pub fn begin_turn(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    pub fn end_turn(&mut self) {
        self.in_flight = false;
    }

    pub fn is_typing(&self) -> bool {
        self.in_flight
    }

    pub fn auto_advance(&self) -> bool {
        self.auto_advance
    }

    pub fn toggle_auto_advance(&mut self) -> bool {
        self.auto_advance = !self.auto_advance;
        self.auto_advance
    }

    /// Forgets every session and the active item. Outstanding tokens become
    /// stale; an in-flight turn keeps its slot until it returns.
    pub fn clear(&mut self) {
        self.streaming = None;
        self.sessions.clear();
        self.active = None;
        self.auto_advance = false;
        self.generation = self.generation.wrapping_add(1);
    }
}
