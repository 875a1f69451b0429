use crate::session::stage::Stage;
use crate::session::transcript::{ItemSession, MessageId, NewMessage, PLACEHOLDER};

/// The single in-flight assistant message a streamed turn writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingReply {
    message_id: MessageId,
    tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizedReply {
    /// The streamed message stays in the transcript with this content.
    Kept { id: MessageId, content: String },
    /// The streamed message duplicated its predecessor and was folded into it.
    Collapsed { removed: MessageId, kept: MessageId },
    /// Nothing but the placeholder was produced; the message is gone.
    Removed { id: MessageId },
}

impl StreamingReply {
    /// Appends the placeholder bubble.
    pub fn open(session: &mut ItemSession, step: Stage) -> Self {
        let outcome = session.append(NewMessage::assistant(PLACEHOLDER).with_step(step));
        Self {
            message_id: outcome.id().clone(),
            tokens: 0,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Applies one token; the first real token replaces the placeholder.
    /// Returns the message content afterwards, or `None` if the message is gone.
    pub fn push_token(&mut self, session: &mut ItemSession, token: &str) -> Option<String> {
        if token.is_empty() {
            return session.message(&self.message_id).map(|m| m.content.clone());
        }
        let applied = session.update_content(&self.message_id, |prev| {
            if prev == PLACEHOLDER {
                token.to_string()
            } else {
                format!("{prev}{token}")
            }
        });
        if !applied {
            return None;
        }
        self.tokens += 1;
        session.message(&self.message_id).map(|m| m.content.clone())
    }

    /// Reconciles the streamed buffer with the turn's terminal result.
    ///
    /// With an action pending, a placeholder-only message is deleted and a
    /// leading placeholder marker is stripped. Without one, `final_text` fills a
    /// message that received no tokens, and the result is deduplicated against
    /// the preceding entry.
    pub fn finalize(self, session: &mut ItemSession, final_text: &str, has_action: bool) -> FinalizedReply {
        let id = self.message_id;
        let Some(current) = session.message(&id).map(|m| m.content.clone()) else {
            return FinalizedReply::Removed { id };
        };

        let content = if has_action {
            strip_marker(&current)
        } else if is_placeholder(&current) {
            final_text.trim().to_string()
        } else {
            current
        };

        if is_placeholder(&content) {
            session.remove(&id);
            return FinalizedReply::Removed { id };
        }

        session.update_content(&id, |_| content.clone());
        match session.collapse_trailing_duplicate(&id) {
            Some(kept) => FinalizedReply::Collapsed { removed: id, kept },
            None => FinalizedReply::Kept { id, content },
        }
    }
}

fn is_placeholder(content: &str) -> bool {
    let trimmed = content.trim();
    trimmed.is_empty() || trimmed == PLACEHOLDER
}

fn strip_marker(content: &str) -> String {
    content
        .strip_prefix(PLACEHOLDER)
        .unwrap_or(content)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn session() -> ItemSession {
        ItemSession::new("ubiquitous", Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
    }

    #[test]
    fn tokens_replace_placeholder_then_accumulate() {
        let mut s = session();
        let mut reply = StreamingReply::open(&mut s, Stage::Introduction);
        assert_eq!(s.message(reply.id()).unwrap().content, PLACEHOLDER);

        assert_eq!(reply.push_token(&mut s, "Phones are "), Some("Phones are ".into()));
        assert_eq!(reply.push_token(&mut s, ""), Some("Phones are ".into()));
        assert_eq!(reply.push_token(&mut s, "everywhere."), Some("Phones are everywhere.".into()));
        assert_eq!(reply.tokens(), 2);

        let id = reply.id().clone();
        assert_eq!(
            reply.finalize(&mut s, "Phones are everywhere.", false),
            FinalizedReply::Kept { id, content: "Phones are everywhere.".into() }
        );
    }

    #[test]
    fn placeholder_only_message_is_removed_when_action_follows() {
        let mut s = session();
        let before = s.transcript.len();
        let reply = StreamingReply::open(&mut s, Stage::Introduction);
        let id = reply.id().clone();
        assert_eq!(reply.finalize(&mut s, "", true), FinalizedReply::Removed { id });
        assert_eq!(s.transcript.len(), before);
        assert!(s.transcript.iter().all(|m| m.content != PLACEHOLDER));
    }

    #[test]
    fn leading_marker_is_stripped_when_action_follows() {
        let mut s = session();
        let reply = StreamingReply::open(&mut s, Stage::Introduction);
        s.update_content(reply.id(), |_| "... Let me show you its roots.".into());
        let id = reply.id().clone();
        assert_eq!(
            reply.finalize(&mut s, "", true),
            FinalizedReply::Kept { id, content: "Let me show you its roots.".into() }
        );
    }

    #[test]
    fn final_text_fills_a_silent_stream_and_dedups() {
        let mut s = session();
        let earlier = s.append(NewMessage::assistant("Keep going!")).id().clone();

        let reply = StreamingReply::open(&mut s, Stage::Introduction);
        let removed = reply.id().clone();
        assert_eq!(
            reply.finalize(&mut s, "Keep going!", false),
            FinalizedReply::Collapsed { removed, kept: earlier }
        );
        assert_eq!(s.last().unwrap().content, "Keep going!");

        let reply = StreamingReply::open(&mut s, Stage::Introduction);
        assert!(matches!(reply.finalize(&mut s, "  ", false), FinalizedReply::Removed { .. }));
    }

    #[test]
    fn tokens_after_removal_are_dropped() {
        let mut s = session();
        let mut reply = StreamingReply::open(&mut s, Stage::Introduction);
        let id = reply.id().clone();
        s.remove(&id);
        assert_eq!(reply.push_token(&mut s, "late"), None);
        assert_eq!(reply.finalize(&mut s, "late", false), FinalizedReply::Removed { id });
    }
}
