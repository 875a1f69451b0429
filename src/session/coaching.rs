use serde::{Deserialize, Serialize};

use crate::session::card::CardPayload;
use crate::session::stage::{MasteryFlags, Stage};
use crate::session::transcript::{Message, Role};

const ACKNOWLEDGEMENTS: [&str; 6] = ["got it", "i got it", "understood", "i remember", "记住了", "我记住了"];

const FILLERS: [&str; 5] = ["okay", "ok", "好的", "好", "嗯"];

/// User text that confirms the introduction was absorbed: one of the known
/// phrases, optionally after a filler like "ok", and followed by nothing but
/// punctuation or more words. "I haven't got it" does not count.
pub fn is_acknowledgement(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    let rest = FILLERS
        .iter()
        .find_map(|filler| strip_word(&normalized, filler))
        .map(|rest| rest.trim_start_matches(|c: char| !c.is_alphanumeric()))
        .unwrap_or(normalized.as_str());
    ACKNOWLEDGEMENTS
        .iter()
        .any(|phrase| strip_word(rest, phrase).is_some())
}

/// `text` without its leading `word`, if the word ends at a boundary.
fn strip_word<'a>(text: &'a str, word: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(word)?;
    let at_boundary = rest.chars().next().map_or(true, |c| !c.is_alphanumeric());
    at_boundary.then_some(rest)
}

/// Low-stakes content for an idle turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProactiveTopic {
    UsageExample,
    CulturalFact,
    Collocation,
    MemoryHook,
    Etymology,
}

impl ProactiveTopic {
    pub const ROTATION: [ProactiveTopic; 5] = [
        ProactiveTopic::UsageExample,
        ProactiveTopic::CulturalFact,
        ProactiveTopic::Collocation,
        ProactiveTopic::MemoryHook,
        ProactiveTopic::Etymology,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProactiveTopic::UsageExample => "usage_example",
            ProactiveTopic::CulturalFact => "cultural_fact",
            ProactiveTopic::Collocation => "collocation",
            ProactiveTopic::MemoryHook => "memory_hook",
            ProactiveTopic::Etymology => "etymology",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ProactiveTopic::UsageExample => "Share one fresh usage example of the word. Do not ask a question.",
            ProactiveTopic::CulturalFact => "Share one interesting cultural fact related to the word.",
            ProactiveTopic::Collocation => "Share a common collocation or phrase built with the word.",
            ProactiveTopic::MemoryHook => "Offer a short memory hook for the spelling or meaning.",
            ProactiveTopic::Etymology => "Tell a brief story about where the word comes from.",
        }
    }

    fn index(self) -> usize {
        Self::ROTATION.iter().position(|t| *t == self).unwrap_or(0)
    }

    /// Picks the topic for the next idle turn. The last transcript entry sets a
    /// preferred starting point, `round` rotates through the rest, and the
    /// previous topic is never repeated.
    pub fn pick(round: u32, last: Option<&Message>, previous: Option<ProactiveTopic>) -> ProactiveTopic {
        let preferred = match last {
            Some(message) => match &message.card {
                Some(CardPayload::Detail { .. }) => ProactiveTopic::UsageExample,
                Some(CardPayload::Spelling { .. }) | Some(CardPayload::Writing { .. }) => {
                    ProactiveTopic::MemoryHook
                }
                Some(_) => ProactiveTopic::CulturalFact,
                None if message.role == Role::Assistant => ProactiveTopic::Collocation,
                None => ProactiveTopic::Etymology,
            },
            None => ProactiveTopic::UsageExample,
        };

        let len = Self::ROTATION.len();
        let start = (preferred.index() + round as usize) % len;
        let topic = Self::ROTATION[start];
        if Some(topic) == previous {
            Self::ROTATION[(start + 1) % len]
        } else {
            topic
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub text: String,
    pub emoji: String,
}

impl QuickReply {
    fn new(text: &str, emoji: &str) -> Self {
        Self {
            text: text.to_string(),
            emoji: emoji.to_string(),
        }
    }
}

/// Suggested replies derived from the last transcript entry, the stage and
/// the checkpoints already passed.
pub fn quick_replies(last: Option<&Message>, stage: Stage, mastery: MasteryFlags) -> Vec<QuickReply> {
    let Some(last) = last else {
        return vec![QuickReply::new("Start learning", "📚")];
    };

    if let Some(card) = &last.card {
        return match card {
            CardPayload::Detail { .. } => vec![
                QuickReply::new("Got it", "👌"),
                QuickReply::new("Etymology?", "📜"),
                QuickReply::new("Tell me more", "🤔"),
            ],
            CardPayload::Quiz { .. } => vec![QuickReply::new("Not sure", "🤔")],
            CardPayload::Spelling { .. } => vec![QuickReply::new("Give me a hint", "💡")],
            CardPayload::Writing { .. } => vec![QuickReply::new("Show an example", "📝")],
            CardPayload::Etymology { .. } => vec![
                QuickReply::new("Interesting!", "🤩"),
                QuickReply::new("Quiz me", "❓"),
            ],
            CardPayload::Countdown { .. } => vec![QuickReply::new("Stay on this word", "✋")],
        };
    }

    if last.role == Role::Assistant && ends_with_question(&last.content) {
        return vec![QuickReply::new("Yes", "👍"), QuickReply::new("Not sure", "🤔")];
    }

    if stage.is_terminal() || (mastery.recognition && mastery.production) {
        return vec![
            QuickReply::new("Next word", "➡️"),
            QuickReply::new("Review once more", "📝"),
        ];
    }

    match stage {
        Stage::Introduction => vec![
            QuickReply::new("Got it", "👌"),
            QuickReply::new("Another example", "🔄"),
        ],
        _ => vec![
            QuickReply::new("Continue", "➡️"),
            QuickReply::new("Etymology", "📜"),
            QuickReply::new("Quiz me", "❓"),
        ],
    }
}

fn ends_with_question(content: &str) -> bool {
    content
        .split(['。', '！', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .last()
        .is_some_and(|s| s.ends_with('?') || s.ends_with('？'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transcript::ItemSession;
    use crate::session::transcript::NewMessage;
    use chrono::{TimeZone, Utc};

    #[test]
    fn acknowledgements_in_both_languages() {
        for text in ["got it", "Got it!", "  I got it. ", "我记住了", "记住了！", "ok, got it"] {
            assert!(is_acknowledgement(text), "{text}");
        }
        for text in [
            "what?",
            "ephemeral",
            "not yet",
            "I haven't got it",
            "i don't think i got it",
            "got items?",
            "记住了吗",
            "还没记住了",
            "okey",
        ] {
            assert!(!is_acknowledgement(text), "{text}");
        }
    }

    #[test]
    fn consecutive_idle_topics_never_repeat() {
        let mut session = ItemSession::new("eloquent", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let mut previous = None;
        for round in 0..12u32 {
            if round % 3 == 0 {
                session.append(NewMessage::user(format!("hmm {round}")));
            }
            let topic = ProactiveTopic::pick(round, session.last(), previous);
            assert_ne!(Some(topic), previous, "round {round}");
            session.append(NewMessage::assistant(topic.hint()));
            previous = Some(topic);
        }
    }

    #[test]
    fn last_entry_shapes_the_first_topic() {
        let session = ItemSession::new("eloquent", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(
            ProactiveTopic::pick(0, session.last(), None),
            ProactiveTopic::Collocation
        );
        assert_eq!(ProactiveTopic::pick(0, None, None), ProactiveTopic::UsageExample);
    }

    #[test]
    fn replies_follow_context() {
        let mut session = ItemSession::new("eloquent", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(quick_replies(None, Stage::Introduction, MasteryFlags::default())[0].text, "Start learning");

        session.append(NewMessage::assistant("Can you use it in a sentence?"));
        let replies = quick_replies(session.last(), Stage::FreeProduction, MasteryFlags::default());
        assert_eq!(replies[0].text, "Yes");

        session.append(NewMessage::assistant("Great job."));
        let mastery = MasteryFlags { recognition: true, production: true, free_production: false };
        assert_eq!(quick_replies(session.last(), Stage::FreeProduction, mastery)[0].text, "Next word");
    }
}
