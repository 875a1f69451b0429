use serde::{Deserialize, Serialize};

use crate::services::catalog::{CatalogItem, QuizOption};
use crate::session::stage::Stage;

/// Structured payload handed to the presentation layer's card renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardPayload {
    #[serde(rename_all = "camelCase")]
    Detail {
        word: String,
        phonetic: String,
        definition: String,
        definition_en: String,
        example_sentence: String,
        example_translation: String,
    },
    Quiz {
        word: String,
        question: String,
        options: Vec<QuizOption>,
        explanation: String,
    },
    Spelling {
        word: String,
        hint: String,
        definition: String,
    },
    #[serde(rename_all = "camelCase")]
    Writing {
        word: String,
        example_sentence: String,
    },
    #[serde(rename_all = "camelCase")]
    Etymology {
        word: String,
        root: String,
        meaning: String,
        history: String,
        related_words: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Countdown {
        next_item_id: Option<String>,
        seconds: u64,
    },
}

impl CardPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            CardPayload::Detail { .. } => "detail",
            CardPayload::Quiz { .. } => "quiz",
            CardPayload::Spelling { .. } => "spelling",
            CardPayload::Writing { .. } => "writing",
            CardPayload::Etymology { .. } => "etymology",
            CardPayload::Countdown { .. } => "countdown",
        }
    }
}

pub fn card_for_stage(item: &CatalogItem, stage: Stage) -> Option<CardPayload> {
    let word = item.word.clone();
    match stage {
        Stage::Introduction => Some(CardPayload::Detail {
            word,
            phonetic: item.phonetic.clone(),
            definition: item.definition.clone(),
            definition_en: item.definition_en.clone(),
            example_sentence: item.example_sentence.clone(),
            example_translation: item.example_translation.clone(),
        }),
        Stage::RecognitionCheck => Some(CardPayload::Quiz {
            word,
            question: item.quiz_question.clone(),
            options: item.quiz_options.clone(),
            explanation: item.quiz_explanation.clone(),
        }),
        Stage::ProductionCheck => Some(CardPayload::Spelling {
            word,
            hint: item.spelling_hint.clone(),
            definition: item.definition.clone(),
        }),
        Stage::FreeProduction => Some(CardPayload::Writing {
            word,
            example_sentence: item.example_sentence.clone(),
        }),
        Stage::Completed => None,
    }
}
