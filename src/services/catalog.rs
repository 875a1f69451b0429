use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ItemId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOption {
    pub id: String,
    pub label: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub word: ItemId,
    pub phonetic: String,
    pub definition: String,
    #[serde(default)]
    pub definition_en: String,
    pub example_sentence: String,
    #[serde(default)]
    pub example_translation: String,
    pub quiz_question: String,
    pub quiz_options: Vec<QuizOption>,
    #[serde(default)]
    pub quiz_explanation: String,
    pub spelling_hint: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate catalog item: {0}")]
    Duplicate(String),
    #[error("catalog is empty")]
    Empty,
}

/// Ordered item list; order is the tie-break for new-item selection.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: Vec<CatalogItem>,
    index: HashMap<ItemId, usize>,
}

impl Catalog {
    pub fn new(items: Vec<CatalogItem>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            if index.insert(item.word.clone(), pos).is_some() {
                return Err(CatalogError::Duplicate(item.word.clone()));
            }
        }
        Ok(Self { items, index })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let items: Vec<CatalogItem> = serde_json::from_str(&raw)?;
        if items.is_empty() {
            return Err(CatalogError::Empty);
        }
        Self::new(items)
    }

    pub fn builtin() -> Self {
        let items: Vec<CatalogItem> = SEED_WORDS.iter().map(SeedWord::to_item).collect();
        // Seed words are unique by construction.
        let index = items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.word.clone(), pos))
            .collect();
        Self { items, index }
    }

    pub fn get(&self, id: &str) -> Option<&CatalogItem> {
        self.index.get(id).map(|&pos| &self.items[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|item| item.word.clone()).collect()
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

struct SeedWord {
    word: &'static str,
    phonetic: &'static str,
    definition: &'static str,
    definition_en: &'static str,
    example: &'static str,
    translation: &'static str,
    distractors: [&'static str; 3],
    hint: &'static str,
}

impl SeedWord {
    fn to_item(&self) -> CatalogItem {
        let mut quiz_options = vec![QuizOption {
            id: "A".to_string(),
            label: self.definition.to_string(),
            is_correct: true,
        }];
        for (label, id) in self.distractors.iter().zip(["B", "C", "D"]) {
            quiz_options.push(QuizOption {
                id: id.to_string(),
                label: label.to_string(),
                is_correct: false,
            });
        }
        // Keep the correct answer off the first slot.
        quiz_options.rotate_left(self.word.len() % 4);
        for (option, id) in quiz_options.iter_mut().zip(["A", "B", "C", "D"]) {
            option.id = id.to_string();
        }

        CatalogItem {
            word: self.word.to_string(),
            phonetic: self.phonetic.to_string(),
            definition: self.definition.to_string(),
            definition_en: self.definition_en.to_string(),
            example_sentence: self.example.to_string(),
            example_translation: self.translation.to_string(),
            quiz_question: format!("What does \"{}\" mean?", self.word),
            quiz_options,
            quiz_explanation: format!("\"{}\" means: {}", self.word, self.definition_en),
            spelling_hint: self.hint.to_string(),
        }
    }
}

const SEED_WORDS: &[SeedWord] = &[
    SeedWord {
        word: "serendipity",
        phonetic: "/ˌser.ənˈdɪp.ə.ti/",
        definition: "机缘巧合；意外发现美好事物的运气",
        definition_en: "the occurrence of events by chance in a happy way",
        example: "Finding that bookstore was pure serendipity.",
        translation: "发现那家书店纯属机缘巧合。",
        distractors: ["悲伤的经历", "精心的计划", "困难的挑战"],
        hint: "s_r_n_i_i_y",
    },
    SeedWord {
        word: "ephemeral",
        phonetic: "/ɪˈfem.ər.əl/",
        definition: "短暂的；转瞬即逝的",
        definition_en: "lasting for a very short time",
        example: "Fame in the age of social media is often ephemeral.",
        translation: "社交媒体时代的名气往往转瞬即逝。",
        distractors: ["永恒的", "巨大的", "沉重的"],
        hint: "e_h_m_r_l",
    },
    SeedWord {
        word: "ubiquitous",
        phonetic: "/juːˈbɪk.wɪ.təs/",
        definition: "无处不在的",
        definition_en: "seeming to be everywhere",
        example: "Smartphones have become ubiquitous in modern life.",
        translation: "智能手机在现代生活中已无处不在。",
        distractors: ["稀有的", "古老的", "危险的"],
        hint: "u_i_u_t_u_",
    },
    SeedWord {
        word: "resilient",
        phonetic: "/rɪˈzɪl.i.ənt/",
        definition: "有韧性的；能迅速恢复的",
        definition_en: "able to recover quickly from difficulties",
        example: "Children are often remarkably resilient.",
        translation: "孩子们往往有着惊人的恢复力。",
        distractors: ["脆弱的", "懒惰的", "固执的"],
        hint: "r_s_l_e_t",
    },
    SeedWord {
        word: "meticulous",
        phonetic: "/məˈtɪk.jə.ləs/",
        definition: "一丝不苟的；极其仔细的",
        definition_en: "showing great attention to detail",
        example: "She kept meticulous records of every experiment.",
        translation: "她一丝不苟地记录了每一次实验。",
        distractors: ["粗心的", "匆忙的", "模糊的"],
        hint: "m_t_c_l_u_",
    },
    SeedWord {
        word: "eloquent",
        phonetic: "/ˈel.ə.kwənt/",
        definition: "雄辩的；有说服力的",
        definition_en: "fluent and persuasive in speaking or writing",
        example: "He gave an eloquent speech at the ceremony.",
        translation: "他在典礼上发表了一篇雄辩的演讲。",
        distractors: ["沉默的", "笨拙的", "愤怒的"],
        hint: "e_o_u_n_",
    },
    SeedWord {
        word: "pragmatic",
        phonetic: "/præɡˈmæt.ɪk/",
        definition: "务实的；实用主义的",
        definition_en: "dealing with things sensibly and realistically",
        example: "We need a pragmatic approach to this problem.",
        translation: "我们需要用务实的方法解决这个问题。",
        distractors: ["理想化的", "浪漫的", "混乱的"],
        hint: "p_a_m_t_c",
    },
    SeedWord {
        word: "ambiguous",
        phonetic: "/æmˈbɪɡ.ju.əs/",
        definition: "模棱两可的；含糊不清的",
        definition_en: "open to more than one interpretation",
        example: "The ending of the film was deliberately ambiguous.",
        translation: "这部电影的结局故意含糊不清。",
        distractors: ["清晰的", "简短的", "响亮的"],
        hint: "a_b_g_o_s",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_is_indexed_in_order() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.len(), SEED_WORDS.len());
        assert_eq!(catalog.position("serendipity"), Some(0));
        assert_eq!(catalog.position("ephemeral"), Some(1));
        assert!(catalog.get("nonexistent").is_none());
    }

    #[test]
    fn builtin_quiz_has_exactly_one_correct_option() {
        for item in Catalog::builtin().items() {
            let correct: Vec<_> = item.quiz_options.iter().filter(|o| o.is_correct).collect();
            assert_eq!(correct.len(), 1, "word {}", item.word);
            assert_eq!(correct[0].label, item.definition);
            let ids: Vec<_> = item.quiz_options.iter().map(|o| o.id.as_str()).collect();
            assert_eq!(ids, ["A", "B", "C", "D"]);
        }
    }

    #[test]
    fn duplicate_items_are_rejected() {
        let item = Catalog::builtin().items()[0].clone();
        let err = Catalog::new(vec![item.clone(), item]).unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(word) if word == "serendipity"));
    }

    #[test]
    fn loads_catalog_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let items = Catalog::builtin().items()[..2].to_vec();
        std::fs::write(&path, serde_json::to_string(&items).unwrap()).unwrap();

        let catalog = Catalog::from_json_file(&path).unwrap();
        assert_eq!(catalog.ids(), vec!["serendipity", "ephemeral"]);

        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(Catalog::from_json_file(&path), Err(CatalogError::Empty)));
    }
}
