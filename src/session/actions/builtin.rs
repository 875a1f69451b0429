use serde::Deserialize;
use serde_json::Value;

use super::{
    parse_args, ActionContext, ActionDispatcher, ActionEffect, ActionError, ActionHandler, ActionSchema,
    ParamKind, ParamSpec, RegistryError,
};
use crate::session::card::CardPayload;
use crate::session::transcript::NewMessage;

pub fn register_builtin(dispatcher: &mut ActionDispatcher) -> Result<(), RegistryError> {
    dispatcher.register(ShowEtymology)?;
    dispatcher.register(GenerateExample)?;
    dispatcher.register(ShowVisualAid)?;
    dispatcher.register(StartRoleplay)?;
    dispatcher.register(NextItem)?;
    dispatcher.register(AdvanceStage)?;
    dispatcher.register(ShowCard)?;
    Ok(())
}

struct ShowEtymology;

#[derive(Deserialize)]
struct EtymologyArgs {
    root: String,
    meaning: String,
    history: String,
    related_words: Vec<String>,
}

impl ActionHandler for ShowEtymology {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "show_etymology",
            description: "Show where the word comes from when the learner wants its origin or history.",
            params: vec![
                ParamSpec::required("root", ParamKind::Text, "word root, e.g. Serendip"),
                ParamSpec::required("meaning", ParamKind::Text, "original meaning of the root"),
                ParamSpec::required("history", ParamKind::Text, "how the word evolved"),
                ParamSpec::required("related_words", ParamKind::TextList, "3-5 cognates or related words"),
            ],
        }
    }

    fn execute(&self, arguments: &Value, ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        let args: EtymologyArgs = parse_args("show_etymology", arguments)?;
        if args.root.trim().is_empty() {
            return Err(ActionError::HandlerFailed {
                action: "show_etymology".into(),
                reason: "root is blank".into(),
            });
        }
        Ok(vec![ActionEffect::RenderCard(CardPayload::Etymology {
            word: ctx.item.word.clone(),
            root: args.root,
            meaning: args.meaning,
            history: args.history,
            related_words: args.related_words,
        })])
    }
}

struct GenerateExample;

#[derive(Deserialize)]
struct ExampleArgs {
    sentence: String,
    translation: String,
}

impl ActionHandler for GenerateExample {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "generate_example",
            description: "Show a fresh example sentence using the word in a new context.",
            params: vec![
                ParamSpec::required("sentence", ParamKind::Text, "English sentence containing the word"),
                ParamSpec::required("translation", ParamKind::Text, "translation of the sentence"),
            ],
        }
    }

    fn execute(&self, arguments: &Value, _ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        let args: ExampleArgs = parse_args("generate_example", arguments)?;
        Ok(vec![ActionEffect::AppendMessage(NewMessage::assistant(format!(
            "\"{}\" -- {}",
            args.sentence, args.translation
        )))])
    }
}

struct ShowVisualAid;

#[derive(Deserialize)]
struct VisualAidArgs {
    description: String,
    #[serde(default)]
    image_url: Option<String>,
}

impl ActionHandler for ShowVisualAid {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "show_visual_aid",
            description: "Describe a mind map or visual association for the word.",
            params: vec![
                ParamSpec::required("description", ParamKind::Text, "text outline of the visual structure"),
                ParamSpec::optional("image_url", ParamKind::Text, "optional image URL"),
            ],
        }
    }

    fn execute(&self, arguments: &Value, ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        let args: VisualAidArgs = parse_args("show_visual_aid", arguments)?;
        let mut content = format!("### Visual structure: {}\n\n{}", ctx.item.word, args.description);
        if let Some(url) = args.image_url.filter(|url| !url.trim().is_empty()) {
            content.push_str(&format!("\n\n![{}]({})", ctx.item.word, url));
        }
        Ok(vec![ActionEffect::AppendMessage(NewMessage::assistant(content))])
    }
}

struct StartRoleplay;

#[derive(Deserialize)]
struct RoleplayArgs {
    scenario: String,
    role_ai: String,
    role_user: String,
}

impl ActionHandler for StartRoleplay {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "start_roleplay",
            description: "Start a short roleplay so the learner uses the word in a realistic scene.",
            params: vec![
                ParamSpec::required("scenario", ParamKind::Text, "scene description"),
                ParamSpec::required("role_ai", ParamKind::Text, "role played by the tutor"),
                ParamSpec::required("role_user", ParamKind::Text, "role played by the learner"),
            ],
        }
    }

    fn execute(&self, arguments: &Value, _ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        let args: RoleplayArgs = parse_args("start_roleplay", arguments)?;
        Ok(vec![ActionEffect::AppendMessage(NewMessage::assistant(format!(
            "**Roleplay time!**\n\nScene: {}\nYou are: {}\nI am: {}\n\nLet's begin!",
            args.scenario, args.role_user, args.role_ai
        )))])
    }
}

struct NextItem;

impl ActionHandler for NextItem {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "next_item",
            description: "The learner has mastered the current word; move on to the next one.",
            params: Vec::new(),
        }
    }

    fn execute(&self, _arguments: &Value, _ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        Ok(vec![ActionEffect::SwitchToNextItem])
    }
}

struct AdvanceStage;

impl ActionHandler for AdvanceStage {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "advance_stage",
            description: "The learner has clearly satisfied the current step; move to the next step.",
            params: Vec::new(),
        }
    }

    fn execute(&self, _arguments: &Value, ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        if ctx.stage.is_terminal() {
            return Ok(Vec::new());
        }
        Ok(vec![ActionEffect::AdvanceStage])
    }
}

/// Cards are rendered automatically on stage entry; kept so older prompts get a
/// harmless reply.
struct ShowCard;

impl ActionHandler for ShowCard {
    fn schema(&self) -> ActionSchema {
        ActionSchema {
            name: "show_card",
            description: "Deprecated: cards are rendered automatically. Do not call.",
            params: vec![ParamSpec::optional("card_type", ParamKind::Text, "deprecated")],
        }
    }

    fn execute(&self, _arguments: &Value, _ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
        Ok(vec![ActionEffect::AppendMessage(NewMessage::assistant(
            "(Cards appear automatically as we go.)",
        ))])
    }
}
