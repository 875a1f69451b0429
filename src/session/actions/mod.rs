//! Named, side-effecting actions the collaborator may request instead of (or
//! alongside) plain commentary.
//!
//! Handlers never touch session state directly. They validate their arguments
//! and return a list of [`ActionEffect`]s; the orchestrator applies those
//! effects only after confirming the originating activation is still live.

mod builtin;
pub mod streaming;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::services::catalog::CatalogItem;
use crate::session::card::CardPayload;
use crate::session::context::ActivationToken;
use crate::session::stage::Stage;
use crate::session::transcript::NewMessage;

pub use builtin::register_builtin;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("unsupported action: {0}")]
    UnknownAction(String),
    #[error("invalid arguments for {action}: {reason}")]
    ArgumentMismatch { action: String, reason: String },
    #[error("action {action} failed: {reason}")]
    HandlerFailed { action: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action already registered: {0}")]
    Duplicate(String),
    #[error("malformed action {action}: {reason}")]
    Malformed { action: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    TextList,
}

impl ParamKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::Text => value.is_string(),
            ParamKind::TextList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        }
    }

    fn json_schema(self) -> Value {
        match self {
            ParamKind::Text => json!({ "type": "string" }),
            ParamKind::TextList => json!({ "type": "array", "items": { "type": "string" } }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self { name, kind, required: true, description }
    }

    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self { name, kind, required: false, description }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ActionSchema {
    /// Checks shape only: an object whose declared fields carry the declared
    /// types. Undeclared fields are tolerated.
    pub fn validate(&self, arguments: &Value) -> Result<(), ActionError> {
        let empty = Map::new();
        let fields = match arguments {
            Value::Object(fields) => fields,
            Value::Null => &empty,
            other => {
                return Err(self.mismatch(format!("expected an object, got {}", type_name(other))))
            }
        };

        for param in &self.params {
            match fields.get(param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(self.mismatch(format!("missing required field `{}`", param.name)));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.kind.matches(value) => {
                    return Err(self.mismatch(format!(
                        "field `{}` has type {}",
                        param.name,
                        type_name(value)
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// OpenAI-style function tool definition.
    pub fn tool_definition(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|param| {
                let mut schema = param.kind.json_schema();
                schema["description"] = Value::String(param.description.to_string());
                (param.name.to_string(), schema)
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|param| param.required)
            .map(|param| param.name)
            .collect();

        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }

    fn mismatch(&self, reason: String) -> ActionError {
        ActionError::ArgumentMismatch {
            action: self.name.to_string(),
            reason,
        }
    }

    fn check(&self) -> Result<(), RegistryError> {
        let malformed = |reason: &str| RegistryError::Malformed {
            action: self.name.to_string(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(malformed("empty name"));
        }
        let mut seen = Vec::with_capacity(self.params.len());
        for param in &self.params {
            if param.name.trim().is_empty() {
                return Err(malformed("empty parameter name"));
            }
            if seen.contains(&param.name) {
                return Err(malformed("duplicate parameter name"));
            }
            seen.push(param.name);
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deserializes already-validated arguments into a handler's typed form.
pub fn parse_args<T: DeserializeOwned>(action: &str, arguments: &Value) -> Result<T, ActionError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(arguments).map_err(|err| ActionError::ArgumentMismatch {
        action: action.to_string(),
        reason: err.to_string(),
    })
}

/// What the handler sees about the live item.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub item: &'a CatalogItem,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionEffect {
    AppendMessage(NewMessage),
    RenderCard(CardPayload),
    AdvanceStage,
    SwitchToNextItem,
}

/// A collaborator-issued action waiting to be dispatched against the
/// activation it was issued under.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub name: String,
    pub arguments: Value,
    pub token: ActivationToken,
}

pub trait ActionHandler: Send + Sync {
    fn schema(&self) -> ActionSchema;

    fn execute(&self, arguments: &Value, ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError>;
}

struct Registered {
    schema: ActionSchema,
    handler: Box<dyn ActionHandler>,
}

/// Name-keyed registry of action handlers.
#[derive(Default)]
pub struct ActionDispatcher {
    actions: HashMap<&'static str, Registered>,
    order: Vec<&'static str>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action.
    pub fn with_builtin() -> Result<Self, RegistryError> {
        let mut dispatcher = Self::new();
        register_builtin(&mut dispatcher)?;
        Ok(dispatcher)
    }

    pub fn register(&mut self, handler: impl ActionHandler + 'static) -> Result<(), RegistryError> {
        let schema = handler.schema();
        schema.check()?;
        if self.actions.contains_key(schema.name) {
            return Err(RegistryError::Duplicate(schema.name.to_string()));
        }
        let name = schema.name;
        self.order.push(name);
        self.actions.insert(
            name,
            Registered {
                schema,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[&'static str] {
        &self.order
    }

    pub fn schema(&self, name: &str) -> Option<&ActionSchema> {
        self.actions.get(name).map(|registered| &registered.schema)
    }

    pub fn tool_definitions(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.actions.get(name))
            .map(|registered| registered.schema.tool_definition())
            .collect()
    }

    pub fn execute(
        &self,
        name: &str,
        arguments: &Value,
        ctx: &ActionContext<'_>,
    ) -> Result<Vec<ActionEffect>, ActionError> {
        let registered = self
            .actions
            .get(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_string()))?;
        registered.schema.validate(arguments)?;
        let effects = registered.handler.execute(arguments, ctx)?;
        debug!(action = name, effects = effects.len(), "action executed");
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog::Catalog;

    struct Echo;

    impl ActionHandler for Echo {
        fn schema(&self) -> ActionSchema {
            ActionSchema {
                name: "echo",
                description: "Repeat text",
                params: vec![
                    ParamSpec::required("text", ParamKind::Text, "what to say"),
                    ParamSpec::optional("tags", ParamKind::TextList, "labels"),
                ],
            }
        }

        fn execute(&self, arguments: &Value, _ctx: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(vec![ActionEffect::AppendMessage(NewMessage::assistant(text))])
        }
    }

    fn with_ctx<R>(f: impl FnOnce(&ActionContext<'_>) -> R) -> R {
        let catalog = Catalog::builtin();
        let item = catalog.get("ephemeral").unwrap();
        f(&ActionContext { item, stage: Stage::Introduction })
    }

    #[test]
    fn duplicate_and_malformed_registration_fail_fast() {
        let mut dispatcher = ActionDispatcher::new();
        dispatcher.register(Echo).unwrap();
        assert_eq!(
            dispatcher.register(Echo),
            Err(RegistryError::Duplicate("echo".into()))
        );

        struct Broken;
        impl ActionHandler for Broken {
            fn schema(&self) -> ActionSchema {
                ActionSchema {
                    name: "broken",
                    description: "",
                    params: vec![
                        ParamSpec::required("a", ParamKind::Text, ""),
                        ParamSpec::required("a", ParamKind::Text, ""),
                    ],
                }
            }
            fn execute(&self, _: &Value, _: &ActionContext<'_>) -> Result<Vec<ActionEffect>, ActionError> {
                Ok(Vec::new())
            }
        }
        assert!(matches!(
            dispatcher.register(Broken),
            Err(RegistryError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_action_is_reported() {
        let dispatcher = ActionDispatcher::new();
        let err = with_ctx(|ctx| dispatcher.execute("dance", &json!({}), ctx)).unwrap_err();
        assert_eq!(err, ActionError::UnknownAction("dance".into()));
    }

    #[test]
    fn arguments_are_validated_before_the_handler_runs() {
        let mut dispatcher = ActionDispatcher::new();
        dispatcher.register(Echo).unwrap();

        for bad in [json!({}), json!({ "text": 3 }), json!("hi"), json!({ "text": "x", "tags": [1] })] {
            let err = with_ctx(|ctx| dispatcher.execute("echo", &bad, ctx)).unwrap_err();
            assert!(
                matches!(err, ActionError::ArgumentMismatch { .. }),
                "expected mismatch for {bad}"
            );
        }

        let effects = with_ctx(|ctx| dispatcher.execute("echo", &json!({ "text": "hello", "extra": true }), ctx))
            .unwrap();
        assert_eq!(effects, vec![ActionEffect::AppendMessage(NewMessage::assistant("hello"))]);
    }

    #[test]
    fn tool_definitions_follow_registration_order() {
        let dispatcher = ActionDispatcher::with_builtin().unwrap();
        let tools = dispatcher.tool_definitions();
        assert_eq!(tools.len(), dispatcher.names().len());
        assert_eq!(tools[0]["function"]["name"], dispatcher.names()[0]);

        let etymology = dispatcher.schema("show_etymology").unwrap().tool_definition();
        let required = etymology["function"]["parameters"]["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "root"));
        assert_eq!(
            etymology["function"]["parameters"]["properties"]["related_words"]["type"],
            "array"
        );
    }
}
