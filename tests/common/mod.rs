#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;

use danci_session::collaborator::{ScriptedCollaborator, ScriptedTurn};
use danci_session::config::SessionSettings;
use danci_session::events::EventBus;
use danci_session::routes;
use danci_session::services::catalog::Catalog;
use danci_session::session::transcript::Message;
use danci_session::session::SessionOrchestrator;
use danci_session::state::AppState;
use danci_session::storage::MemoryStore;

pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub collaborator: Arc<ScriptedCollaborator>,
    pub store: Arc<MemoryStore>,
}

pub async fn harness(turns: Vec<ScriptedTurn>) -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()), turns).await
}

pub async fn harness_with_store(store: Arc<MemoryStore>, turns: Vec<ScriptedTurn>) -> Harness {
    let collaborator = Arc::new(ScriptedCollaborator::with_script(turns));
    let orchestrator = SessionOrchestrator::load(
        Arc::new(Catalog::builtin()),
        store.clone(),
        collaborator.clone(),
        EventBus::new(),
        SessionSettings::default(),
    )
    .await
    .expect("orchestrator loads");
    Harness {
        orchestrator,
        collaborator,
        store,
    }
}

pub async fn create_test_app() -> Router {
    let harness = harness(Vec::new()).await;
    routes::router(AppState::new(harness.orchestrator))
}

impl Harness {
    pub fn transcript(&self) -> Vec<Message> {
        self.orchestrator.snapshot().transcript
    }

    pub fn last_message(&self) -> Message {
        self.transcript().pop().expect("transcript is never empty")
    }

    pub fn card_kinds(&self) -> Vec<&'static str> {
        self.transcript()
            .iter()
            .filter_map(|m| m.card.as_ref().map(|card| card.kind()))
            .collect()
    }
}
