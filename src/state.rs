use std::time::{Instant, SystemTime};

use crate::events::EventBus;
use crate::session::SessionOrchestrator;

#[derive(Clone)]
pub struct AppState {
    orchestrator: SessionOrchestrator,
    started_at: Instant,
    started_at_system: SystemTime,
}

impl AppState {
    pub fn new(orchestrator: SessionOrchestrator) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
        }
    }

    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    pub fn events(&self) -> &EventBus {
        self.orchestrator.events()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }
}
