use serde::{Deserialize, Serialize};

use crate::services::fsrs::Rating;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Introduction,
    RecognitionCheck,
    ProductionCheck,
    FreeProduction,
    Completed,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Introduction,
        Stage::RecognitionCheck,
        Stage::ProductionCheck,
        Stage::FreeProduction,
        Stage::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Introduction => "introduction",
            Stage::RecognitionCheck => "recognition_check",
            Stage::ProductionCheck => "production_check",
            Stage::FreeProduction => "free_production",
            Stage::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Completed
    }

    pub fn progress_percent(self) -> u8 {
        let index = Stage::ORDER.iter().position(|s| *s == self).unwrap_or(0);
        ((index * 100) / (Stage::ORDER.len() - 1)) as u8
    }
}

/// Next stage in order; `Completed` maps to itself.
pub fn advance(stage: Stage) -> Stage {
    match stage {
        Stage::Introduction => Stage::RecognitionCheck,
        Stage::RecognitionCheck => Stage::ProductionCheck,
        Stage::ProductionCheck => Stage::FreeProduction,
        Stage::FreeProduction | Stage::Completed => Stage::Completed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionOutcome {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryFlags {
    pub recognition: bool,
    pub production: bool,
    pub free_production: bool,
}

impl MasteryFlags {
    pub fn all_passed(&self) -> bool {
        self.recognition && self.production && self.free_production
    }

    fn mark(&mut self, stage: Stage) {
        match stage {
            Stage::RecognitionCheck => self.recognition = true,
            Stage::ProductionCheck => self.production = true,
            Stage::FreeProduction => self.free_production = true,
            Stage::Introduction | Stage::Completed => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The reported step is not the current stage.
    Ignored { current: Stage },
    /// Failed attempt; the stage stays put for a retry.
    Retry { stage: Stage, failures: u32 },
    Advanced { from: Stage, to: Stage },
    Completed,
}

/// Per-item pass over the ordered stages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMachine {
    stage: Stage,
    mastery: MasteryFlags,
    failures: u32,
    #[serde(default)]
    passes_completed: u32,
}

impl StageMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn mastery(&self) -> MasteryFlags {
        self.mastery
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn passes_completed(&self) -> u32 {
        self.passes_completed
    }

    pub fn is_completed(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Moves one stage forward. Repeated calls once completed are no-ops.
    pub fn advance(&mut self) -> Stage {
        if self.stage.is_terminal() {
            return self.stage;
        }
        self.mastery.mark(self.stage);
        self.stage = advance(self.stage);
        if self.stage.is_terminal() {
            self.passes_completed = self.passes_completed.saturating_add(1);
        }
        self.stage
    }

    pub fn record(&mut self, step: Stage, outcome: InteractionOutcome) -> StepResult {
        if step != self.stage || self.stage.is_terminal() {
            return StepResult::Ignored { current: self.stage };
        }

        match outcome {
            InteractionOutcome::Failed => {
                self.failures = self.failures.saturating_add(1);
                StepResult::Retry {
                    stage: self.stage,
                    failures: self.failures,
                }
            }
            InteractionOutcome::Passed => {
                let from = self.stage;
                let to = self.advance();
                if to.is_terminal() {
                    StepResult::Completed
                } else {
                    StepResult::Advanced { from, to }
                }
            }
        }
    }

    /// Review outcome for a finished pass: clean passes map to `good`/`easy`,
    /// passes that needed retries to `hard`/`again`.
    pub fn derived_rating(&self, had_review_history: bool) -> Rating {
        match self.failures {
            0 if had_review_history => Rating::Easy,
            0 => Rating::Good,
            1..=2 => Rating::Hard,
            _ => Rating::Again,
        }
    }

    /// Starts a fresh pass, keeping the count of finished passes.
    pub fn restart(&mut self) {
        self.stage = Stage::Introduction;
        self.mastery = MasteryFlags::default();
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_in_order_and_stick_at_completed() {
        let mut machine = StageMachine::new();
        let mut seen = vec![machine.stage()];
        for _ in 0..4 {
            seen.push(machine.advance());
        }
        assert_eq!(seen, Stage::ORDER.to_vec());

        for _ in 0..3 {
            assert_eq!(machine.advance(), Stage::Completed);
        }
        assert_eq!(machine.passes_completed(), 1);
        assert!(machine.mastery().all_passed());
    }

    #[test]
    fn free_function_is_idempotent_at_terminal() {
        assert_eq!(advance(Stage::FreeProduction), Stage::Completed);
        assert_eq!(advance(Stage::Completed), Stage::Completed);
    }

    #[test]
    fn mismatched_steps_are_ignored() {
        let mut machine = StageMachine::new();
        let result = machine.record(Stage::ProductionCheck, InteractionOutcome::Passed);
        assert_eq!(result, StepResult::Ignored { current: Stage::Introduction });
        assert_eq!(machine.stage(), Stage::Introduction);
    }

    #[test]
    fn failures_keep_stage_and_shape_rating() {
        let mut machine = StageMachine::new();
        machine.record(Stage::Introduction, InteractionOutcome::Passed);
        assert_eq!(
            machine.record(Stage::RecognitionCheck, InteractionOutcome::Failed),
            StepResult::Retry { stage: Stage::RecognitionCheck, failures: 1 }
        );
        assert_eq!(machine.stage(), Stage::RecognitionCheck);
        assert!(!machine.mastery().recognition);

        assert_eq!(
            machine.record(Stage::RecognitionCheck, InteractionOutcome::Passed),
            StepResult::Advanced { from: Stage::RecognitionCheck, to: Stage::ProductionCheck }
        );
        assert!(machine.mastery().recognition);
        machine.record(Stage::ProductionCheck, InteractionOutcome::Passed);
        assert_eq!(
            machine.record(Stage::FreeProduction, InteractionOutcome::Passed),
            StepResult::Completed
        );
        assert_eq!(machine.derived_rating(false), Rating::Hard);
        assert_eq!(
            machine.record(Stage::Completed, InteractionOutcome::Passed),
            StepResult::Ignored { current: Stage::Completed }
        );
    }

    #[test]
    fn derived_rating_table() {
        let mut machine = StageMachine::new();
        assert_eq!(machine.derived_rating(false), Rating::Good);
        assert_eq!(machine.derived_rating(true), Rating::Easy);
        for _ in 0..3 {
            machine.record(Stage::Introduction, InteractionOutcome::Failed);
        }
        assert_eq!(machine.derived_rating(true), Rating::Again);
    }

    #[test]
    fn restart_clears_the_pass() {
        let mut machine = StageMachine::new();
        machine.record(Stage::Introduction, InteractionOutcome::Failed);
        for _ in 0..4 {
            machine.advance();
        }
        machine.restart();
        assert_eq!(machine.stage(), Stage::Introduction);
        assert_eq!(machine.failures(), 0);
        assert_eq!(machine.mastery(), MasteryFlags::default());
        assert_eq!(machine.passes_completed(), 1);
        assert_eq!(Stage::Completed.progress_percent(), 100);
        assert_eq!(Stage::ProductionCheck.progress_percent(), 50);
    }
}
