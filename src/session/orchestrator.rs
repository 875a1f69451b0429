use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collaborator::{Collaborator, CollaboratorError, TurnDirective, TurnRequest, TurnResponse};
use crate::config::SessionSettings;
use crate::events::{EventBus, SessionEvent};
use crate::services::catalog::{Catalog, CatalogItem, ItemId};
use crate::services::composer::{self, SessionQueueItem, SessionStats};
use crate::services::fsrs::{FsrsParams, LifecycleState};
use crate::services::progress::ProgressStore;
use crate::storage::{get_json, keys, put_json, KvStore};

use super::actions::streaming::{FinalizedReply, StreamingReply};
use super::actions::{ActionContext, ActionDispatcher, ActionEffect, ActionError, PendingAction};
use super::card::{card_for_stage, CardPayload};
use super::coaching::{is_acknowledgement, quick_replies, ProactiveTopic, QuickReply};
use super::context::{ActivationToken, SessionContext};
use super::stage::{InteractionOutcome, MasteryFlags, Stage, StepResult};
use super::timer::CancellableTimer;
use super::transcript::{ActionRecord, AppendOutcome, ItemSession, Message, NewMessage};
use super::{RecoveredFault, SessionError};

const FALLBACK_REPLY: &str = "Let's keep going.";
const ALL_DONE_REPLY: &str = "That's everything for today. Great job!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    /// A collaborator turn was already in flight; nothing changed.
    Busy,
    /// The active item changed before the turn resolved; its effects were dropped.
    Stale,
    /// A local reply stood in for a failed collaborator turn or action.
    Fallback,
    Ignored,
    NoActiveItem,
}

/// Outcome of one orchestrator request. Internal failures end up here as
/// recovered faults, never as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub status: TurnStatus,
    pub item_id: Option<ItemId>,
    pub stage: Option<Stage>,
    pub faults: Vec<RecoveredFault>,
}

impl TurnReport {
    fn without_item(status: TurnStatus) -> Self {
        Self {
            status,
            item_id: None,
            stage: None,
            faults: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveItem {
    pub item: CatalogItem,
    pub generation: u64,
    pub stage: Stage,
    pub mastery: MasteryFlags,
    pub failures: u32,
    pub progress_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub active_item: Option<ActiveItem>,
    pub is_typing: bool,
    pub auto_advance: bool,
    pub transcript: Vec<Message>,
    pub quick_replies: Vec<QuickReply>,
    pub countdown_remaining_ms: Option<u64>,
}

#[derive(Debug)]
enum TimerEvent {
    Idle(ActivationToken),
    AutoContinue(ActivationToken),
    Countdown(ActivationToken),
}

struct Inner {
    catalog: Arc<Catalog>,
    progress: ProgressStore,
    store: Arc<dyn KvStore>,
    dispatcher: ActionDispatcher,
    collaborator: Arc<dyn Collaborator>,
    events: EventBus,
    settings: SessionSettings,
    context: Mutex<SessionContext>,
    idle_timer: CancellableTimer,
    auto_timer: CancellableTimer,
    countdown_timer: CancellableTimer,
    timer_events: mpsc::UnboundedSender<TimerEvent>,
}

/// Drives the active item's session: turns, stage progress, scheduling and
/// the idle, auto-advance and countdown timers.
///
/// Every async effect carries the [`ActivationToken`] it started under and is
/// applied only while that token is live. At most one collaborator turn runs
/// at a time.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Restores progress, item sessions and session flags from `store`.
    pub async fn load(
        catalog: Arc<Catalog>,
        store: Arc<dyn KvStore>,
        collaborator: Arc<dyn Collaborator>,
        events: EventBus,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let progress = ProgressStore::load(Arc::clone(&store), FsrsParams::default()).await?;
        let dispatcher = ActionDispatcher::with_builtin()?;

        let mut sessions = HashMap::new();
        for (key, value) in store.scan_prefix(keys::SESSION_PREFIX).await? {
            let item_id = key.trim_start_matches(keys::SESSION_PREFIX);
            if !catalog.contains(item_id) {
                warn!(item_id, "dropping session for an item missing from the catalog");
                continue;
            }
            match serde_json::from_value::<ItemSession>(value) {
                Ok(mut session) => {
                    // A turn interrupted by shutdown leaves its bubble behind.
                    session
                        .transcript
                        .retain(|m| !(m.is_placeholder() && m.card.is_none() && m.action.is_none()));
                    sessions.insert(item_id.to_string(), session);
                }
                Err(err) => warn!(item_id, error = %err, "skipping unreadable session"),
            }
        }

        let active_item = read_flag::<ItemId>(store.as_ref(), keys::active_item_key())
            .await
            .filter(|id| sessions.contains_key(id));
        let auto_advance = read_flag::<bool>(store.as_ref(), keys::auto_advance_key())
            .await
            .unwrap_or(false);

        info!(
            sessions = sessions.len(),
            active_item = ?active_item,
            auto_advance,
            collaborator = collaborator.name(),
            "session state restored"
        );

        let (timer_events, timer_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            inner: Arc::new(Inner {
                catalog,
                progress,
                store,
                dispatcher,
                collaborator,
                events,
                settings,
                context: Mutex::new(SessionContext::restore(sessions, active_item, auto_advance)),
                idle_timer: CancellableTimer::new("idle"),
                auto_timer: CancellableTimer::new("auto_advance"),
                countdown_timer: CancellableTimer::new("countdown"),
                timer_events,
            }),
        };
        tokio::spawn(run_timer_events(Arc::downgrade(&orchestrator.inner), timer_rx));
        Ok(orchestrator)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.inner.progress
    }

    pub fn settings(&self) -> SessionSettings {
        self.inner.settings
    }

    /// Makes `item_id` the active item. Its session is created on first use
    /// and resumed afterwards; a session left at `Completed` starts a new pass.
    pub async fn activate_item(&self, item_id: &str) -> TurnReport {
        if !self.inner.catalog.contains(item_id) {
            warn!(item_id, "activation of an unknown item ignored");
            return TurnReport::without_item(TurnStatus::Ignored);
        }
        self.cancel_timers();

        let now = Utc::now();
        let (token, fresh) = self.with_context(|ctx| {
            let (token, created) = ctx.activate(item_id, now);
            let restarted = ctx
                .with_live_session(&token, |session| {
                    if session.machine.is_completed() {
                        session.machine.restart();
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            (token, created || restarted)
        });

        info!(item_id, generation = token.generation, resumed = !fresh, "item activated");
        self.publish(SessionEvent::ItemActivated {
            item_id: token.item_id.clone(),
            generation: token.generation,
            resumed: !fresh,
        });
        if fresh {
            self.render_stage_card(&token);
        }
        self.publish_quick_replies(&token);

        self.persist_session(&token.item_id).await;
        self.persist_flag(keys::active_item_key(), &token.item_id).await;
        self.schedule_follow_up(&token, true);
        self.report(TurnStatus::Completed, &token, Vec::new())
    }

    pub async fn submit_user_input(&self, text: &str) -> TurnReport {
        let text = text.trim();
        let Some(token) = self.active_token() else {
            return TurnReport::without_item(TurnStatus::NoActiveItem);
        };
        if text.is_empty() {
            return self.report(TurnStatus::Ignored, &token, Vec::new());
        }
        if !self.with_context(|ctx| ctx.begin_turn()) {
            debug!(item_id = %token.item_id, "input while a turn is in flight");
            return self.report(TurnStatus::Busy, &token, Vec::new());
        }
        self.note_user_activity(&token);

        let mut faults = Vec::new();
        let stage = self.live_stage(&token).unwrap_or_default();
        if self
            .append_live(&token, NewMessage::user(text).with_step(stage))
            .is_some_and(|outcome| outcome.is_duplicate())
        {
            faults.push(RecoveredFault::DuplicateOutcome);
        }

        let directive = if stage == Stage::Introduction && is_acknowledgement(text) {
            self.apply_step(&token, Stage::Introduction, InteractionOutcome::Passed, &mut faults)
                .await;
            TurnDirective::StageEntered {
                stage: self.live_stage(&token).unwrap_or(Stage::RecognitionCheck),
            }
        } else {
            TurnDirective::UserMessage { text: text.to_string() }
        };

        self.run_turn(token, directive, true, faults).await
    }

    /// Reports the learner's result for the card of `step`. Results for any
    /// other step than the current one are ignored.
    pub async fn submit_interaction_result(&self, step: Stage, outcome: InteractionOutcome) -> TurnReport {
        let Some(token) = self.active_token() else {
            return TurnReport::without_item(TurnStatus::NoActiveItem);
        };
        if !self.with_context(|ctx| ctx.begin_turn()) {
            return self.report(TurnStatus::Busy, &token, Vec::new());
        }
        self.note_user_activity(&token);

        let mut faults = Vec::new();
        match self.apply_step(&token, step, outcome, &mut faults).await {
            None => {
                self.with_context(|ctx| ctx.end_turn());
                faults.push(RecoveredFault::StaleEffect);
                self.report(TurnStatus::Stale, &token, faults)
            }
            Some(StepResult::Ignored { current }) => {
                debug!(item_id = %token.item_id, step = step.as_str(), current = current.as_str(), "step result ignored");
                self.with_context(|ctx| ctx.end_turn());
                self.schedule_follow_up(&token, true);
                self.report(TurnStatus::Ignored, &token, faults)
            }
            Some(_) => {
                self.run_turn(token, TurnDirective::InteractionResult { step, outcome }, true, faults)
                    .await
            }
        }
    }

    /// Proactive text-only turn after a silence. Skipped in auto-advance mode,
    /// at `Completed`, and while a turn is in flight.
    pub async fn on_idle_timeout(&self) -> TurnReport {
        let Some(token) = self.active_token() else {
            return TurnReport::without_item(TurnStatus::NoActiveItem);
        };
        if let Some(status) = self.claim_turn(&token, |ctx| ctx.auto_advance()) {
            return self.report(status, &token, Vec::new());
        }

        let topic = self.with_context(|ctx| {
            ctx.with_live_session(&token, |session| {
                let topic = ProactiveTopic::pick(session.proactive_rounds, session.last(), session.last_topic);
                session.proactive_rounds = session.proactive_rounds.wrapping_add(1);
                session.last_topic = Some(topic);
                topic
            })
        });
        let Some(topic) = topic else {
            self.with_context(|ctx| ctx.end_turn());
            return self.report(TurnStatus::Stale, &token, vec![RecoveredFault::StaleEffect]);
        };

        info!(item_id = %token.item_id, topic = topic.as_str(), "proactive turn");
        self.run_turn(token, TurnDirective::Proactive { topic }, false, Vec::new())
            .await
    }

    pub fn get_active_item(&self) -> Option<ActiveItem> {
        self.with_context(|ctx| self.active_item_view(ctx))
    }

    /// Copy of any item's session, active or not.
    pub fn session(&self, item_id: &str) -> Option<ItemSession> {
        self.with_context(|ctx| ctx.session(item_id).cloned())
    }

    /// Flips auto-advance and swaps the idle timer for the auto-advance timer
    /// (or back). Returns the new setting.
    pub async fn toggle_auto_advance(&self) -> bool {
        let enabled = self.with_context(|ctx| ctx.toggle_auto_advance());
        info!(enabled, "auto-advance toggled");
        self.publish(SessionEvent::AutoAdvanceChanged { enabled });

        if enabled {
            self.inner.idle_timer.cancel();
        } else {
            self.inner.auto_timer.cancel();
        }
        if let Some(token) = self.active_token() {
            self.schedule_follow_up(&token, true);
        }
        self.persist_flag(keys::auto_advance_key(), &enabled).await;
        enabled
    }

    /// Forgets all progress, sessions and flags, in memory and in the store.
    pub async fn reset_all_data(&self) {
        self.cancel_timers();
        self.with_context(|ctx| ctx.clear());
        self.inner.progress.reset();
        if let Err(err) = self.inner.store.clear().await {
            warn!(error = %err, "failed to clear stored session data");
        }
        info!("all session data reset");
        self.publish(SessionEvent::DataReset);
    }

    pub fn get_daily_queue(&self) -> Vec<SessionQueueItem> {
        composer::compose(
            &self.inner.progress.snapshot(),
            &self.inner.catalog.ids(),
            self.inner.settings.limits,
            Utc::now(),
        )
    }

    pub fn get_stats(&self) -> SessionStats {
        composer::stats(&self.inner.progress.snapshot(), Utc::now())
    }

    /// `None` for items missing from the catalog.
    pub async fn toggle_learned(&self, item_id: &str) -> Option<bool> {
        if !self.inner.catalog.contains(item_id) {
            return None;
        }
        Some(self.inner.progress.toggle_learned(item_id, Utc::now()).await)
    }

    /// Stops a running completion countdown. Returns `true` if one was pending.
    pub fn cancel_countdown(&self) -> bool {
        let cancelled = self.inner.countdown_timer.cancel();
        if cancelled {
            if let Some(token) = self.active_token() {
                self.publish(SessionEvent::CountdownCancelled { item_id: token.item_id });
            }
        }
        cancelled
    }

    /// Starts the completion countdown again from its full length. Only an
    /// active item at `Completed` has one; returns `false` otherwise.
    pub fn restart_countdown(&self) -> bool {
        let Some(token) = self.active_token() else {
            return false;
        };
        if !self.live_stage(&token).is_some_and(Stage::is_terminal) {
            return false;
        }
        info!(item_id = %token.item_id, "countdown restarted");
        let next_item_id = self.next_queue_item(&token.item_id);
        self.start_countdown(&token, next_item_id);
        true
    }

    /// Leaves the active item for the next one in the daily queue without
    /// waiting for the countdown.
    pub async fn advance_to_next_item(&self) -> TurnReport {
        let Some(token) = self.active_token() else {
            return TurnReport::without_item(TurnStatus::NoActiveItem);
        };
        if self.inner.countdown_timer.cancel() {
            self.publish(SessionEvent::CountdownCancelled {
                item_id: token.item_id.clone(),
            });
        }
        self.advance_to_next(&token).await;
        match self.active_token() {
            Some(current) => self.report(TurnStatus::Completed, &current, Vec::new()),
            None => TurnReport::without_item(TurnStatus::NoActiveItem),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let countdown_remaining_ms = self
            .inner
            .countdown_timer
            .remaining()
            .map(|left| left.as_millis() as u64);
        self.with_context(|ctx| {
            let ctx = &*ctx;
            let session = ctx.active_session();
            SessionSnapshot {
                active_item: self.active_item_view(ctx),
                is_typing: ctx.is_typing(),
                auto_advance: ctx.auto_advance(),
                transcript: session.map(|s| s.transcript.clone()).unwrap_or_default(),
                quick_replies: session
                    .map(|s| quick_replies(s.last(), s.stage(), s.mastery()))
                    .unwrap_or_default(),
                countdown_remaining_ms,
            }
        })
    }

    /// One collaborator turn against `token`. The caller has claimed the turn
    /// slot; it is released here on every path.
    async fn run_turn(
        &self,
        token: ActivationToken,
        directive: TurnDirective,
        allow_actions: bool,
        mut faults: Vec<RecoveredFault>,
    ) -> TurnReport {
        let rearm_idle = !matches!(directive, TurnDirective::Proactive { .. });
        self.publish(SessionEvent::TypingChanged { is_typing: true });

        let status = self
            .stream_turn(&token, directive, allow_actions, &mut faults)
            .await;

        self.with_context(|ctx| {
            ctx.clear_streaming(&token);
            ctx.end_turn();
        });
        self.publish(SessionEvent::TypingChanged { is_typing: false });

        if status == TurnStatus::Stale {
            debug!(item_id = %token.item_id, generation = token.generation, "stale turn discarded");
        } else {
            self.publish_quick_replies(&token);
            self.persist_session(&token.item_id).await;
            self.schedule_follow_up(&token, rearm_idle);
        }
        self.report(status, &token, faults)
    }

    async fn stream_turn(
        &self,
        token: &ActivationToken,
        directive: TurnDirective,
        allow_actions: bool,
        faults: &mut Vec<RecoveredFault>,
    ) -> TurnStatus {
        let Some(item) = self.inner.catalog.get(&token.item_id).cloned() else {
            return TurnStatus::Ignored;
        };

        let opened = self.with_context(|ctx| {
            let opened = ctx.with_live_session(token, |session| {
                let stage = session.stage();
                let transcript = session.transcript.clone();
                let reply = StreamingReply::open(session, stage);
                let placeholder = session.message(reply.id()).cloned();
                (stage, transcript, reply, placeholder)
            });
            if let Some((_, _, reply, _)) = &opened {
                ctx.set_streaming(token, reply.id().clone());
            }
            opened
        });
        let Some((stage, transcript, mut reply, placeholder)) = opened else {
            faults.push(RecoveredFault::StaleEffect);
            return TurnStatus::Stale;
        };
        if let Some(message) = placeholder {
            self.publish_appended(&token.item_id, message);
        }

        let tools = if allow_actions {
            self.inner.dispatcher.tool_definitions()
        } else {
            Vec::new()
        };
        let request = TurnRequest {
            item,
            stage,
            transcript,
            directive,
            tools,
            allow_actions,
        };

        let turn_timeout = self.inner.settings.turn_timeout;
        let (tokens_tx, mut tokens_rx) = mpsc::unbounded_channel::<String>();
        let call = self.inner.collaborator.stream_turn(request, tokens_tx);
        let deadline = tokio::time::sleep(turn_timeout);
        tokio::pin!(call);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                biased;
                Some(text) = tokens_rx.recv() => self.apply_token(token, &mut reply, &text),
                result = &mut call => break result,
                () = &mut deadline => break Err(CollaboratorError::Timeout(turn_timeout)),
            }
        };
        while let Ok(text) = tokens_rx.try_recv() {
            self.apply_token(token, &mut reply, &text);
        }

        match result {
            Ok(response) => self.finish_turn(token, reply, response, faults).await,
            Err(err) => {
                warn!(
                    item_id = %token.item_id,
                    collaborator = self.inner.collaborator.name(),
                    error = %err,
                    "collaborator turn failed"
                );
                faults.push(RecoveredFault::CollaboratorUnavailable { reason: err.to_string() });
                self.fall_back(token, reply, faults)
            }
        }
    }

    fn apply_token(&self, token: &ActivationToken, reply: &mut StreamingReply, text: &str) {
        let content = self
            .with_context(|ctx| ctx.with_live_session(token, |session| reply.push_token(session, text)))
            .flatten();
        if let Some(content) = content {
            self.publish(SessionEvent::MessageUpdated {
                item_id: token.item_id.clone(),
                message_id: reply.id().clone(),
                content,
            });
        }
    }

    async fn finish_turn(
        &self,
        token: &ActivationToken,
        reply: StreamingReply,
        response: TurnResponse,
        faults: &mut Vec<RecoveredFault>,
    ) -> TurnStatus {
        let has_action = response.action.is_some();
        let finalized = self.with_context(|ctx| {
            ctx.with_live_session(token, |session| reply.finalize(session, &response.final_text, has_action))
        });
        let Some(finalized) = finalized else {
            faults.push(RecoveredFault::StaleEffect);
            return TurnStatus::Stale;
        };
        self.publish_finalized(&token.item_id, finalized, faults);

        match response.action {
            Some(action) => {
                let pending = PendingAction {
                    name: action.name,
                    arguments: action.arguments,
                    token: token.clone(),
                };
                self.dispatch(pending, faults).await
            }
            None => TurnStatus::Completed,
        }
    }

    /// Settles the streamed message after a failed turn and adds the local
    /// fallback reply.
    fn fall_back(
        &self,
        token: &ActivationToken,
        reply: StreamingReply,
        faults: &mut Vec<RecoveredFault>,
    ) -> TurnStatus {
        let streamed = reply.tokens() > 0;
        let finalized = self.with_context(|ctx| {
            ctx.with_live_session(token, |session| reply.finalize(session, FALLBACK_REPLY, false))
        });
        let Some(finalized) = finalized else {
            faults.push(RecoveredFault::StaleEffect);
            return TurnStatus::Stale;
        };
        self.publish_finalized(&token.item_id, finalized, faults);

        if streamed {
            let stage = self.live_stage(token).unwrap_or_default();
            self.append_live(token, NewMessage::assistant(FALLBACK_REPLY).with_step(stage));
        }
        TurnStatus::Fallback
    }

    async fn dispatch(&self, pending: PendingAction, faults: &mut Vec<RecoveredFault>) -> TurnStatus {
        let PendingAction { name, arguments, token } = pending;
        let Some(item) = self.inner.catalog.get(&token.item_id) else {
            return TurnStatus::Ignored;
        };
        let Some(stage) = self.live_stage(&token) else {
            faults.push(RecoveredFault::StaleEffect);
            return TurnStatus::Stale;
        };

        let ctx = ActionContext { item, stage };
        match self.inner.dispatcher.execute(&name, &arguments, &ctx) {
            Ok(effects) => {
                info!(item_id = %token.item_id, action = %name, effects = effects.len(), "action dispatched");
                let record = NewMessage::assistant("")
                    .with_action(ActionRecord { name, arguments })
                    .with_step(stage);
                if self.append_live(&token, record).is_none() {
                    faults.push(RecoveredFault::StaleEffect);
                    return TurnStatus::Stale;
                }
                self.apply_effects(&token, effects, faults).await
            }
            Err(err) => {
                warn!(item_id = %token.item_id, action = %name, error = %err, "action rejected");
                faults.push(match err {
                    ActionError::UnknownAction(name) => RecoveredFault::UnknownAction { name },
                    other => RecoveredFault::ActionRejected {
                        name,
                        reason: other.to_string(),
                    },
                });
                let fallback = format!("{FALLBACK_REPLY} We're still on \"{}\".", item.word);
                self.append_live(&token, NewMessage::assistant(fallback).with_step(stage));
                TurnStatus::Fallback
            }
        }
    }

    async fn apply_effects(
        &self,
        token: &ActivationToken,
        effects: Vec<ActionEffect>,
        faults: &mut Vec<RecoveredFault>,
    ) -> TurnStatus {
        for effect in effects {
            let Some(stage) = self.live_stage(token) else {
                faults.push(RecoveredFault::StaleEffect);
                return TurnStatus::Stale;
            };
            match effect {
                ActionEffect::AppendMessage(message) => {
                    if self
                        .append_live(token, message)
                        .is_some_and(|outcome| outcome.is_duplicate())
                    {
                        faults.push(RecoveredFault::DuplicateOutcome);
                    }
                }
                ActionEffect::RenderCard(card) => {
                    if self
                        .append_live(token, NewMessage::card(card).with_step(stage))
                        .is_some_and(|outcome| outcome.is_duplicate())
                    {
                        faults.push(RecoveredFault::DuplicateOutcome);
                    }
                }
                ActionEffect::AdvanceStage => {
                    self.apply_step(token, stage, InteractionOutcome::Passed, faults)
                        .await;
                }
                ActionEffect::SwitchToNextItem => {
                    self.advance_to_next(token).await;
                    return TurnStatus::Completed;
                }
            }
        }
        TurnStatus::Completed
    }

    /// Feeds one checkpoint result to the stage machine and carries out what
    /// follows: the next stage's card, or the completion flow. `None` when the
    /// token is stale.
    async fn apply_step(
        &self,
        token: &ActivationToken,
        step: Stage,
        outcome: InteractionOutcome,
        faults: &mut Vec<RecoveredFault>,
    ) -> Option<StepResult> {
        let result = self.with_context(|ctx| {
            ctx.with_live_session(token, |session| session.machine.record(step, outcome))
        })?;

        match result {
            StepResult::Ignored { .. } => {}
            StepResult::Retry { stage, failures } => {
                info!(item_id = %token.item_id, stage = stage.as_str(), failures, "checkpoint failed");
            }
            StepResult::Advanced { from, to } => {
                info!(item_id = %token.item_id, from = from.as_str(), to = to.as_str(), "stage advanced");
                self.publish(SessionEvent::StageChanged {
                    item_id: token.item_id.clone(),
                    from,
                    to,
                });
                self.render_stage_card(token);
            }
            StepResult::Completed => {
                info!(item_id = %token.item_id, "all stages completed");
                self.publish(SessionEvent::StageChanged {
                    item_id: token.item_id.clone(),
                    from: step,
                    to: Stage::Completed,
                });
                self.complete_item(token, faults).await;
            }
        }
        Some(result)
    }

    /// Records the review for a finished pass, marks the item learned and
    /// starts the countdown to the next queued item.
    async fn complete_item(&self, token: &ActivationToken, faults: &mut Vec<RecoveredFault>) {
        let item_id = token.item_id.as_str();
        let prior = self.inner.progress.get(item_id);
        let had_review_history = prior
            .as_ref()
            .is_some_and(|state| state.lifecycle_state == LifecycleState::Review);

        let rating = self.with_context(|ctx| {
            ctx.with_live_session(token, |session| session.machine.derived_rating(had_review_history))
        });
        let Some(rating) = rating else {
            faults.push(RecoveredFault::StaleEffect);
            return;
        };

        if prior.as_ref().is_some_and(|state| !state.is_in_domain()) {
            warn!(item_id, "stored memory state out of domain, clamped on review");
            faults.push(RecoveredFault::ModelFault {
                item_id: item_id.to_string(),
            });
        }
        self.inner.progress.record_review(item_id, rating, Utc::now()).await;
        self.inner.progress.mark_learned(item_id).await;

        let next_item_id = self.next_queue_item(item_id);
        let seconds = self.inner.settings.countdown.as_secs();
        let card = CardPayload::Countdown {
            next_item_id: next_item_id.clone(),
            seconds,
        };
        if self
            .append_live(token, NewMessage::card(card).with_step(Stage::Completed))
            .is_none()
        {
            faults.push(RecoveredFault::StaleEffect);
            return;
        }

        self.start_countdown(token, next_item_id);
    }

    fn start_countdown(&self, token: &ActivationToken, next_item_id: Option<ItemId>) {
        self.publish(SessionEvent::CountdownStarted {
            item_id: token.item_id.clone(),
            seconds: self.inner.settings.countdown.as_secs(),
            next_item_id,
        });
        self.arm(
            &self.inner.countdown_timer,
            self.inner.settings.countdown,
            TimerEvent::Countdown(token.clone()),
        );
    }

    /// Moves on to the next queued item, or says goodbye when none is left.
    async fn advance_to_next(&self, token: &ActivationToken) {
        let Some(stage) = self.live_stage(token) else {
            return;
        };
        match self.next_queue_item(&token.item_id) {
            Some(next) => {
                self.activate_item(&next).await;
            }
            None => {
                info!(item_id = %token.item_id, "daily queue exhausted");
                self.append_live(token, NewMessage::assistant(ALL_DONE_REPLY).with_step(stage));
                self.persist_session(&token.item_id).await;
            }
        }
    }

    fn next_queue_item(&self, current: &str) -> Option<ItemId> {
        self.get_daily_queue()
            .into_iter()
            .map(|queued| queued.item_id)
            .find(|id| id != current)
    }

    async fn auto_continue(&self) -> TurnReport {
        let Some(token) = self.active_token() else {
            return TurnReport::without_item(TurnStatus::NoActiveItem);
        };
        if let Some(status) = self.claim_turn(&token, |ctx| !ctx.auto_advance()) {
            return self.report(status, &token, Vec::new());
        }
        self.run_turn(token, TurnDirective::AutoContinue, true, Vec::new())
            .await
    }

    async fn handle_timer(&self, event: TimerEvent) {
        let report = match event {
            TimerEvent::Idle(token) if self.is_live(&token) => self.on_idle_timeout().await,
            TimerEvent::AutoContinue(token) if self.is_live(&token) => self.auto_continue().await,
            TimerEvent::Countdown(token) => {
                self.advance_to_next(&token).await;
                return;
            }
            stale => {
                debug!(event = ?stale, "timer fired for a stale activation");
                return;
            }
        };
        debug!(status = ?report.status, "timer turn finished");
    }

    /// Claims the turn slot for a timer-driven turn. Returns the status to
    /// report instead when `skip` holds, the item is done, or a turn is running.
    fn claim_turn(
        &self,
        token: &ActivationToken,
        skip: impl FnOnce(&SessionContext) -> bool,
    ) -> Option<TurnStatus> {
        self.with_context(|ctx| {
            let completed = ctx
                .session(&token.item_id)
                .map_or(true, |session| session.stage().is_terminal());
            if skip(ctx) || completed || !ctx.is_live(token) {
                Some(TurnStatus::Ignored)
            } else if !ctx.begin_turn() {
                Some(TurnStatus::Busy)
            } else {
                None
            }
        })
    }

    /// Arms the auto-advance timer in auto mode, the idle timer otherwise.
    fn schedule_follow_up(&self, token: &ActivationToken, rearm_idle: bool) {
        let state = self.with_context(|ctx| {
            let completed = ctx
                .session(&token.item_id)
                .map_or(true, |session| session.stage().is_terminal());
            ctx.is_live(token).then(|| (ctx.auto_advance(), completed))
        });
        let Some((auto_advance, completed)) = state else {
            return;
        };
        if completed {
            return;
        }
        if auto_advance {
            self.arm(
                &self.inner.auto_timer,
                self.inner.settings.auto_advance_delay,
                TimerEvent::AutoContinue(token.clone()),
            );
        } else if rearm_idle {
            self.arm(
                &self.inner.idle_timer,
                self.inner.settings.idle_timeout,
                TimerEvent::Idle(token.clone()),
            );
        }
    }

    fn arm(&self, timer: &CancellableTimer, delay: Duration, event: TimerEvent) {
        let events = self.inner.timer_events.clone();
        timer.arm(delay, move || async move {
            let _ = events.send(event);
        });
    }

    fn note_user_activity(&self, token: &ActivationToken) {
        self.inner.idle_timer.cancel();
        self.inner.auto_timer.cancel();
        if self.inner.countdown_timer.cancel() {
            self.publish(SessionEvent::CountdownCancelled {
                item_id: token.item_id.clone(),
            });
        }
    }

    fn cancel_timers(&self) {
        self.inner.idle_timer.cancel();
        self.inner.auto_timer.cancel();
        self.inner.countdown_timer.cancel();
    }

    fn render_stage_card(&self, token: &ActivationToken) {
        let Some(item) = self.inner.catalog.get(&token.item_id) else {
            return;
        };
        let Some(stage) = self.live_stage(token) else {
            return;
        };
        let Some(card) = card_for_stage(item, stage) else {
            return;
        };
        let appended = self.append_live(token, NewMessage::card(card).with_step(stage));
        if stage == Stage::Introduction && appended.is_some() {
            self.publish(SessionEvent::PronunciationRequested {
                item_id: token.item_id.clone(),
                word: item.word.clone(),
            });
        }
    }

    /// Appends to the live session and publishes the new entry. `None` when
    /// the token is stale.
    fn append_live(&self, token: &ActivationToken, message: NewMessage) -> Option<AppendOutcome> {
        let (outcome, stored) = self.with_context(|ctx| {
            ctx.with_live_session(token, |session| {
                let outcome = session.append(message);
                let stored = match &outcome {
                    AppendOutcome::Appended(id) => session.message(id).cloned(),
                    AppendOutcome::Duplicate(_) => None,
                };
                (outcome, stored)
            })
        })?;
        if let Some(message) = stored {
            self.publish_appended(&token.item_id, message);
        }
        Some(outcome)
    }

    fn publish_appended(&self, item_id: &str, message: Message) {
        let card = message.card.clone();
        let message_id = message.id.clone();
        self.publish(SessionEvent::MessageAppended {
            item_id: item_id.to_string(),
            message,
        });
        if let Some(card) = card {
            self.publish(SessionEvent::CardRendered {
                item_id: item_id.to_string(),
                message_id,
                card,
            });
        }
    }

    fn publish_finalized(&self, item_id: &str, finalized: FinalizedReply, faults: &mut Vec<RecoveredFault>) {
        match finalized {
            FinalizedReply::Kept { id, content } => self.publish(SessionEvent::MessageUpdated {
                item_id: item_id.to_string(),
                message_id: id,
                content,
            }),
            FinalizedReply::Collapsed { removed, .. } => {
                faults.push(RecoveredFault::DuplicateOutcome);
                self.publish(SessionEvent::MessageRemoved {
                    item_id: item_id.to_string(),
                    message_id: removed,
                });
            }
            FinalizedReply::Removed { id } => self.publish(SessionEvent::MessageRemoved {
                item_id: item_id.to_string(),
                message_id: id,
            }),
        }
    }

    fn publish_quick_replies(&self, token: &ActivationToken) {
        let replies = self.with_context(|ctx| {
            if !ctx.is_live(token) {
                return None;
            }
            ctx.session(&token.item_id)
                .map(|session| quick_replies(session.last(), session.stage(), session.mastery()))
        });
        if let Some(replies) = replies {
            self.publish(SessionEvent::QuickReplies {
                item_id: token.item_id.clone(),
                replies,
            });
        }
    }

    fn publish(&self, event: SessionEvent) {
        self.inner.events.publish(event);
    }

    fn active_item_view(&self, ctx: &SessionContext) -> Option<ActiveItem> {
        let token = ctx.active()?;
        let session = ctx.session(&token.item_id)?;
        let item = self.inner.catalog.get(&token.item_id)?.clone();
        let stage = session.stage();
        Some(ActiveItem {
            item,
            generation: token.generation,
            stage,
            mastery: session.mastery(),
            failures: session.machine.failures(),
            progress_percent: stage.progress_percent(),
        })
    }

    async fn persist_session(&self, item_id: &str) {
        let Some(session) = self.with_context(|ctx| ctx.session(item_id).cloned()) else {
            return;
        };
        if let Err(err) = put_json(self.inner.store.as_ref(), &keys::session_key(item_id), &session).await {
            warn!(item_id, error = %err, "failed to persist session");
        }
    }

    async fn persist_flag<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(err) = put_json(self.inner.store.as_ref(), key, value).await {
            warn!(key, error = %err, "failed to persist session flag");
        }
    }

    fn report(&self, status: TurnStatus, token: &ActivationToken, faults: Vec<RecoveredFault>) -> TurnReport {
        let stage = self.with_context(|ctx| ctx.session(&token.item_id).map(ItemSession::stage));
        TurnReport {
            status,
            item_id: Some(token.item_id.clone()),
            stage,
            faults,
        }
    }

    fn active_token(&self) -> Option<ActivationToken> {
        self.with_context(|ctx| ctx.active().cloned())
    }

    fn is_live(&self, token: &ActivationToken) -> bool {
        self.with_context(|ctx| ctx.is_live(token))
    }

    fn live_stage(&self, token: &ActivationToken) -> Option<Stage> {
        self.with_context(|ctx| ctx.with_live_session(token, |session| session.stage()))
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut SessionContext) -> R) -> R {
        f(&mut self.inner.context.lock())
    }
}

async fn run_timer_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TimerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionOrchestrator { inner }.handle_timer(event).await;
    }
}

/// Reads an optional session flag; unreadable values count as unset.
async fn read_flag<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    match get_json(store, key).await {
        Ok(value) => value,
        Err(err) => {
            warn!(key, error = %err, "ignoring unreadable session flag");
            None
        }
    }
}
