use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::catalog::ItemId;
use crate::services::fsrs::{is_mastered, LifecycleState, MemoryState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLimits {
    pub max_reviews: usize,
    pub max_new_per_session: usize,
    pub max_total: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_reviews: 15,
            max_new_per_session: 5,
            max_total: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Review,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonTag {
    Review,
    HighPriorityReview,
    NewItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQueueItem {
    pub item_id: ItemId,
    pub kind: QueueKind,
    pub reason_tag: ReasonTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_learned: usize,
    pub due_today: usize,
    pub mastered_count: usize,
}

/// Builds the day's queue: due reviews first (most overdue, then catalog order),
/// then never-studied catalog items. Items unknown to the catalog are skipped.
pub fn compose(
    progress: &HashMap<ItemId, MemoryState>,
    catalog: &[ItemId],
    limits: SessionLimits,
    now: DateTime<Utc>,
) -> Vec<SessionQueueItem> {
    let positions: HashMap<&str, usize> = catalog
        .iter()
        .enumerate()
        .map(|(pos, id)| (id.as_str(), pos))
        .collect();

    let mut due: Vec<(&ItemId, &MemoryState, usize)> = progress
        .iter()
        .filter(|(_, state)| state.is_due(now))
        .filter_map(|(id, state)| positions.get(id.as_str()).map(|&pos| (id, state, pos)))
        .collect();
    due.sort_by(|a, b| a.1.due_at.cmp(&b.1.due_at).then(a.2.cmp(&b.2)));

    let review_cap = limits.max_reviews.min(limits.max_total);
    let mut queue: Vec<SessionQueueItem> = due
        .into_iter()
        .take(review_cap)
        .map(|(id, state, _)| SessionQueueItem {
            item_id: id.clone(),
            kind: QueueKind::Review,
            reason_tag: if state.lifecycle_state == LifecycleState::Relearning {
                ReasonTag::HighPriorityReview
            } else {
                ReasonTag::Review
            },
        })
        .collect();

    let new_cap = limits
        .max_new_per_session
        .min(limits.max_total.saturating_sub(queue.len()));
    queue.extend(
        catalog
            .iter()
            .filter(|id| !progress.contains_key(id.as_str()))
            .take(new_cap)
            .map(|id| SessionQueueItem {
                item_id: id.clone(),
                kind: QueueKind::New,
                reason_tag: ReasonTag::NewItem,
            }),
    );

    queue
}

pub fn stats(progress: &HashMap<ItemId, MemoryState>, now: DateTime<Utc>) -> SessionStats {
    SessionStats {
        total_learned: progress.len(),
        due_today: progress.values().filter(|state| state.is_due(now)).count(),
        mastered_count: progress.values().filter(|state| is_mastered(state)).count(),
    }
}
