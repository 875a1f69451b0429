use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::services::catalog::ItemId;
use crate::services::fsrs::{schedule_with, FsrsParams, MemoryState, Rating};
use crate::storage::{get_json, keys, put_json, KvStore, StorageResult};

/// Owner of every `MemoryState`; entries are created and replaced only through
/// [`ProgressStore::record_review`] and are never removed except by a full reset.
pub struct ProgressStore {
    entries: RwLock<HashMap<ItemId, MemoryState>>,
    learned: RwLock<BTreeSet<ItemId>>,
    params: FsrsParams,
    store: Arc<dyn KvStore>,
}

impl ProgressStore {
    pub async fn load(store: Arc<dyn KvStore>, params: FsrsParams) -> StorageResult<Self> {
        let mut entries = HashMap::new();
        for (key, value) in store.scan_prefix(keys::PROGRESS_PREFIX).await? {
            let item_id = key.trim_start_matches(keys::PROGRESS_PREFIX).to_string();
            match serde_json::from_value::<MemoryState>(value) {
                Ok(state) => {
                    entries.insert(item_id, state);
                }
                Err(err) => warn!(item_id = %item_id, error = %err, "skipping unreadable progress entry"),
            }
        }

        let learned: BTreeSet<ItemId> = get_json(store.as_ref(), keys::learned_items_key())
            .await?
            .unwrap_or_default();

        info!(items = entries.len(), learned = learned.len(), "progress loaded");

        Ok(Self {
            entries: RwLock::new(entries),
            learned: RwLock::new(learned),
            params,
            store,
        })
    }

    pub fn params(&self) -> &FsrsParams {
        &self.params
    }

    pub fn get(&self, item_id: &str) -> Option<MemoryState> {
        self.entries.read().get(item_id).cloned()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.entries.read().contains_key(item_id)
    }

    /// Point-in-time copy for the composer; may lag concurrent reviews.
    pub fn snapshot(&self) -> HashMap<ItemId, MemoryState> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub async fn record_review(
        &self,
        item_id: &str,
        rating: Rating,
        now: DateTime<Utc>,
    ) -> MemoryState {
        let next = {
            let mut entries = self.entries.write();
            let current = entries
                .get(item_id)
                .cloned()
                .unwrap_or_else(|| MemoryState::new_item(now));
            let next = schedule_with(&current, rating, now, &self.params);
            entries.insert(item_id.to_string(), next.clone());
            next
        };

        info!(
            item_id,
            rating = rating.as_str(),
            lifecycle = next.lifecycle_state.as_str(),
            stability = next.stability,
            due_at = %next.due_at,
            "review recorded"
        );

        if let Err(err) = put_json(self.store.as_ref(), &keys::progress_key(item_id), &next).await {
            warn!(item_id, error = %err, "failed to persist progress");
        }
        next
    }

    pub fn learned_items(&self) -> Vec<ItemId> {
        self.learned.read().iter().cloned().collect()
    }

    pub fn is_learned(&self, item_id: &str) -> bool {
        self.learned.read().contains(item_id)
    }

    /// Returns `true` if the item was not yet marked learned.
    pub async fn mark_learned(&self, item_id: &str) -> bool {
        let inserted = self.learned.write().insert(item_id.to_string());
        if inserted {
            self.persist_learned().await;
        }
        inserted
    }

    /// Manual graduation toggle. Marking learned seeds progress with a `good`
    /// review when the item has never been reviewed. Returns the new membership.
    pub async fn toggle_learned(&self, item_id: &str, now: DateTime<Utc>) -> bool {
        let now_learned = {
            let mut learned = self.learned.write();
            if learned.remove(item_id) {
                false
            } else {
                learned.insert(item_id.to_string());
                true
            }
        };

        if now_learned && !self.contains(item_id) {
            self.record_review(item_id, Rating::Good, now).await;
        }
        self.persist_learned().await;
        info!(item_id, learned = now_learned, "learned flag toggled");
        now_learned
    }

    /// Drops in-memory state; the caller clears the backing store.
    pub fn reset(&self) {
        self.entries.write().clear();
        self.learned.write().clear();
    }

    async fn persist_learned(&self) {
        let snapshot = self.learned.read().clone();
        if let Err(err) = put_json(self.store.as_ref(), keys::learned_items_key(), &snapshot).await {
            warn!(error = %err, "failed to persist learned items");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fsrs::LifecycleState;
    use crate::storage::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn reviews_are_persisted_and_reloaded() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let progress = ProgressStore::load(Arc::clone(&store), FsrsParams::default())
            .await
            .unwrap();

        let first = progress.record_review("ephemeral", Rating::Good, now()).await;
        assert_eq!(first.lifecycle_state, LifecycleState::Learning);
        let second = progress
            .record_review("ephemeral", Rating::Good, now() + Duration::days(1))
            .await;
        assert_eq!(second.lifecycle_state, LifecycleState::Review);
        assert!(progress.mark_learned("ephemeral").await);
        assert!(!progress.mark_learned("ephemeral").await);

        let reloaded = ProgressStore::load(store, FsrsParams::default()).await.unwrap();
        assert_eq!(reloaded.get("ephemeral"), Some(second));
        assert!(reloaded.is_learned("ephemeral"));
    }

    #[tokio::test]
    async fn toggle_learned_seeds_progress_once() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let progress = ProgressStore::load(store, FsrsParams::default()).await.unwrap();

        assert!(progress.toggle_learned("resilient", now()).await);
        let seeded = progress.get("resilient").unwrap();
        assert_eq!(seeded.repetitions, 1);

        assert!(!progress.toggle_learned("resilient", now()).await);
        assert!(progress.toggle_learned("resilient", now()).await);
        assert_eq!(progress.get("resilient").unwrap().repetitions, 1);
    }
}
