use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct Armed {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    armed: Option<Armed>,
    next_generation: u64,
}

/// One-shot timer that can be cancelled and re-armed. A cancelled arming never
/// fires, even if its sleep already elapsed.
#[derive(Clone)]
pub struct CancellableTimer {
    name: &'static str,
    slot: Arc<Mutex<TimerSlot>>,
}

impl CancellableTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    /// Arms the timer, replacing any pending arming.
    pub fn arm<F, Fut>(&self, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.armed.take() {
            previous.handle.abort();
        }
        slot.next_generation = slot.next_generation.wrapping_add(1);
        let generation = slot.next_generation;

        let shared = Arc::clone(&self.slot);
        let name = self.name;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_armed = {
                let mut slot = shared.lock();
                match &slot.armed {
                    Some(armed) if armed.generation == generation => {
                        slot.armed = None;
                        true
                    }
                    _ => false,
                }
            };
            if still_armed {
                debug!(timer = name, "timer fired");
                on_fire().await;
            }
        });

        slot.armed = Some(Armed {
            generation,
            deadline: Instant::now() + delay,
            handle,
        });
        debug!(timer = name, delay_ms = delay.as_millis() as u64, "timer armed");
    }

    /// Returns `true` if a pending arming was cancelled.
    pub fn cancel(&self) -> bool {
        let armed = self.slot.lock().armed.take();
        match armed {
            Some(armed) => {
                armed.handle.abort();
                debug!(timer = self.name, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().armed.is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.slot
            .lock()
            .armed
            .as_ref()
            .map(|armed| armed.deadline.saturating_duration_since(Instant::now()))
    }
}
