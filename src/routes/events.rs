use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tracing::warn;

use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Session events as server-sent events, with a ping on connect and every
/// 30 seconds.
pub async fn stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events().subscribe();

    let events = BroadcastStream::new(receiver).filter_map(|msg| async move {
        match msg {
            Ok(envelope) => match serde_json::to_string(&envelope.event) {
                Ok(data) => Some(Ok(Event::default()
                    .id(envelope.sequence.to_string())
                    .event(envelope.event.event_type())
                    .data(data))),
                Err(err) => {
                    warn!(error = %err, "failed to encode session event");
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
                None
            }
        }
    });

    let initial = stream::once(async { Ok::<Event, Infallible>(ping_event()) });
    let pings = IntervalStream::new(interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL))
        .map(|_| Ok::<Event, Infallible>(ping_event()));

    Sse::new(initial.chain(stream::select(events, pings)))
}

fn ping_event() -> Event {
    let data = serde_json::json!({ "timestamp": chrono::Utc::now().timestamp_millis() });
    Event::default()
        .id(uuid::Uuid::new_v4().to_string())
        .event("ping")
        .data(data.to_string())
}
