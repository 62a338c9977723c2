//! SSE fan-out (C9): `/api/message-stream` and `/api/bot-stream`. Each
//! client has its own subscription, timers, and state; a slow or dead
//! client can't back-pressure anyone else, and per-client send failures
//! are swallowed.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use meshrank_protocol::SseEvent;
use tokio_stream::wrappers::BroadcastStream;

use crate::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn event_type(event: &SseEvent) -> &'static str {
    match event {
        SseEvent::Ready { .. } => "ready",
        SseEvent::Packet { .. } => "packet",
        SseEvent::CountersUpdated { .. } => "counters",
        SseEvent::RanksUpdated { .. } => "ranks",
        SseEvent::Health { .. } => "health",
        SseEvent::LogEntry { .. } => "log_entry",
        SseEvent::Ping => "ping",
        SseEvent::Error { .. } => "error",
        SseEvent::BotReply { .. } => "reply",
    }
}

fn to_sse_event(event: &SseEvent) -> Option<Event> {
    serde_json::to_string(event)
        .ok()
        .map(|json| Event::default().event(event_type(event)).data(json))
}

/// `GET /api/message-stream`: ready, counters (10s), health (12s), packet
/// ticks (1s, aggregated per message), ranks (whenever a recompute lands),
/// and a 15s keepalive ping — all independent per client.
pub async fn message_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_rowid = tokio::task::spawn_blocking({
        let storage = state.storage.clone();
        move || {
            let db = storage.db.lock().expect("db mutex poisoned");
            crate::storage::messages::last_message_observer_rowid(db.conn()).unwrap_or(0)
        }
    })
    .await
    .unwrap_or(0);

    let ready = stream::once(async move {
        Ok(Event::default()
            .event("ready")
            .data(serde_json::json!({ "serverTime": chrono::Utc::now().to_rfc3339(), "lastRowId": last_rowid }).to_string()))
    });

    let rx = state.dashboard_tx.subscribe();
    let broadcast_stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => to_sse_event(&event).map(Ok),
            Err(_lagged) => Some(Ok(Event::default()
                .event("error")
                .data(r#"{"code":"lagged","message":"client fell behind, some events were dropped"}"#))),
        }
    });

    Sse::new(ready.chain(broadcast_stream))
        .keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL).text("ping"))
}

/// `GET /api/bot-stream`: auth-gated (caller checks the bearer token or
/// session before this handler is reached), receives `event: reply` only.
pub async fn bot_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bot_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event @ SseEvent::BotReply { .. }) => to_sse_event(&event).map(Ok),
            _ => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_wire_tag() {
        assert_eq!(event_type(&SseEvent::Ping), "ping");
        assert_eq!(
            event_type(&SseEvent::Health {
                healthy: true,
                detail: String::new()
            }),
            "health"
        );
    }

    #[test]
    fn to_sse_event_serializes_payload() {
        let event = to_sse_event(&SseEvent::Ping).unwrap();
        assert_eq!(format!("{event:?}").contains("ping"), true);
    }
}
