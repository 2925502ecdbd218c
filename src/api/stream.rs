//! `GET /stream`: worker events as server-sent events.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::AppState;
use crate::lifecycle::DaemonState;
use crate::session::WorkerEvent;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

fn to_event(event: &WorkerEvent) -> Option<Event> {
    let name = match event {
        WorkerEvent::NewObservation { .. } => "new_observation",
        WorkerEvent::NewSummary { .. } => "new_summary",
        WorkerEvent::NewPrompt { .. } => "new_prompt",
        WorkerEvent::ProcessingStatus { .. } => "processing_status",
        WorkerEvent::SessionCompleted { .. } => "session_completed",
    };
    match Event::default().event(name).json_data(event) {
        Ok(e) => Some(e),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode stream event");
            None
        }
    }
}

/// Opens with the current processing status, then relays broadcasts until the worker drains.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = WorkerEvent::ProcessingStatus {
        is_processing: state.sessions.is_any_session_processing(),
        queue_depth: state.sessions.queue_depth(),
    };
    let live = BroadcastStream::new(state.sessions.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => to_event(&event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::debug!(missed, "stream subscriber lagged");
                None
            }
        }
    });

    let daemon = state.daemon.clone();
    let stream = stream::iter(to_event(&initial))
        .chain(live)
        .take_until(async move { daemon.wait_for(DaemonState::Draining).await })
        .map(Ok);

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}
