//! SSE event stream endpoint

use crate::AppState;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events handler: live stream of sync events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    crmgate_common::sse::create_event_sse_stream(&state.event_bus)
}
