//! Server-Sent Events stream of run events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::AppState;

/// SSE endpoint handler.
///
/// Each run event is sent as a `run_event` whose data is the flat JSON
/// envelope (`{"type":..,"at":..,..}`). The stream ends on server shutdown.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.env.events.subscribe();
    let mut closing = state.closing();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                _ = closing.wait_for(|closing| *closing) => break,
            };
            match received {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => yield Ok(Event::default().event("run_event").data(json)),
                    Err(err) => warn!(err = %err, "run event not serializable"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
