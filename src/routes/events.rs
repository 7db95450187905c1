//! Server-Sent Events (SSE) push channel.
//!
//! `GET /api/tunnels/events`: the full tunnel list, pushed on every registry
//! mutation. The first event carries the list as of connection time, so a
//! client never has to race a separate `GET /api/tunnels`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;

use crate::tunnel::TunnelRecord;
use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

/// Event name used for tunnel list snapshots.
const SNAPSHOT_EVENT: &str = "tunnels";

fn snapshot_event(tunnels: &[TunnelRecord]) -> Event {
    let data = serde_json::to_string(tunnels).unwrap_or_else(|_| "[]".to_string());
    Event::default().event(SNAPSHOT_EVENT).data(data)
}

/// `GET /api/tunnels/events`: SSE stream of tunnel list snapshots.
pub async fn tunnel_events(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections"));
    }
    state.sse_connections.fetch_add(1, Ordering::Relaxed);

    // Subscribe before reading the initial list so no mutation falls between.
    let rx = state.controller.subscribe();
    let initial = state.controller.list_tunnels().await;

    let stream = futures::stream::unfold(
        (rx, Some(initial)),
        |(mut rx, initial)| async move {
            if let Some(tunnels) = initial {
                return Some((Ok::<_, Infallible>(snapshot_event(&tunnels)), (rx, None)));
            }
            match rx.recv().await {
                Ok(tunnels) => Some((Ok(snapshot_event(&tunnels)), (rx, None))),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Snapshots are full lists; the next one catches the client up.
                    let event = Event::default()
                        .event("error")
                        .data(format!(r#"{{"code":"LAGGED","missed":{n}}}"#));
                    Some((Ok(event), (rx, None)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        },
    );

    let stream = stream.take_until(state.shutdown.clone().cancelled_owned());

    let stream = DropCounterStream {
        inner: Box::pin(stream),
        counter: state.sse_connections.clone(),
        decremented: false,
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(15))))
}

/// Wrapper that decrements the SSE connection counter when the stream is dropped.
struct DropCounterStream<S> {
    inner: std::pin::Pin<Box<S>>,
    counter: std::sync::Arc<std::sync::atomic::AtomicU32>,
    decremented: bool,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let std::task::Poll::Ready(None) = &result {
            if !self.decremented {
                self.counter.fetch_sub(1, Ordering::Relaxed);
                self.decremented = true;
            }
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}
