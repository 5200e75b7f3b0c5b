//! Realtime event streaming: SSE and WebSocket
//!
//! Both endpoints map onto the hub's "since" cursor. SSE honors the
//! standard `Last-Event-ID` reconnection header in addition to the
//! `?afterSeq` query parameter; the WebSocket endpoint takes `?afterSeq`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Response;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use bucketd_core::events::Event;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default, rename = "afterSeq")]
    pub after_seq: Option<u64>,
    #[serde(default, rename = "includeLogs")]
    pub include_logs: Option<bool>,
}

/// `Last-Event-ID` wins over `?afterSeq` on reconnect: the browser sends it
/// automatically with the last sequence it actually saw.
fn resolve_cursor(headers: &HeaderMap, query: &EventsQuery) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.after_seq)
        .unwrap_or(0)
}

pub async fn sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let since = resolve_cursor(&headers, &query);
    let include_logs = query.include_logs.unwrap_or(true);
    let (replay, rx) = state.hub.subscribe(since, include_logs);
    debug!("SSE subscriber attached (since={}, replay={})", since, replay.len());

    let stream = futures::stream::unfold(
        (replay.into_iter(), rx),
        |(mut replay, mut rx)| async move {
            let event = match replay.next() {
                Some(event) => event,
                None => rx.recv().await?,
            };
            Some((Ok(sse_event(&event)), (replay, rx)))
        },
    );

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn sse_event(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.event_type.as_str())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".into()))
}

pub async fn ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let since = resolve_cursor(&headers, &query);
    let include_logs = query.include_logs.unwrap_or(true);
    upgrade.on_upgrade(move |socket| ws_loop(state, socket, since, include_logs))
}

async fn ws_loop(state: Arc<AppState>, mut socket: WebSocket, since: u64, include_logs: bool) {
    let (replay, mut rx) = state.hub.subscribe(since, include_logs);
    debug!("WS subscriber attached (since={}, replay={})", since, replay.len());

    for event in replay {
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    // Dropped as a slow subscriber; close cleanly.
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                };
                if send_event(&mut socket, &event).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    // Pings are answered by axum; other client frames are ignored.
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    socket.send(Message::Text(body.into())).await
}
