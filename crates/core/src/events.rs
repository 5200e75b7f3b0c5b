//! In-process event hub
//!
//! Single-process publish/subscribe with monotonic sequence numbers. Every
//! published event lands in a bounded ring backlog so reconnecting clients
//! can replay from a cursor. Per-subscriber queues are bounded; a subscriber
//! that lags past its bound is dropped (channel closed) instead of ever
//! blocking a publisher.

use serde::Serialize;
use sqlx::types::chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Closed set of event types in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "jobs.deleted")]
    JobsDeleted,
    #[serde(rename = "log.line")]
    LogLine,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobProgress => "job.progress",
            EventType::JobCompleted => "job.completed",
            EventType::JobsDeleted => "jobs.deleted",
            EventType::LogLine => "log.line",
        }
    }

    fn is_log(self) -> bool {
        matches!(self, EventType::LogLine)
    }
}

/// The wire envelope: `{ seq, type, jobId?, payload }`
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "jobId", skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub payload: serde_json::Value,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    id: u64,
    include_logs: bool,
    tx: mpsc::Sender<Arc<Event>>,
}

struct HubInner {
    next_seq: u64,
    backlog: VecDeque<Arc<Event>>,
    subscribers: Vec<Subscriber>,
}

/// Sequenced multi-subscriber fan-out with backlog replay
pub struct EventHub {
    inner: Mutex<HubInner>,
    backlog_capacity: usize,
    subscriber_buffer: usize,
    next_subscriber_id: AtomicU64,
}

impl EventHub {
    pub fn new(backlog_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                next_seq: 0,
                backlog: VecDeque::with_capacity(backlog_capacity),
                subscribers: Vec::new(),
            }),
            backlog_capacity: backlog_capacity.max(1),
            subscriber_buffer: subscriber_buffer.max(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Publish an event, assigning the next sequence number.
    ///
    /// Never blocks: subscribers whose queue is full are dropped and their
    /// channel closed. Returns the assigned sequence.
    pub fn publish(
        &self,
        event_type: EventType,
        job_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        inner.next_seq += 1;
        let event = Arc::new(Event {
            seq: inner.next_seq,
            event_type,
            job_id,
            payload,
            timestamp: Utc::now(),
        });

        if inner.backlog.len() == self.backlog_capacity {
            inner.backlog.pop_front();
        }
        inner.backlog.push_back(event.clone());

        let mut dropped = Vec::new();
        inner.subscribers.retain(|sub| {
            if event.event_type.is_log() && !sub.include_logs {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.push(sub.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        for id in dropped {
            warn!("Dropping slow event subscriber {}", id);
        }

        event.seq
    }

    /// Register a subscriber.
    ///
    /// Returns the backlog slice with `seq > since` (already filtered for
    /// `include_logs`) and a receiver for everything published afterwards.
    /// Both are captured under one lock, so the concatenation of slice and
    /// stream is gap-free and strictly ascending.
    pub fn subscribe(
        &self,
        since: u64,
        include_logs: bool,
    ) -> (Vec<Arc<Event>>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let replay: Vec<Arc<Event>> = inner
            .backlog
            .iter()
            .filter(|e| e.seq > since && (include_logs || !e.event_type.is_log()))
            .cloned()
            .collect();

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        inner.subscribers.push(Subscriber {
            id,
            include_logs,
            tx,
        });
        debug!(
            "Event subscriber {} registered (since={}, replay={})",
            id,
            since,
            replay.len()
        );

        (replay, rx)
    }

    /// Current sequence high-water mark
    pub fn current_seq(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).next_seq
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .subscribers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> EventHub {
        EventHub::new(8, 4)
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let hub = hub();
        let (replay, mut rx) = hub.subscribe(0, true);
        assert!(replay.is_empty());

        for i in 1..=3 {
            hub.publish(EventType::JobProgress, None, json!({ "i": i }));
        }

        for expected in 1..=3u64 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.seq, expected);
        }
    }

    #[tokio::test]
    async fn reconnect_with_cursor_replays_only_newer() {
        let hub = hub();
        for _ in 0..3 {
            hub.publish(EventType::JobProgress, None, json!({}));
        }

        let (replay, _rx) = hub.subscribe(2, true);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].seq, 3);
    }

    #[tokio::test]
    async fn backlog_is_bounded() {
        let hub = EventHub::new(4, 4);
        for _ in 0..10 {
            hub.publish(EventType::JobProgress, None, json!({}));
        }
        let (replay, _rx) = hub.subscribe(0, true);
        let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocked() {
        let hub = EventHub::new(64, 2);
        let (_replay, mut rx) = hub.subscribe(0, true);

        // Buffer holds 2; the third publish overflows and drops the subscriber.
        for _ in 0..3 {
            hub.publish(EventType::JobProgress, None, json!({}));
        }
        assert_eq!(hub.subscriber_count(), 0);

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
        assert!(rx.recv().await.is_none(), "channel must be closed");
    }

    #[tokio::test]
    async fn log_events_are_filtered_per_subscriber() {
        let hub = hub();
        let (_r, mut without_logs) = hub.subscribe(0, false);
        let (_r2, mut with_logs) = hub.subscribe(0, true);

        hub.publish(EventType::LogLine, None, json!({ "line": "x" }));
        hub.publish(EventType::JobCompleted, None, json!({}));

        // The opt-out subscriber sees only the completion.
        assert_eq!(without_logs.recv().await.unwrap().seq, 2);
        // The opt-in subscriber sees both, in order.
        assert_eq!(with_logs.recv().await.unwrap().seq, 1);
        assert_eq!(with_logs.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn sequence_is_gap_free_and_monotonic() {
        let hub = hub();
        let mut last = 0;
        for _ in 0..20 {
            let seq = hub.publish(EventType::JobProgress, None, json!({}));
            assert_eq!(seq, last + 1);
            last = seq;
        }
        assert_eq!(hub.current_seq(), 20);
    }
}
