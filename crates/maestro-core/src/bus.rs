// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-execution event fan-out.
//!
//! One upstream event sequence is delivered to N subscribers, each behind a
//! bounded queue.  A subscriber that falls behind is dropped and told so
//! with a terminal `Lagged` pair; the upstream is never throttled.  Late
//! subscribers replay the ring buffer (oldest→newest) before the live tail.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use maestro_protocol::{ErrorKind, StreamEvent};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

/// Per-session broadcast capacity.  Secondary clients that lag simply skip
/// ahead (broadcast semantics), so the depth only bounds burst absorption.
const SESSION_CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

struct BusInner {
    ring: VecDeque<StreamEvent>,
    subscribers: Vec<Subscriber>,
    terminal: bool,
    next_subscriber_id: u64,
}

/// Fan-out hub for one execution's event stream.
pub struct ExecutionBus {
    inner: Mutex<BusInner>,
    ring_capacity: usize,
    queue_depth: usize,
}

impl ExecutionBus {
    pub fn new(ring_capacity: usize, queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                ring: VecDeque::with_capacity(ring_capacity.min(64)),
                subscribers: Vec::new(),
                terminal: false,
                next_subscriber_id: 0,
            }),
            ring_capacity,
            queue_depth,
        })
    }

    /// Publish one event to the ring and every live subscriber.
    ///
    /// Publishing after the terminal event is a no-op; this is what makes
    /// "abort happens-before any further event" easy to uphold upstream.
    pub async fn publish(&self, event: StreamEvent) {
        let mut inner = self.inner.lock().await;
        if inner.terminal {
            return;
        }
        if inner.ring.len() == self.ring_capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        if event.is_terminal() {
            inner.terminal = true;
        }

        let mut dropped: Vec<Subscriber> = Vec::new();
        inner.subscribers.retain_mut(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Keep the sender so the lag notice can be delivered
                    // once the consumer drains its backlog.
                    dropped.push(Subscriber {
                        id: sub.id,
                        tx: sub.tx.clone(),
                    });
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        drop(inner);

        for sub in dropped {
            warn!(subscriber = sub.id, "subscriber overflowed; dropping");
            let tx = sub.tx;
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamEvent::Error {
                        data: ErrorKind::Lagged.to_string(),
                    })
                    .await;
                let _ = tx
                    .send(StreamEvent::Done {
                        data: String::new(),
                        aborted: true,
                    })
                    .await;
            });
        }
    }

    /// Attach a new subscriber.  The returned [`Subscription`] yields the
    /// buffered history first, then the live tail in FIFO order.
    pub async fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock().await;
        let mut backlog: VecDeque<StreamEvent> = inner.ring.iter().cloned().collect();

        if inner.terminal {
            // Stream already over: backlog plus (if the ring ever evicted
            // it, which it cannot under normal operation) a synthetic done.
            if !backlog.back().map(StreamEvent::is_terminal).unwrap_or(false) {
                backlog.push_back(StreamEvent::Done {
                    data: String::new(),
                    aborted: false,
                });
            }
            let (_tx, rx) = mpsc::channel(1);
            return Subscription { backlog, rx };
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber { id, tx });
        debug!(subscriber = id, backlog = backlog.len(), "subscriber attached");
        Subscription { backlog, rx }
    }

    /// Number of live subscribers (diagnostics).
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

/// A single subscriber's view of one execution.
pub struct Subscription {
    backlog: VecDeque<StreamEvent>,
    rx: mpsc::Receiver<StreamEvent>,
}

impl Subscription {
    /// Next event, backlog first.  `None` after the stream closes.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if let Some(ev) = self.backlog.pop_front() {
            return Some(ev);
        }
        self.rx.recv().await
    }

    /// Drain everything up to and including the terminal event.
    pub async fn collect_to_end(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.next().await {
            let terminal = ev.is_terminal();
            events.push(ev);
            if terminal {
                break;
            }
        }
        events
    }
}

// ─── Session-scoped broadcast ─────────────────────────────────────────────────

/// Session-wide channels: secondary clients registered on a session receive
/// sub-agent traffic from *any* execution on that session.
#[derive(Default)]
pub struct SessionChannels {
    channels: DashMap<String, broadcast::Sender<StreamEvent>>,
}

impl SessionChannels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish onto the session channel if the event class belongs there.
    pub fn publish(&self, session_id: &str, event: &StreamEvent) {
        if !event.is_session_broadcast() {
            return;
        }
        if let Some(tx) = self.channels.get(session_id) {
            // No receivers is fine; nobody registered yet.
            let _ = tx.send(event.clone());
        }
    }

    /// Join the broadcast set for a session.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StreamEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_protocol::AgentLifecycle;

    fn text(n: usize) -> StreamEvent {
        StreamEvent::Text {
            data: format!("event {n}"),
            agent_id: None,
            extra: Default::default(),
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            data: String::new(),
            aborted: false,
        }
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_fifo_order() {
        let bus = ExecutionBus::new(16, 8);
        let mut sub = bus.subscribe().await;
        for i in 0..5 {
            bus.publish(text(i)).await;
        }
        bus.publish(done()).await;

        let events = sub.collect_to_end().await;
        assert_eq!(events.len(), 6);
        for (i, ev) in events.iter().take(5).enumerate() {
            assert!(matches!(ev, StreamEvent::Text { data, .. } if *data == format!("event {i}")));
        }
        assert!(events[5].is_terminal());
    }

    #[tokio::test]
    async fn late_subscriber_replays_ring_before_live_tail() {
        let bus = ExecutionBus::new(16, 8);
        bus.publish(text(0)).await;
        bus.publish(text(1)).await;

        let mut sub = bus.subscribe().await;
        bus.publish(text(2)).await;
        bus.publish(done()).await;

        let events = sub.collect_to_end().await;
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::Text { data, .. } if data == "event 0"));
        assert!(matches!(&events[2], StreamEvent::Text { data, .. } if data == "event 2"));
    }

    #[tokio::test]
    async fn ring_evicts_oldest_when_full() {
        let bus = ExecutionBus::new(4, 8);
        for i in 0..10 {
            bus.publish(text(i)).await;
        }
        let mut sub = bus.subscribe().await;
        // Only the last 4 remain.
        let first = sub.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Text { data, .. } if data == "event 6"));
    }

    #[tokio::test]
    async fn subscribing_after_terminal_yields_backlog_and_done() {
        let bus = ExecutionBus::new(16, 8);
        bus.publish(text(0)).await;
        bus.publish(done()).await;

        let mut sub = bus.subscribe().await;
        let events = sub.collect_to_end().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn publishing_after_terminal_is_ignored() {
        let bus = ExecutionBus::new(16, 8);
        let mut sub = bus.subscribe().await;
        bus.publish(done()).await;
        bus.publish(text(99)).await;

        let events = sub.collect_to_end().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_with_lagged_signal() {
        let bus = ExecutionBus::new(64, 2);
        let mut slow = bus.subscribe().await;
        // Queue depth is 2; the third publish overflows.
        for i in 0..5 {
            bus.publish(text(i)).await;
        }
        assert_eq!(bus.subscriber_count().await, 0, "slow subscriber dropped");

        // The subscriber still drains its prefix, then the Lagged pair.
        let mut seen = Vec::new();
        while let Some(ev) = slow.next().await {
            seen.push(ev);
        }
        // In-order prefix...
        assert!(matches!(&seen[0], StreamEvent::Text { data, .. } if data == "event 0"));
        assert!(matches!(&seen[1], StreamEvent::Text { data, .. } if data == "event 1"));
        // ...interrupted by the lag notice and a terminal done.
        assert!(seen
            .iter()
            .any(|e| matches!(e, StreamEvent::Error { data } if data.contains("overflow"))));
        assert!(matches!(
            seen.last().unwrap(),
            StreamEvent::Done { aborted: true, .. }
        ));
    }

    #[tokio::test]
    async fn fast_subscriber_survives_slow_one() {
        let bus = ExecutionBus::new(64, 2);
        let _slow = bus.subscribe().await;
        let mut fast = bus.subscribe().await;

        let fast_reader = tokio::spawn(async move {
            let mut count = 0;
            while let Some(ev) = fast.next().await {
                if ev.is_terminal() {
                    break;
                }
                count += 1;
            }
            count
        });

        for i in 0..20 {
            bus.publish(text(i)).await;
            tokio::task::yield_now().await;
        }
        bus.publish(done()).await;

        let count = fast_reader.await.unwrap();
        assert_eq!(count, 20, "fast subscriber saw every event");
    }

    #[tokio::test]
    async fn session_channel_carries_agent_events_only() {
        let channels = SessionChannels::new();
        let mut rx = channels.subscribe("s-1");

        channels.publish(
            "s-1",
            &StreamEvent::Text {
                data: "not broadcast".into(),
                agent_id: None,
                extra: Default::default(),
            },
        );
        channels.publish(
            "s-1",
            &StreamEvent::AgentEvent {
                event: AgentLifecycle::Spawned,
                agent_id: "a-1".into(),
                agent_type: None,
                task: None,
                result: None,
                error: None,
                tool_calls: None,
                duration_ms: None,
                parent_tool_use_id: None,
            },
        );

        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, StreamEvent::AgentEvent { .. }));
        assert!(rx.try_recv().is_err(), "text event must not be broadcast");
    }

    #[tokio::test]
    async fn session_channels_are_per_session() {
        let channels = SessionChannels::new();
        let mut rx_a = channels.subscribe("a");
        let _rx_b = channels.subscribe("b");

        channels.publish(
            "b",
            &StreamEvent::AgentEvent {
                event: AgentLifecycle::Completed,
                agent_id: "x".into(),
                agent_type: None,
                task: None,
                result: None,
                error: None,
                tool_calls: None,
                duration_ms: None,
                parent_tool_use_id: None,
            },
        );
        assert!(rx_a.try_recv().is_err());
    }
}
