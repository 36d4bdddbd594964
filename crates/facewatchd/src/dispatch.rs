//! Asynchronous event delivery with bounded retries.
//!
//! Session threads hand events over and continue with the next frame. Each
//! event is delivered on the runtime: one attempt plus up to `max_retries`
//! retries with a fixed backoff. Exhausted events are dropped and counted;
//! detection decisions are never revisited because of sink failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use facewatch_core::{DetectionEvent, EventSink};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub retries: u64,
    pub in_flight: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    in_flight: AtomicU64,
    idle: Notify,
}

/// Clone-safe handle for fire-and-forget event delivery.
#[derive(Clone)]
pub struct EventDispatcher {
    sink: Arc<dyn EventSink>,
    runtime: Handle,
    policy: RetryPolicy,
    counters: Arc<Counters>,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EventSink>, runtime: Handle, policy: RetryPolicy) -> Self {
        Self {
            sink,
            runtime,
            policy,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Queue `event` for delivery. Safe to call from any thread.
    pub fn dispatch(&self, event: DetectionEvent) {
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let policy = self.policy;
        self.runtime.spawn(async move {
            deliver(sink, policy, &counters, event).await;
            if counters.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                counters.idle.notify_waiters();
            }
        });
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            retries: self.counters.retries.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Wait until no deliveries are pending. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let counters = &self.counters;
        let drained = async {
            loop {
                let notified = counters.idle.notified();
                if counters.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

async fn deliver(sink: Arc<dyn EventSink>, policy: RetryPolicy, counters: &Counters, event: DetectionEvent) {
    let event = Arc::new(event);
    let attempts = policy.max_retries + 1;

    for attempt in 1..=attempts {
        let sink = Arc::clone(&sink);
        let ev = Arc::clone(&event);
        // Sinks do blocking I/O.
        let outcome = tokio::task::spawn_blocking(move || sink.emit(&ev)).await;

        match outcome {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(id = %event.id, kind = %event.kind, attempt, "event delivered");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(id = %event.id, attempt, attempts, error = %e, "event delivery failed");
            }
            Err(e) => {
                tracing::warn!(id = %event.id, attempt, attempts, error = %e, "event delivery task panicked");
            }
        }

        if attempt < attempts {
            counters.retries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(policy.backoff).await;
        }
    }

    counters.failed.fetch_add(1, Ordering::SeqCst);
    tracing::error!(
        id = %event.id,
        kind = %event.kind,
        source = %event.source,
        "event dropped after retries exhausted"
    );
}
