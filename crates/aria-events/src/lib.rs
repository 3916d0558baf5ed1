use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload,
        }
    }
}

/// A subscriber invoked for every event of the kind it registered for.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn Handler>,
}

/// Outcome of a single `emit`: how many handlers ran cleanly and how many failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
}

/// In-process bus: ordered async handlers per event kind, plus a broadcast
/// mirror of every event for passive observers.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    handlers: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register `handler` for `kind`. Handlers for the same kind run in
    /// subscription order.
    pub fn subscribe(&self, kind: &str, handler: Arc<dyn Handler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push(Subscription { id, handler });
        trace!(kind, id = id.0, "bus subscription added");
        id
    }

    pub fn subscribe_fn<F, Fut>(&self, kind: &str, f: F) -> SubscriptionId
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(kind, Arc::new(FnHandler(f)))
    }

    pub fn unsubscribe(&self, kind: &str, id: SubscriptionId) -> bool {
        let mut guard = self.handlers.write();
        let Some(list) = guard.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            guard.remove(kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.read().get(kind).map(Vec::len).unwrap_or(0)
    }

    /// Passive stream of everything emitted or published.
    pub fn stream(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Broadcast only; registered handlers are not invoked.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let _ = self.tx.send(Envelope::new(kind, to_payload(payload)));
    }

    /// Deliver to every handler registered for `kind`, in order. A failing or
    /// panicking handler is logged and skipped; the emitter never sees it.
    pub async fn emit<T: Serialize>(&self, kind: &str, payload: &T) -> EmitReport {
        let env = Envelope::new(kind, to_payload(payload));
        let handlers: Vec<(SubscriptionId, Arc<dyn Handler>)> = {
            let guard = self.handlers.read();
            guard
                .get(kind)
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.id, s.handler.clone()))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        let mut report = EmitReport::default();
        for (id, handler) in handlers {
            let result = AssertUnwindSafe(handler.handle(&env)).catch_unwind().await;
            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(kind, handler = id.0, error = %err, "event handler failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(kind, handler = id.0, "event handler panicked");
                }
            }
        }
        let _ = self.tx.send(env);
        report
    }
}

fn to_payload<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}))
}
