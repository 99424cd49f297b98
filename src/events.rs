//! Strongly-typed in-process event bus.
//!
//! Every subsystem publishes named events here; subscribers are optional and
//! emission never fails. Dispatch is synchronous in the caller's scheduling
//! context. A handler that panics is isolated and logged; its error never
//! propagates to the emitter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::anomaly::AnomalyReport;
use crate::breaker::BreakerWindowKind;
use crate::budget::BudgetWindow;
use crate::cache::MatchType;

/// Events emitted by the pipeline and its subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShieldEvent {
    RequestAllowed {
        fingerprint: String,
    },
    RequestBlocked {
        fingerprint: String,
        reason: String,
    },
    CacheHit {
        match_type: MatchType,
        similarity: Option<f64>,
        saved_cost: f64,
    },
    CacheMiss {
        model_id: String,
    },
    CacheStore {
        model_id: String,
        tokens: u64,
    },
    ContextTrimmed {
        original_tokens: u64,
        trimmed_tokens: u64,
        saved_tokens: u64,
    },
    RouterDowngraded {
        original_model: String,
        selected_model: String,
        saved_cost: f64,
    },
    PrefixOptimized {
        saved_dollars: f64,
    },
    LedgerEntry {
        model: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        saved: f64,
        latency_ms: u64,
    },
    BreakerWarning {
        window: BreakerWindowKind,
        current_spend: f64,
        limit: f64,
        percent_used: f64,
    },
    BreakerTripped {
        window: BreakerWindowKind,
        current_spend: f64,
        limit: f64,
        percent_used: f64,
    },
    UserBudgetWarning {
        user_id: String,
        window: BudgetWindow,
        percent_used: f64,
    },
    UserBudgetExceeded {
        user_id: String,
        window: BudgetWindow,
        percent_used: f64,
    },
    UserBudgetSpend {
        user_id: String,
        cost: f64,
        daily_percent_used: f64,
    },
    StreamChunk {
        tokens: u64,
        estimated_cost: f64,
    },
    StreamAbort {
        tokens: u64,
        estimated_cost: f64,
    },
    StreamComplete {
        tokens: u64,
        estimated_cost: f64,
    },
    AnomalyDetected {
        report: AnomalyReport,
    },
    StorageError {
        module: String,
        operation: String,
        error: String,
    },
}

impl ShieldEvent {
    /// The subscription key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RequestAllowed { .. } => EventKind::RequestAllowed,
            Self::RequestBlocked { .. } => EventKind::RequestBlocked,
            Self::CacheHit { .. } => EventKind::CacheHit,
            Self::CacheMiss { .. } => EventKind::CacheMiss,
            Self::CacheStore { .. } => EventKind::CacheStore,
            Self::ContextTrimmed { .. } => EventKind::ContextTrimmed,
            Self::RouterDowngraded { .. } => EventKind::RouterDowngraded,
            Self::PrefixOptimized { .. } => EventKind::PrefixOptimized,
            Self::LedgerEntry { .. } => EventKind::LedgerEntry,
            Self::BreakerWarning { .. } => EventKind::BreakerWarning,
            Self::BreakerTripped { .. } => EventKind::BreakerTripped,
            Self::UserBudgetWarning { .. } => EventKind::UserBudgetWarning,
            Self::UserBudgetExceeded { .. } => EventKind::UserBudgetExceeded,
            Self::UserBudgetSpend { .. } => EventKind::UserBudgetSpend,
            Self::StreamChunk { .. } => EventKind::StreamChunk,
            Self::StreamAbort { .. } => EventKind::StreamAbort,
            Self::StreamComplete { .. } => EventKind::StreamComplete,
            Self::AnomalyDetected { .. } => EventKind::AnomalyDetected,
            Self::StorageError { .. } => EventKind::StorageError,
        }
    }
}

/// Event names for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestAllowed,
    RequestBlocked,
    CacheHit,
    CacheMiss,
    CacheStore,
    ContextTrimmed,
    RouterDowngraded,
    PrefixOptimized,
    LedgerEntry,
    BreakerWarning,
    BreakerTripped,
    UserBudgetWarning,
    UserBudgetExceeded,
    UserBudgetSpend,
    StreamChunk,
    StreamAbort,
    StreamComplete,
    AnomalyDetected,
    StorageError,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestAllowed => "request:allowed",
            Self::RequestBlocked => "request:blocked",
            Self::CacheHit => "cache:hit",
            Self::CacheMiss => "cache:miss",
            Self::CacheStore => "cache:store",
            Self::ContextTrimmed => "context:trimmed",
            Self::RouterDowngraded => "router:downgraded",
            Self::PrefixOptimized => "prefix:optimized",
            Self::LedgerEntry => "ledger:entry",
            Self::BreakerWarning => "breaker:warning",
            Self::BreakerTripped => "breaker:tripped",
            Self::UserBudgetWarning => "userBudget:warning",
            Self::UserBudgetExceeded => "userBudget:exceeded",
            Self::UserBudgetSpend => "userBudget:spend",
            Self::StreamChunk => "stream:chunk",
            Self::StreamAbort => "stream:abort",
            Self::StreamComplete => "stream:complete",
            Self::AnomalyDetected => "anomaly:detected",
            Self::StorageError => "storage:error",
        };
        write!(f, "{}", s)
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ShieldEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    any_handlers: Vec<(SubscriptionId, Handler)>,
    next_id: u64,
}

/// Synchronous publish/subscribe bus.
///
/// Subsystems hold the bus; the bus holds handler closures; ownership flows
/// one way, so Pipeline → subsystem → bus → handler never forms a strong
/// reference cycle back into the pipeline's state.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ShieldEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ShieldEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.any_handlers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns true if it was present.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.any_handlers.len()
            + inner.handlers.values().map(Vec::len).sum::<usize>();
        inner.any_handlers.retain(|(h, _)| *h != id);
        for handlers in inner.handlers.values_mut() {
            handlers.retain(|(h, _)| *h != id);
        }
        let after = inner.any_handlers.len()
            + inner.handlers.values().map(Vec::len).sum::<usize>();
        before != after
    }

    /// Dispatch an event to all matching handlers.
    pub fn emit(&self, event: ShieldEvent) {
        // Snapshot handlers so a subscriber may (un)subscribe reentrantly
        // without deadlocking on the bus lock.
        let targets: Vec<Handler> = {
            let inner = self.lock();
            inner
                .handlers
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(inner.any_handlers.iter())
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(event = %event.kind(), "event handler panicked");
            }
        }
    }

    /// Number of live subscriptions, all kinds included.
    pub fn subscriber_count(&self) -> usize {
        let inner = self.lock();
        inner.any_handlers.len() + inner.handlers.values().map(Vec::len).sum::<usize>()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_miss() -> ShieldEvent {
        ShieldEvent::CacheMiss {
            model_id: "gpt-4o".to_string(),
        }
    }

    #[test]
    fn test_on_emit_off() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = bus.on(EventKind::CacheMiss, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(cache_miss());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.off(id));
        bus.emit(cache_miss());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_filtering() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.on(EventKind::CacheHit, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(cache_miss());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_on_any_receives_everything() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(cache_miss());
        bus.emit(ShieldEvent::PrefixOptimized { saved_dollars: 0.1 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::CacheMiss, |_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.on(EventKind::CacheMiss, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // The panic is contained; the second handler still runs.
        bus.emit(cache_miss());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_subscribe_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let bus2 = Arc::clone(&bus);
        bus.on(EventKind::CacheMiss, move |_| {
            bus2.on(EventKind::CacheHit, |_| {});
        });
        bus.emit(cache_miss());
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::CacheHit.to_string(), "cache:hit");
        assert_eq!(EventKind::UserBudgetSpend.to_string(), "userBudget:spend");
        assert_eq!(EventKind::StorageError.to_string(), "storage:error");
    }

    #[test]
    fn test_event_payload_serializes() {
        let json = serde_json::to_string(&ShieldEvent::PrefixOptimized { saved_dollars: 0.5 })
            .unwrap();
        assert!(json.contains("prefix_optimized"));
        assert!(json.contains("0.5"));
    }
}
