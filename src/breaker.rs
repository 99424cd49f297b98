//! Layered spending circuit breaker.
//!
//! Four windows track spend: session (process lifetime), hour, day, and
//! month. Each window walks CLOSED -> WARN (>= 80%) -> TRIPPED (>= 100%).
//! The configured action decides what a trip means: warn only emits,
//! throttle sets a caller-visible flag, stop rejects. Hour/day/month roll
//! over on their clock boundaries and re-arm the warning.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::events::{EventBus, ShieldEvent};
use crate::persist::{keys, DebouncedStore, VersionedRecord};

/// The four breaker windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerWindowKind {
    Session,
    Hour,
    Day,
    Month,
}

impl std::fmt::Display for BreakerWindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        };
        write!(f, "{}", s)
    }
}

/// What a tripped window does to new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerAction {
    /// Emit events only.
    Warn,
    /// Allow but flag the request for caller-side delay.
    Throttle,
    /// Reject.
    Stop,
}

/// Per-window dollar limits. `None` disables the window.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BreakerLimits {
    pub per_session: Option<f64>,
    pub per_hour: Option<f64>,
    pub per_day: Option<f64>,
    pub per_month: Option<f64>,
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub limits: BreakerLimits,
    pub action: BreakerAction,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            limits: BreakerLimits::default(),
            action: BreakerAction::Stop,
        }
    }
}

/// Window lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Closed,
    Warn,
    Tripped,
}

/// Snapshot of one window for the operator surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerWindowSnapshot {
    pub kind: BreakerWindowKind,
    pub spent: f64,
    pub limit: Option<f64>,
    pub percent_used: f64,
    pub state: WindowState,
}

/// Outcome of a breaker check.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerDecision {
    pub allowed: bool,
    /// Set when the action is throttle and a window is at its limit.
    pub throttled: bool,
    pub tripped_window: Option<BreakerWindowKind>,
    pub spent: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Window {
    kind: BreakerWindowKind,
    spent: f64,
    window_start: DateTime<Local>,
    warned: bool,
    trip_emitted: bool,
}

impl Window {
    fn new(kind: BreakerWindowKind) -> Self {
        Self {
            kind,
            spent: 0.0,
            window_start: Local::now(),
            warned: false,
            trip_emitted: false,
        }
    }

    /// Roll over if the clock has crossed this window's boundary.
    fn roll_over(&mut self, now: DateTime<Local>) {
        let crossed = match self.kind {
            BreakerWindowKind::Session => false,
            BreakerWindowKind::Hour => hour_start(now) != hour_start(self.window_start),
            BreakerWindowKind::Day => now.date_naive() != self.window_start.date_naive(),
            BreakerWindowKind::Month => {
                (now.year(), now.month()) != (self.window_start.year(), self.window_start.month())
            }
        };
        if crossed {
            self.spent = 0.0;
            self.window_start = now;
            self.warned = false;
            self.trip_emitted = false;
        }
    }

    fn tripped(&self, limit: Option<f64>) -> bool {
        match limit {
            Some(l) if l <= 0.0 => self.spent > 0.0,
            Some(l) => self.spent >= l,
            None => false,
        }
    }

    fn percent_used(&self, limit: Option<f64>) -> f64 {
        match limit {
            Some(l) if l > 0.0 => (self.spent / l) * 100.0,
            Some(_) if self.spent > 0.0 => 100.0,
            _ => 0.0,
        }
    }

    fn state(&self, limit: Option<f64>) -> WindowState {
        if self.tripped(limit) {
            WindowState::Tripped
        } else if self.percent_used(limit) >= 80.0 {
            WindowState::Warn
        } else {
            WindowState::Closed
        }
    }
}

fn hour_start(t: DateTime<Local>) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
        .unwrap_or(t)
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBreaker {
    windows: Vec<Window>,
}

/// The layered circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    windows: Mutex<Vec<Window>>,
    bus: Arc<EventBus>,
    persist: Option<Arc<DebouncedStore>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            windows: Mutex::new(vec![
                Window::new(BreakerWindowKind::Session),
                Window::new(BreakerWindowKind::Hour),
                Window::new(BreakerWindowKind::Day),
                Window::new(BreakerWindowKind::Month),
            ]),
            bus,
            persist: None,
        }
    }

    /// Persist spend counters through the given store, reloading the
    /// previous process's windows (the session window starts fresh).
    pub fn with_persistence(mut self, store: Arc<DebouncedStore>) -> Self {
        self.persist = Some(store);
        self.load();
        self
    }

    fn limit_for(&self, kind: BreakerWindowKind) -> Option<f64> {
        match kind {
            BreakerWindowKind::Session => self.config.limits.per_session,
            BreakerWindowKind::Hour => self.config.limits.per_hour,
            BreakerWindowKind::Day => self.config.limits.per_day,
            BreakerWindowKind::Month => self.config.limits.per_month,
        }
    }

    /// Gate a new request on the current windows.
    pub fn check(&self) -> BreakerDecision {
        let now = Local::now();
        let mut windows = self.lock();

        let mut worst: Option<(BreakerWindowKind, f64, f64)> = None;
        for window in windows.iter_mut() {
            window.roll_over(now);
            let limit = self.limit_for(window.kind);
            if window.tripped(limit) && worst.is_none() {
                worst = Some((window.kind, window.spent, limit.unwrap_or(0.0)));
            }
        }

        match worst {
            Some((kind, spent, limit)) => BreakerDecision {
                allowed: self.config.action != BreakerAction::Stop,
                throttled: self.config.action == BreakerAction::Throttle,
                tripped_window: Some(kind),
                spent,
                limit,
            },
            None => BreakerDecision {
                allowed: true,
                throttled: false,
                tripped_window: None,
                spent: 0.0,
                limit: 0.0,
            },
        }
    }

    /// Add spend to every window, emitting warn/trip events on threshold
    /// crossings.
    pub fn record_spend(&self, cost: f64, model: &str) {
        tracing::debug!(model, cost, "breaker spend");
        let now = Local::now();
        let mut events = Vec::new();
        {
            let mut windows = self.lock();
            for window in windows.iter_mut() {
                window.roll_over(now);
                window.spent += cost;

                let limit = self.limit_for(window.kind);
                let Some(limit_value) = limit else { continue };
                let percent = window.percent_used(limit);

                if window.tripped(limit) && !window.trip_emitted {
                    window.trip_emitted = true;
                    events.push(ShieldEvent::BreakerTripped {
                        window: window.kind,
                        current_spend: window.spent,
                        limit: limit_value,
                        percent_used: percent,
                    });
                } else if percent >= 80.0 && !window.warned && !window.tripped(limit) {
                    window.warned = true;
                    events.push(ShieldEvent::BreakerWarning {
                        window: window.kind,
                        current_spend: window.spent,
                        limit: limit_value,
                        percent_used: percent,
                    });
                }
            }
        }
        for event in events {
            self.bus.emit(event);
        }
        self.save();
    }

    /// Reset one window, or all of them.
    pub fn reset(&self, kind: Option<BreakerWindowKind>) {
        {
            let mut windows = self.lock();
            for window in windows.iter_mut() {
                if kind.is_none() || kind == Some(window.kind) {
                    window.spent = 0.0;
                    window.window_start = Local::now();
                    window.warned = false;
                    window.trip_emitted = false;
                }
            }
        }
        self.save();
    }

    /// Current window states.
    pub fn snapshot(&self) -> Vec<BreakerWindowSnapshot> {
        let now = Local::now();
        let mut windows = self.lock();
        windows
            .iter_mut()
            .map(|window| {
                window.roll_over(now);
                let limit = self.limit_for(window.kind);
                BreakerWindowSnapshot {
                    kind: window.kind,
                    spent: window.spent,
                    limit,
                    percent_used: window.percent_used(limit),
                    state: window.state(limit),
                }
            })
            .collect()
    }

    fn save(&self) {
        let Some(store) = &self.persist else { return };
        let record = PersistedBreaker {
            windows: self.lock().clone(),
        };
        let result = VersionedRecord::new(record)
            .to_json()
            .and_then(|json| store.put(keys::BREAKER_STATE, &json));
        if let Err(e) = result {
            self.bus.emit(ShieldEvent::StorageError {
                module: "breaker".to_string(),
                operation: "persist".to_string(),
                error: e.to_string(),
            });
        }
    }

    fn load(&self) {
        let Some(store) = &self.persist else { return };
        match store.get(keys::BREAKER_STATE) {
            Ok(Some(json)) => match VersionedRecord::<PersistedBreaker>::from_json(&json) {
                Ok(record) => {
                    let mut windows = self.lock();
                    for saved in record.windows {
                        // The session window always starts fresh.
                        if saved.kind == BreakerWindowKind::Session {
                            continue;
                        }
                        if let Some(window) =
                            windows.iter_mut().find(|w| w.kind == saved.kind)
                        {
                            *window = saved;
                        }
                    }
                }
                Err(e) => self.bus.emit(ShieldEvent::StorageError {
                    module: "breaker".to_string(),
                    operation: "load".to_string(),
                    error: e.to_string(),
                }),
            },
            Ok(None) => {}
            Err(e) => self.bus.emit(ShieldEvent::StorageError {
                module: "breaker".to_string(),
                operation: "load".to_string(),
                error: e.to_string(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Window>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(limits: BreakerLimits, action: BreakerAction) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig { limits, action }, Arc::new(EventBus::new()))
    }

    fn session_limit(limit: f64) -> BreakerLimits {
        BreakerLimits {
            per_session: Some(limit),
            ..BreakerLimits::default()
        }
    }

    #[test]
    fn test_unlimited_allows() {
        let b = breaker(BreakerLimits::default(), BreakerAction::Stop);
        b.record_spend(1_000.0, "gpt-4o");
        assert!(b.check().allowed);
    }

    #[test]
    fn test_stop_rejects_at_limit() {
        let b = breaker(session_limit(1.0), BreakerAction::Stop);
        b.record_spend(1.0, "gpt-4o");

        let decision = b.check();
        assert!(!decision.allowed);
        assert_eq!(decision.tripped_window, Some(BreakerWindowKind::Session));
        assert_eq!(decision.limit, 1.0);
    }

    #[test]
    fn test_throttle_allows_with_flag() {
        let b = breaker(session_limit(1.0), BreakerAction::Throttle);
        b.record_spend(2.0, "gpt-4o");

        let decision = b.check();
        assert!(decision.allowed);
        assert!(decision.throttled);
    }

    #[test]
    fn test_warn_action_never_blocks() {
        let b = breaker(session_limit(1.0), BreakerAction::Warn);
        b.record_spend(5.0, "gpt-4o");

        let decision = b.check();
        assert!(decision.allowed);
        assert!(!decision.throttled);
        assert_eq!(decision.tripped_window, Some(BreakerWindowKind::Session));
    }

    #[test]
    fn test_zero_limit_trips_on_first_nonzero_spend() {
        let b = breaker(session_limit(0.0), BreakerAction::Stop);
        // Nothing spent yet: a zero limit has nothing to trip on.
        assert!(b.check().allowed);

        b.record_spend(0.0001, "gpt-4o");
        assert!(!b.check().allowed);
    }

    #[test]
    fn test_warning_emitted_once_at_80_percent() {
        let bus = Arc::new(EventBus::new());
        let b = CircuitBreaker::new(
            BreakerConfig {
                limits: session_limit(10.0),
                action: BreakerAction::Stop,
            },
            Arc::clone(&bus),
        );

        let warnings = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&warnings);
        bus.on(EventKind::BreakerWarning, move |_| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        b.record_spend(7.0, "m");
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
        b.record_spend(1.5, "m");
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
        // Still above 80%, but the warning already fired for this window.
        b.record_spend(0.5, "m");
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trip_event_emitted_once() {
        let bus = Arc::new(EventBus::new());
        let b = CircuitBreaker::new(
            BreakerConfig {
                limits: session_limit(1.0),
                action: BreakerAction::Stop,
            },
            Arc::clone(&bus),
        );

        let trips = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&trips);
        bus.on(EventKind::BreakerTripped, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        b.record_spend(1.5, "m");
        b.record_spend(1.0, "m");
        assert_eq!(trips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_rearms() {
        let b = breaker(session_limit(1.0), BreakerAction::Stop);
        b.record_spend(2.0, "m");
        assert!(!b.check().allowed);

        b.reset(Some(BreakerWindowKind::Session));
        assert!(b.check().allowed);
    }

    #[test]
    fn test_spend_lands_in_all_windows() {
        let b = breaker(
            BreakerLimits {
                per_session: Some(100.0),
                per_hour: Some(100.0),
                per_day: Some(100.0),
                per_month: Some(100.0),
            },
            BreakerAction::Stop,
        );
        b.record_spend(3.0, "m");

        for snapshot in b.snapshot() {
            assert!((snapshot.spent - 3.0).abs() < 1e-9);
            assert_eq!(snapshot.state, WindowState::Closed);
        }
    }

    #[test]
    fn test_snapshot_states() {
        let b = breaker(session_limit(10.0), BreakerAction::Stop);
        b.record_spend(8.5, "m");

        let session = b
            .snapshot()
            .into_iter()
            .find(|s| s.kind == BreakerWindowKind::Session)
            .unwrap();
        assert_eq!(session.state, WindowState::Warn);
        assert!((session.percent_used - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_persistence_restores_day_but_not_session() {
        let store = Arc::new(DebouncedStore::with_interval(
            Arc::new(crate::persist::MemoryStore::new()),
            std::time::Duration::from_millis(0),
        ));
        let bus = Arc::new(EventBus::new());
        let limits = BreakerLimits {
            per_session: Some(100.0),
            per_day: Some(100.0),
            ..BreakerLimits::default()
        };

        {
            let b = CircuitBreaker::new(
                BreakerConfig {
                    limits,
                    action: BreakerAction::Stop,
                },
                Arc::clone(&bus),
            )
            .with_persistence(Arc::clone(&store));
            b.record_spend(5.0, "m");
        }

        let reloaded = CircuitBreaker::new(
            BreakerConfig {
                limits,
                action: BreakerAction::Stop,
            },
            bus,
        )
        .with_persistence(store);

        let snapshots = reloaded.snapshot();
        let day = snapshots
            .iter()
            .find(|s| s.kind == BreakerWindowKind::Day)
            .unwrap();
        let session = snapshots
            .iter()
            .find(|s| s.kind == BreakerWindowKind::Session)
            .unwrap();
        assert!((day.spent - 5.0).abs() < 1e-9);
        assert_eq!(session.spent, 0.0);
    }
}
