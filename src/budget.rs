//! Per-user budgets with reserve/commit/release accounting.
//!
//! A request first reserves its estimated cost against the user's daily and
//! monthly windows; the reservation is later committed as actual spend or
//! released, exactly once. Duplicate commits and releases are no-ops: the
//! token is consumed on first use. Windows roll over on local-time day and
//! calendar-month boundaries.

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{EventBus, ShieldEvent};
use crate::persist::{keys, DebouncedStore, VersionedRecord};

/// Budget window that can block a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    Daily,
    Monthly,
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// Dollar limits for one user. `None` disables the window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserBudgetSpec {
    pub daily: Option<f64>,
    pub monthly: Option<f64>,
    /// Pricing tier label, resolved against `tier_models`.
    #[serde(default)]
    pub tier: Option<String>,
}

impl UserBudgetSpec {
    pub fn new(daily: Option<f64>, monthly: Option<f64>) -> Self {
        Self {
            daily,
            monthly,
            tier: None,
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone, Default)]
pub struct UserBudgetConfig {
    /// Explicit per-user budgets.
    pub users: HashMap<String, UserBudgetSpec>,
    /// Budget applied to users not listed above.
    pub default_budget: UserBudgetSpec,
    /// Models a tier label is allowed to use.
    pub tier_models: HashMap<String, Vec<String>>,
}

/// Point-in-time view of one user's windows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserBudgetSnapshot {
    pub user_id: String,
    pub tier: Option<String>,
    pub daily_spent: f64,
    pub daily_limit: Option<f64>,
    pub monthly_spent: f64,
    pub monthly_limit: Option<f64>,
    pub inflight: f64,
    pub inflight_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedUser {
    tier: Option<String>,
    daily_spent: f64,
    monthly_spent: f64,
    day: NaiveDate,
    month: (i32, u32),
}

struct UserState {
    spec: UserBudgetSpec,
    daily_spent: f64,
    monthly_spent: f64,
    day: NaiveDate,
    month: (i32, u32),
    inflight: HashMap<Uuid, f64>,
    daily_warned: bool,
    monthly_warned: bool,
}

impl UserState {
    fn new(spec: UserBudgetSpec) -> Self {
        let now = Local::now();
        Self {
            spec,
            daily_spent: 0.0,
            monthly_spent: 0.0,
            day: now.date_naive(),
            month: (now.year(), now.month()),
            inflight: HashMap::new(),
            daily_warned: false,
            monthly_warned: false,
        }
    }

    fn roll_over(&mut self) {
        let now = Local::now();
        if now.date_naive() != self.day {
            self.day = now.date_naive();
            self.daily_spent = 0.0;
            self.daily_warned = false;
        }
        if (now.year(), now.month()) != self.month {
            self.month = (now.year(), now.month());
            self.monthly_spent = 0.0;
            self.monthly_warned = false;
        }
    }

    fn inflight_total(&self) -> f64 {
        self.inflight.values().sum()
    }

    fn spent(&self, window: BudgetWindow) -> f64 {
        match window {
            BudgetWindow::Daily => self.daily_spent,
            BudgetWindow::Monthly => self.monthly_spent,
        }
    }

    fn limit(&self, window: BudgetWindow) -> Option<f64> {
        match window {
            BudgetWindow::Daily => self.spec.daily,
            BudgetWindow::Monthly => self.spec.monthly,
        }
    }

    fn percent_used(&self, window: BudgetWindow) -> f64 {
        match self.limit(window) {
            Some(limit) if limit > 0.0 => {
                (self.spent(window) + self.inflight_total()) / limit * 100.0
            }
            _ => 0.0,
        }
    }
}

/// Tracks spend and in-flight reservations per user.
pub struct UserBudgetManager {
    config: UserBudgetConfig,
    users: Mutex<HashMap<String, UserState>>,
    bus: Arc<EventBus>,
    persist: Option<Arc<DebouncedStore>>,
}

impl UserBudgetManager {
    pub fn new(config: UserBudgetConfig, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            users: Mutex::new(HashMap::new()),
            bus,
            persist: None,
        }
    }

    /// Persist per-user spend through the given store. Reservations are
    /// process-local and never persisted.
    pub fn with_persistence(mut self, store: Arc<DebouncedStore>) -> Self {
        self.persist = Some(store);
        self
    }

    /// Reserve `estimated_cost` against the user's windows.
    ///
    /// Fails with the first window (daily before monthly) that could not
    /// cover `spent + inflight + estimated_cost`, emitting
    /// `userBudget:exceeded` for it.
    pub fn reserve(&self, user_id: &str, estimated_cost: f64) -> Result<Uuid> {
        let mut events: Vec<ShieldEvent> = Vec::new();
        let result = {
            let mut users = self.lock();
            let state = self.user_entry(&mut users, user_id);
            state.roll_over();

            let mut blocked = None;
            for window in [BudgetWindow::Daily, BudgetWindow::Monthly] {
                if let Some(limit) = state.limit(window) {
                    let committed = state.spent(window) + state.inflight_total();
                    if committed + estimated_cost > limit {
                        blocked = Some(window);
                        break;
                    }
                }
            }

            match blocked {
                Some(window) => {
                    events.push(ShieldEvent::UserBudgetExceeded {
                        user_id: user_id.to_string(),
                        window,
                        percent_used: state.percent_used(window),
                    });
                    Err(Error::budget_blocked(user_id, window))
                }
                None => {
                    let token = Uuid::new_v4();
                    state.inflight.insert(token, estimated_cost);

                    for window in [BudgetWindow::Daily, BudgetWindow::Monthly] {
                        if state.limit(window).is_none() {
                            continue;
                        }
                        let percent = state.percent_used(window);
                        let warned = match window {
                            BudgetWindow::Daily => state.daily_warned,
                            BudgetWindow::Monthly => state.monthly_warned,
                        };
                        if !warned && percent >= 80.0 {
                            match window {
                                BudgetWindow::Daily => state.daily_warned = true,
                                BudgetWindow::Monthly => state.monthly_warned = true,
                            }
                            events.push(ShieldEvent::UserBudgetWarning {
                                user_id: user_id.to_string(),
                                window,
                                percent_used: percent,
                            });
                        }
                    }
                    Ok(token)
                }
            }
        };

        for event in events {
            self.bus.emit(event);
        }
        result
    }

    /// Commit a reservation as actual spend. Idempotent: the token is
    /// consumed on first use, later calls are no-ops.
    pub fn record_spend(&self, user_id: &str, actual_cost: f64, model: &str, token: Uuid) {
        tracing::debug!(user = user_id, model, cost = actual_cost, "user spend");
        let event = {
            let mut users = self.lock();
            let state = self.user_entry(&mut users, user_id);
            state.roll_over();

            if state.inflight.remove(&token).is_none() {
                return;
            }
            state.daily_spent += actual_cost;
            state.monthly_spent += actual_cost;

            ShieldEvent::UserBudgetSpend {
                user_id: user_id.to_string(),
                cost: actual_cost,
                daily_percent_used: state.percent_used(BudgetWindow::Daily),
            }
        };
        self.bus.emit(event);
        self.save(user_id);
    }

    /// Release a reservation without charging spend. Idempotent.
    pub fn release_inflight(&self, user_id: &str, token: Uuid) {
        let mut users = self.lock();
        if let Some(state) = users.get_mut(user_id) {
            state.inflight.remove(&token);
        }
    }

    /// Total reserved-but-uncommitted dollars for a user.
    pub fn inflight(&self, user_id: &str) -> f64 {
        let users = self.lock();
        users.get(user_id).map(|s| s.inflight_total()).unwrap_or(0.0)
    }

    pub fn snapshot(&self, user_id: &str) -> Option<UserBudgetSnapshot> {
        let mut users = self.lock();
        let state = users.get_mut(user_id)?;
        state.roll_over();
        Some(UserBudgetSnapshot {
            user_id: user_id.to_string(),
            tier: state.spec.tier.clone(),
            daily_spent: state.daily_spent,
            daily_limit: state.spec.daily,
            monthly_spent: state.monthly_spent,
            monthly_limit: state.spec.monthly,
            inflight: state.inflight_total(),
            inflight_count: state.inflight.len(),
        })
    }

    /// Models a user's tier may use, when tier routing is configured.
    pub fn models_for_user(&self, user_id: &str) -> Option<Vec<String>> {
        let users = self.lock();
        let tier = users.get(user_id)?.spec.tier.clone()?;
        self.config.tier_models.get(&tier).cloned()
    }

    fn user_entry<'a>(
        &self,
        users: &'a mut HashMap<String, UserState>,
        user_id: &str,
    ) -> &'a mut UserState {
        if !users.contains_key(user_id) {
            let spec = self
                .config
                .users
                .get(user_id)
                .cloned()
                .unwrap_or_else(|| self.config.default_budget.clone());
            let mut state = UserState::new(spec);
            self.load_into(user_id, &mut state);
            users.insert(user_id.to_string(), state);
        }
        users.get_mut(user_id).expect("entry just inserted")
    }

    fn save(&self, user_id: &str) {
        let Some(store) = &self.persist else { return };
        let record = {
            let users = self.lock();
            let Some(state) = users.get(user_id) else { return };
            PersistedUser {
                tier: state.spec.tier.clone(),
                daily_spent: state.daily_spent,
                monthly_spent: state.monthly_spent,
                day: state.day,
                month: state.month,
            }
        };
        let result = VersionedRecord::new(record)
            .to_json()
            .and_then(|json| store.put(&keys::user_budget(user_id), &json));
        if let Err(e) = result {
            self.bus.emit(ShieldEvent::StorageError {
                module: "userBudget".to_string(),
                operation: "persist".to_string(),
                error: e.to_string(),
            });
        }
    }

    fn load_into(&self, user_id: &str, state: &mut UserState) {
        let Some(store) = &self.persist else { return };
        match store.get(&keys::user_budget(user_id)) {
            Ok(Some(json)) => {
                if let Ok(record) = VersionedRecord::<PersistedUser>::from_json(&json) {
                    state.daily_spent = record.daily_spent;
                    state.monthly_spent = record.monthly_spent;
                    state.day = record.day;
                    state.month = record.month;
                    // Stale windows clear on the first roll_over call.
                }
            }
            Ok(None) => {}
            // Called with the user table locked: log rather than emit so a
            // subscriber touching the budget cannot deadlock.
            Err(e) => tracing::warn!(user = user_id, error = %e, "user budget load failed"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserState>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(daily: Option<f64>, monthly: Option<f64>) -> UserBudgetManager {
        UserBudgetManager::new(
            UserBudgetConfig {
                default_budget: UserBudgetSpec::new(daily, monthly),
                ..UserBudgetConfig::default()
            },
            Arc::new(EventBus::new()),
        )
    }

    #[test]
    fn test_reserve_commit() {
        let m = manager(Some(10.0), None);
        let token = m.reserve("u1", 0.5).unwrap();
        assert!((m.inflight("u1") - 0.5).abs() < 1e-9);

        m.record_spend("u1", 0.4, "gpt-4o", token);
        assert_eq!(m.inflight("u1"), 0.0);
        let snap = m.snapshot("u1").unwrap();
        assert!((snap.daily_spent - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_release() {
        let m = manager(Some(10.0), None);
        let token = m.reserve("u1", 0.5).unwrap();
        m.release_inflight("u1", token);

        assert_eq!(m.inflight("u1"), 0.0);
        assert_eq!(m.snapshot("u1").unwrap().daily_spent, 0.0);
    }

    #[test]
    fn test_release_then_commit_is_noop() {
        let m = manager(Some(10.0), None);
        let token = m.reserve("u1", 0.5).unwrap();
        m.release_inflight("u1", token);
        m.record_spend("u1", 0.4, "gpt-4o", token);

        assert_eq!(m.inflight("u1"), 0.0);
        assert_eq!(m.snapshot("u1").unwrap().daily_spent, 0.0);
    }

    #[test]
    fn test_duplicate_commit_charges_once() {
        let m = manager(Some(10.0), None);
        let token = m.reserve("u1", 0.5).unwrap();
        m.record_spend("u1", 0.4, "gpt-4o", token);
        m.record_spend("u1", 0.4, "gpt-4o", token);

        let snap = m.snapshot("u1").unwrap();
        assert!((snap.daily_spent - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_release_is_noop() {
        let m = manager(Some(10.0), None);
        let token = m.reserve("u1", 0.5).unwrap();
        m.release_inflight("u1", token);
        m.release_inflight("u1", token);
        assert_eq!(m.inflight("u1"), 0.0);
    }

    #[test]
    fn test_daily_limit_blocks() {
        let bus = Arc::new(EventBus::new());
        let m = UserBudgetManager::new(
            UserBudgetConfig {
                default_budget: UserBudgetSpec::new(Some(10.0), None),
                ..UserBudgetConfig::default()
            },
            Arc::clone(&bus),
        );

        let exceeded = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&exceeded);
        bus.on(EventKind::UserBudgetExceeded, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        // Spend 9.99 of the 10.00 daily budget.
        let token = m.reserve("u1", 9.99).unwrap();
        m.record_spend("u1", 9.99, "gpt-4o", token);

        let err = m.reserve("u1", 0.05).unwrap_err();
        match err {
            Error::BudgetBlocked { user_id, window } => {
                assert_eq!(user_id, "u1");
                assert_eq!(window, BudgetWindow::Daily);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(exceeded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inflight_counts_against_limit() {
        let m = manager(Some(1.0), None);
        let _held = m.reserve("u1", 0.8).unwrap();
        assert!(m.reserve("u1", 0.3).is_err());
        assert!(m.reserve("u1", 0.1).is_ok());
    }

    #[test]
    fn test_monthly_limit_blocks_with_window_name() {
        let m = manager(None, Some(5.0));
        let token = m.reserve("u1", 4.9).unwrap();
        m.record_spend("u1", 4.9, "gpt-4o", token);

        match m.reserve("u1", 0.5).unwrap_err() {
            Error::BudgetBlocked { window, .. } => assert_eq!(window, BudgetWindow::Monthly),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_warning_at_80_percent() {
        let bus = Arc::new(EventBus::new());
        let m = UserBudgetManager::new(
            UserBudgetConfig {
                default_budget: UserBudgetSpec::new(Some(10.0), None),
                ..UserBudgetConfig::default()
            },
            Arc::clone(&bus),
        );

        let warnings = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&warnings);
        bus.on(EventKind::UserBudgetWarning, move |_| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        let t = m.reserve("u1", 8.5).unwrap();
        assert_eq!(warnings.load(Ordering::SeqCst), 1);

        // Warning fires once per window period.
        m.record_spend("u1", 8.5, "gpt-4o", t);
        let _ = m.reserve("u1", 0.5).unwrap();
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unlimited_user_never_blocks() {
        let m = manager(None, None);
        for _ in 0..50 {
            let token = m.reserve("u1", 100.0).unwrap();
            m.record_spend("u1", 100.0, "gpt-4o", token);
        }
        assert!(m.reserve("u1", 1_000.0).is_ok());
    }

    #[test]
    fn test_explicit_user_overrides_default() {
        let mut users = HashMap::new();
        users.insert("vip".to_string(), UserBudgetSpec::new(Some(1_000.0), None));
        let m = UserBudgetManager::new(
            UserBudgetConfig {
                users,
                default_budget: UserBudgetSpec::new(Some(0.01), None),
                ..UserBudgetConfig::default()
            },
            Arc::new(EventBus::new()),
        );

        assert!(m.reserve("vip", 10.0).is_ok());
        assert!(m.reserve("ordinary", 10.0).is_err());
    }

    #[test]
    fn test_tier_models() {
        let mut users = HashMap::new();
        users.insert(
            "u1".to_string(),
            UserBudgetSpec {
                daily: None,
                monthly: None,
                tier: Some("pro".to_string()),
            },
        );
        let mut tier_models = HashMap::new();
        tier_models.insert(
            "pro".to_string(),
            vec!["gpt-4o".to_string(), "claude-3-5-sonnet-20241022".to_string()],
        );
        let m = UserBudgetManager::new(
            UserBudgetConfig {
                users,
                tier_models,
                ..UserBudgetConfig::default()
            },
            Arc::new(EventBus::new()),
        );

        let _ = m.reserve("u1", 0.1).unwrap();
        assert_eq!(m.models_for_user("u1").unwrap().len(), 2);
        assert!(m.models_for_user("nobody").is_none());
    }

    #[test]
    fn test_persistence_restores_spend() {
        let store = Arc::new(DebouncedStore::with_interval(
            Arc::new(crate::persist::MemoryStore::new()),
            std::time::Duration::from_millis(0),
        ));
        let bus = Arc::new(EventBus::new());
        let config = || UserBudgetConfig {
            default_budget: UserBudgetSpec::new(Some(10.0), None),
            ..UserBudgetConfig::default()
        };

        {
            let m = UserBudgetManager::new(config(), Arc::clone(&bus))
                .with_persistence(Arc::clone(&store));
            let token = m.reserve("u1", 3.0).unwrap();
            m.record_spend("u1", 3.0, "gpt-4o", token);
        }

        let reloaded = UserBudgetManager::new(config(), bus).with_persistence(store);
        let snap = reloaded.snapshot("u1");
        // Snapshot of an unseen user is None until first touch; reserve
        // loads persisted spend.
        assert!(snap.is_none());
        let _ = reloaded.reserve("u1", 0.1).unwrap();
        let snap = reloaded.snapshot("u1").unwrap();
        assert!((snap.daily_spent - 3.0).abs() < 1e-9);
    }
}
