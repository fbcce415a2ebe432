use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::database::{UsageSnapshot, UsageStore};
use crate::models::{ApiCallRecord, NewApiCall, Provider};
use crate::utils::{Clock, UsageCalendar};

/// How long records are kept
pub const RETENTION_DAYS: i64 = 7;

/// Append-only log of every price lookup, cached or not.
///
/// The full record list is written to the store after each append. The
/// in-memory list and the write happen under one lock, so concurrent callers
/// can neither lose a record nor persist a list older than memory.
pub struct UsageLedger {
    calls: Mutex<Vec<ApiCallRecord>>,
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    calendar: UsageCalendar,
}

impl UsageLedger {
    /// Load the persisted history and drop anything past the retention window.
    ///
    /// A store that cannot be read yields an empty ledger rather than an error.
    pub async fn initialize(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, calendar: UsageCalendar) -> Self {
        let loaded = match store.load().await {
            Ok(Some(snapshot)) => snapshot.api_calls,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("[API Tracker] Failed to load usage history: {}", e);
                Vec::new()
            }
        };

        let cutoff = clock.now() - Duration::days(RETENTION_DAYS);
        let total = loaded.len();
        let calls: Vec<ApiCallRecord> = loaded.into_iter().filter(|call| call.timestamp > cutoff).collect();
        if calls.len() < total {
            info!("[API Tracker] Pruned {} records older than {} days", total - calls.len(), RETENTION_DAYS);
        }

        let ledger = Self {
            calls: Mutex::new(calls),
            store,
            clock,
            calendar,
        };
        ledger.flush().await;
        ledger
    }

    /// Stamp, append and persist one call.
    pub async fn record(&self, call: NewApiCall) {
        let record = call.stamped(self.clock.now());
        debug!(
            "[API Tracker] Recorded {} call: endpoint={} key={:?} cost={} from_cache={} success={}",
            record.provider, record.endpoint, record.key, record.cost, record.from_cache, record.success
        );

        let mut calls = self.calls.lock().await;
        calls.push(record);
        self.persist(&calls).await;
    }

    /// Write the current list to the store.
    pub async fn flush(&self) {
        let calls = self.calls.lock().await;
        self.persist(&calls).await;
    }

    async fn persist(&self, calls: &[ApiCallRecord]) {
        let snapshot = UsageSnapshot {
            api_calls: calls.to_vec(),
            last_saved: self.clock.now(),
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!("[API Tracker] Failed to save usage history: {}", e);
        }
    }

    /// Records whose calendar date is today
    pub async fn todays_calls(&self) -> Vec<ApiCallRecord> {
        let now = self.clock.now();
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| self.calendar.is_same_day(call.timestamp, now))
            .cloned()
            .collect()
    }

    pub async fn provider_calls_today(&self, provider: Provider) -> Vec<ApiCallRecord> {
        self.todays_calls()
            .await
            .into_iter()
            .filter(|call| call.provider == provider)
            .collect()
    }

    /// Records strictly newer than `instant`
    pub async fn calls_since(&self, instant: DateTime<Utc>) -> Vec<ApiCallRecord> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.timestamp > instant)
            .cloned()
            .collect()
    }

    pub async fn all_calls(&self) -> Vec<ApiCallRecord> {
        self.calls.lock().await.clone()
    }

    /// Forget today's records (manual quota reset).
    pub async fn reset_todays_usage(&self) {
        let now = self.clock.now();
        let mut calls = self.calls.lock().await;
        calls.retain(|call| !self.calendar.is_same_day(call.timestamp, now));
        self.persist(&calls).await;
        info!("[API Tracker] Today's usage reset");
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn calendar(&self) -> &UsageCalendar {
        &self.calendar
    }
}
