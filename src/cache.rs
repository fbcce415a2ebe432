//! Per-provider price cache with an expiry policy.
//!
//! Entries are keyed by the provider's identifier (ticker symbol or coin id).
//! Expired entries are not evicted: normal lookups treat them as misses, but
//! they stay reachable through [`PriceCache::get`] so a failed fetch can fall
//! back to the last known price.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::CacheStatus;
use crate::utils::{Clock, UsageCalendar};

/// When a freshly written entry stops being valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// 23:59:59.999 of the calendar day the entry was written
    EndOfDay,
    /// A fixed time after the entry was written
    After(Duration),
}

impl ExpiryPolicy {
    pub fn expires_at(&self, cached_at: DateTime<Utc>, calendar: &UsageCalendar) -> DateTime<Utc> {
        match self {
            ExpiryPolicy::EndOfDay => calendar.end_of_day(cached_at),
            ExpiryPolicy::After(ttl) => cached_at + *ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceCacheEntry<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> PriceCacheEntry<T> {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct PriceCache<T> {
    entries: RwLock<HashMap<String, PriceCacheEntry<T>>>,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock>,
    calendar: UsageCalendar,
}

impl<T: Clone + Send + Sync> PriceCache<T> {
    pub fn new(policy: ExpiryPolicy, clock: Arc<dyn Clock>, calendar: UsageCalendar) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
            clock,
            calendar,
        }
    }

    /// Any entry for `key`, expired or not
    pub async fn get(&self, key: &str) -> Option<PriceCacheEntry<T>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Entry for `key` only if it is still valid
    pub async fn get_valid(&self, key: &str) -> Option<PriceCacheEntry<T>> {
        let entry = self.get(key).await?;
        self.is_valid(&entry).then_some(entry)
    }

    pub async fn put(&self, key: &str, data: T) {
        let cached_at = self.clock.now();
        let expires_at = self.policy.expires_at(cached_at, &self.calendar);
        let entry = PriceCacheEntry {
            data,
            cached_at,
            expires_at,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        debug!("Cached {} until {}", key, expires_at);
    }

    pub fn is_valid(&self, entry: &PriceCacheEntry<T>) -> bool {
        entry.is_valid_at(self.clock.now())
    }

    /// Remove one entry, or every entry when `key` is `None`
    pub async fn clear(&self, key: Option<&str>) {
        let mut entries = self.entries.write().await;
        match key {
            Some(key) => {
                entries.remove(key);
            }
            None => entries.clear(),
        }
    }

    pub async fn status(&self) -> Vec<CacheStatus> {
        let now = self.clock.now();
        let mut status: Vec<CacheStatus> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, entry)| CacheStatus {
                key: key.clone(),
                cached_at: entry.cached_at,
                expires_at: entry.expires_at,
                is_valid: entry.is_valid_at(now),
            })
            .collect();
        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }
}
