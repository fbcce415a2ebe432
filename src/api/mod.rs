use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::info;

use crate::models::{CacheStatus, ConnectionTest, PriceUpdateResult, Provider};

pub mod alpha_vantage_client;
pub mod coin_gecko_client;
pub use alpha_vantage_client::AlphaVantageClient;
pub use coin_gecko_client::CoinGeckoClient;

/// Minimum spacing between request starts, shared by every caller.
///
/// `acquire` hands out a permit that must be held for the whole request: a
/// second caller waits both for the interval to pass and for the previous
/// permit to be dropped.
pub struct ApiRateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

/// Exclusive right to make one rate-limited request
pub struct RateLimitPermit<'a> {
    _last_request: MutexGuard<'a, Option<Instant>>,
}

impl ApiRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let delay_ms = if requests_per_minute > 0 {
            60_000 / requests_per_minute as u64
        } else {
            1000 // Default 1 second delay
        };

        Self::with_interval(Duration::from_millis(delay_ms))
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for our turn, then mark the start of a new request.
    pub async fn acquire(&self) -> RateLimitPermit<'_> {
        let mut last_request = self.last_request.lock().await;

        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                info!("Rate limiting: waiting {}ms before next request", wait.as_millis());
                tokio::time::sleep(wait).await;
            }
        }

        *last_request = Some(Instant::now());
        RateLimitPermit {
            _last_request: last_request,
        }
    }
}

/// Everything the interface layer may ask of a price provider
#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Current price of `key`, from cache when allowed and still valid
    async fn get_price(&self, key: &str, use_cache: bool) -> PriceUpdateResult;

    async fn get_multiple_prices(&self, keys: &[String], use_cache: bool) -> Vec<PriceUpdateResult>;

    /// Valid cache entries only: no network, no usage recorded
    async fn get_cached_prices_only(&self, keys: &[String]) -> Vec<PriceUpdateResult>;

    async fn test_connection(&self) -> ConnectionTest;

    async fn clear_cache(&self, key: Option<&str>);

    async fn cache_status(&self) -> Vec<CacheStatus>;
}

pub(crate) fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent("portfolio-pulse/0.1")
        .build()
}
