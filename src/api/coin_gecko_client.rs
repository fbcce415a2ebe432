use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{build_http_client, PriceProvider};
use crate::cache::{ExpiryPolicy, PriceCache};
use crate::error::PriceError;
use crate::models::{CacheStatus, Config, ConnectionTest, CryptoQuote, NewApiCall, PriceUpdateResult, Provider};
use crate::usage::UsageLedger;
use crate::utils::Clock;

pub const SIMPLE_PRICE: &str = "simple_price";

/// Ids per simple/price request
pub const BATCH_SIZE: usize = 100;

/// Crypto prices move fast; keep them for five minutes
pub const CACHE_TTL_MINUTES: i64 = 5;

pub const TEST_COIN: &str = "bitcoin";

/// One coin in a simple/price response
#[derive(Debug, Clone, Deserialize)]
struct SimplePrice {
    usd: Option<f64>,
    usd_24h_change: Option<f64>,
    last_updated_at: Option<i64>,
}

/// CoinGecko API client.
///
/// Any number of ids is priced with one request per batch of 100; ids absent
/// from the response fail individually.
pub struct CoinGeckoClient {
    client: Client,
    base_url: Url,
    cache: PriceCache<CryptoQuote>,
    ledger: Arc<UsageLedger>,
    clock: Arc<dyn Clock>,
}

impl CoinGeckoClient {
    pub fn new(config: &Config, ledger: Arc<UsageLedger>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let client = build_http_client(config.request_timeout)?;

        Ok(Self {
            client,
            base_url: config.coingecko_base_url.clone(),
            cache: PriceCache::new(
                ExpiryPolicy::After(Duration::minutes(CACHE_TTL_MINUTES)),
                Arc::clone(&clock),
                config.calendar,
            ),
            ledger,
            clock,
        })
    }

    fn simple_price_url(&self) -> String {
        format!("{}/simple/price", self.base_url.as_str().trim_end_matches('/'))
    }

    async fn fetch_prices(&self, ids: &[String]) -> Result<HashMap<String, SimplePrice>, PriceError> {
        let response = self
            .client
            .get(self.simple_price_url())
            .query(&[
                ("ids", ids.join(",").as_str()),
                ("vs_currencies", "usd"),
                ("include_24hr_change", "true"),
                ("include_last_updated_at", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(PriceError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(serde_json::from_str(&text)?)
    }

    fn to_quote(&self, coin_id: &str, raw: &SimplePrice) -> Result<CryptoQuote, PriceError> {
        let price = raw.usd.ok_or_else(|| PriceError::DataAbsent(coin_id.to_string()))?;
        let last_updated = raw
            .last_updated_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| self.clock.now());

        Ok(CryptoQuote {
            coin_id: coin_id.to_string(),
            symbol: coin_id.to_uppercase(),
            price,
            change_24h: raw.usd_24h_change,
            last_updated,
        })
    }

    async fn fallback(&self, coin_id: &str, error: &PriceError) -> PriceUpdateResult {
        match self.cache.get(coin_id).await {
            Some(entry) => {
                info!("Returning stale cached data for {} due to API error", coin_id);
                PriceUpdateResult::stale(coin_id, &entry.data, error)
            }
            None => PriceUpdateResult::failed(coin_id, error).with_symbol(coin_id.to_uppercase()),
        }
    }

    /// Price one batch; results come back in input order
    async fn price_batch(&self, batch: &[String], use_cache: bool) -> Vec<PriceUpdateResult> {
        let mut slots: Vec<Option<PriceUpdateResult>> = vec![None; batch.len()];
        let mut hits = Vec::new();
        let mut pending: Vec<usize> = Vec::new();

        for (idx, id) in batch.iter().enumerate() {
            let cached = if use_cache { self.cache.get_valid(id).await } else { None };
            match cached {
                Some(entry) => {
                    slots[idx] = Some(PriceUpdateResult::cached(id, &entry.data));
                    hits.push(id.clone());
                }
                None => pending.push(idx),
            }
        }

        if !hits.is_empty() {
            debug!("Using cached data for {} coins", hits.len());
            self.ledger
                .record(NewApiCall::cache_hit(Provider::CoinGecko, SIMPLE_PRICE, group_key(&hits)))
                .await;
        }

        if pending.is_empty() {
            return slots.into_iter().flatten().collect();
        }

        let mut request_ids: Vec<String> = Vec::with_capacity(pending.len());
        for &idx in &pending {
            if !request_ids.contains(&batch[idx]) {
                request_ids.push(batch[idx].clone());
            }
        }

        info!("Fetching fresh prices for {} coins from CoinGecko...", request_ids.len());
        match self.fetch_prices(&request_ids).await {
            Ok(data) => {
                let mut all_priced = true;
                for &idx in &pending {
                    let id = &batch[idx];
                    let quote = data
                        .get(id)
                        .ok_or_else(|| PriceError::DataAbsent(id.clone()))
                        .and_then(|raw| self.to_quote(id, raw));

                    slots[idx] = Some(match quote {
                        Ok(quote) => {
                            self.cache.put(id, quote.clone()).await;
                            PriceUpdateResult::fresh(id, &quote)
                        }
                        Err(e) => {
                            warn!("{}", e);
                            all_priced = false;
                            self.fallback(id, &e).await
                        }
                    });
                }
                // A round trip that left any requested id unpriced counts as failed
                self.ledger
                    .record(NewApiCall::network(
                        Provider::CoinGecko,
                        SIMPLE_PRICE,
                        group_key(&request_ids),
                        all_priced,
                    ))
                    .await;
            }
            Err(e) => {
                error!("Error fetching crypto prices: {}", e);
                self.ledger
                    .record(NewApiCall::network(Provider::CoinGecko, SIMPLE_PRICE, group_key(&request_ids), false))
                    .await;
                for &idx in &pending {
                    slots[idx] = Some(self.fallback(&batch[idx], &e).await);
                }
            }
        }

        slots.into_iter().flatten().collect()
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoClient {
    fn provider(&self) -> Provider {
        Provider::CoinGecko
    }

    async fn get_price(&self, coin_id: &str, use_cache: bool) -> PriceUpdateResult {
        let batch = [coin_id.to_string()];
        self.price_batch(&batch, use_cache)
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                PriceUpdateResult::failed(coin_id, PriceError::DataAbsent(coin_id.to_string()))
                    .with_symbol(coin_id.to_uppercase())
            })
    }

    async fn get_multiple_prices(&self, coin_ids: &[String], use_cache: bool) -> Vec<PriceUpdateResult> {
        let mut results = Vec::with_capacity(coin_ids.len());
        for batch in coin_ids.chunks(BATCH_SIZE) {
            results.extend(self.price_batch(batch, use_cache).await);
        }
        results
    }

    async fn get_cached_prices_only(&self, coin_ids: &[String]) -> Vec<PriceUpdateResult> {
        let mut results = Vec::new();
        for id in coin_ids {
            if let Some(entry) = self.cache.get_valid(id).await {
                results.push(PriceUpdateResult::cached(id, &entry.data));
            }
        }
        results
    }

    async fn test_connection(&self) -> ConnectionTest {
        let result = self.get_price(TEST_COIN, false).await;
        match (result.success, result.price) {
            (true, Some(price)) => ConnectionTest {
                success: true,
                message: format!("CoinGecko API working. Bitcoin price: ${:.2}", price),
            },
            _ => ConnectionTest {
                success: false,
                message: result
                    .error
                    .unwrap_or_else(|| "Unknown error testing CoinGecko API".to_string()),
            },
        }
    }

    async fn clear_cache(&self, coin_id: Option<&str>) {
        self.cache.clear(coin_id).await;
        match coin_id {
            Some(id) => info!("Crypto cache cleared for {}", id),
            None => info!("All crypto price cache cleared"),
        }
    }

    async fn cache_status(&self) -> Vec<CacheStatus> {
        self.cache.status().await
    }
}

/// Ledger key for a grouped request: the id itself when there is only one
fn group_key(ids: &[String]) -> Option<String> {
    match ids {
        [only] => Some(only.clone()),
        _ => None,
    }
}
