use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{build_http_client, ApiRateLimiter, PriceProvider};
use crate::cache::{ExpiryPolicy, PriceCache};
use crate::error::PriceError;
use crate::models::{
    CacheStatus, Config, ConnectionTest, DailyBar, DataFetchMode, NewApiCall, PriceUpdateResult, Provider,
    StockQuote,
};
use crate::usage::UsageLedger;
use crate::utils::{Clock, UsageCalendar};

pub const GLOBAL_QUOTE: &str = "GLOBAL_QUOTE";
pub const TIME_SERIES_DAILY: &str = "TIME_SERIES_DAILY";

/// Symbol used to probe connectivity
pub const TEST_SYMBOL: &str = "AAPL";

/// Alpha Vantage GLOBAL_QUOTE response, including its in-band error fields
#[derive(Debug, Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    global_quote: Option<GlobalQuote>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

/// Every field arrives as text; unknown symbols come back as an empty object
#[derive(Debug, Default, Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: Option<String>,
    #[serde(rename = "02. open")]
    open: Option<String>,
    #[serde(rename = "03. high")]
    high: Option<String>,
    #[serde(rename = "04. low")]
    low: Option<String>,
    #[serde(rename = "05. price")]
    price: Option<String>,
    #[serde(rename = "06. volume")]
    volume: Option<String>,
    #[serde(rename = "07. latest trading day")]
    latest_trading_day: Option<String>,
    #[serde(rename = "08. previous close")]
    previous_close: Option<String>,
    #[serde(rename = "09. change")]
    change: Option<String>,
    #[serde(rename = "10. change percent")]
    change_percent: Option<String>,
}

/// Alpha Vantage daily data structures
#[derive(Debug, Deserialize)]
struct DailyResponse {
    #[serde(rename = "Time Series (Daily)")]
    time_series: Option<HashMap<String, DailyPriceData>>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyPriceData {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

/// Alpha Vantage API client.
///
/// Quotes are cached until the end of the calendar day and every outbound
/// request goes through the shared rate limiter (5 requests/minute on the
/// free tier).
pub struct AlphaVantageClient {
    client: Client,
    api_key: String,
    base_url: Url,
    rate_limiter: Arc<ApiRateLimiter>,
    cache: PriceCache<StockQuote>,
    ledger: Arc<UsageLedger>,
    calendar: UsageCalendar,
    batch_pause: Duration,
}

impl AlphaVantageClient {
    pub fn new(config: &Config, ledger: Arc<UsageLedger>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let rate_limiter = Arc::new(ApiRateLimiter::new(config.stock_requests_per_minute));
        Self::with_rate_limiter(config, ledger, clock, rate_limiter)
    }

    /// Build a client that shares an existing limiter
    pub fn with_rate_limiter(
        config: &Config,
        ledger: Arc<UsageLedger>,
        clock: Arc<dyn Clock>,
        rate_limiter: Arc<ApiRateLimiter>,
    ) -> anyhow::Result<Self> {
        let client = build_http_client(config.request_timeout)?;

        Ok(Self {
            client,
            api_key: config.alpha_vantage_api_key.clone(),
            base_url: config.alpha_vantage_base_url.clone(),
            rate_limiter,
            cache: PriceCache::new(ExpiryPolicy::EndOfDay, clock, config.calendar),
            ledger,
            calendar: config.calendar,
            batch_pause: config.stock_batch_pause,
        })
    }

    pub fn rate_limiter(&self) -> &Arc<ApiRateLimiter> {
        &self.rate_limiter
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<StockQuote, PriceError> {
        let response = self
            .client
            .get(self.base_url.clone())
            .query(&[("function", GLOBAL_QUOTE), ("symbol", symbol), ("apikey", self.api_key.as_str())])
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

        let body: GlobalQuoteResponse = serde_json::from_str(&text)?;
        check_in_band_errors(body.error_message, body.note, body.information)?;

        let quote = body
            .global_quote
            .ok_or_else(|| PriceError::Parse("missing \"Global Quote\" in Alpha Vantage response".to_string()))?;
        self.convert_quote(symbol, quote)
    }

    /// Turn the text-encoded wire quote into a `StockQuote`
    fn convert_quote(&self, symbol: &str, quote: GlobalQuote) -> Result<StockQuote, PriceError> {
        let price = match quote.price.as_deref() {
            Some(raw) => parse_number(raw, "price")?,
            None => return Err(PriceError::DataAbsent(symbol.to_string())),
        };

        let last_updated = match quote.latest_trading_day.as_deref() {
            Some(raw) => {
                let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| PriceError::Parse(format!("latest trading day '{}': {}", raw, e)))?;
                self.calendar.start_of(day)
            }
            None => self.ledger.now(),
        };

        Ok(StockQuote {
            symbol: quote.symbol.unwrap_or_else(|| symbol.to_string()),
            price,
            change: parse_optional(quote.change.as_deref()),
            change_percent: parse_optional(quote.change_percent.as_deref().map(|p| p.trim_end_matches('%'))),
            open: parse_optional(quote.open.as_deref()),
            high: parse_optional(quote.high.as_deref()),
            low: parse_optional(quote.low.as_deref()),
            volume: quote.volume.as_deref().and_then(|v| v.trim().parse().ok()),
            previous_close: parse_optional(quote.previous_close.as_deref()),
            last_updated,
        })
    }

    /// Failed lookup: serve whatever the cache still holds, expired or not
    async fn fallback(&self, symbol: &str, error: &PriceError) -> PriceUpdateResult {
        match self.cache.get(symbol).await {
            Some(entry) => {
                info!("Returning stale cached data for {} due to API error", symbol);
                PriceUpdateResult::stale(symbol, &entry.data, error)
            }
            None => PriceUpdateResult::failed(symbol, error).with_symbol(symbol),
        }
    }

    /// Daily OHLCV history, oldest first. Not cached; still rate limited and recorded.
    pub async fn get_daily_history(&self, symbol: &str, mode: DataFetchMode) -> Result<Vec<DailyBar>, PriceError> {
        let fetched = {
            let _permit = self.rate_limiter.acquire().await;
            debug!("Fetching {} daily history for {}", mode.as_str(), symbol);
            self.fetch_daily(symbol, mode).await
        };

        self.ledger
            .record(NewApiCall::network(
                Provider::AlphaVantage,
                TIME_SERIES_DAILY,
                Some(symbol.to_string()),
                fetched.is_ok(),
            ))
            .await;

        if let Err(e) = &fetched {
            warn!("Error fetching historical data for {}: {}", symbol, e);
        }
        fetched
    }

    async fn fetch_daily(&self, symbol: &str, mode: DataFetchMode) -> Result<Vec<DailyBar>, PriceError> {
        let response = self
            .client
            .get(self.base_url.clone())
            .query(&[
                ("function", TIME_SERIES_DAILY),
                ("symbol", symbol),
                ("outputsize", mode.as_str()),
                ("apikey", self.api_key.as_str()),
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

        let body: DailyResponse = serde_json::from_str(&text)?;
        check_in_band_errors(body.error_message, body.note, body.information)?;

        let series = body.time_series.ok_or_else(|| PriceError::DataAbsent(symbol.to_string()))?;
        convert_daily_data(series)
    }
}

#[async_trait]
impl PriceProvider for AlphaVantageClient {
    fn provider(&self) -> Provider {
        Provider::AlphaVantage
    }

    async fn get_price(&self, symbol: &str, use_cache: bool) -> PriceUpdateResult {
        if use_cache {
            if let Some(entry) = self.cache.get_valid(symbol).await {
                debug!("Using cached data for {}", symbol);
                self.ledger
                    .record(NewApiCall::cache_hit(Provider::AlphaVantage, GLOBAL_QUOTE, Some(symbol.to_string())))
                    .await;
                return PriceUpdateResult::cached(symbol, &entry.data);
            }
        }

        let fetched = {
            let _permit = self.rate_limiter.acquire().await;
            info!("Fetching fresh data for {} from Alpha Vantage...", symbol);
            self.fetch_quote(symbol).await
        };

        match fetched {
            Ok(quote) => {
                self.cache.put(symbol, quote.clone()).await;
                self.ledger
                    .record(NewApiCall::network(Provider::AlphaVantage, GLOBAL_QUOTE, Some(symbol.to_string()), true))
                    .await;
                PriceUpdateResult::fresh(symbol, &quote)
            }
            Err(e) => {
                warn!("Error fetching quote for {}: {}", symbol, e);
                // A failed request still consumes quota
                self.ledger
                    .record(NewApiCall::network(Provider::AlphaVantage, GLOBAL_QUOTE, Some(symbol.to_string()), false))
                    .await;
                self.fallback(symbol, &e).await
            }
        }
    }

    async fn get_multiple_prices(&self, symbols: &[String], use_cache: bool) -> Vec<PriceUpdateResult> {
        info!("Fetching quotes for {} symbols...", symbols.len());
        let mut results = Vec::with_capacity(symbols.len());

        // One at a time: the limiter allows a single request in flight anyway
        for (i, symbol) in symbols.iter().enumerate() {
            results.push(self.get_price(symbol, use_cache).await);

            if i + 1 < symbols.len() && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        results
    }

    async fn get_cached_prices_only(&self, symbols: &[String]) -> Vec<PriceUpdateResult> {
        let mut results = Vec::new();
        for symbol in symbols {
            if let Some(entry) = self.cache.get_valid(symbol).await {
                results.push(PriceUpdateResult::cached(symbol, &entry.data));
            }
        }
        results
    }

    async fn test_connection(&self) -> ConnectionTest {
        let result = self.get_price(TEST_SYMBOL, false).await;
        match (result.success, result.price) {
            (true, Some(price)) => ConnectionTest {
                success: true,
                message: format!("Alpha Vantage API working. {} price: ${:.2}", TEST_SYMBOL, price),
            },
            _ => ConnectionTest {
                success: false,
                message: result
                    .error
                    .unwrap_or_else(|| "Unknown error testing Alpha Vantage API".to_string()),
            },
        }
    }

    async fn clear_cache(&self, symbol: Option<&str>) {
        self.cache.clear(symbol).await;
        match symbol {
            Some(symbol) => info!("Cache cleared for {}", symbol),
            None => info!("All stock price cache cleared"),
        }
    }

    async fn cache_status(&self) -> Vec<CacheStatus> {
        self.cache.status().await
    }
}

/// Alpha Vantage reports errors and throttling inside a 200 response
fn check_in_band_errors(
    error_message: Option<String>,
    note: Option<String>,
    information: Option<String>,
) -> Result<(), PriceError> {
    if let Some(message) = error_message {
        return Err(PriceError::Provider(message));
    }
    if let Some(note) = note.or(information) {
        return Err(PriceError::RateLimited(note));
    }
    Ok(())
}

fn parse_number(raw: &str, field: &str) -> Result<f64, PriceError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| PriceError::Parse(format!("{} '{}': {}", field, raw, e)))
}

fn parse_optional(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|v| v.trim().parse().ok())
}

/// Convert Alpha Vantage daily data to internal format, oldest first
fn convert_daily_data(series: HashMap<String, DailyPriceData>) -> Result<Vec<DailyBar>, PriceError> {
    let mut bars = Vec::with_capacity(series.len());

    for (date_str, price_data) in series {
        let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
            .map_err(|e| PriceError::Parse(format!("date '{}': {}", date_str, e)))?;

        bars.push(DailyBar {
            date,
            open: parse_number(&price_data.open, "open")?,
            high: parse_number(&price_data.high, "high")?,
            low: parse_number(&price_data.low, "low")?,
            close: parse_number(&price_data.close, "close")?,
            volume: price_data
                .volume
                .trim()
                .parse()
                .map_err(|e| PriceError::Parse(format!("volume '{}': {}", price_data.volume, e)))?,
        });
    }

    bars.sort_by_key(|bar| bar.date);
    Ok(bars)
}
