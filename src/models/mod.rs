use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::utils::UsageCalendar;

/// External price data sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "alphavantage")]
    AlphaVantage,
    #[serde(rename = "coingecko")]
    CoinGecko,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::AlphaVantage => "alphavantage",
            Provider::CoinGecko => "coingecko",
        }
    }

    pub fn limits(&self) -> ProviderLimit {
        match self {
            Provider::AlphaVantage => ProviderLimit {
                daily_limit: Some(500),
                minute_limit: 5,
                calls_per_quote: 1,
            },
            Provider::CoinGecko => ProviderLimit {
                daily_limit: None,
                minute_limit: 30,
                calls_per_quote: 1,
            },
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published free-tier quota of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderLimit {
    /// `None` when the provider has no daily ceiling
    pub daily_limit: Option<u32>,
    pub minute_limit: u32,
    /// Quota units one quote request consumes
    pub calls_per_quote: u32,
}

/// One price lookup as written to the usage ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: Provider,
    pub endpoint: String,
    #[serde(default, alias = "symbol", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub success: bool,
    pub from_cache: bool,
    pub cost: u32,
}

/// A call about to be recorded; the ledger stamps the time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewApiCall {
    pub provider: Provider,
    pub endpoint: String,
    pub key: Option<String>,
    pub success: bool,
    pub from_cache: bool,
    pub cost: u32,
}

impl NewApiCall {
    /// Served from cache: always successful and free
    pub fn cache_hit(provider: Provider, endpoint: &str, key: Option<String>) -> Self {
        Self {
            provider,
            endpoint: endpoint.to_string(),
            key,
            success: true,
            from_cache: true,
            cost: 0,
        }
    }

    /// A request that went over the network, whatever its outcome
    pub fn network(provider: Provider, endpoint: &str, key: Option<String>, success: bool) -> Self {
        Self {
            provider,
            endpoint: endpoint.to_string(),
            key,
            success,
            from_cache: false,
            cost: provider.limits().calls_per_quote,
        }
    }

    pub fn stamped(self, timestamp: DateTime<Utc>) -> ApiCallRecord {
        ApiCallRecord {
            timestamp,
            provider: self.provider,
            endpoint: self.endpoint,
            key: self.key,
            success: self.success,
            from_cache: self.from_cache,
            cost: self.cost,
        }
    }
}

/// Stock quote after conversion from the provider's wire format
#[derive(Debug, Clone, PartialEq)]
pub struct StockQuote {
    pub symbol: String,
    pub price: f64,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<i64>,
    pub previous_close: Option<f64>,
    /// Start of the latest trading day the quote belongs to
    pub last_updated: DateTime<Utc>,
}

/// Crypto price after conversion from the provider's wire format
#[derive(Debug, Clone, PartialEq)]
pub struct CryptoQuote {
    pub coin_id: String,
    pub symbol: String,
    pub price: f64,
    pub change_24h: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

/// Anything a price cache can hold
pub trait PricePoint: Clone + Send + Sync {
    /// Display symbol (ticker, or upper-cased coin id)
    fn symbol(&self) -> &str;
    fn price(&self) -> f64;
    fn last_updated(&self) -> DateTime<Utc>;
}

impl PricePoint for StockQuote {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

impl PricePoint for CryptoQuote {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

/// Uniform answer to "what is the price of X"
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdateResult {
    pub success: bool,
    pub key: String,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub from_cache: bool,
}

impl PriceUpdateResult {
    pub fn fresh<P: PricePoint>(key: &str, quote: &P) -> Self {
        Self {
            success: true,
            key: key.to_string(),
            symbol: Some(quote.symbol().to_string()),
            price: Some(quote.price()),
            last_updated: Some(quote.last_updated()),
            error: None,
            from_cache: false,
        }
    }

    pub fn cached<P: PricePoint>(key: &str, quote: &P) -> Self {
        Self {
            from_cache: true,
            ..Self::fresh(key, quote)
        }
    }

    /// Failed lookup answered with whatever the cache still held
    pub fn stale<P: PricePoint>(key: &str, quote: &P, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(format!("API error: {} (showing cached data)", error)),
            ..Self::cached(key, quote)
        }
    }

    pub fn failed(key: &str, error: impl fmt::Display) -> Self {
        Self {
            success: false,
            key: key.to_string(),
            symbol: None,
            price: None,
            last_updated: None,
            error: Some(error.to_string()),
            from_cache: false,
        }
    }

    /// Set the display symbol, e.g. on a failure that never saw a quote
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

/// Outcome of a connectivity probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
}

/// Debug view of one cache slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub key: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}

/// How much daily history to request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFetchMode {
    Compact, // 100 days
    Full,    // 20+ years
}

impl DataFetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFetchMode::Compact => "compact",
            DataFetchMode::Full => "full",
        }
    }
}

/// One day of OHLCV history
#[derive(Debug, Clone, PartialEq)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Configuration for the application
#[derive(Debug, Clone)]
pub struct Config {
    pub alpha_vantage_api_key: String,
    pub alpha_vantage_base_url: Url,
    pub coingecko_base_url: Url,
    pub database_path: String,
    pub stock_daily_limit: u32,
    pub stock_requests_per_minute: u32,
    /// Extra pause between symbols in a sequential stock refresh
    pub stock_batch_pause: Duration,
    pub request_timeout: Duration,
    pub stock_symbols: Vec<String>,
    pub crypto_ids: Vec<String>,
    pub calendar: UsageCalendar,
}

pub const DEFAULT_ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co/query";
pub const DEFAULT_COINGECKO_URL: &str = "https://api.coingecko.com/api/v3";

impl Default for Config {
    fn default() -> Self {
        let stock_limits = Provider::AlphaVantage.limits();
        Self {
            alpha_vantage_api_key: String::new(),
            alpha_vantage_base_url: Url::parse(DEFAULT_ALPHA_VANTAGE_URL).expect("static URL"),
            coingecko_base_url: Url::parse(DEFAULT_COINGECKO_URL).expect("static URL"),
            database_path: "portfolio_usage.db".to_string(),
            stock_daily_limit: stock_limits.daily_limit.unwrap_or(500),
            stock_requests_per_minute: stock_limits.minute_limit,
            stock_batch_pause: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(10),
            stock_symbols: vec!["SPY".to_string(), "VTI".to_string()],
            crypto_ids: vec!["bitcoin".to_string(), "ethereum".to_string()],
            calendar: UsageCalendar::local(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let defaults = Config::default();

        let alpha_vantage_api_key = std::env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_default();
        if alpha_vantage_api_key.is_empty() {
            warn!("Alpha Vantage API key not found. Set ALPHA_VANTAGE_API_KEY in .env");
        }

        let alpha_vantage_base_url = match std::env::var("ALPHA_VANTAGE_BASE_URL") {
            Ok(raw) => Url::parse(&raw)
                .map_err(|e| anyhow::anyhow!("ALPHA_VANTAGE_BASE_URL is not a valid URL: {}", e))?,
            Err(_) => defaults.alpha_vantage_base_url,
        };
        let coingecko_base_url = match std::env::var("COINGECKO_BASE_URL") {
            Ok(raw) => Url::parse(&raw)
                .map_err(|e| anyhow::anyhow!("COINGECKO_BASE_URL is not a valid URL: {}", e))?,
            Err(_) => defaults.coingecko_base_url,
        };

        let calendar = std::env::var("USAGE_UTC_OFFSET_MINUTES")
            .ok()
            .and_then(|raw| raw.parse::<i32>().ok())
            .map(UsageCalendar::from_offset_minutes)
            .unwrap_or(defaults.calendar);

        Ok(Config {
            alpha_vantage_api_key,
            alpha_vantage_base_url,
            coingecko_base_url,
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or(defaults.database_path),
            stock_daily_limit: parse_env("STOCK_DAILY_LIMIT", defaults.stock_daily_limit),
            stock_requests_per_minute: parse_env("STOCK_REQUESTS_PER_MINUTE", defaults.stock_requests_per_minute),
            stock_batch_pause: Duration::from_millis(parse_env("STOCK_BATCH_PAUSE_MS", 1000)),
            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", 10)),
            stock_symbols: std::env::var("STOCK_SYMBOLS")
                .map(|raw| split_list(&raw, false))
                .unwrap_or(defaults.stock_symbols),
            crypto_ids: std::env::var("CRYPTO_IDS")
                .map(|raw| split_list(&raw, true))
                .unwrap_or(defaults.crypto_ids),
            calendar,
        })
    }

    /// Distinct configured stock symbols, in first-seen order
    pub fn distinct_stock_symbols(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for symbol in &self.stock_symbols {
            if !seen.contains(symbol) {
                seen.push(symbol.clone());
            }
        }
        seen
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str, lowercase: bool) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| if lowercase { s.to_lowercase() } else { s.to_uppercase() })
        .collect()
}
