use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::api::{AlphaVantageClient, CoinGeckoClient, PriceProvider};
use crate::database::{SqliteUsageStore, UsageStore};
use crate::models::{Config, PriceUpdateResult};
use crate::usage::{UsageAdvisor, UsageLedger};
use crate::utils::{Clock, SystemClock};

/// Prices fetched by one portfolio refresh
#[derive(Debug, Clone, Default)]
pub struct PortfolioRefresh {
    pub stocks: Vec<PriceUpdateResult>,
    pub crypto: Vec<PriceUpdateResult>,
}

impl PortfolioRefresh {
    pub fn failures(&self) -> usize {
        self.stocks.iter().chain(&self.crypto).filter(|r| !r.success).count()
    }
}

/// Process-wide services, built once and shared by reference.
///
/// The ledger is created first so both provider clients and the advisor
/// see the same record list.
pub struct PortfolioServices {
    pub config: Config,
    pub ledger: Arc<UsageLedger>,
    pub stocks: Arc<AlphaVantageClient>,
    pub crypto: Arc<CoinGeckoClient>,
    pub advisor: UsageAdvisor,
}

impl PortfolioServices {
    /// Open the SQLite usage store at `config.database_path` and wire everything up
    pub async fn initialize(config: Config) -> Result<Self> {
        let store = SqliteUsageStore::connect(&config.database_path).await?;
        Self::with_store(config, Arc::new(store), Arc::new(SystemClock)).await
    }

    pub async fn with_store(config: Config, store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let ledger = Arc::new(UsageLedger::initialize(store, Arc::clone(&clock), config.calendar).await);

        let stocks = Arc::new(AlphaVantageClient::new(&config, Arc::clone(&ledger), Arc::clone(&clock))?);
        let crypto = Arc::new(CoinGeckoClient::new(&config, Arc::clone(&ledger), clock)?);
        let advisor = UsageAdvisor::new(
            Arc::clone(&ledger),
            config.stock_daily_limit,
            config.distinct_stock_symbols().len(),
        );

        Ok(Self {
            config,
            ledger,
            stocks,
            crypto,
            advisor,
        })
    }

    pub async fn refresh_stocks(&self, force: bool) -> Vec<PriceUpdateResult> {
        self.stocks
            .get_multiple_prices(&self.config.distinct_stock_symbols(), !force)
            .await
    }

    pub async fn refresh_crypto(&self, force: bool) -> Vec<PriceUpdateResult> {
        self.crypto.get_multiple_prices(&self.config.crypto_ids, !force).await
    }

    /// Refresh both asset classes at once; the stock side stays sequential
    pub async fn refresh_all(&self, force: bool) -> PortfolioRefresh {
        let (stocks, crypto) = futures::join!(self.refresh_stocks(force), self.refresh_crypto(force));
        let refresh = PortfolioRefresh { stocks, crypto };
        info!(
            "✅ Refreshed {} stock and {} crypto prices ({} failed)",
            refresh.stocks.len(),
            refresh.crypto.len(),
            refresh.failures()
        );
        refresh
    }

    /// Whatever is still valid in the caches, with no network traffic
    pub async fn cached_prices(&self) -> PortfolioRefresh {
        PortfolioRefresh {
            stocks: self
                .stocks
                .get_cached_prices_only(&self.config.distinct_stock_symbols())
                .await,
            crypto: self.crypto.get_cached_prices_only(&self.config.crypto_ids).await,
        }
    }

    pub async fn clear_caches(&self) {
        self.stocks.clear_cache(None).await;
        self.crypto.clear_cache(None).await;
    }
}
