use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use portfolio_pulse::api::PriceProvider;
use portfolio_pulse::models::{Config, DataFetchMode, PriceUpdateResult};
use portfolio_pulse::usage::OperationKind;
use portfolio_pulse::{PortfolioRefresh, PortfolioServices};

#[derive(Parser)]
#[command(
    name = "portfolio-pulse",
    about = "📈 Portfolio price refresh with API quota tracking",
    long_about = "Fetches stock (Alpha Vantage) and crypto (CoinGecko) prices through local caches and keeps a ledger of every lookup against the providers' free-tier limits."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Today's usage and remaining daily quota
    Stats,
    /// Daily and per-minute limit status
    Limits,
    /// Which prices were fetched live today
    Live,
    /// Calls per day over the last week
    History,
    /// Estimated quota cost of an operation (test, single, all)
    Estimate { operation: OperationKind },
    /// Fetch prices for the configured portfolio
    Refresh {
        /// Bypass the cache
        #[arg(long, short)]
        force: bool,
        /// Only stocks
        #[arg(long, conflicts_with = "crypto")]
        stocks: bool,
        /// Only crypto
        #[arg(long)]
        crypto: bool,
    },
    /// Show cached prices without touching the network
    Cached,
    /// Probe a provider with a live request
    TestConnection {
        #[arg(value_enum, default_value = "stock")]
        target: Target,
    },
    /// Daily OHLCV history for one stock symbol
    HistoryDaily {
        symbol: String,
        /// Full history instead of the last 100 days
        #[arg(long)]
        full: bool,
    },
    /// Forget today's recorded usage
    ResetToday,
    /// Drop every cached price
    ClearCache,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Stock,
    Crypto,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portfolio_pulse=info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("❌ Configuration Error: {}", e);
            std::process::exit(1);
        }
    };

    let services = PortfolioServices::initialize(config).await?;

    match cli.command {
        Command::Stats => show_stats(&services).await,
        Command::Limits => show_limits(&services).await,
        Command::Live => show_live(&services).await,
        Command::History => show_history(&services).await,
        Command::Estimate { operation } => {
            let estimate = services.advisor.estimate_operation_cost(operation).await;
            let verdict = if estimate.affordable { "✅ affordable" } else { "❌ over quota" };
            println!("{} - {} call(s), {}", estimate.description, estimate.cost, verdict);
        }
        Command::Refresh { force, stocks, crypto } => {
            let refresh = if stocks {
                PortfolioRefresh {
                    stocks: services.refresh_stocks(force).await,
                    ..Default::default()
                }
            } else if crypto {
                PortfolioRefresh {
                    crypto: services.refresh_crypto(force).await,
                    ..Default::default()
                }
            } else {
                services.refresh_all(force).await
            };
            print_results("STOCKS", &refresh.stocks);
            print_results("CRYPTO", &refresh.crypto);
        }
        Command::Cached => {
            let cached = services.cached_prices().await;
            print_results("STOCKS (cached)", &cached.stocks);
            print_results("CRYPTO (cached)", &cached.crypto);
        }
        Command::TestConnection { target } => {
            let result = match target {
                Target::Stock => services.stocks.test_connection().await,
                Target::Crypto => services.crypto.test_connection().await,
            };
            let icon = if result.success { "✅" } else { "❌" };
            println!("{} {}", icon, result.message);
        }
        Command::HistoryDaily { symbol, full } => {
            let mode = if full { DataFetchMode::Full } else { DataFetchMode::Compact };
            let symbol = symbol.to_uppercase();
            match services.stocks.get_daily_history(&symbol, mode).await {
                Ok(bars) => {
                    println!("📅 {} daily bars for {}", bars.len(), symbol);
                    for bar in bars.iter().rev().take(10) {
                        println!(
                            "{}  O {:>10.2}  H {:>10.2}  L {:>10.2}  C {:>10.2}  V {:>12}",
                            bar.date, bar.open, bar.high, bar.low, bar.close, bar.volume
                        );
                    }
                }
                Err(e) => println!("❌ {}", e),
            }
        }
        Command::ResetToday => {
            services.ledger.reset_todays_usage().await;
            println!("🔄 Today's usage has been reset");
        }
        Command::ClearCache => {
            services.clear_caches().await;
            println!("🧹 Price caches cleared");
        }
    }

    Ok(())
}

async fn show_stats(services: &PortfolioServices) {
    let stats = services.advisor.todays_stats().await;
    let local = services.config.calendar.offset();

    println!("📊 API USAGE TODAY");
    println!("══════════════════════════════════════");
    println!("Calls today:     {}", stats.total_calls_today);
    println!("Remaining:       {} / {}", stats.remaining_calls_today, stats.daily_limit);
    println!("Resets at:       {}", stats.reset_time.with_timezone(&local).format("%Y-%m-%d %H:%M"));
    println!();
    println!("💰 COST OF OPERATIONS");
    println!("Test connection: {}", stats.cost_analysis.test_connection);
    println!("Single refresh:  {}", stats.cost_analysis.single_refresh);
    println!("Full refresh:    {}", stats.cost_analysis.all_refresh);
    if let Some(next) = stats.cost_analysis.next_scheduled_update {
        println!("Next scheduled:  {}", next.with_timezone(&local).format("%Y-%m-%d %H:%M"));
    }
}

async fn show_limits(services: &PortfolioServices) {
    let status = services.advisor.rate_limit_status().await;
    println!(
        "Daily:  {:>8} ({:.1}% used)",
        status.daily.status.as_str(),
        status.daily.percentage
    );
    println!(
        "Minute: {:>8} ({} call(s) in the last minute)",
        status.minute.status.as_str(),
        status.minute.calls_in_last_minute
    );
}

async fn show_live(services: &PortfolioServices) {
    let indicators = services.advisor.live_data_indicators().await;
    if indicators.is_empty() {
        println!("No live fetches today");
        return;
    }
    let local = services.config.calendar.offset();
    for (key, indicator) in indicators {
        println!(
            "🟢 {:12} {:12} {}",
            key,
            indicator.provider.as_str(),
            indicator.last_update.with_timezone(&local).format("%H:%M:%S")
        );
    }
}

async fn show_history(services: &PortfolioServices) {
    for point in services.advisor.usage_history().await {
        println!("{}  {:>4}  {}", point.label, point.calls, "▇".repeat(point.calls.min(60) as usize));
    }
}

fn print_results(title: &str, results: &[PriceUpdateResult]) {
    if results.is_empty() {
        return;
    }
    println!("{}", title);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for result in results {
        let icon = match (result.success, result.from_cache) {
            (true, false) => "✅",
            (true, true) => "📦",
            (false, true) => "⚠️",
            (false, false) => "❌",
        };
        let price = result
            .price
            .map(|p| format!("${:.2}", p))
            .unwrap_or_else(|| "-".to_string());
        match &result.error {
            Some(error) => println!("{} {:12} {:>14}  {}", icon, result.key, price, error),
            None => println!("{} {:12} {:>14}", icon, result.key, price),
        }
    }
    println!();
}
