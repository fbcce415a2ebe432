use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::{ApiCallRecord, Provider};
use super::UsageLedger;

/// Traffic-light bucket for quota consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStatus {
    Safe,
    Warning,
    Critical,
}

impl LimitStatus {
    /// Daily bucket: critical above 90%, warning above 75%
    pub fn for_daily_percentage(percentage: f64) -> Self {
        if percentage > 90.0 {
            LimitStatus::Critical
        } else if percentage > 75.0 {
            LimitStatus::Warning
        } else {
            LimitStatus::Safe
        }
    }

    /// Per-minute bucket: critical at the limit, warning one call before it
    pub fn for_minute_calls(calls: u32, minute_limit: u32) -> Self {
        if calls >= minute_limit {
            LimitStatus::Critical
        } else if calls >= minute_limit.saturating_sub(1) {
            LimitStatus::Warning
        } else {
            LimitStatus::Safe
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitStatus::Safe => "safe",
            LimitStatus::Warning => "warning",
            LimitStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostAnalysis {
    pub test_connection: u32,
    pub single_refresh: u32,
    pub all_refresh: u32,
    /// Placeholder: nothing actually runs at this time
    pub next_scheduled_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageStats {
    pub today: Vec<ApiCallRecord>,
    pub total_calls_today: u32,
    pub remaining_calls_today: u32,
    pub daily_limit: u32,
    pub reset_time: DateTime<Utc>,
    pub cost_analysis: CostAnalysis,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyLimitStatus {
    pub status: LimitStatus,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinuteLimitStatus {
    pub status: LimitStatus,
    pub calls_in_last_minute: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub daily: DailyLimitStatus,
    pub minute: MinuteLimitStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveIndicator {
    pub is_live: bool,
    pub last_update: DateTime<Utc>,
    pub provider: Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Test,
    Single,
    All,
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "test" => Ok(OperationKind::Test),
            "single" => Ok(OperationKind::Single),
            "all" => Ok(OperationKind::All),
            other => Err(format!("unknown operation '{}', expected test|single|all", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEstimate {
    pub cost: u32,
    pub affordable: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageHistoryPoint {
    pub date: NaiveDate,
    /// `MM/dd` label for charts
    pub label: String,
    pub calls: u32,
}

/// Read-only statistics derived from the usage ledger.
///
/// Nothing here fails: an unusable daily limit reports as fully consumed.
pub struct UsageAdvisor {
    ledger: Arc<UsageLedger>,
    daily_limit: u32,
    stock_symbol_count: u32,
}

const MINUTE_WINDOW_SECS: i64 = 60;
const HISTORY_DAYS: i64 = 7;

impl UsageAdvisor {
    pub fn new(ledger: Arc<UsageLedger>, daily_limit: u32, stock_symbol_count: usize) -> Self {
        Self {
            ledger,
            daily_limit,
            stock_symbol_count: u32::try_from(stock_symbol_count).unwrap_or(u32::MAX),
        }
    }

    pub async fn todays_stats(&self) -> UsageStats {
        let now = self.ledger.now();
        let today = self.ledger.todays_calls().await;
        let total_calls_today = billable_cost(&today);

        UsageStats {
            total_calls_today,
            remaining_calls_today: self.daily_limit.saturating_sub(total_calls_today),
            daily_limit: self.daily_limit,
            reset_time: self.ledger.calendar().start_of_next_day(now),
            cost_analysis: self.cost_analysis(now),
            today,
        }
    }

    fn cost_analysis(&self, now: DateTime<Utc>) -> CostAnalysis {
        CostAnalysis {
            test_connection: 1,
            single_refresh: 1,
            all_refresh: self.stock_symbol_count,
            next_scheduled_update: Some(self.next_scheduled_update(now)),
        }
    }

    /// Tomorrow at market open (09:30)
    fn next_scheduled_update(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let calendar = self.ledger.calendar();
        let tomorrow = calendar.date_of(now) + Duration::days(1);
        let market_open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN);
        calendar.at(tomorrow, market_open)
    }

    pub async fn rate_limit_status(&self) -> RateLimitStatus {
        let total = billable_cost(&self.ledger.todays_calls().await);
        let percentage = if self.daily_limit == 0 {
            100.0
        } else {
            f64::from(total) * 100.0 / f64::from(self.daily_limit)
        };

        let window_start = self.ledger.now() - Duration::seconds(MINUTE_WINDOW_SECS);
        let recent = self.ledger.calls_since(window_start).await;
        let calls_in_last_minute = recent
            .iter()
            .filter(|call| call.provider == Provider::AlphaVantage && !call.from_cache)
            .map(|call| call.cost)
            .sum();

        RateLimitStatus {
            daily: DailyLimitStatus {
                status: LimitStatus::for_daily_percentage(percentage),
                percentage,
            },
            minute: MinuteLimitStatus {
                status: LimitStatus::for_minute_calls(
                    calls_in_last_minute,
                    Provider::AlphaVantage.limits().minute_limit,
                ),
                calls_in_last_minute,
            },
        }
    }

    /// Keys fetched live today, with their most recent successful fetch
    pub async fn live_data_indicators(&self) -> BTreeMap<String, LiveIndicator> {
        let mut indicators: BTreeMap<String, LiveIndicator> = BTreeMap::new();

        for call in self.ledger.todays_calls().await {
            if !call.success || call.from_cache {
                continue;
            }
            let Some(key) = call.key else { continue };

            let newer = indicators
                .get(&key)
                .map_or(true, |existing| call.timestamp > existing.last_update);
            if newer {
                indicators.insert(
                    key,
                    LiveIndicator {
                        is_live: true,
                        last_update: call.timestamp,
                        provider: call.provider,
                    },
                );
            }
        }

        indicators
    }

    pub async fn estimate_operation_cost(&self, operation: OperationKind) -> OperationEstimate {
        let stats = self.todays_stats().await;
        let analysis = &stats.cost_analysis;

        let (cost, description) = match operation {
            OperationKind::Test => (analysis.test_connection, "Test API connection (1 call)".to_string()),
            OperationKind::Single => (analysis.single_refresh, "Refresh 1 stock (1 call)".to_string()),
            OperationKind::All => (
                analysis.all_refresh,
                format!("Refresh all stocks ({} calls)", analysis.all_refresh),
            ),
        };

        OperationEstimate {
            cost,
            affordable: cost <= stats.remaining_calls_today,
            description,
        }
    }

    /// One point per day for the trailing week, oldest first
    pub async fn usage_history(&self) -> Vec<UsageHistoryPoint> {
        let calendar = *self.ledger.calendar();
        let calls = self.ledger.all_calls().await;

        calendar
            .trailing_dates(self.ledger.now(), HISTORY_DAYS)
            .into_iter()
            .map(|date| {
                let calls = calls
                    .iter()
                    .filter(|call| !call.from_cache && calendar.date_of(call.timestamp) == date)
                    .map(|call| call.cost)
                    .sum();
                UsageHistoryPoint {
                    date,
                    label: date.format("%m/%d").to_string(),
                    calls,
                }
            })
            .collect()
    }
}

/// Quota units consumed by calls that actually went out
fn billable_cost(calls: &[ApiCallRecord]) -> u32 {
    calls.iter().filter(|call| !call.from_cache).map(|call| call.cost).sum()
}
