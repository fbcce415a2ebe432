//! API usage accounting: the persisted call ledger and the statistics derived from it.

pub mod advisor;
pub mod ledger;

pub use advisor::{
    CostAnalysis, LimitStatus, LiveIndicator, OperationEstimate, OperationKind, RateLimitStatus, UsageAdvisor,
    UsageHistoryPoint, UsageStats,
};
pub use ledger::{UsageLedger, RETENTION_DAYS};
