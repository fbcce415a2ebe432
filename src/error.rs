use thiserror::Error;

/// Failures while talking to a price provider.
///
/// None of these escape a provider client: they are turned into a failed
/// `PriceUpdateResult`, recorded in the usage ledger and, where possible,
/// answered from stale cache.
#[derive(Debug, Error)]
pub enum PriceError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("API Error: {0}")]
    Provider(String),

    #[error("API call frequency limit reached. Please try again later.")]
    RateLimited(String),

    #[error("No price data found for {0}")]
    DataAbsent(String),

    #[error("Invalid response format: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for PriceError {
    fn from(e: serde_json::Error) -> Self {
        PriceError::Parse(e.to_string())
    }
}

/// Failures reading or writing the durable usage snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}
