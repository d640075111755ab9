use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("daily budget exceeded: limit={limit} consumed={consumed}")]
    BudgetExceeded { limit: u64, consumed: u64 },
    #[error("insufficient funds: balance_micros={balance_micros} required_micros={required_micros}")]
    InsufficientFunds {
        balance_micros: u64,
        required_micros: u64,
    },
    #[error("no pricing configured for feature {feature}")]
    UnpricedFeature { feature: String },
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },
}

pub type Result<T> = std::result::Result<T, MeterError>;
