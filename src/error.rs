//! Error types for the order book engine

use thiserror::Error;

/// Order book engine errors
///
/// Only `UnknownSymbol`, `EmptyBook` and `Config` reach API callers; the
/// transient variants (`StaleUpdate`, `SequenceGap`, `Transport`, `Parse`)
/// are absorbed by the sync state machine.
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("order book for {0} has an empty side")]
    EmptyBook(String),

    #[error("stale update: final_update_id {final_update_id} <= last_update_id {last_update_id}")]
    StaleUpdate {
        final_update_id: u64,
        last_update_id: u64,
    },

    #[error("sequence gap: expected first_update_id <= {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("failed to parse message: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        MarketDataError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
