//! Order book state engine
//!
//! Reconstructs and maintains consistent, bounded, per-symbol limit order
//! books from a REST snapshot plus a stream of incremental diffs, recovers
//! from sequence gaps and transport failures, and derives microstructure
//! metrics from the book state.

pub mod adapter;
pub mod collector;
pub mod config;
pub mod error;
pub mod orderbook;
pub mod sync;

pub use adapter::{BinanceAdapter, DepthDiff, DepthSnapshot, ExchangeAdapter};
pub use collector::{
    CallbackHandle, EnhancedOrderBookCollector, MetricsCallback, OrderBookCollector,
};
pub use config::{BackoffConfig, Config};
pub use error::{MarketDataError, Result};
pub use orderbook::{
    OrderBook, OrderBookAnalyzer, OrderBookMetrics, OrderBookSnapshot, PriceLevel, Side,
};
pub use sync::{BinanceClient, BookSyncController, DiffStream, ExchangeClient, SyncState};
