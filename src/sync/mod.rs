//! Book synchronization: transport, rate limiting and the per-symbol
//! sync state machine.

mod controller;
mod limiter;
mod transport;

pub use controller::{BookSyncController, SyncState};
pub use limiter::RestRateLimiter;
pub use transport::{BinanceClient, DiffStream, ExchangeClient};
