//! Order book collector
//!
//! Owns one sync controller and one book per configured symbol and exposes
//! the query surface. Symbol membership is fixed at construction; lifecycle
//! is tied to `start()`/`stop()`.

mod enhanced;

pub use enhanced::{CallbackHandle, EnhancedOrderBookCollector, MetricsCallback};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MarketDataError, Result};
use crate::orderbook::{OrderBook, OrderBookAnalyzer, OrderBookMetrics, OrderBookSnapshot};
use crate::sync::{BookSyncController, ExchangeClient, RestRateLimiter, SyncState};

/// Per-symbol state owned by the collector
struct SymbolHandle {
    book: Arc<RwLock<OrderBook>>,
    analyzer: Mutex<OrderBookAnalyzer>,
    state_tx: Arc<watch::Sender<SyncState>>,
    state_rx: watch::Receiver<SyncState>,
    healthy: Arc<AtomicBool>,
    gap_count: Arc<AtomicU64>,
    runtime: Mutex<Option<RunningController>>,
}

struct RunningController {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns a book and sync controller per symbol; query surface is uniform
/// regardless of each symbol's sync state.
pub struct OrderBookCollector {
    config: Arc<Config>,
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<RestRateLimiter>,
    symbols: HashMap<String, SymbolHandle>,
}

impl OrderBookCollector {
    /// Build a collector for the configured symbols
    ///
    /// Configuration errors are fatal here; everything after construction is
    /// recoverable.
    pub fn new(config: Config, client: Arc<dyn ExchangeClient>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let limiter = Arc::new(RestRateLimiter::new(config.rest_min_interval()));

        let symbols = config
            .symbols
            .iter()
            .map(|symbol| {
                let (state_tx, state_rx) = watch::channel(SyncState::Uninitialized);
                let handle = SymbolHandle {
                    book: Arc::new(RwLock::new(OrderBook::new(symbol, config.depth_limit))),
                    analyzer: Mutex::new(OrderBookAnalyzer::new(symbol, config.metrics_window)),
                    state_tx: Arc::new(state_tx),
                    state_rx,
                    healthy: Arc::new(AtomicBool::new(true)),
                    gap_count: Arc::new(AtomicU64::new(0)),
                    runtime: Mutex::new(None),
                };
                (symbol.clone(), handle)
            })
            .collect();

        Ok(Self {
            config,
            client,
            limiter,
            symbols,
        })
    }

    /// Spawn one sync controller per symbol; no-op for symbols already
    /// running.
    pub async fn start(&self) {
        for (symbol, handle) in &self.symbols {
            let mut runtime = handle.runtime.lock().await;
            if runtime.is_some() {
                continue;
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let controller = BookSyncController::new(
                symbol.clone(),
                self.config.depth_limit,
                self.config.backoff.clone(),
                self.client.clone(),
                self.limiter.clone(),
                handle.book.clone(),
                handle.state_tx.clone(),
                handle.healthy.clone(),
                handle.gap_count.clone(),
                shutdown_rx,
            );

            let task = tokio::spawn(controller.run());
            *runtime = Some(RunningController { shutdown_tx, task });
            info!(symbol = %symbol, "Started sync controller");
        }
    }

    /// Signal every controller to stop and await their completion
    ///
    /// No task mutates state after this resolves. Idempotent.
    pub async fn stop(&self) {
        for (symbol, handle) in &self.symbols {
            let running = handle.runtime.lock().await.take();
            if let Some(running) = running {
                let _ = running.shutdown_tx.send(true);
                if let Err(e) = running.task.await {
                    warn!(symbol = %symbol, error = %e, "Sync controller task failed");
                }
                info!(symbol = %symbol, "Stopped sync controller");
            }
        }
    }

    fn handle(&self, symbol: &str) -> Result<&SymbolHandle> {
        self.symbols
            .get(symbol)
            .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))
    }

    /// Point-in-time snapshot of one symbol's book
    ///
    /// A book that has not finished syncing yields a valid empty snapshot;
    /// only unconfigured symbols are errors.
    pub async fn get_order_book(
        &self,
        symbol: &str,
        depth: Option<usize>,
    ) -> Result<OrderBookSnapshot> {
        let handle = self.handle(symbol)?;
        Ok(handle.book.read().await.snapshot(depth))
    }

    /// Metrics over the current snapshot
    ///
    /// `levels` defaults to the configured `metrics_levels`; `price_range`
    /// optionally restricts depth aggregation to `mid ± range`.
    pub async fn get_metrics(
        &self,
        symbol: &str,
        price_range: Option<Decimal>,
        levels: Option<usize>,
    ) -> Result<OrderBookMetrics> {
        let handle = self.handle(symbol)?;
        let snapshot = handle.book.read().await.snapshot(None);
        let levels = levels.unwrap_or(self.config.metrics_levels);
        handle
            .analyzer
            .lock()
            .await
            .compute(&snapshot, levels, price_range)
    }

    /// Current sync state for a symbol
    pub fn sync_state(&self, symbol: &str) -> Result<SyncState> {
        Ok(*self.handle(symbol)?.state_rx.borrow())
    }

    /// Watch receiver for a symbol's state transitions
    pub fn watch_sync_state(&self, symbol: &str) -> Result<watch::Receiver<SyncState>> {
        Ok(self.handle(symbol)?.state_rx.clone())
    }

    /// False once reconnect attempts exceed the configured maximum; reset on
    /// the next successful sync.
    pub fn is_healthy(&self, symbol: &str) -> Result<bool> {
        Ok(self.handle(symbol)?.healthy.load(Ordering::Relaxed))
    }

    /// Sequence gaps observed on a symbol's stream since start
    pub fn gap_count(&self, symbol: &str) -> Result<u64> {
        Ok(self.handle(symbol)?.gap_count.load(Ordering::Relaxed))
    }

    /// Configured symbols
    pub fn symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DepthSnapshot;
    use crate::sync::DiffStream;
    use async_trait::async_trait;

    /// Client that must never be reached (collector not started)
    struct UnreachableClient;

    #[async_trait]
    impl ExchangeClient for UnreachableClient {
        async fn fetch_snapshot(&self, _symbol: &str, _depth: usize) -> Result<DepthSnapshot> {
            panic!("unexpected snapshot fetch");
        }

        async fn open_diff_stream(&self, _symbol: &str) -> Result<Box<dyn DiffStream>> {
            panic!("unexpected stream open");
        }
    }

    fn collector() -> OrderBookCollector {
        let mut config = Config::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        OrderBookCollector::new(config, Arc::new(UnreachableClient)).unwrap()
    }

    #[tokio::test]
    async fn unknown_symbol_is_an_error() {
        let collector = collector();
        assert!(matches!(
            collector.get_order_book("ETHUSDT", None).await,
            Err(MarketDataError::UnknownSymbol(_))
        ));
        assert!(matches!(
            collector.get_metrics("ETHUSDT", None, None).await,
            Err(MarketDataError::UnknownSymbol(_))
        ));
    }

    #[tokio::test]
    async fn unsynced_book_yields_empty_snapshot_not_error() {
        let collector = collector();
        let snapshot = collector.get_order_book("BTCUSDT", None).await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.sequence, 0);
        assert_eq!(collector.sync_state("BTCUSDT").unwrap(), SyncState::Uninitialized);
    }

    #[tokio::test]
    async fn metrics_on_empty_book_fail_with_empty_book() {
        let collector = collector();
        assert!(matches!(
            collector.get_metrics("BTCUSDT", None, None).await,
            Err(MarketDataError::EmptyBook(_))
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_fatal_at_construction() {
        let mut config = Config::default();
        config.depth_limit = 0;
        assert!(OrderBookCollector::new(config, Arc::new(UnreachableClient)).is_err());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let collector = collector();
        collector.stop().await;
        collector.stop().await;
    }
}
