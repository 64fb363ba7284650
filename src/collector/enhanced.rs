//! Periodic metrics fan-out
//!
//! Wraps the collector with a subscription registry and one emission task
//! per symbol. Emission pulls the current (snapshot, metrics) pair on a
//! fixed interval, decoupled from the book's update cadence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::error::{MarketDataError, Result};
use crate::orderbook::{OrderBookMetrics, OrderBookSnapshot};

use super::OrderBookCollector;

/// Subscriber callback; an `Err` is logged and isolated to that subscriber
pub type MetricsCallback =
    Arc<dyn Fn(&OrderBookSnapshot, &OrderBookMetrics) -> anyhow::Result<()> + Send + Sync>;

/// Identity of a registered callback, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

/// Ordered per-symbol callback registry; insertion order is fan-out order
type Registry = HashMap<String, Vec<(u64, MetricsCallback)>>;

struct RunningEmitter {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Collector plus periodic (snapshot, metrics) emission to subscribers
pub struct EnhancedOrderBookCollector {
    collector: Arc<OrderBookCollector>,
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
    emitters: Mutex<Vec<RunningEmitter>>,
}

impl EnhancedOrderBookCollector {
    pub fn new(collector: OrderBookCollector) -> Self {
        let registry = collector
            .symbols()
            .into_iter()
            .map(|symbol| (symbol, Vec::new()))
            .collect();

        Self {
            collector: Arc::new(collector),
            registry: Arc::new(RwLock::new(registry)),
            next_id: AtomicU64::new(1),
            emitters: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped collector, for direct queries
    pub fn collector(&self) -> &OrderBookCollector {
        &self.collector
    }

    /// Register a callback for one symbol, or for every configured symbol
    /// when `symbol` is `None`
    pub async fn register_callback(
        &self,
        callback: MetricsCallback,
        symbol: Option<&str>,
    ) -> Result<CallbackHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.write().await;

        match symbol {
            Some(symbol) => {
                let callbacks = registry
                    .get_mut(symbol)
                    .ok_or_else(|| MarketDataError::UnknownSymbol(symbol.to_string()))?;
                callbacks.push((id, callback));
            }
            None => {
                for callbacks in registry.values_mut() {
                    callbacks.push((id, callback.clone()));
                }
            }
        }

        Ok(CallbackHandle(id))
    }

    /// Remove a callback everywhere it was registered; a no-op for handles
    /// that were never (or already un-) registered
    pub async fn unregister_callback(&self, handle: CallbackHandle) {
        let mut registry = self.registry.write().await;
        for callbacks in registry.values_mut() {
            callbacks.retain(|(id, _)| *id != handle.0);
        }
    }

    /// Start the collector and one emission task per symbol; idempotent
    pub async fn start(&self) {
        self.collector.start().await;

        let mut emitters = self.emitters.lock().await;
        if !emitters.is_empty() {
            return;
        }

        for symbol in self.collector.symbols() {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(emission_loop(
                symbol,
                self.collector.clone(),
                self.registry.clone(),
                shutdown_rx,
            ));
            emitters.push(RunningEmitter { shutdown_tx, task });
        }
    }

    /// Stop emission tasks, then the collector; idempotent
    pub async fn stop(&self) {
        let emitters: Vec<RunningEmitter> = self.emitters.lock().await.drain(..).collect();
        for emitter in emitters {
            let _ = emitter.shutdown_tx.send(true);
            let _ = emitter.task.await;
        }
        self.collector.stop().await;
    }
}

/// One symbol's periodic pull-and-fan-out loop
async fn emission_loop(
    symbol: String,
    collector: Arc<OrderBookCollector>,
    registry: Arc<RwLock<Registry>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(collector.config().callback_interval());

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                emit_once(&symbol, &collector, &registry).await;
            }
        }
    }
}

async fn emit_once(
    symbol: &str,
    collector: &OrderBookCollector,
    registry: &RwLock<Registry>,
) {
    let snapshot = match collector.get_order_book(symbol, None).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(symbol = %symbol, error = %e, "Skipping emission tick");
            return;
        }
    };

    let metrics = match collector.get_metrics(symbol, None, None).await {
        Ok(metrics) => metrics,
        // Book not populated yet: freshness degrades, no error surfaces
        Err(MarketDataError::EmptyBook(_)) => return,
        Err(e) => {
            debug!(symbol = %symbol, error = %e, "Skipping emission tick");
            return;
        }
    };

    let callbacks: Vec<(u64, MetricsCallback)> = registry
        .read()
        .await
        .get(symbol)
        .map(|v| v.to_vec())
        .unwrap_or_default();

    for (id, callback) in callbacks {
        // A failing subscriber never blocks the rest of the tick
        if let Err(e) = callback(&snapshot, &metrics) {
            warn!(symbol = %symbol, callback_id = id, error = %e, "Subscriber callback failed");
        }
    }
}
