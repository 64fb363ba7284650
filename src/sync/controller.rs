//! Per-symbol sync state machine
//!
//! Reconstructs one symbol's book from a REST snapshot plus the diff stream,
//! validates sequence continuity, resyncs on gaps and reconnects with backoff
//! on transport failure. All book mutation happens on this task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapter::DepthDiff;
use crate::config::BackoffConfig;
use crate::error::{MarketDataError, Result};
use crate::orderbook::OrderBook;
use crate::sync::limiter::RestRateLimiter;
use crate::sync::transport::{DiffStream, ExchangeClient};

/// Controller lifecycle, observable through a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Syncing,
    Streaming,
    Resyncing,
    Reconnecting,
    Stopped,
}

/// Outcome of the snapshot-plus-buffer procedure
enum Flow {
    Streaming,
    Stopped,
}

/// Per-symbol book synchronization controller
pub struct BookSyncController {
    symbol: String,
    depth_limit: usize,
    backoff: BackoffConfig,
    client: Arc<dyn ExchangeClient>,
    limiter: Arc<RestRateLimiter>,
    book: Arc<RwLock<OrderBook>>,
    state_tx: Arc<watch::Sender<SyncState>>,
    healthy: Arc<AtomicBool>,
    gap_count: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
    reconnect_attempts: u32,
}

impl BookSyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        depth_limit: usize,
        backoff: BackoffConfig,
        client: Arc<dyn ExchangeClient>,
        limiter: Arc<RestRateLimiter>,
        book: Arc<RwLock<OrderBook>>,
        state_tx: Arc<watch::Sender<SyncState>>,
        healthy: Arc<AtomicBool>,
        gap_count: Arc<AtomicU64>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            symbol,
            depth_limit,
            backoff,
            client,
            limiter,
            book,
            state_tx,
            healthy,
            gap_count,
            shutdown,
            reconnect_attempts: 0,
        }
    }

    /// Drive the state machine until stop is signalled
    ///
    /// Transport failures and sequence gaps are recoverable and retried
    /// forever; nothing here is fatal.
    pub async fn run(mut self) {
        loop {
            if self.stop_requested() {
                break;
            }

            match self.session().await {
                Ok(()) => break,
                Err(e) => {
                    if self.stop_requested() {
                        break;
                    }
                    self.set_state(SyncState::Reconnecting);
                    warn!(symbol = %self.symbol, error = %e, "Transport failure, reconnecting");
                    if self.backoff_delay().await {
                        break;
                    }
                }
            }
        }

        self.set_state(SyncState::Stopped);
        info!(symbol = %self.symbol, "Sync controller stopped");
    }

    /// One connection lifetime: sync, then stream until stop or failure
    ///
    /// `Ok(())` means stop was requested; any transport problem surfaces as
    /// `Err` and the caller reconnects.
    async fn session(&mut self) -> Result<()> {
        self.set_state(SyncState::Syncing);

        // The stream is opened before the snapshot fetch so diffs arriving
        // while the fetch is in flight are buffered, not lost.
        let mut stream = self.client.open_diff_stream(&self.symbol).await?;

        match self.sync_from_snapshot(stream.as_mut()).await {
            Ok(Flow::Stopped) => {
                stream.close().await;
                return Ok(());
            }
            Ok(Flow::Streaming) => {}
            Err(e) => {
                stream.close().await;
                return Err(e);
            }
        }

        self.set_state(SyncState::Streaming);
        self.healthy.store(true, Ordering::Relaxed);
        self.reconnect_attempts = 0;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.stop_requested() {
                        stream.close().await;
                        return Ok(());
                    }
                }
                diff = stream.next_diff() => match diff {
                    Ok(Some(diff)) => {
                        match self.handle_diff(diff, stream.as_mut()).await {
                            Ok(Flow::Streaming) => {}
                            Ok(Flow::Stopped) => {
                                stream.close().await;
                                return Ok(());
                            }
                            Err(e) => {
                                stream.close().await;
                                return Err(e);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stream.close().await;
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Validate one streamed diff against the book sequence and apply it
    async fn handle_diff(&mut self, diff: DepthDiff, stream: &mut dyn DiffStream) -> Result<Flow> {
        let last_update_id = self.book.read().await.last_update_id();

        if diff.first_update_id > last_update_id + 1 {
            let gap = MarketDataError::SequenceGap {
                expected: last_update_id + 1,
                got: diff.first_update_id,
            };
            self.gap_count.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %self.symbol, error = %gap, "Sequence gap detected, resyncing");
            self.set_state(SyncState::Resyncing);
            // Stale state goes before the fresh snapshot arrives
            self.book.write().await.clear();

            let flow = self.sync_from_snapshot(stream).await?;
            if matches!(flow, Flow::Streaming) {
                self.set_state(SyncState::Streaming);
            }
            return Ok(flow);
        }

        let mut book = self.book.write().await;
        match book.apply_diff(&diff) {
            Ok(()) => {
                if book.is_crossed() {
                    warn!(symbol = %self.symbol, "Book is crossed after diff");
                }
            }
            Err(MarketDataError::StaleUpdate { final_update_id, last_update_id }) => {
                debug!(
                    symbol = %self.symbol,
                    final_update_id,
                    last_update_id,
                    "Dropping stale diff"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(Flow::Streaming)
    }

    /// Fetch a snapshot through the shared rate limiter while draining the
    /// stream into a buffer, then seed the book and replay the buffer.
    ///
    /// Repeats the fetch when the buffered diffs already start past the
    /// snapshot's sequence (the snapshot was unusable on arrival).
    async fn sync_from_snapshot(&mut self, stream: &mut dyn DiffStream) -> Result<Flow> {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.stop_requested() {
                        return Ok(Flow::Stopped);
                    }
                }
                _ = self.limiter.acquire() => {}
            }

            let snapshot_fut = self.client.fetch_snapshot(&self.symbol, self.depth_limit);
            tokio::pin!(snapshot_fut);

            let mut buffered: Vec<DepthDiff> = Vec::new();
            let snapshot = loop {
                tokio::select! {
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || self.stop_requested() {
                            return Ok(Flow::Stopped);
                        }
                    }
                    snapshot = &mut snapshot_fut => break snapshot?,
                    diff = stream.next_diff() => match diff? {
                        Some(diff) => buffered.push(diff),
                        None => {}
                    },
                }
            };

            // Diffs the snapshot already covers are dropped
            buffered.retain(|d| d.final_update_id > snapshot.sequence);

            let mut gap_in_buffer = false;
            {
                let mut book = self.book.write().await;
                book.apply_snapshot(&snapshot);
                for diff in &buffered {
                    if diff.first_update_id > book.last_update_id() + 1 {
                        gap_in_buffer = true;
                        book.clear();
                        break;
                    }
                    if let Err(MarketDataError::StaleUpdate { .. }) = book.apply_diff(diff) {
                        debug!(symbol = %self.symbol, "Dropping stale buffered diff");
                    }
                }
            }

            if gap_in_buffer {
                warn!(
                    symbol = %self.symbol,
                    sequence = snapshot.sequence,
                    "Snapshot unusable: buffered diffs start past its sequence, refetching"
                );
                continue;
            }

            let book = self.book.read().await;
            info!(
                symbol = %self.symbol,
                sequence = book.last_update_id(),
                bid_levels = book.bid_levels(),
                ask_levels = book.ask_levels(),
                replayed = buffered.len(),
                "Order book synchronized"
            );
            if book.is_crossed() {
                warn!(symbol = %self.symbol, "Book is crossed after snapshot");
            }

            return Ok(Flow::Streaming);
        }
    }

    /// Exponential backoff with jitter; returns true when stop interrupts it
    ///
    /// Past `max_attempts` the symbol is flagged unhealthy but retries keep
    /// going at the capped interval.
    async fn backoff_delay(&mut self) -> bool {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

        if self.reconnect_attempts > self.backoff.max_attempts
            && self.healthy.swap(false, Ordering::Relaxed)
        {
            warn!(
                symbol = %self.symbol,
                attempts = self.reconnect_attempts,
                "Marking symbol unhealthy, retries continue at the capped interval"
            );
        }

        let exponent = self.reconnect_attempts.saturating_sub(1).min(16);
        let exp_delay = self
            .backoff
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.backoff.max_delay_ms);

        let jitter = self.backoff.jitter;
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        let delay = Duration::from_millis((exp_delay as f64 * factor).max(0.0) as u64);

        warn!(
            symbol = %self.symbol,
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Backing off before reconnect"
        );

        tokio::select! {
            changed = self.shutdown.changed() => changed.is_err() || self.stop_requested(),
            _ = sleep(delay) => false,
        }
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, state: SyncState) {
        debug!(symbol = %self.symbol, state = ?state, "Sync state change");
        let _ = self.state_tx.send(state);
    }
}
