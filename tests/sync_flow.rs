//! End-to-end sync flow against a channel-driven mock exchange

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

use orderbook_engine::{
    Config, DepthDiff, DepthSnapshot, DiffStream, EnhancedOrderBookCollector, ExchangeClient,
    MarketDataError, OrderBookCollector, PriceLevel, Result, SyncState,
};

/// Exchange served entirely from test-controlled channels: snapshots are
/// handed out one per fetch, and each connect consumes one queued stream.
/// Connecting with no stream queued fails like a refused socket.
struct MockExchange {
    snapshot_rx: Mutex<mpsc::UnboundedReceiver<DepthSnapshot>>,
    streams: std::sync::Mutex<VecDeque<mpsc::UnboundedReceiver<DepthDiff>>>,
    fetch_count: AtomicU64,
}

impl MockExchange {
    /// Queue a fresh stream; the returned sender feeds it
    fn push_stream(&self) -> mpsc::UnboundedSender<DepthDiff> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<DepthDiff>,
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn fetch_snapshot(&self, _symbol: &str, _depth: usize) -> Result<DepthSnapshot> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.snapshot_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MarketDataError::Transport("snapshot source closed".into()))
    }

    async fn open_diff_stream(&self, _symbol: &str) -> Result<Box<dyn DiffStream>> {
        let rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| MarketDataError::Transport("connection refused".into()))?;
        Ok(Box::new(MockStream { rx }))
    }
}

#[async_trait]
impl DiffStream for MockStream {
    async fn next_diff(&mut self) -> Result<Option<DepthDiff>> {
        match self.rx.recv().await {
            Some(diff) => Ok(Some(diff)),
            None => Err(MarketDataError::Transport("stream ended".into())),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

struct Harness {
    collector: Arc<OrderBookCollector>,
    exchange: Arc<MockExchange>,
    snapshot_tx: mpsc::UnboundedSender<DepthSnapshot>,
    diff_tx: mpsc::UnboundedSender<DepthDiff>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.symbols = vec!["BTCUSDT".to_string()];
    config.depth_limit = 5;
    config.callback_interval_ms = 10;
    config.rest_min_interval_ms = 1;
    config.backoff.base_delay_ms = 10;
    config.backoff.max_delay_ms = 50;
    config
}

fn harness(config: Config) -> Harness {
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();

    let exchange = Arc::new(MockExchange {
        snapshot_rx: Mutex::new(snapshot_rx),
        streams: std::sync::Mutex::new(VecDeque::new()),
        fetch_count: AtomicU64::new(0),
    });
    let diff_tx = exchange.push_stream();

    let client: Arc<dyn ExchangeClient> = exchange.clone();
    let collector = Arc::new(OrderBookCollector::new(config, client).unwrap());

    Harness {
        collector,
        exchange,
        snapshot_tx,
        diff_tx,
    }
}

fn snapshot(sequence: u64) -> DepthSnapshot {
    DepthSnapshot {
        sequence,
        bids: vec![
            PriceLevel::new(dec!(100.0), dec!(1.0)),
            PriceLevel::new(dec!(99.5), dec!(2.0)),
        ],
        asks: vec![
            PriceLevel::new(dec!(101.0), dec!(1.0)),
            PriceLevel::new(dec!(101.5), dec!(2.0)),
        ],
    }
}

fn diff(first: u64, last: u64) -> DepthDiff {
    DepthDiff {
        symbol: "BTCUSDT".to_string(),
        event_time: 0,
        first_update_id: first,
        final_update_id: last,
        bids: vec![PriceLevel::new(dec!(100.0), dec!(3.0))],
        asks: vec![],
    }
}

async fn wait_for_sequence(collector: &OrderBookCollector, sequence: u64) {
    timeout(Duration::from_secs(5), async {
        loop {
            let snap = collector.get_order_book("BTCUSDT", None).await.unwrap();
            if snap.sequence == sequence {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("book never reached sequence {}", sequence));
}

async fn wait_for_state(collector: &OrderBookCollector, state: SyncState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if collector.sync_state("BTCUSDT").unwrap() == state {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("controller never reached {:?}", state));
}

#[tokio::test]
async fn snapshot_plus_contiguous_diffs_advance_the_book() {
    let h = harness(test_config());
    h.snapshot_tx.send(snapshot(1)).unwrap();

    h.collector.start().await;
    wait_for_state(&h.collector, SyncState::Streaming).await;

    for seq in 2..=4 {
        h.diff_tx.send(diff(seq, seq)).unwrap();
    }
    wait_for_sequence(&h.collector, 4).await;

    let snap = h.collector.get_order_book("BTCUSDT", None).await.unwrap();
    assert_eq!(snap.sequence, 4);
    assert_eq!(snap.bids[0].quantity, dec!(3.0));
    assert_eq!(h.exchange.fetch_count.load(Ordering::SeqCst), 1);
    assert_eq!(h.collector.gap_count("BTCUSDT").unwrap(), 0);

    h.collector.stop().await;
}

#[tokio::test]
async fn gap_triggers_resync_with_one_snapshot_fetch() {
    let h = harness(test_config());
    h.snapshot_tx.send(snapshot(1)).unwrap();

    h.collector.start().await;
    for seq in 2..=4 {
        h.diff_tx.send(diff(seq, seq)).unwrap();
    }
    wait_for_sequence(&h.collector, 4).await;

    // 10-id gap; no snapshot is queued yet, so the controller parks in
    // Resyncing with the stale book discarded
    h.diff_tx.send(diff(15, 15)).unwrap();
    wait_for_state(&h.collector, SyncState::Resyncing).await;
    assert_eq!(h.collector.gap_count("BTCUSDT").unwrap(), 1);

    let snap = h.collector.get_order_book("BTCUSDT", None).await.unwrap();
    assert!(snap.is_empty(), "old book state must be discarded");

    // Serve the recovery snapshot: exactly one extra fetch
    h.snapshot_tx.send(snapshot(20)).unwrap();
    wait_for_state(&h.collector, SyncState::Streaming).await;
    wait_for_sequence(&h.collector, 20).await;
    assert_eq!(h.exchange.fetch_count.load(Ordering::SeqCst), 2);

    // Contiguous streaming resumes on the same connection
    h.diff_tx.send(diff(21, 21)).unwrap();
    wait_for_sequence(&h.collector, 21).await;

    h.collector.stop().await;
}

#[tokio::test]
async fn stale_diffs_buffered_during_sync_are_dropped() {
    let h = harness(test_config());

    // Diffs already covered by the snapshot arrive first
    h.diff_tx.send(diff(2, 3)).unwrap();
    h.diff_tx.send(diff(4, 5)).unwrap();
    h.snapshot_tx.send(snapshot(5)).unwrap();

    h.collector.start().await;
    wait_for_state(&h.collector, SyncState::Streaming).await;

    let snap = h.collector.get_order_book("BTCUSDT", None).await.unwrap();
    assert_eq!(snap.sequence, 5);
    assert_eq!(snap.bids[0].quantity, dec!(1.0), "covered diffs must not replay");

    h.collector.stop().await;
}

#[tokio::test]
async fn buffered_diff_spanning_the_snapshot_replays() {
    let h = harness(test_config());

    h.diff_tx.send(diff(5, 7)).unwrap();
    h.snapshot_tx.send(snapshot(5)).unwrap();

    h.collector.start().await;
    wait_for_state(&h.collector, SyncState::Streaming).await;
    wait_for_sequence(&h.collector, 7).await;

    h.collector.stop().await;
}

#[tokio::test]
async fn unusable_snapshot_is_refetched() {
    let h = harness(test_config());

    // The buffered diff starts past the first snapshot's sequence + 1
    h.diff_tx.send(diff(10, 11)).unwrap();
    h.snapshot_tx.send(snapshot(1)).unwrap();
    h.snapshot_tx.send(snapshot(12)).unwrap();

    h.collector.start().await;
    wait_for_state(&h.collector, SyncState::Streaming).await;

    let snap = h.collector.get_order_book("BTCUSDT", None).await.unwrap();
    assert_eq!(snap.sequence, 12);
    assert_eq!(h.exchange.fetch_count.load(Ordering::SeqCst), 2);

    h.collector.stop().await;
}

#[tokio::test]
async fn transport_failure_reconnects_and_flags_health() {
    let mut config = test_config();
    config.backoff.max_attempts = 2;
    let h = harness(config);
    h.snapshot_tx.send(snapshot(1)).unwrap();

    h.collector.start().await;
    wait_for_state(&h.collector, SyncState::Streaming).await;
    assert!(h.collector.is_healthy("BTCUSDT").unwrap());
    assert_eq!(h.exchange.fetch_count.load(Ordering::SeqCst), 1);

    // Tear the connection down mid-stream; with no replacement queued,
    // every reconnect attempt fails and backoff keeps running
    drop(h.diff_tx);
    wait_for_state(&h.collector, SyncState::Reconnecting).await;

    timeout(Duration::from_secs(5), async {
        while h.collector.is_healthy("BTCUSDT").unwrap() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("symbol should go unhealthy once attempts exceed the maximum");

    // Service returns: a fresh stream plus snapshot completes a new session
    let diff_tx = h.exchange.push_stream();
    h.snapshot_tx.send(snapshot(30)).unwrap();

    wait_for_state(&h.collector, SyncState::Streaming).await;
    wait_for_sequence(&h.collector, 30).await;
    assert!(h.collector.is_healthy("BTCUSDT").unwrap());
    assert_eq!(h.exchange.fetch_count.load(Ordering::SeqCst), 2);

    // Streaming resumes on the new connection
    diff_tx.send(diff(31, 31)).unwrap();
    wait_for_sequence(&h.collector, 31).await;

    h.collector.stop().await;
}

#[tokio::test]
async fn stop_reaches_terminal_state_and_is_idempotent() {
    let h = harness(test_config());
    h.snapshot_tx.send(snapshot(1)).unwrap();

    h.collector.start().await;
    wait_for_state(&h.collector, SyncState::Streaming).await;

    h.collector.stop().await;
    assert_eq!(
        h.collector.sync_state("BTCUSDT").unwrap(),
        SyncState::Stopped
    );

    // Diffs after stop must not mutate the book
    let before = h.collector.get_order_book("BTCUSDT", None).await.unwrap();
    let _ = h.diff_tx.send(diff(2, 2));
    sleep(Duration::from_millis(30)).await;
    let after = h.collector.get_order_book("BTCUSDT", None).await.unwrap();
    assert_eq!(before.sequence, after.sequence);

    h.collector.stop().await;
}

#[tokio::test]
async fn callback_failure_is_isolated_from_other_subscribers() {
    let h = harness(test_config());
    h.snapshot_tx.send(snapshot(1)).unwrap();

    let collector = Arc::try_unwrap(h.collector).ok().expect("sole owner");
    let enhanced = Arc::new(EnhancedOrderBookCollector::new(collector));

    let failing_calls = Arc::new(AtomicU64::new(0));
    let good_calls = Arc::new(AtomicU64::new(0));

    let counter = failing_calls.clone();
    enhanced
        .register_callback(
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("subscriber exploded")
            }),
            Some("BTCUSDT"),
        )
        .await
        .unwrap();

    let counter = good_calls.clone();
    enhanced
        .register_callback(
            Arc::new(move |snapshot, metrics| {
                assert_eq!(snapshot.symbol, "BTCUSDT");
                assert!(metrics.liquidity_score.is_finite());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            None,
        )
        .await
        .unwrap();

    enhanced.start().await;

    timeout(Duration::from_secs(5), async {
        while good_calls.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("good subscriber should keep receiving ticks");

    // The failing callback ran on the same ticks and never stopped the loop
    assert!(failing_calls.load(Ordering::SeqCst) >= 3);

    enhanced.stop().await;
    assert_eq!(
        enhanced.collector().sync_state("BTCUSDT").unwrap(),
        SyncState::Stopped
    );
}
