//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management. A single
//! logical writer (the owning sync controller task) serializes mutations;
//! readers obtain consistent copies via `snapshot()`.

use chrono::Utc;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{OrderBookSnapshot, PriceLevel, Side};
use crate::adapter::{DepthDiff, DepthSnapshot};
use crate::error::{MarketDataError, Result};

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Last processed update ID
    last_update_id: u64,
    /// Whether the book has been seeded with a snapshot
    initialized: bool,
    /// Maximum depth levels retained per side
    depth_limit: usize,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str, depth_limit: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            initialized: false,
            depth_limit,
        }
    }

    /// Re-seed the book wholesale from a full snapshot
    ///
    /// Replaces all levels and resets the sequence. Always succeeds; this is
    /// the recovery primitive after a gap.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in &snapshot.asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_id = snapshot.sequence;
        self.initialized = true;
        self.trim_depth();
    }

    /// Apply an incremental diff
    ///
    /// The caller is responsible for contiguity (`first_update_id <=
    /// last_update_id + 1`); the book itself only rejects diffs that do not
    /// advance the sequence. On rejection the book is unchanged.
    pub fn apply_diff(&mut self, diff: &DepthDiff) -> Result<()> {
        if diff.final_update_id <= self.last_update_id {
            return Err(MarketDataError::StaleUpdate {
                final_update_id: diff.final_update_id,
                last_update_id: self.last_update_id,
            });
        }

        for level in &diff.bids {
            self.update_side(Side::Bid, level);
        }
        for level in &diff.asks {
            self.update_side(Side::Ask, level);
        }

        self.last_update_id = diff.final_update_id;
        self.trim_depth();

        Ok(())
    }

    /// Upsert or remove a single price level. Removal is idempotent: a zero
    /// quantity for an absent price is a no-op.
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity == Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    /// Discard worst-priced levels beyond the depth limit
    fn trim_depth(&mut self) {
        while self.bids.len() > self.depth_limit {
            self.bids.pop_last();
        }
        while self.asks.len() > self.depth_limit {
            self.asks.pop_last();
        }
    }

    /// Drop all levels, keeping the sequence. Used when entering a resync so
    /// stale state is discarded before the fresh snapshot lands.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.initialized = false;
    }

    /// Best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// True when best bid meets or crosses best ask once both sides are
    /// non-empty. A crossed book is a protocol error on the feed side;
    /// surfaced as a signal, never auto-corrected.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Produce an immutable point-in-time copy of the top `depth` levels
    ///
    /// `depth` is clamped to the book's depth limit. Construction does not
    /// yield, so a copy can never observe a partially applied diff.
    pub fn snapshot(&self, depth: Option<usize>) -> OrderBookSnapshot {
        let depth = depth.unwrap_or(self.depth_limit).min(self.depth_limit);

        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            sequence: self.last_update_id,
            bids: self
                .bids
                .iter()
                .take(depth)
                .map(|(Reverse(p), q)| PriceLevel::new(*p, *q))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(p, q)| PriceLevel::new(*p, *q))
                .collect(),
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> PriceLevel {
        PriceLevel::new(price, quantity)
    }

    fn seeded_book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT", 10);
        let snapshot = DepthSnapshot {
            sequence: 100,
            bids: vec![level(dec!(50000), dec!(1.0)), level(dec!(49999), dec!(2.0))],
            asks: vec![level(dec!(50001), dec!(1.5)), level(dec!(50002), dec!(2.5))],
        };
        book.apply_snapshot(&snapshot);
        book
    }

    fn diff(first: u64, last: u64, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthDiff {
        DepthDiff {
            symbol: "BTCUSDT".to_string(),
            event_time: 0,
            first_update_id: first,
            final_update_id: last,
            bids,
            asks,
        }
    }

    #[test]
    fn best_bid_ask_after_snapshot() {
        let book = seeded_book();
        assert_eq!(book.best_bid(), Some(dec!(50000)));
        assert_eq!(book.best_ask(), Some(dec!(50001)));
        assert!(book.is_initialized());
        assert_eq!(book.last_update_id(), 100);
    }

    #[test]
    fn snapshot_drops_zero_quantity_levels() {
        let mut book = OrderBook::new("BTCUSDT", 10);
        book.apply_snapshot(&DepthSnapshot {
            sequence: 1,
            bids: vec![level(dec!(100), dec!(0)), level(dec!(99), dec!(1))],
            asks: vec![level(dec!(101), dec!(2))],
        });
        assert_eq!(book.bid_levels(), 1);
        assert_eq!(book.best_bid(), Some(dec!(99)));
    }

    #[test]
    fn snapshot_respects_depth_limit() {
        let mut book = OrderBook::new("BTCUSDT", 3);
        let bids = (0..8)
            .map(|i| level(Decimal::from(100 - i), dec!(1)))
            .collect();
        let asks = (0..8)
            .map(|i| level(Decimal::from(101 + i), dec!(1)))
            .collect();
        book.apply_snapshot(&DepthSnapshot {
            sequence: 1,
            bids,
            asks,
        });

        assert_eq!(book.bid_levels(), 3);
        assert_eq!(book.ask_levels(), 3);
        // Worst-priced levels are the ones discarded
        assert_eq!(book.best_bid(), Some(dec!(100)));
        assert_eq!(book.best_ask(), Some(dec!(101)));
    }

    #[test]
    fn diff_upserts_and_advances_sequence() {
        let mut book = seeded_book();
        let d = diff(
            101,
            102,
            vec![level(dec!(50000), dec!(3.0))],
            vec![level(dec!(50003), dec!(1.0))],
        );
        book.apply_diff(&d).unwrap();
        assert_eq!(book.last_update_id(), 102);
        assert_eq!(book.ask_levels(), 3);

        let snap = book.snapshot(None);
        assert_eq!(snap.bids[0].quantity, dec!(3.0));
    }

    #[test]
    fn zero_quantity_removes_level() {
        let mut book = seeded_book();
        book.apply_diff(&diff(101, 101, vec![level(dec!(49999), dec!(0))], vec![]))
            .unwrap();
        assert_eq!(book.bid_levels(), 1);
    }

    #[test]
    fn removal_of_absent_level_is_noop() {
        let mut book = seeded_book();
        book.apply_diff(&diff(101, 101, vec![level(dec!(48000), dec!(0))], vec![]))
            .unwrap();
        assert_eq!(book.bid_levels(), 2);
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn stale_diff_rejected_and_book_unchanged() {
        let mut book = seeded_book();
        let err = book
            .apply_diff(&diff(90, 100, vec![level(dec!(50000), dec!(9.0))], vec![]))
            .unwrap_err();
        assert!(matches!(err, MarketDataError::StaleUpdate { .. }));
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.snapshot(None).bids[0].quantity, dec!(1.0));
    }

    #[test]
    fn sides_stay_sorted_through_diffs() {
        let mut book = seeded_book();
        for (i, price) in [dec!(49998.5), dec!(50000.5), dec!(49997)].iter().enumerate() {
            let seq = 101 + i as u64;
            book.apply_diff(&diff(seq, seq, vec![level(*price, dec!(1))], vec![]))
                .unwrap();
        }

        let snap = book.snapshot(None);
        for pair in snap.bids.windows(2) {
            assert!(pair[0].price > pair[1].price);
        }
        for pair in snap.asks.windows(2) {
            assert!(pair[0].price < pair[1].price);
        }
        assert!(snap.bids.iter().all(|l| l.quantity > Decimal::ZERO));
    }

    #[test]
    fn crossed_book_detected_not_corrected() {
        let mut book = seeded_book();
        assert!(!book.is_crossed());
        book.apply_diff(&diff(101, 101, vec![level(dec!(50001), dec!(1))], vec![]))
            .unwrap();
        assert!(book.is_crossed());
        // Both levels still present; no auto-correction
        assert_eq!(book.best_bid(), Some(dec!(50001)));
        assert_eq!(book.best_ask(), Some(dec!(50001)));
    }

    #[test]
    fn snapshot_depth_is_clamped() {
        let book = seeded_book();
        let snap = book.snapshot(Some(1));
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.asks.len(), 1);

        let snap = book.snapshot(Some(100));
        assert_eq!(snap.bids.len(), 2);
    }

    #[test]
    fn clear_discards_levels() {
        let mut book = seeded_book();
        book.clear();
        assert_eq!(book.bid_levels(), 0);
        assert_eq!(book.ask_levels(), 0);
        assert!(!book.is_initialized());
    }
}
