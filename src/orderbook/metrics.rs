//! Microstructure metrics derived from book snapshots
//!
//! Pure computation over an `OrderBookSnapshot` plus a bounded mid-price
//! history kept per symbol for rolling volatility.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderBookSnapshot, PriceLevel};
use crate::error::{MarketDataError, Result};

/// Metrics for one snapshot, computed fresh on every call
///
/// Linear metrics stay in fixed point; volatility and liquidity pass through
/// ln/sqrt and are carried as floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// best_ask - best_bid
    pub spread: Decimal,

    /// (best_bid + best_ask) / 2
    pub mid_price: Decimal,

    /// Average of the volume-weighted bid and ask prices over the top levels
    pub weighted_mid_price: Decimal,

    /// Total bid volume over the top levels
    pub bid_depth: Decimal,

    /// Total ask volume over the top levels
    pub ask_depth: Decimal,

    /// (bid_depth - ask_depth) / (bid_depth + ask_depth), in [-1, 1]
    pub imbalance: Decimal,

    /// Rank-weighted volume difference, in [-1, 1]
    pub pressure: Decimal,

    /// Stddev of mid-price log-returns over the history window, scaled by
    /// sqrt of the return count; 0 with fewer than two samples
    pub volatility: f64,

    /// (1/(1+spread) + ln(1 + bid_depth + ask_depth)) / 2
    ///
    /// Unbounded above: the depth term grows with ln(depth). Callers needing
    /// a [0, 1] score must normalize externally.
    pub liquidity_score: f64,
}

/// Fixed-capacity ring buffer of (timestamp, mid price) samples
#[derive(Debug)]
pub struct MidPriceHistory {
    window_size: usize,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl MidPriceHistory {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            samples: VecDeque::with_capacity(window_size),
        }
    }

    /// Append a sample, evicting the oldest once the window is full
    pub fn push(&mut self, at: DateTime<Utc>, mid_price: f64) {
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back((at, mid_price));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Stddev of consecutive log-returns, scaled by sqrt of the return count
    pub fn log_return_volatility(&self) -> f64 {
        let returns: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter(|((_, prev), (_, next))| *prev > 0.0 && *next > 0.0)
            .map(|((_, prev), (_, next))| (next / prev).ln())
            .collect();

        if returns.is_empty() {
            return 0.0;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt() * n.sqrt()
    }
}

/// Per-symbol analyzer: stateless per call except for the mid-price history
#[derive(Debug)]
pub struct OrderBookAnalyzer {
    symbol: String,
    history: MidPriceHistory,
}

impl OrderBookAnalyzer {
    pub fn new(symbol: &str, window_size: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            history: MidPriceHistory::new(window_size),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Compute metrics over the top `levels` of each side
    ///
    /// `price_range`, when given, first restricts both sides to levels within
    /// `mid ± price_range`. Fails with `EmptyBook` when either side has no
    /// levels or no volume in range. Each successful or failed call on a
    /// populated book appends the current mid price to the history.
    pub fn compute(
        &mut self,
        snapshot: &OrderBookSnapshot,
        levels: usize,
        price_range: Option<Decimal>,
    ) -> Result<OrderBookMetrics> {
        let (best_bid, best_ask) = match (snapshot.best_bid(), snapshot.best_ask()) {
            (Some(bid), Some(ask)) => (bid, ask),
            _ => return Err(MarketDataError::EmptyBook(self.symbol.clone())),
        };

        let spread = best_ask - best_bid;
        let mid_price = (best_bid + best_ask) / Decimal::from(2);
        self.history
            .push(snapshot.captured_at, mid_price.to_f64().unwrap_or(0.0));

        let bids = in_range(&snapshot.bids, levels, price_range.map(|r| mid_price - r), true);
        let asks = in_range(&snapshot.asks, levels, price_range.map(|r| mid_price + r), false);

        let bid_depth: Decimal = bids.iter().map(|l| l.quantity).sum();
        let ask_depth: Decimal = asks.iter().map(|l| l.quantity).sum();
        if bid_depth == Decimal::ZERO || ask_depth == Decimal::ZERO {
            return Err(MarketDataError::EmptyBook(self.symbol.clone()));
        }

        let weighted_bid: Decimal =
            bids.iter().map(|l| l.price * l.quantity).sum::<Decimal>() / bid_depth;
        let weighted_ask: Decimal =
            asks.iter().map(|l| l.price * l.quantity).sum::<Decimal>() / ask_depth;
        let weighted_mid_price = (weighted_bid + weighted_ask) / Decimal::from(2);

        let total_depth = bid_depth + ask_depth;
        let imbalance = if total_depth > Decimal::ZERO {
            (bid_depth - ask_depth) / total_depth
        } else {
            Decimal::ZERO
        };

        let bid_pressure = rank_weighted_volume(&bids);
        let ask_pressure = rank_weighted_volume(&asks);
        let total_pressure = bid_pressure + ask_pressure;
        let pressure = if total_pressure > Decimal::ZERO {
            (bid_pressure - ask_pressure) / total_pressure
        } else {
            Decimal::ZERO
        };

        let spread_f = spread.to_f64().unwrap_or(0.0);
        let depth_f = total_depth.to_f64().unwrap_or(0.0);
        let liquidity_score = (1.0 / (1.0 + spread_f) + (1.0 + depth_f).ln()) / 2.0;

        Ok(OrderBookMetrics {
            spread,
            mid_price,
            weighted_mid_price,
            bid_depth,
            ask_depth,
            imbalance,
            pressure,
            volatility: self.history.log_return_volatility(),
            liquidity_score,
        })
    }
}

/// Top `levels` of a side, optionally cut off at a price bound
fn in_range(
    side: &[PriceLevel],
    levels: usize,
    bound: Option<Decimal>,
    is_bid: bool,
) -> Vec<PriceLevel> {
    side.iter()
        .filter(|l| match bound {
            Some(b) if is_bid => l.price >= b,
            Some(b) => l.price <= b,
            None => true,
        })
        .take(levels)
        .cloned()
        .collect()
}

/// Each level's quantity divided by (rank + 1), rank 0 being the best price
fn rank_weighted_volume(side: &[PriceLevel]) -> Decimal {
    side.iter()
        .enumerate()
        .map(|(rank, l)| l.quantity / Decimal::from(rank as u64 + 1))
        .sum()
}
