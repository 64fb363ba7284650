//! Exchange wire formats
//!
//! `ExchangeAdapter` fixes the parsing contract per exchange; the sync layer
//! is injected with an adapter and never sees raw payload shapes.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::error::{MarketDataError, Result};
use crate::orderbook::PriceLevel;

/// Full-depth snapshot fetched over REST
#[derive(Debug, Clone)]
pub struct DepthSnapshot {
    /// Sequence id the snapshot is current as of
    pub sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Incremental diff received on the stream
#[derive(Debug, Clone)]
pub struct DepthDiff {
    pub symbol: String,
    /// Event time in milliseconds
    pub event_time: u64,
    /// First update id covered by this diff
    pub first_update_id: u64,
    /// Final update id covered by this diff
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Per-exchange parsing and endpoint contract
pub trait ExchangeAdapter: Send + Sync + 'static {
    /// Parse a REST snapshot payload
    fn parse_snapshot(&self, raw: &[u8]) -> Result<DepthSnapshot>;

    /// Parse a stream diff payload
    fn parse_diff(&self, raw: &[u8]) -> Result<DepthDiff>;

    /// REST URL for a depth snapshot
    fn snapshot_url(&self, rest_endpoint: &str, symbol: &str, depth: usize) -> String;

    /// WebSocket URL for one symbol's diff stream
    fn stream_url(&self, ws_endpoint: &str, symbol: &str) -> String;
}

/// Binance spot depth adapter
#[derive(Debug, Default, Clone)]
pub struct BinanceAdapter;

/// Binance REST depth payload
#[derive(Debug, Deserialize)]
struct BinanceSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    asks: Vec<PriceLevel>,
}

/// Binance depthUpdate stream event
#[derive(Debug, Deserialize)]
struct BinanceDepthUpdate {
    #[serde(rename = "e")]
    event_type: String,

    #[serde(rename = "E")]
    event_time: u64,

    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "U")]
    first_update_id: u64,

    #[serde(rename = "u")]
    final_update_id: u64,

    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    bids: Vec<PriceLevel>,

    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    asks: Vec<PriceLevel>,
}

/// Combined stream wrapper ({"stream": ..., "data": ...})
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[allow(dead_code)]
    stream: String,
    data: serde_json::Value,
}

impl ExchangeAdapter for BinanceAdapter {
    fn parse_snapshot(&self, raw: &[u8]) -> Result<DepthSnapshot> {
        let snapshot: BinanceSnapshot = serde_json::from_slice(raw)?;
        Ok(DepthSnapshot {
            sequence: snapshot.last_update_id,
            bids: snapshot.bids,
            asks: snapshot.asks,
        })
    }

    fn parse_diff(&self, raw: &[u8]) -> Result<DepthDiff> {
        // Combined streams wrap the event; single streams send it bare
        let update: BinanceDepthUpdate =
            if let Ok(envelope) = serde_json::from_slice::<StreamEnvelope>(raw) {
                serde_json::from_value(envelope.data)?
            } else {
                serde_json::from_slice(raw)?
            };

        if update.event_type != "depthUpdate" {
            return Err(MarketDataError::Parse(format!(
                "unexpected event type: {}",
                update.event_type
            )));
        }

        Ok(DepthDiff {
            symbol: update.symbol,
            event_time: update.event_time,
            first_update_id: update.first_update_id,
            final_update_id: update.final_update_id,
            bids: update.bids,
            asks: update.asks,
        })
    }

    fn snapshot_url(&self, rest_endpoint: &str, symbol: &str, depth: usize) -> String {
        format!("{}/depth?symbol={}&limit={}", rest_endpoint, symbol, depth)
    }

    fn stream_url(&self, ws_endpoint: &str, symbol: &str) -> String {
        format!("{}/ws/{}@depth@100ms", ws_endpoint, symbol.to_lowercase())
    }
}

/// Deserialize price levels from arrays of [price_string, quantity_string]
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}
