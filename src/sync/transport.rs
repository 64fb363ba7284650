//! Exchange transport: REST snapshots and diff WebSocket streams
//!
//! The sync controller talks to `ExchangeClient`/`DiffStream` trait objects
//! so tests can drive it without a network.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::adapter::{DepthDiff, DepthSnapshot, ExchangeAdapter};
use crate::error::{MarketDataError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Source of snapshots and diff streams for one exchange
#[async_trait]
pub trait ExchangeClient: Send + Sync + 'static {
    /// Fetch a full-depth snapshot, truncated to `depth` levels
    async fn fetch_snapshot(&self, symbol: &str, depth: usize) -> Result<DepthSnapshot>;

    /// Open the diff stream for one symbol
    async fn open_diff_stream(&self, symbol: &str) -> Result<Box<dyn DiffStream>>;
}

/// An open per-symbol diff stream
#[async_trait]
pub trait DiffStream: Send {
    /// Next parsed diff; `Ok(None)` for non-data frames (ping/pong)
    async fn next_diff(&mut self) -> Result<Option<DepthDiff>>;

    /// Close the transport, swallowing secondary errors
    async fn close(&mut self);
}

/// Binance-backed client: reqwest for snapshots, tungstenite for diffs
pub struct BinanceClient {
    http: reqwest::Client,
    adapter: Arc<dyn ExchangeAdapter>,
    rest_endpoint: String,
    ws_endpoint: String,
}

impl BinanceClient {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, rest_endpoint: &str, ws_endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            adapter,
            rest_endpoint: rest_endpoint.to_string(),
            ws_endpoint: ws_endpoint.to_string(),
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn fetch_snapshot(&self, symbol: &str, depth: usize) -> Result<DepthSnapshot> {
        let url = self.adapter.snapshot_url(&self.rest_endpoint, symbol, depth);
        debug!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MarketDataError::Transport(format!(
                "snapshot request failed with status {}",
                response.status()
            )));
        }

        let body = response.bytes().await?;
        self.adapter.parse_snapshot(&body)
    }

    async fn open_diff_stream(&self, symbol: &str) -> Result<Box<dyn DiffStream>> {
        let url = self.adapter.stream_url(&self.ws_endpoint, symbol);
        info!(symbol = %symbol, url = %url, "Connecting to diff stream");

        let (stream, response) = connect_async(&url).await.map_err(|e| {
            MarketDataError::Transport(format!("failed to connect: {}", e))
        })?;
        debug!(status = ?response.status(), "Diff stream connected");

        Ok(Box::new(WsDiffStream {
            stream: Some(stream),
            adapter: self.adapter.clone(),
            symbol: symbol.to_string(),
        }))
    }
}

/// WebSocket-backed diff stream for one symbol
struct WsDiffStream {
    stream: Option<WsStream>,
    adapter: Arc<dyn ExchangeAdapter>,
    symbol: String,
}

#[async_trait]
impl DiffStream for WsDiffStream {
    async fn next_diff(&mut self) -> Result<Option<DepthDiff>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MarketDataError::Transport("not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => match self.adapter.parse_diff(text.as_bytes()) {
                Ok(diff) => Ok(Some(diff)),
                Err(e) => {
                    // Malformed payloads are dropped, never fatal
                    error!(symbol = %self.symbol, error = %e, "Dropping unparseable message");
                    Ok(None)
                }
            },
            Some(Ok(Message::Binary(data))) => match self.adapter.parse_diff(&data) {
                Ok(diff) => Ok(Some(diff)),
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "Dropping unparseable message");
                    Ok(None)
                }
            },
            Some(Ok(Message::Ping(data))) => {
                debug!(symbol = %self.symbol, "Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Ok(Message::Close(frame))) => {
                warn!(symbol = %self.symbol, frame = ?frame, "Received close frame");
                self.stream = None;
                Err(MarketDataError::Transport("connection closed".to_string()))
            }
            Some(Err(e)) => {
                error!(symbol = %self.symbol, error = %e, "WebSocket error");
                self.stream = None;
                Err(MarketDataError::Transport(e.to_string()))
            }
            None => {
                warn!(symbol = %self.symbol, "WebSocket stream ended");
                self.stream = None;
                Err(MarketDataError::Transport("stream ended".to_string()))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
