//! Order book engine runner
//!
//! Wires a Binance-backed collector from environment configuration, logs
//! per-symbol metrics through a subscriber callback, and runs until Ctrl-C.

use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_engine::{
    BinanceAdapter, BinanceClient, Config, EnhancedOrderBookCollector, OrderBookCollector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting order book engine");

    let config = Config::load()?;
    info!(symbols = ?config.symbols, depth_limit = config.depth_limit, "Configuration loaded");

    let adapter = Arc::new(BinanceAdapter);
    let client = Arc::new(BinanceClient::new(
        adapter,
        &config.rest_endpoint,
        &config.ws_endpoint,
    ));

    let collector = OrderBookCollector::new(config, client)?;
    let enhanced = EnhancedOrderBookCollector::new(collector);

    enhanced
        .register_callback(
            Arc::new(|snapshot, metrics| {
                info!(
                    symbol = %snapshot.symbol,
                    sequence = snapshot.sequence,
                    mid_price = %metrics.mid_price,
                    spread = %metrics.spread,
                    imbalance = %metrics.imbalance,
                    liquidity_score = metrics.liquidity_score,
                    crossed = snapshot.is_crossed(),
                    "Order book status"
                );
                Ok(())
            }),
            None,
        )
        .await?;

    enhanced.start().await;
    info!("Collector running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    enhanced.stop().await;

    Ok(())
}
