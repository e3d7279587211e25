//! trellisd — Trellis overlay node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use trellis_core::config::TrellisConfig;
use trellis_core::crypto::Keypair;
use trellis_core::NodeAddress;
use trellis_services::{launch, NodeOptions};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TrellisConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TrellisConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TrellisConfig::default()
    });

    // Keypair
    let keypair = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .with_context(|| format!("failed to load keypair from {}", config.identity.keypair_path.display()))?,
    );
    tracing::info!(public_key = hex::encode(keypair.public), "keypair ready");

    let gateway = config
        .node
        .gateway
        .as_deref()
        .map(|g| g.parse::<NodeAddress>().with_context(|| format!("invalid gateway {g:?}")))
        .transpose()?;

    let options = NodeOptions::from_config(&config, keypair)?;
    let mut node = launch(options).await?;
    tracing::info!(
        node = %node.address(),
        kind = ?config.transport.connection_type,
        "trellisd running"
    );

    // ── Join and maintain ────────────────────────────────────────────────────

    if let Some(gateway) = &gateway {
        match node.join(gateway).await {
            Ok(Some(response)) => tracing::info!(
                gateway = %gateway,
                neighbours = response.neighbours.len(),
                "join complete"
            ),
            Ok(None) => tracing::info!("configured gateway is this node, starting a new overlay"),
            Err(e) => tracing::warn!(gateway = %gateway, error = %e, "join failed, relying on maintenance"),
        }
    }
    node.maintenance_mut().start()?;

    let stats_printer = {
        let connector = node.connector().clone();
        let context = node.context().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                interval.tick().await;
                let cache = connector.cache_stats();
                tracing::info!(
                    neighbours = context.table.len(),
                    cache_hits = cache.hits,
                    cache_misses = cache.misses,
                    cache_idle = cache.idle,
                    workers_in_use = connector.pool().in_use(),
                    "status"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    stats_printer.abort();
    node.shutdown().await
}
