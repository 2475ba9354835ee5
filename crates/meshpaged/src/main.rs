//! meshpaged: Meshtastic MQTT to DAPNET paging relay.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshpage_core::config::RelayConfig;
use meshpage_services::{
    ForwardWorker, ForwarderSettings, HttpGateway, IngressRouter, NodeDirectory, PacketWorker,
    PagingForwarder, PagingGateway, PayloadDispatcher, SeenPackets, DUPLICATE_WINDOW,
};

mod mqtt;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let wrote_default = RelayConfig::write_default_if_missing();
    let config = RelayConfig::load().context("failed to load config")?;

    init_tracing(config.logging.file.as_deref())?;
    match wrote_default {
        Ok(path) => tracing::info!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration incomplete");
        return Err(e.into());
    }
    let key = Arc::new(config.channel_key()?);
    tracing::info!(channel = %config.channel.name, key_len = key.len(), "meshpaged starting");

    // Node directory
    let directory = NodeDirectory::open(&config.storage.database_path, &config.channel.name)
        .context("failed to open node directory")?;
    tracing::info!(
        path = %config.storage.database_path.display(),
        nodes = directory.count().unwrap_or(0),
        "node directory ready"
    );

    // Forwarding
    let gateway: Arc<dyn PagingGateway> = Arc::new(HttpGateway::new(
        &config.gateway.url,
        &config.gateway.callsign,
        &config.gateway.password,
        config.gateway.timeout(),
    )?);
    let forwarder = PagingForwarder::new(
        gateway,
        directory.clone(),
        ForwarderSettings {
            callsign: config.gateway.callsign.clone(),
            transmitter_group: config.gateway.transmitter_group.clone(),
            max_attempts: config.gateway.max_retries,
            retry_delay: config.gateway.retry_delay(),
        },
    );
    let (forward_tx, forward_rx) = mpsc::channel(config.pipeline.forward_queue_depth);

    // Ingress
    let seen = SeenPackets::new(DUPLICATE_WINDOW);
    let (router, packet_rxs) = IngressRouter::new(
        config.pipeline.workers,
        config.pipeline.queue_depth,
        seen.clone(),
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut packet_workers = tokio::task::JoinSet::new();
    for (shard, packet_rx) in packet_rxs.into_iter().enumerate() {
        packet_workers.spawn(
            PacketWorker::new(
                shard,
                key.clone(),
                PayloadDispatcher::new(directory.clone(), forward_tx.clone()),
                packet_rx,
                shutdown_tx.subscribe(),
            )
            .run(),
        );
    }
    drop(forward_tx);
    tracing::info!(workers = packet_workers.len(), "packet workers started");

    let mut forward_task = tokio::spawn(
        ForwardWorker::new(forwarder, forward_rx, shutdown_tx.subscribe()).run(),
    );

    let mqtt_task = tokio::spawn(
        mqtt::MqttIngress::new(
            &config.mqtt,
            &config.channel.name,
            router,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let prune_task = {
        let seen = seen.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                seen.prune();
                tracing::debug!(tracked = seen.len(), "duplicate table pruned");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let forward_exited = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            false
        }
        r = mqtt_task => {
            tracing::error!("mqtt ingress exited: {:?}", r);
            false
        }
        r = &mut forward_task => {
            tracing::error!("forward worker exited: {:?}", r);
            true
        }
        r = packet_workers.join_next() => {
            tracing::error!("packet worker exited: {:?}", r);
            false
        }
        r = prune_task => {
            tracing::error!("prune task exited: {:?}", r);
            false
        }
    };

    // Wake anything still running if we got here through a task exit.
    let _ = shutdown_tx.send(());
    while packet_workers.join_next().await.is_some() {}
    if !forward_exited {
        let grace = config.gateway.timeout() + Duration::from_secs(1);
        finish_forwarding(forward_task, grace).await;
    }

    Ok(())
}

/// Let a page that is already on the wire complete before exit.
async fn finish_forwarding(task: JoinHandle<Result<()>>, grace: Duration) {
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(Ok(()))) => tracing::info!("forward worker stopped"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "forward worker failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "forward worker panicked"),
        Err(_) => tracing::warn!(grace_secs = grace.as_secs(), "forward worker still busy, abandoning"),
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
