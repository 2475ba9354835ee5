//! Pipeline workers.
//!
//! `PacketWorker`: one per shard, decrypt then dispatch. Errors are logged
//! and the packet dropped; nothing here can stop the loop except shutdown
//! or the ingress side going away.
//!
//! `ForwardWorker`: drains the forward queue one message at a time so a
//! slow paging gateway only ever backs up the forward queue, never
//! decryption.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use meshpage_core::crypto::{decrypt, ChannelKey};
use meshpage_core::mesh::MeshPacket;

use crate::dispatcher::{DispatchOutcome, PayloadDispatcher};
use crate::forwarder::{ForwardError, ForwardRequest, PagingForwarder};

pub struct PacketWorker {
    shard: usize,
    key: Arc<ChannelKey>,
    dispatcher: PayloadDispatcher,
    packet_rx: mpsc::Receiver<MeshPacket>,
    shutdown: broadcast::Receiver<()>,
}

impl PacketWorker {
    pub fn new(
        shard: usize,
        key: Arc<ChannelKey>,
        dispatcher: PayloadDispatcher,
        packet_rx: mpsc::Receiver<MeshPacket>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            shard,
            key,
            dispatcher,
            packet_rx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(shard = self.shard, "packet worker shutting down");
                    return Ok(());
                }

                msg = self.packet_rx.recv() => {
                    let packet = match msg {
                        Some(p) => p,
                        None => {
                            tracing::info!(shard = self.shard, "ingress dropped, packet worker exiting");
                            return Ok(());
                        }
                    };
                    self.process(packet).await;
                }
            }
        }
    }

    /// Decrypt and dispatch one packet. Returns the outcome for tests and
    /// stats; failures are already logged.
    pub async fn process(&self, packet: MeshPacket) -> Option<DispatchOutcome> {
        let data = match decrypt(&packet, &self.key) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(from = packet.from, id = packet.id, error = %e, "decryption failed");
                return None;
            }
        };
        tracing::debug!(from = packet.from, id = packet.id, port = data.portnum, "packet decrypted");

        match self.dispatcher.dispatch(packet.sender(), &data).await {
            Ok(outcome) => {
                tracing::debug!(from = packet.from, ?outcome, "payload dispatched");
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(from = packet.from, id = packet.id, error = %e, "dispatch failed");
                None
            }
        }
    }
}

pub struct ForwardWorker {
    forwarder: PagingForwarder,
    forward_rx: mpsc::Receiver<ForwardRequest>,
    shutdown: broadcast::Receiver<()>,
}

impl ForwardWorker {
    pub fn new(
        forwarder: PagingForwarder,
        forward_rx: mpsc::Receiver<ForwardRequest>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            forwarder,
            forward_rx,
            shutdown,
        }
    }

    /// A delivery already in flight always completes; shutdown is checked
    /// before the next request is taken.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("forward worker shutting down");
                    return Ok(());
                }

                msg = self.forward_rx.recv() => {
                    let request = match msg {
                        Some(r) => r,
                        None => {
                            tracing::info!("dispatchers dropped, forward worker exiting");
                            return Ok(());
                        }
                    };
                    let result = self
                        .forwarder
                        .forward(&request.text, &request.sender_label, &mut self.shutdown)
                        .await;
                    match result {
                        Ok(_) => {}
                        Err(ForwardError::ShutdownRequested { .. }) => {
                            tracing::info!("forward worker stopped mid-retry");
                            return Ok(());
                        }
                        // Terminal; already logged by the forwarder.
                        Err(ForwardError::DeliveryFailed { .. }) => {}
                    }
                }
            }
        }
    }
}
