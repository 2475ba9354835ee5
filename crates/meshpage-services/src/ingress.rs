//! Ingress — from raw transport bytes to queued packets.
//!
//! A packet reaches the decryptor only when:
//!   1. the envelope decodes and carries a packet,
//!   2. the packet is addressed to the broadcast address,
//!   3. it carries an encrypted body (not an already-decoded one),
//!   4. its (sender, packet id) pair has not been seen recently.
//!
//! Several gateways usually uplink the same radio packet, so step 4 is what
//! keeps one transmission from producing several pages. A sighting only
//! sticks once the packet is queued; a packet dropped on a full queue can
//! still arrive through another gateway.
//!
//! Accepted packets are sharded by sender onto bounded per-worker queues.
//! `try_send` is used throughout: a full queue drops the packet rather than
//! stalling the transport's event loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use prost::Message;
use tokio::sync::mpsc;

use meshpage_core::mesh::{MeshPacket, ServiceEnvelope, BROADCAST_ADDR};

/// How long a (sender, id) pair is remembered.
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(600);

/// Why an inbound message was or was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressVerdict {
    Queued,
    MalformedEnvelope,
    MissingPacket,
    NotBroadcast,
    NotEncrypted,
    Duplicate,
    QueueFull,
    Closed,
}

/// Filter: pass the packet on only if it is an encrypted broadcast.
pub fn accept(envelope: ServiceEnvelope) -> Result<MeshPacket, IngressVerdict> {
    let packet = envelope.packet.ok_or(IngressVerdict::MissingPacket)?;
    if packet.to != BROADCAST_ADDR {
        return Err(IngressVerdict::NotBroadcast);
    }
    if packet.encrypted().is_none() {
        return Err(IngressVerdict::NotEncrypted);
    }
    Ok(packet)
}

// ── Duplicate suppression ─────────────────────────────────────────────────────

/// Recently seen (sender, packet id) pairs.
#[derive(Clone)]
pub struct SeenPackets {
    seen: Arc<DashMap<(u32, u32), Instant>>,
    window: Duration,
}

impl SeenPackets {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Arc::new(DashMap::new()),
            window,
        }
    }

    /// Record a packet. Returns false if it was already seen within the window.
    pub fn first_sighting(&self, sender: u32, packet_id: u32) -> bool {
        let now = Instant::now();
        let mut fresh = true;
        self.seen
            .entry((sender, packet_id))
            .and_modify(|at| {
                if now.duration_since(*at) < self.window {
                    fresh = false;
                } else {
                    *at = now;
                }
            })
            .or_insert(now);
        fresh
    }

    /// Drop the record of one sighting.
    pub fn forget(&self, sender: u32, packet_id: u32) {
        self.seen.remove(&(sender, packet_id));
    }

    /// Forget entries older than the window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.seen
            .retain(|_, at| now.duration_since(*at) < self.window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Decodes, filters, de-duplicates and shards inbound messages.
#[derive(Clone)]
pub struct IngressRouter {
    shards: Arc<[mpsc::Sender<MeshPacket>]>,
    seen: SeenPackets,
}

impl IngressRouter {
    /// Build a router with `workers` shards of depth `queue_depth`.
    /// Returns the receivers, one per worker, in shard order.
    pub fn new(
        workers: usize,
        queue_depth: usize,
        seen: SeenPackets,
    ) -> (Self, Vec<mpsc::Receiver<MeshPacket>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers.max(1))
            .map(|_| mpsc::channel(queue_depth.max(1)))
            .unzip();
        (
            Self {
                shards: senders.into(),
                seen,
            },
            receivers,
        )
    }

    /// Shard index for a sender. A sender always lands on the same worker.
    pub fn shard_for(&self, sender: u32) -> usize {
        sender as usize % self.shards.len()
    }

    /// Handle one raw transport payload.
    pub fn ingest(&self, raw: &[u8]) -> IngressVerdict {
        let envelope = match ServiceEnvelope::decode(raw) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, len = raw.len(), "failed to parse service envelope");
                return IngressVerdict::MalformedEnvelope;
            }
        };
        let gateway = envelope.gateway_id.clone();

        let packet = match accept(envelope) {
            Ok(p) => p,
            Err(verdict) => {
                tracing::debug!(?verdict, gateway = %gateway, "packet filtered");
                return verdict;
            }
        };

        let (from, id) = (packet.from, packet.id);
        if !self.seen.first_sighting(from, id) {
            tracing::debug!(
                from,
                id,
                gateway = %gateway,
                "duplicate packet dropped"
            );
            return IngressVerdict::Duplicate;
        }

        let verdict = self.enqueue(packet);
        if verdict != IngressVerdict::Queued {
            self.seen.forget(from, id);
        }
        verdict
    }

    /// Queue an already-filtered packet on its sender's shard.
    pub fn enqueue(&self, packet: MeshPacket) -> IngressVerdict {
        let shard = self.shard_for(packet.from);
        match self.shards[shard].try_send(packet) {
            Ok(()) => IngressVerdict::Queued,
            Err(mpsc::error::TrySendError::Full(p)) => {
                tracing::warn!(shard, from = p.from, id = p.id, "packet queue full, dropping");
                IngressVerdict::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => IngressVerdict::Closed,
        }
    }

    pub fn seen(&self) -> &SeenPackets {
        &self.seen
    }
}
