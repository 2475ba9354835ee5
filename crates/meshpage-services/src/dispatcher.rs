//! Routes decrypted payloads by application port.
//!
//! | port         | action                                   |
//! |--------------|------------------------------------------|
//! | TEXT_MESSAGE | queue for the paging forwarder           |
//! | NODEINFO     | upsert long/short name                   |
//! | POSITION     | upsert coordinates unless latitude unset |
//! | TELEMETRY    | parse and log                            |
//! | anything else| ignored                                  |
//!
//! Directory failures are logged and reported in the outcome; they never
//! fail the dispatch itself. Packets without a sender id never touch the
//! directory.
//!
//! Text is handed to the forward queue with `try_send`. A full queue drops
//! the message: a stalled gateway must never hold up decryption.

use prost::Message;
use thiserror::Error;
use tokio::sync::mpsc;

use meshpage_core::mesh::{node_label, telemetry, Data, PortNum, Position, Telemetry, User};

use crate::directory::{NodeDirectory, NodeUpdate};
use crate::forwarder::{truncate, ForwardRequest};

/// What happened to a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Text handed to the forward queue.
    Forwarded,
    /// Node names stored.
    NodeInfoStored,
    /// Coordinates stored.
    PositionStored,
    /// Position without a latitude; directory left alone.
    PositionUnset,
    /// Telemetry parsed and logged.
    TelemetrySeen,
    /// Directory write failed; already logged.
    DirectoryUnavailable,
    /// NODE_INFO or POSITION without a sender id; nothing to key it on.
    AnonymousSkipped,
    /// Port the relay does not handle.
    Ignored(i32),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("text payload is not valid UTF-8: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),
    #[error("malformed {port:?} payload: {source}")]
    MalformedBody {
        port: PortNum,
        source: prost::DecodeError,
    },
    #[error("paging forwarder is not accepting messages")]
    ForwarderUnavailable,
    #[error("forward queue full, text dropped")]
    ForwardQueueFull,
}

/// Stateless router; holds handles to the directory and the forward queue.
#[derive(Clone)]
pub struct PayloadDispatcher {
    directory: NodeDirectory,
    forward_tx: mpsc::Sender<ForwardRequest>,
}

impl PayloadDispatcher {
    pub fn new(directory: NodeDirectory, forward_tx: mpsc::Sender<ForwardRequest>) -> Self {
        Self {
            directory,
            forward_tx,
        }
    }

    pub async fn dispatch(
        &self,
        sender: Option<u32>,
        data: &Data,
    ) -> Result<DispatchOutcome, DispatchError> {
        let label = node_label(sender);
        let port = match PortNum::try_from(data.portnum) {
            Ok(port) => port,
            Err(_) => return Ok(DispatchOutcome::Ignored(data.portnum)),
        };

        match port {
            PortNum::TextMessageApp => self.forward_text(label, data),
            PortNum::NodeinfoApp | PortNum::PositionApp if sender.is_none() => {
                tracing::debug!(port = ?port, "directory update without sender id skipped");
                Ok(DispatchOutcome::AnonymousSkipped)
            }
            PortNum::NodeinfoApp => {
                let user = decode::<User>(port, &data.payload)?;
                let update = NodeUpdate {
                    long_name: non_empty(user.long_name),
                    short_name: non_empty(user.short_name),
                    ..Default::default()
                };
                Ok(self.store(label, update, DispatchOutcome::NodeInfoStored).await)
            }
            PortNum::PositionApp => {
                let pos = decode::<Position>(port, &data.payload)?;
                let latitude_i = match pos.latitude_i {
                    Some(lat) if lat != 0 => lat,
                    _ => {
                        tracing::debug!(node = %label, "position without latitude skipped");
                        return Ok(DispatchOutcome::PositionUnset);
                    }
                };
                let update = NodeUpdate {
                    latitude_i: Some(latitude_i),
                    longitude_i: pos.longitude_i,
                    altitude: pos.altitude,
                    precision_bits: Some(pos.precision_bits),
                    ..Default::default()
                };
                Ok(self.store(label, update, DispatchOutcome::PositionStored).await)
            }
            PortNum::TelemetryApp => {
                let t = decode::<Telemetry>(port, &data.payload)?;
                log_telemetry(&label, &t);
                Ok(DispatchOutcome::TelemetrySeen)
            }
            other => {
                tracing::trace!(node = %label, port = ?other, "port ignored");
                Ok(DispatchOutcome::Ignored(data.portnum))
            }
        }
    }

    fn forward_text(&self, label: String, data: &Data) -> Result<DispatchOutcome, DispatchError> {
        let text = String::from_utf8(data.payload.clone())?;
        tracing::info!(node = %label, text = %truncate(&text, 100), "text message received");
        match self.forward_tx.try_send(ForwardRequest {
            text,
            sender_label: label,
        }) {
            Ok(()) => Ok(DispatchOutcome::Forwarded),
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::warn!(node = %req.sender_label, "forward queue full, dropping text");
                Err(DispatchError::ForwardQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::ForwarderUnavailable),
        }
    }

    async fn store(&self, label: String, update: NodeUpdate, ok: DispatchOutcome) -> DispatchOutcome {
        match self.directory.upsert_async(label.clone(), update).await {
            Ok(()) => ok,
            Err(e) => {
                tracing::error!(node = %label, error = %e, "node directory update failed");
                DispatchOutcome::DirectoryUnavailable
            }
        }
    }
}

fn decode<M: Message + Default>(port: PortNum, body: &[u8]) -> Result<M, DispatchError> {
    M::decode(body).map_err(|source| DispatchError::MalformedBody { port, source })
}

fn non_empty(s: String) -> Option<String> {
    (!s.trim().is_empty()).then_some(s)
}

fn log_telemetry(label: &str, t: &Telemetry) {
    match &t.variant {
        Some(telemetry::Variant::DeviceMetrics(m)) => tracing::debug!(
            node = label,
            battery = ?m.battery_level,
            voltage = ?m.voltage,
            channel_util = ?m.channel_utilization,
            uptime = ?m.uptime_seconds,
            "device telemetry"
        ),
        Some(telemetry::Variant::EnvironmentMetrics(m)) => tracing::debug!(
            node = label,
            temperature = ?m.temperature,
            humidity = ?m.relative_humidity,
            pressure = ?m.barometric_pressure,
            "environment telemetry"
        ),
        None => tracing::debug!(node = label, "telemetry"),
    }
}
