//! Meshtastic wire types — the subset of the mesh protobuf schema this relay reads.
//!
//! Field tags match the upstream `mqtt.proto`, `mesh.proto`, `portnums.proto`
//! and `telemetry.proto` definitions. Changing a tag here silently breaks
//! decoding of every packet on the channel. Fields the relay never looks at
//! are omitted; prost skips unknown fields on decode.

/// Destination address meaning "every node on the channel".
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Label used when a packet carries no usable sender id.
pub const UNKNOWN_NODE: &str = "!unknown";

// ── Envelope ──────────────────────────────────────────────────────────────────

/// What a gateway node publishes to MQTT: one packet plus routing metadata.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    /// Channel name the packet was heard on, e.g. "LongFast".
    #[prost(string, tag = "2")]
    pub channel_id: String,
    /// Node id of the gateway that uplinked the packet, e.g. "!a1b2c3d4".
    #[prost(string, tag = "3")]
    pub gateway_id: String,
}

// ── Packet ────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    /// Channel index (hash of the channel name for encrypted packets).
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    /// Exactly one of decoded / encrypted is carried on the wire.
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

impl MeshPacket {
    /// The encrypted body, if this packet still carries one.
    pub fn encrypted(&self) -> Option<&[u8]> {
        match &self.payload_variant {
            Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Sender id, or `None` for the reserved id 0.
    pub fn sender(&self) -> Option<u32> {
        (self.from != 0).then_some(self.from)
    }
}

// ── Application payload ───────────────────────────────────────────────────────

/// Decrypted application payload: a port number plus an opaque body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

/// Application ports. Only the ones the relay routes on are listed; anything
/// else decodes as an unknown value and is ignored by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    TextMessageCompressedApp = 7,
    WaypointApp = 8,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
}

/// NODEINFO_APP body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(bytes, tag = "4")]
    pub macaddr: Vec<u8>,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
}

/// POSITION_APP body. Coordinates are degrees * 1e7.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(uint32, tag = "23")]
    pub precision_bits: u32,
}

/// TELEMETRY_APP body.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3")]
    pub variant: Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
}

// ── Node labels ───────────────────────────────────────────────────────────────

/// Human-facing node id: `!` followed by lowercase hex, no zero padding.
///
/// This label is also the Node Directory key.
pub fn node_label(node: Option<u32>) -> String {
    match node {
        Some(n) => format!("!{n:x}"),
        None => UNKNOWN_NODE.to_string(),
    }
}
