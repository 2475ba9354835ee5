//! meshpage-core — configuration, channel crypto, and Meshtastic wire types.
//! All other meshpage crates depend on this one.

pub mod config;
pub mod crypto;
pub mod mesh;

pub use crypto::{decrypt, ChannelKey, DecryptError};
pub use mesh::{node_label, Data, MeshPacket, PortNum, ServiceEnvelope, BROADCAST_ADDR};
