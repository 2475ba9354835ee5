//! meshpage-services: the relay pipeline between a decoded envelope and a
//! delivered page.
//!
//! ingress → packet workers (decrypt + dispatch) → forward worker → gateway,
//! with the node directory shared by the dispatcher and the forwarder.

pub mod directory;
pub mod dispatcher;
pub mod forwarder;
pub mod gateway;
pub mod ingress;
pub mod worker;

pub use directory::{DirectoryError, NodeDirectory, NodeRecord, NodeUpdate};
pub use dispatcher::{DispatchError, DispatchOutcome, PayloadDispatcher};
pub use forwarder::{
    compose_message, ForwardError, ForwardOutcome, ForwardRequest, ForwarderSettings,
    PagingForwarder,
};
pub use gateway::{GatewayError, HttpGateway, PagingGateway, PagingRequest};
pub use ingress::{accept, IngressRouter, IngressVerdict, SeenPackets, DUPLICATE_WINDOW};
pub use worker::{ForwardWorker, PacketWorker};
