//! meshpage integration test harness.
//!
//! Tests here drive the relay pipeline against an in-process fake paging
//! gateway bound to 127.0.0.1:0. No broker or network access is needed:
//!
//!   cargo test --test integration
//!
//! Each test starts its own gateway, so tests never share state.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use prost::Message;

use meshpage_core::crypto::{encrypt, ChannelKey};
use meshpage_core::mesh::{mesh_packet::PayloadVariant, Data, MeshPacket, ServiceEnvelope};

mod gateway;
mod pipeline;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CALLSIGN: &str = "n0call";
pub const PASSWORD: &str = "s3cret";
pub const GROUP: &str = "dl-all";

/// One request as seen by the fake gateway.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone, Default)]
struct FakeState {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    /// Status codes to answer with, in order. Empty means 200.
    script: Arc<Mutex<VecDeque<u16>>>,
}

/// In-process stand-in for the DAPNET `/calls` endpoint.
pub struct FakeGateway {
    pub addr: SocketAddr,
    state: FakeState,
}

impl FakeGateway {
    pub async fn start() -> Result<Self> {
        Self::with_script(&[]).await
    }

    /// Answer the first calls with `statuses`, then 200.
    pub async fn with_script(statuses: &[u16]) -> Result<Self> {
        let state = FakeState {
            script: Arc::new(Mutex::new(statuses.iter().copied().collect())),
            ..FakeState::default()
        };
        let app = Router::new()
            .route("/calls", post(record_call))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind fake gateway")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}/calls", self.addr)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    /// Poll until `n` calls arrived or `timeout` passed.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> Vec<RecordedCall> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let calls = self.calls();
            if calls.len() >= n || tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn record_call(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .calls
        .lock()
        .unwrap()
        .push(RecordedCall {
            authorization,
            body,
        });
    let code = state.script.lock().unwrap().pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Expected `Authorization` header for the test credentials.
pub fn basic_auth() -> String {
    let raw = format!("{CALLSIGN}:{PASSWORD}");
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

// ── Packet builders ───────────────────────────────────────────────────────────

pub fn channel_key() -> ChannelKey {
    ChannelKey::from_base64("1PG7OiApB1nwvP+rz05pAQ==").unwrap()
}

/// Encrypted envelope as a gateway would publish it.
pub fn envelope(key: &ChannelKey, from: u32, to: u32, id: u32, data: &Data) -> Vec<u8> {
    let ciphertext = encrypt(id, from, &data.encode_to_vec(), key).unwrap();
    ServiceEnvelope {
        packet: Some(MeshPacket {
            from,
            to,
            id,
            payload_variant: Some(PayloadVariant::Encrypted(ciphertext)),
            ..Default::default()
        }),
        channel_id: "LongFast".into(),
        gateway_id: "!gw000001".into(),
    }
    .encode_to_vec()
}

#[tokio::test]
async fn test_fake_gateway_records_calls() {
    let fake = FakeGateway::start().await.unwrap();
    assert!(fake.addr.port() > 0);
    assert!(fake.calls().is_empty());
    assert_eq!(basic_auth(), "Basic bjBjYWxsOnMzY3JldA==");
}
