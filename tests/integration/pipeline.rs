use crate::*;

use meshpage_core::mesh::{PortNum, Position, User, BROADCAST_ADDR};
use meshpage_services::{
    ForwardWorker, ForwarderSettings, HttpGateway, IngressRouter, IngressVerdict, NodeDirectory,
    PacketWorker, PagingForwarder, PayloadDispatcher, SeenPackets, DUPLICATE_WINDOW,
};
use tokio::sync::{broadcast, mpsc};

/// A running relay minus the MQTT transport: raw envelopes go straight
/// into the router.
struct Relay {
    router: IngressRouter,
    directory: NodeDirectory,
    shutdown_tx: broadcast::Sender<()>,
}

fn start_relay(fake: &FakeGateway, workers: usize) -> Relay {
    let key = Arc::new(channel_key());
    let directory = NodeDirectory::open_in_memory("LongFast").unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let (forward_tx, forward_rx) = mpsc::channel(16);

    let gateway =
        HttpGateway::new(fake.url(), CALLSIGN, PASSWORD, Duration::from_secs(5)).unwrap();
    let forwarder = PagingForwarder::new(
        Arc::new(gateway),
        directory.clone(),
        ForwarderSettings {
            callsign: CALLSIGN.into(),
            transmitter_group: GROUP.into(),
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        },
    );
    tokio::spawn(ForwardWorker::new(forwarder, forward_rx, shutdown_tx.subscribe()).run());

    let (router, packet_rxs) = IngressRouter::new(workers, 32, SeenPackets::new(DUPLICATE_WINDOW));
    for (shard, rx) in packet_rxs.into_iter().enumerate() {
        tokio::spawn(
            PacketWorker::new(
                shard,
                key.clone(),
                PayloadDispatcher::new(directory.clone(), forward_tx.clone()),
                rx,
                shutdown_tx.subscribe(),
            )
            .run(),
        );
    }

    Relay {
        router,
        directory,
        shutdown_tx,
    }
}

fn text(body: &str) -> Data {
    Data {
        portnum: PortNum::TextMessageApp as i32,
        payload: body.as_bytes().to_vec(),
        ..Default::default()
    }
}

fn nodeinfo(long_name: &str, short_name: &str) -> Data {
    let user = User {
        long_name: long_name.into(),
        short_name: short_name.into(),
        ..Default::default()
    };
    Data {
        portnum: PortNum::NodeinfoApp as i32,
        payload: user.encode_to_vec(),
        ..Default::default()
    }
}

/// Wait until the directory knows a display name for `node`.
async fn wait_for_name(directory: &NodeDirectory, node: &str) -> Option<String> {
    for _ in 0..100 {
        if let Some(name) = directory.display_name(node).unwrap() {
            return Some(name);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Broadcast text from a node with no directory entry is paged under its
/// bare id, escaped.
#[tokio::test]
async fn test_text_message_is_paged() {
    let fake = FakeGateway::start().await.unwrap();
    let relay = start_relay(&fake, 2);

    let raw = envelope(&channel_key(), 0xa1b2c3d4, BROADCAST_ADDR, 1, &text("QRV 145.500!"));
    assert_eq!(relay.router.ingest(&raw), IngressVerdict::Queued);

    let calls = fake.wait_for_calls(1, Duration::from_secs(5)).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body["text"], r"*!a1b2c3d4*:QRV 145\.500\!");
    assert_eq!(calls[0].body["callSignNames"], serde_json::json!([CALLSIGN]));
    assert_eq!(calls[0].authorization.as_deref(), Some(basic_auth().as_str()));

    let _ = relay.shutdown_tx.send(());
}

/// NodeInfo first, then text: the page carries the stored long name.
#[tokio::test]
async fn test_nodeinfo_names_later_pages() {
    let fake = FakeGateway::start().await.unwrap();
    let relay = start_relay(&fake, 4);
    let key = channel_key();

    relay
        .router
        .ingest(&envelope(&key, 0x2a, BROADCAST_ADDR, 10, &nodeinfo("Base Camp", "BC")));
    assert_eq!(
        wait_for_name(&relay.directory, "!2a").await.as_deref(),
        Some("Base Camp")
    );

    relay
        .router
        .ingest(&envelope(&key, 0x2a, BROADCAST_ADDR, 11, &text("all good")));

    let calls = fake.wait_for_calls(1, Duration::from_secs(5)).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body["text"], "*Base Camp (!2a)*:all good");

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn test_position_is_stored() {
    let fake = FakeGateway::start().await.unwrap();
    let relay = start_relay(&fake, 1);

    let position = Position {
        latitude_i: Some(514_000_000),
        longitude_i: Some(-1_000_000),
        altitude: Some(42),
        precision_bits: 32,
        ..Default::default()
    };
    let data = Data {
        portnum: PortNum::PositionApp as i32,
        payload: position.encode_to_vec(),
        ..Default::default()
    };
    relay
        .router
        .ingest(&envelope(&channel_key(), 0x77, BROADCAST_ADDR, 5, &data));

    let mut stored = None;
    for _ in 0..100 {
        stored = relay.directory.get("!77").unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = stored.expect("position should be stored");
    assert_eq!(record.latitude_i, Some(514_000_000));
    assert_eq!(record.longitude_i, Some(-1_000_000));
    assert_eq!(record.altitude, Some(42));
    assert_eq!(record.precision_bits, Some(32));
    assert!(fake.calls().is_empty());

    let _ = relay.shutdown_tx.send(());
}

/// Direct messages, duplicate uplinks and wrong-key packets never page.
#[tokio::test]
async fn test_filtered_packets_never_page() {
    let fake = FakeGateway::start().await.unwrap();
    let relay = start_relay(&fake, 2);
    let key = channel_key();

    let direct = envelope(&key, 0x10, 0x20, 1, &text("private"));
    assert_eq!(relay.router.ingest(&direct), IngressVerdict::NotBroadcast);

    let once = envelope(&key, 0x10, BROADCAST_ADDR, 2, &text("once"));
    assert_eq!(relay.router.ingest(&once), IngressVerdict::Queued);
    assert_eq!(relay.router.ingest(&once), IngressVerdict::Duplicate);

    let calls = fake.wait_for_calls(1, Duration::from_secs(5)).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].body["text"], "*!10*:once");

    // Give any stray second page time to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fake.calls().len(), 1);

    let _ = relay.shutdown_tx.send(());
}

/// Messages from one sender are paged in the order they were received.
#[tokio::test]
async fn test_per_sender_order_is_preserved() {
    let fake = FakeGateway::start().await.unwrap();
    let relay = start_relay(&fake, 4);
    let key = channel_key();

    for (id, body) in ["one", "two", "three"].iter().enumerate() {
        let raw = envelope(&key, 0x99, BROADCAST_ADDR, id as u32 + 1, &text(body));
        assert_eq!(relay.router.ingest(&raw), IngressVerdict::Queued);
    }

    let calls = fake.wait_for_calls(3, Duration::from_secs(5)).await;
    let texts: Vec<_> = calls
        .iter()
        .map(|c| c.body["text"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(texts, vec!["*!99*:one", "*!99*:two", "*!99*:three"]);

    let _ = relay.shutdown_tx.send(());
}
