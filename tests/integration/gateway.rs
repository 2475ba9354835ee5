use crate::*;

use meshpage_services::{
    ForwardError, ForwarderSettings, GatewayError, HttpGateway, NodeDirectory, NodeUpdate,
    PagingForwarder, PagingGateway, PagingRequest,
};

fn http_gateway(fake: &FakeGateway) -> HttpGateway {
    HttpGateway::new(fake.url(), CALLSIGN, PASSWORD, Duration::from_secs(5)).unwrap()
}

fn request(text: &str) -> PagingRequest {
    PagingRequest {
        text: text.into(),
        call_sign_names: vec![CALLSIGN.into()],
        transmitter_group_names: vec![GROUP.into()],
        emergency: false,
    }
}

fn forwarder(fake: &FakeGateway, directory: NodeDirectory, max_attempts: u32) -> PagingForwarder {
    PagingForwarder::new(
        Arc::new(http_gateway(fake)),
        directory,
        ForwarderSettings {
            callsign: CALLSIGN.into(),
            transmitter_group: GROUP.into(),
            max_attempts,
            retry_delay: Duration::from_millis(10),
        },
    )
}

/// A 200 is delivery; the body and credentials reach the gateway intact.
#[tokio::test]
async fn test_http_gateway_posts_json_with_basic_auth() {
    let fake = FakeGateway::start().await.unwrap();
    http_gateway(&fake).deliver(&request("*!a1*:hi")).await.unwrap();

    let calls = fake.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].authorization.as_deref(), Some(basic_auth().as_str()));
    assert_eq!(
        calls[0].body,
        serde_json::json!({
            "text": "*!a1*:hi",
            "callSignNames": [CALLSIGN],
            "transmitterGroupNames": [GROUP],
            "emergency": false
        })
    );
}

/// Only 200 counts. A 201 is reported as a status failure.
#[tokio::test]
async fn test_non_200_success_code_is_failure() {
    let fake = FakeGateway::with_script(&[201]).await.unwrap();
    let err = http_gateway(&fake).deliver(&request("x")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Status { code: 201, .. }), "{err:?}");
}

#[tokio::test]
async fn test_forwarder_retries_until_gateway_recovers() {
    let fake = FakeGateway::with_script(&[500, 503]).await.unwrap();
    let directory = NodeDirectory::open_in_memory("LongFast").unwrap();
    let (_shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);

    let outcome = forwarder(&fake, directory, 5)
        .forward("hello", "!a1b2", &mut shutdown_rx)
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 3);
    let calls = fake.calls();
    assert_eq!(calls.len(), 3);
    // Every retry carries the same composed text.
    assert!(calls.iter().all(|c| c.body["text"] == "*!a1b2*:hello"));
}

#[tokio::test]
async fn test_forwarder_gives_up_after_max_attempts() {
    let fake = FakeGateway::with_script(&[500, 500, 500]).await.unwrap();
    let directory = NodeDirectory::open_in_memory("LongFast").unwrap();
    let (_shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);

    let err = forwarder(&fake, directory, 2)
        .forward("hello", "!a1b2", &mut shutdown_rx)
        .await
        .unwrap_err();

    match err {
        ForwardError::DeliveryFailed {
            attempts,
            last_error: GatewayError::Status { code, .. },
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(code, 500);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fake.calls().len(), 2);
}

#[tokio::test]
async fn test_forwarder_uses_directory_name_and_escapes_body() {
    let fake = FakeGateway::start().await.unwrap();
    let directory = NodeDirectory::open_in_memory("LongFast").unwrap();
    directory
        .upsert(
            "!a1b2",
            &NodeUpdate {
                long_name: Some("Alice".into()),
                ..Default::default()
            },
        )
        .unwrap();
    let (_shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);

    forwarder(&fake, directory, 1)
        .forward("meet @ 5.30 (park)", "!a1b2", &mut shutdown_rx)
        .await
        .unwrap();

    let calls = fake.calls();
    assert_eq!(
        calls[0].body["text"],
        r"*Alice (!a1b2)*:meet @ 5\.30 \(park\)"
    );
}
