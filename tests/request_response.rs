mod common;

use std::time::Duration;

use common::{config, supervisor, wait_until};
use serde_json::{json, Value};
use tether::{
    ConnectParams, MemoryBroker, RequestOptions, SubscribeOptions, Supervisor, TetherError,
};

/// A second client on the same broker that echoes every request on
/// `svc/echo`.
async fn echo_responder(broker: &MemoryBroker) -> Supervisor {
    let responder = supervisor(broker, config("responder"));
    responder.connect(ConnectParams::default()).await.unwrap();

    let replier = responder.clone();
    responder
        .subscribe(
            "svc/echo",
            SubscribeOptions::default().handler(move |message| {
                let replier = replier.clone();
                let message = message.clone();
                tokio::spawn(async move {
                    let body = json!({ "echo": message.json().unwrap_or(Value::Null) });
                    replier.reply(&message, &body).await.unwrap();
                });
            }),
        )
        .await
        .unwrap();
    responder
}

#[tokio::test(start_paused = true)]
async fn request_gets_the_correlated_reply() {
    let broker = MemoryBroker::new();
    let _responder = echo_responder(&broker).await;
    let requester = supervisor(&broker, config("requester"));
    requester.connect(ConnectParams::default()).await.unwrap();

    let response = requester
        .request("svc/echo", &json!({ "ping": 1 }), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response.topic, "responses/requester");
    assert_eq!(response.payload["echo"]["ping"], 1);
    assert_eq!(response.payload["echo"]["senderId"], "requester");
    assert!(response.correlation_id.starts_with("req"));

    let stats = requester.request_stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.responses_received, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn request_falls_back_to_body_fields_without_properties() {
    let broker = MemoryBroker::new();
    broker.set_properties_supported(false);
    let _responder = echo_responder(&broker).await;
    let requester = supervisor(&broker, config("legacy"));
    requester.connect(ConnectParams::default()).await.unwrap();

    let response = requester
        .request("svc/echo", &json!({ "ping": 2 }), RequestOptions::default())
        .await
        .unwrap();

    let echoed = &response.payload["echo"];
    assert_eq!(echoed["ping"], 2);
    assert_eq!(echoed["responseTopic"], "responses/legacy");
    assert_eq!(echoed["correlationId"], response.correlation_id.as_str());
    assert_eq!(response.payload["correlationId"], response.correlation_id.as_str());
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_are_matched_independently() {
    let broker = MemoryBroker::new();
    let _responder = echo_responder(&broker).await;
    let requester = supervisor(&broker, config("fanout"));
    requester.connect(ConnectParams::default()).await.unwrap();

    let calls = (0..5).map(|i| {
        let requester = requester.clone();
        async move {
            requester
                .request("svc/echo", &json!({ "n": i }), RequestOptions::default())
                .await
        }
    });
    let responses = futures_util::future::join_all(calls).await;

    for (i, response) in responses.into_iter().enumerate() {
        assert_eq!(response.unwrap().payload["echo"]["n"], i);
    }
    assert_eq!(requester.request_stats().responses_received, 5);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_at_its_deadline() {
    let broker = MemoryBroker::new();
    let requester = supervisor(&broker, config("lonely"));
    requester.connect(ConnectParams::default()).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = requester
        .request("svc/nobody", &json!({}), RequestOptions::timeout(Duration::from_secs(2)))
        .await
        .unwrap_err();

    match err {
        TetherError::RequestTimeout { topic, timeout, .. } => {
            assert_eq!(topic, "svc/nobody");
            assert_eq!(timeout, Duration::from_secs(2));
        }
        other => panic!("unexpected {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2_100));

    let stats = requester.request_stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_rejects_pending_calls() {
    let broker = MemoryBroker::new();
    let requester = supervisor(&broker, config("impatient"));
    requester.connect(ConnectParams::default()).await.unwrap();

    let call = tokio::spawn({
        let requester = requester.clone();
        async move {
            requester
                .request("svc/slow", &json!({}), RequestOptions::default())
                .await
        }
    });
    wait_until(|| requester.correlator().pending_count() == 1).await;

    assert_eq!(requester.cancel_all_requests(), 1);
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::Cancelled(_)));
    assert_eq!(requester.request_stats().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn connection_loss_fails_pending_calls() {
    let broker = MemoryBroker::new();
    let requester = supervisor(&broker, config("dropped"));
    requester.connect(ConnectParams::default()).await.unwrap();

    let call = tokio::spawn({
        let requester = requester.clone();
        async move {
            requester
                .request("svc/slow", &json!({}), RequestOptions::default())
                .await
        }
    });
    wait_until(|| requester.correlator().pending_count() == 1).await;

    broker.kick("dropped");
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::ConnectionLost));
}

#[tokio::test(start_paused = true)]
async fn request_needs_a_live_session() {
    let broker = MemoryBroker::new();
    let requester = supervisor(&broker, config("early"));

    let err = requester
        .request("svc/echo", &json!({}), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Configuration(_)));

    requester.connect(ConnectParams::default()).await.unwrap();
    broker.set_online(false);
    wait_until(|| !requester.is_connected()).await;

    let err = requester
        .request("svc/echo", &json!({}), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::NotConnected));
    assert_eq!(requester.request_stats().errors, 1);
}

#[tokio::test(start_paused = true)]
async fn replies_to_unknown_ids_reach_listeners() {
    let broker = MemoryBroker::new();
    let requester = supervisor(&broker, config("stray"));
    requester.connect(ConnectParams::default()).await.unwrap();
    let (seen, record) = common::recorder::<String>();
    let _h = requester.on_message(move |m| record(&m.topic));

    let mut stray = tether::InboundMessage::new("responses/stray", r#"{"correlationId":"req-0-zzz"}"#);
    stray.properties.correlation_data = Some("req-0-zzz".into());
    broker.inject(stray);

    wait_until(|| !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), ["responses/stray"]);
}
