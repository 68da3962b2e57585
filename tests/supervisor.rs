mod common;

use std::{
    collections::BTreeSet,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use common::{config, counter, create_request, recorder, supervisor, wait_until, ScriptedTokenService};
use tether::{
    config::TokenConfig, ConnectParams, ConnectionState, MemoryBroker, MqttManager, PublishOptions,
    PublishOutcome, QoS, SubscribeOptions, TetherError, TokenConnectParams,
};

fn without_requests(client_id: &str) -> tether::Config {
    let mut config = config(client_id);
    config.request.enabled = false;
    config
}

#[tokio::test(start_paused = true)]
async fn subscribe_twice_issues_one_protocol_call() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("idem"));
    sup.connect(ConnectParams::default()).await.unwrap();

    let first = sup.subscribe("alerts/#", SubscribeOptions::qos(QoS::AtLeastOnce)).await;
    let second = sup.subscribe("alerts/#", SubscribeOptions::default()).await;

    assert_eq!(first.unwrap(), QoS::AtLeastOnce);
    assert_eq!(second.unwrap(), QoS::AtLeastOnce);
    assert_eq!(broker.subscribe_calls(), vec!["alerts/#".to_string()]);
    assert_eq!(sup.subscriptions(), vec!["alerts/#".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rejected_subscription_is_not_recorded() {
    let broker = MemoryBroker::new();
    broker.reject_subscriptions_to("$SYS/#");
    let sup = supervisor(&broker, without_requests("rejected"));
    sup.connect(ConnectParams::default()).await.unwrap();

    let err = sup.subscribe("$SYS/#", SubscribeOptions::default()).await.unwrap_err();
    assert!(matches!(err, TetherError::Transport(_)));
    assert!(sup.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_the_subscription_record() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, config("resub"));
    let (connects, on_connected) = counter();
    let _h = sup.on_connected(on_connected);

    sup.connect(ConnectParams::default()).await.unwrap();
    sup.subscribe("sensors/+/temp", SubscribeOptions::qos(QoS::AtMostOnce)).await.unwrap();
    sup.subscribe("cmd/resub", SubscribeOptions::qos(QoS::ExactlyOnce)).await.unwrap();
    let before: BTreeSet<_> = sup.subscriptions().into_iter().collect();

    broker.kick("resub");
    assert!(broker.subscriptions("resub").is_empty());
    wait_until(|| connects.load(Ordering::SeqCst) == 2).await;

    let live: BTreeSet<_> = broker
        .subscriptions("resub")
        .into_iter()
        .map(|(topic, _)| topic)
        .collect();
    assert_eq!(live, before);
    assert!(broker
        .subscriptions("resub")
        .contains(&("cmd/resub".to_string(), QoS::ExactlyOnce)));
    assert_eq!(sup.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn staggered_resubscribe_keeps_order() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("stagger");
    cfg.staggered_resubscribe = true;
    cfg.resubscribe_delay_ms = 200;
    let sup = supervisor(&broker, cfg);
    let (connects, on_connected) = counter();
    let _h = sup.on_connected(on_connected);

    sup.connect(ConnectParams::default()).await.unwrap();
    for topic in ["a", "b", "c"] {
        sup.subscribe(topic, SubscribeOptions::default()).await.unwrap();
    }

    broker.kick("stagger");
    let started = tokio::time::Instant::now();
    wait_until(|| connects.load(Ordering::SeqCst) == 2).await;

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(broker.subscribe_calls(), ["a", "b", "c", "a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn failed_resubscribe_does_not_abort_the_rest() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("partial"));
    let (errors, on_error) = recorder::<String>();
    let _e = sup.on_error(move |e| on_error(&e.to_string()));
    let (connects, on_connected) = counter();
    let _c = sup.on_connected(on_connected);

    sup.connect(ConnectParams::default()).await.unwrap();
    sup.subscribe("one", SubscribeOptions::default()).await.unwrap();
    sup.subscribe("two", SubscribeOptions::default()).await.unwrap();

    broker.reject_subscriptions_to("one");
    broker.kick("partial");
    wait_until(|| connects.load(Ordering::SeqCst) == 2).await;

    let live: Vec<_> = broker.subscriptions("partial").into_iter().map(|(t, _)| t).collect();
    assert_eq!(live, ["two"]);
    assert!(errors.lock().unwrap().iter().any(|e| e.contains("Subscription to one refused")));
    assert_eq!(sup.subscriptions(), ["one", "two"]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_removes_from_record_and_broker() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("unsub"));
    sup.connect(ConnectParams::default()).await.unwrap();
    sup.subscribe("x", SubscribeOptions::default()).await.unwrap();

    sup.unsubscribe("x").await.unwrap();
    assert!(sup.subscriptions().is_empty());
    assert!(broker.subscriptions("unsub").is_empty());
}

#[tokio::test(start_paused = true)]
async fn drop_oldest_keeps_the_newest_messages_in_order() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("fifo");
    cfg.offline_queue.max_size = 3;
    cfg.offline_queue.drop_oldest = true;
    let sup = supervisor(&broker, cfg);

    for i in 0..5 {
        let outcome = sup
            .publish(&format!("m{i}"), format!("{i}"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Queued);
    }
    assert_eq!(sup.offline_queue_len(), 3);

    sup.connect(ConnectParams::default()).await.unwrap();
    let sent: Vec<_> = broker.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(sent, ["m2", "m3", "m4"]);
    assert_eq!(sup.offline_queue_len(), 0);

    let outcome = sup.publish("live", "now", PublishOptions::default()).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Sent);
}

#[tokio::test(start_paused = true)]
async fn reject_new_keeps_the_oldest_messages() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("reject");
    cfg.offline_queue.max_size = 3;
    cfg.offline_queue.drop_oldest = false;
    let sup = supervisor(&broker, cfg);

    let mut outcomes = Vec::new();
    for i in 0..5 {
        outcomes.push(
            sup.publish(&format!("m{i}"), "x", PublishOptions::default())
                .await
                .unwrap(),
        );
    }
    assert_eq!(
        outcomes,
        [
            PublishOutcome::Queued,
            PublishOutcome::Queued,
            PublishOutcome::Queued,
            PublishOutcome::Dropped,
            PublishOutcome::Dropped
        ]
    );

    sup.connect(ConnectParams::default()).await.unwrap();
    let sent: Vec<_> = broker.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(sent, ["m0", "m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn publishes_during_an_outage_are_flushed_after_reconnect() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("outage"));
    let (connects, on_connected) = counter();
    let _h = sup.on_connected(on_connected);
    let mut state = sup.watch_state();

    sup.connect(ConnectParams::default()).await.unwrap();
    broker.set_online(false);
    state
        .wait_for(|s| matches!(s, ConnectionState::Disconnected(_) | ConnectionState::Reconnecting(_)))
        .await
        .unwrap();

    let outcome = sup.publish("telemetry", "42", PublishOptions::default()).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);

    broker.set_online(true);
    wait_until(|| connects.load(Ordering::SeqCst) == 2).await;
    let sent: Vec<_> = broker.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(sent, ["telemetry"]);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_stops_reconnecting() {
    let broker = MemoryBroker::new();
    broker.set_reject_auth(true);
    let sup = supervisor(&broker, config("denied"));
    let (auth, on_auth) = recorder::<String>();
    let _a = sup.on_auth_error(move |reason| on_auth(&reason.to_string()));
    let (errors, on_error) = counter();
    let _e = sup.on_error(move |_| on_error());

    let err = sup
        .connect(ConnectParams::with_credentials("device", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::AuthRejected(_)));
    assert!(err.is_auth());
    assert!(matches!(sup.state(), ConnectionState::Error(_)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(auth.lock().unwrap().len(), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_after_a_drop_enters_error() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("revoked"));
    let mut state = sup.watch_state();
    sup.connect(ConnectParams::default()).await.unwrap();

    broker.set_reject_auth(true);
    broker.kick("revoked");
    state
        .wait_for(|s| matches!(s, ConnectionState::Error(_)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn tolerated_auth_failures_are_bounded() {
    let broker = MemoryBroker::new();
    broker.set_reject_auth(true);
    let mut cfg = config("tolerant");
    cfg.reconnect_on_auth_error = true;
    cfg.max_auth_retries = 2;
    let sup = supervisor(&broker, cfg);

    let err = sup.connect(ConnectParams::default()).await.unwrap_err();
    assert!(matches!(err, TetherError::AuthRejected(_)));
    assert_eq!(broker.connect_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_reconnect_attempts() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let mut cfg = config("flaky");
    cfg.max_reconnect_attempts = 3;
    let sup = supervisor(&broker, cfg);
    let (attempts, on_reconnecting) = recorder::<u32>();
    let _h = sup.on_reconnecting(move |n| on_reconnecting(&n));

    let err = sup.connect(ConnectParams::default()).await.unwrap_err();
    assert!(matches!(err, TetherError::Connection(ref reason) if reason.contains("maximum")));
    assert!(matches!(sup.state(), ConnectionState::Error(_)));
    assert_eq!(*attempts.lock().unwrap(), [1, 2, 3]);
    assert_eq!(broker.connect_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn unlimited_attempts_end_at_connect_timeout() {
    let broker = MemoryBroker::new();
    broker.set_online(false);
    let mut cfg = config("patient");
    cfg.max_reconnect_attempts = 0;
    cfg.connect_timeout_ms = 1_000;
    let sup = supervisor(&broker, cfg);

    let err = sup.connect(ConnectParams::default()).await.unwrap_err();
    assert!(matches!(err, TetherError::ConnectionTimeout(d) if d == Duration::from_secs(1)));
    assert!(matches!(sup.state(), ConnectionState::Error(_)));

    let attempts = broker.connect_attempts();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(broker.connect_attempts(), attempts);
}

#[tokio::test(start_paused = true)]
async fn state_changes_are_observable() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("watched"));
    let (states, on_state) = recorder::<ConnectionState>();
    let _h = sup.on_state_change(on_state);

    sup.connect(ConnectParams::default()).await.unwrap();
    sup.disconnect().await.unwrap();

    let states = states.lock().unwrap().clone();
    assert_eq!(states[0], ConnectionState::Connecting);
    assert_eq!(states[1], ConnectionState::Connected);
    assert_eq!(states[2], ConnectionState::Disconnecting);
    assert!(matches!(states[3], ConnectionState::Disconnected(_)));
}

#[tokio::test(start_paused = true)]
async fn session_id_survives_reconnects() {
    let broker = MemoryBroker::new();
    let sup = supervisor(&broker, without_requests("session"));
    assert!(sup.session_id().is_none());

    sup.connect(ConnectParams::default()).await.unwrap();
    let id = sup.session_id();
    sup.reconnect().await.unwrap();
    assert_eq!(sup.session_id(), id);
}

#[tokio::test(start_paused = true)]
async fn token_credentials_follow_refreshes() {
    let broker = MemoryBroker::new();
    broker.accept_password(Some("pass-1"));
    let service = Arc::new(ScriptedTokenService::default());
    let tokens = common::token_manager(
        Arc::clone(&service),
        TokenConfig {
            auto_refresh: false,
            ..TokenConfig::default()
        },
    );
    let sup = MqttManager::from_config(without_requests("device-7"))
        .unwrap()
        .with_transport(Arc::new(broker.transport()))
        .with_token_manager(tokens.clone())
        .build()
        .unwrap();
    let (connects, on_connected) = counter();
    let _h = sup.on_connected(on_connected);

    let request = create_request();
    sup.connect_with_token(TokenConnectParams {
        organization_id: request.organization_id,
        secret_key: Some(request.secret_key),
        user_email: Some(request.user_email),
        ..TokenConnectParams::default()
    })
    .await
    .unwrap();
    assert_eq!(broker.session_password("device-7").as_deref(), Some("pass-1"));

    tokens.refresh_token().await.unwrap();
    broker.accept_password(Some("pass-2"));
    broker.kick("device-7");
    wait_until(|| connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(broker.session_password("device-7").as_deref(), Some("pass-2"));
}

#[tokio::test(start_paused = true)]
async fn connect_with_token_needs_a_credential_source() {
    let broker = MemoryBroker::new();
    let service = Arc::new(ScriptedTokenService::default());
    let sup = MqttManager::from_config(without_requests("nosource"))
        .unwrap()
        .with_transport(Arc::new(broker.transport()))
        .with_token_manager(common::token_manager(service, TokenConfig::default()))
        .build()
        .unwrap();

    let err = sup
        .connect_with_token(TokenConnectParams {
            organization_id: "org_1".into(),
            ..TokenConnectParams::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Configuration(_)));

    let err = sup
        .connect_with_token(TokenConnectParams {
            organization_id: "org_1".into(),
            external_token: Some(String::new()),
            ..TokenConnectParams::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TetherError::Token(_)));
    assert_eq!(broker.connect_attempts(), 0);
}

/// Starts `connect` on its own task and waits for the acknowledgment, so the
/// caller can act while the post-connect work is still running.
async fn connect_in_background(
    sup: &tether::Supervisor,
) -> tokio::task::JoinHandle<Result<(), TetherError>> {
    let mut state = sup.watch_state();
    let task = tokio::spawn({
        let sup = sup.clone();
        async move { sup.connect(ConnectParams::default()).await }
    });
    state.wait_for(ConnectionState::is_connected).await.unwrap();
    task
}

#[tokio::test(start_paused = true)]
async fn publish_while_settling_without_buffer_is_sent() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("settling");
    cfg.offline_queue.enabled = false;
    cfg.post_connect_delay_ms = 1_000;
    let sup = supervisor(&broker, cfg);

    let connecting = connect_in_background(&sup).await;
    let outcome = sup.publish("status", "up", PublishOptions::default()).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Sent);
    let sent: Vec<_> = broker.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(sent, ["status"]);
    connecting.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn publish_while_flushing_queues_behind_the_backlog() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("backlog");
    cfg.post_connect_delay_ms = 1_000;
    let sup = supervisor(&broker, cfg);

    let queued = sup.publish("old", "1", PublishOptions::default()).await.unwrap();
    assert_eq!(queued, PublishOutcome::Queued);

    let connecting = connect_in_background(&sup).await;
    let outcome = sup.publish("new", "2", PublishOptions::default()).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Queued);
    assert!(broker.published().is_empty());

    connecting.await.unwrap().unwrap();
    let sent: Vec<_> = broker.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(sent, ["old", "new"]);

    let outcome = sup.publish("live", "3", PublishOptions::default()).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Sent);
}

#[tokio::test(start_paused = true)]
async fn publish_while_settling_with_empty_buffer_is_sent() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("empty-backlog");
    cfg.post_connect_delay_ms = 1_000;
    let sup = supervisor(&broker, cfg);

    let connecting = connect_in_background(&sup).await;
    let outcome = sup.publish("status", "up", PublishOptions::default()).await.unwrap();

    assert_eq!(outcome, PublishOutcome::Sent);
    assert_eq!(sup.offline_queue_len(), 0);
    connecting.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn settling_delay_is_not_bounded_by_connect_timeout() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("slow-settle");
    cfg.connect_timeout_ms = 1_000;
    cfg.post_connect_delay_ms = 1_500;
    let sup = supervisor(&broker, cfg);

    let started = tokio::time::Instant::now();
    sup.connect(ConnectParams::default()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(1_500));
    assert!(sup.is_connected());
    assert!(broker.is_connected("slow-settle"));
}

#[tokio::test(start_paused = true)]
async fn long_staggered_resubscribe_completes_a_forced_reconnect() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("many-subs");
    cfg.connect_timeout_ms = 1_000;
    cfg.staggered_resubscribe = true;
    cfg.resubscribe_delay_ms = 200;
    let sup = supervisor(&broker, cfg);

    sup.connect(ConnectParams::default()).await.unwrap();
    for i in 0..8 {
        sup.subscribe(&format!("topic/{i}"), SubscribeOptions::default())
            .await
            .unwrap();
    }

    let started = tokio::time::Instant::now();
    sup.reconnect().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(1_400));
    assert!(sup.is_connected());
    assert_eq!(broker.subscriptions("many-subs").len(), 8);
}

#[tokio::test(start_paused = true)]
async fn drop_during_settling_fails_the_connect() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("fragile");
    cfg.post_connect_delay_ms = 1_000;
    let sup = supervisor(&broker, cfg);

    let connecting = connect_in_background(&sup).await;
    broker.kick("fragile");

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::ConnectionLost));
    wait_until(|| sup.is_connected()).await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_does_not_satisfy_a_later_one() {
    let broker = MemoryBroker::new();
    let mut cfg = without_requests("abandoned");
    cfg.post_connect_delay_ms = 500;
    let sup = supervisor(&broker, cfg);

    let early = tokio::time::timeout(Duration::from_millis(100), sup.connect(ConnectParams::default())).await;
    assert!(early.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(sup.is_connected());
    sup.disconnect().await.unwrap();
    assert!(matches!(sup.state(), ConnectionState::Disconnected(_)));

    let attempts = broker.connect_attempts();
    sup.connect(ConnectParams::default()).await.unwrap();
    assert_eq!(broker.connect_attempts(), attempts + 1);
    assert!(sup.is_connected());
}
