use std::time::Duration;

use serde_json::json;
use tether::{
    config::TokenConfig,
    token::{
        CreateTokenRequest, ExchangeTokenRequest, HttpTokenService, RefreshTokenRequest, TokenService,
    },
    TokenError, TokenManager, TokenState,
};
use wiremock::{
    matchers::{body_partial_json, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn token_body(password: &str) -> serde_json::Value {
    json!({
        "token_id": "tok_42",
        "access_token": "eyJhbGciOi",
        "mqtt_credentials": { "username": "device-42", "password": password },
        "user_email": "ops@example.com",
        "provider": "native",
        "expires_at": "2099-01-01T00:00:00Z",
        "refresh_recommended_at": "2098-12-31T23:00:00Z"
    })
}

fn service(server: &MockServer) -> HttpTokenService {
    HttpTokenService::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

fn create_request() -> CreateTokenRequest {
    CreateTokenRequest {
        organization_id: "org_1".into(),
        secret_key: "sk_live".into(),
        user_email: "ops@example.com".into(),
        integration_id: None,
        replace_existing: Some(true),
    }
}

#[tokio::test]
async fn create_posts_the_request_and_parses_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/create"))
        .and(body_partial_json(json!({
            "organization_id": "org_1",
            "secret_key": "sk_live",
            "replace_existing": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("p1")))
        .expect(1)
        .mount(&server)
        .await;

    let response = service(&server).create(&create_request()).await.unwrap();
    assert_eq!(response.token_id, "tok_42");
    assert_eq!(response.mqtt_credentials.username, "device-42");
    assert_eq!(response.mqtt_credentials.password, "p1");
    assert!(response.expires_at.is_some());
}

#[tokio::test]
async fn exchange_maps_not_found_and_rate_limits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/exchange"))
        .and(body_partial_json(json!({ "token": "unknown-idp" })))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "error": "Provider not configured" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/exchange"))
        .and(body_partial_json(json!({ "token": "busy" })))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let svc = service(&server);
    let exchange = |token: &str| ExchangeTokenRequest {
        organization_id: "org_1".into(),
        token: token.into(),
        integration_id: Some("int_1".into()),
    };

    assert!(matches!(
        svc.exchange(&exchange("unknown-idp")).await,
        Err(TokenError::ProviderNotFound(msg)) if msg == "Provider not configured"
    ));
    assert!(matches!(
        svc.exchange(&exchange("busy")).await,
        Err(TokenError::RateLimited(msg)) if msg == "slow down"
    ));
}

#[tokio::test]
async fn refresh_unauthorized_means_expired() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/refresh"))
        .and(body_partial_json(json!({ "token_id": "tok_42", "current_token_password": "p1" })))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "token revoked" })))
        .mount(&server)
        .await;

    let err = service(&server)
        .refresh(&RefreshTokenRequest {
            token_id: "tok_42".into(),
            current_token_password: "p1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, TokenError::TokenExpired("token revoked".into()));
}

#[tokio::test]
async fn undecodable_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/create"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = service(&server).create(&create_request()).await.unwrap_err();
    assert!(matches!(err, TokenError::InvalidResponse(_)));
}

#[tokio::test]
async fn providers_are_listed_per_organization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/providers"))
        .and(query_param("organization_id", "org_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "providers": [
                { "id": "auth0", "name": "Auth0", "type": "oidc", "enabled": true },
                { "id": "native" }
            ]
        })))
        .mount(&server)
        .await;

    let providers = service(&server).providers("org_1").await.unwrap();
    assert_eq!(providers.len(), 2);
    assert_eq!(providers[0].provider_type.as_deref(), Some("oidc"));
    assert_eq!(providers[1].name, None);
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    let svc = HttpTokenService::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
    let err = svc.create(&create_request()).await.unwrap_err();
    assert!(matches!(err, TokenError::Network(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn manager_round_trip_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("p1")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/refresh"))
        .and(body_partial_json(json!({ "current_token_password": "p1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("p2")))
        .expect(1)
        .mount(&server)
        .await;

    let tm = TokenManager::new(TokenConfig {
        service_url: Some(server.uri()),
        ..TokenConfig::default()
    })
    .unwrap();

    let info = tm.create_token(create_request()).await.unwrap();
    assert_eq!(info.token_id, "tok_42");
    assert_eq!(tm.state(), TokenState::Valid);
    assert_eq!(tm.credentials().unwrap().password, "p1");

    tm.refresh_token().await.unwrap();
    assert_eq!(tm.credentials().unwrap().password, "p2");
    tm.destroy();
}

#[tokio::test]
async fn expired_credential_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("p1")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/tokens/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "token revoked" })))
        .expect(1)
        .mount(&server)
        .await;

    let tm = TokenManager::new(TokenConfig {
        service_url: Some(server.uri()),
        max_refresh_retries: 3,
        refresh_retry_delay_ms: 10,
        ..TokenConfig::default()
    })
    .unwrap();
    tm.create_token(create_request()).await.unwrap();

    match tm.refresh_token().await.unwrap_err() {
        TokenError::RefreshFailed { attempts, last } => {
            assert_eq!(attempts, 1);
            assert_eq!(*last, TokenError::TokenExpired("token revoked".into()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(tm.state(), TokenState::Error);
}
