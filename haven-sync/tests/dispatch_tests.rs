use async_trait::async_trait;
use haven_sync::{
    DispatchError, DispatchOutcome, DispatchRequest, HttpDispatcher, HttpMethod,
    MutationDispatcher, SyncError, TokenProvider,
};
use haven_types::{OperationId, OperationKind};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(method: HttpMethod, path: &str, body: Value) -> DispatchRequest {
    DispatchRequest {
        id: OperationId::new(),
        kind: OperationKind::CreateIncident,
        method,
        path: path.to_string(),
        body,
    }
}

fn dispatcher(server: &MockServer) -> HttpDispatcher {
    HttpDispatcher::new(server.uri(), Duration::from_secs(5)).unwrap()
}

// ── Success ─────────────────────────────────────────────────────

#[tokio::test]
async fn created_returns_server_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/incidents"))
        .and(body_json(json!({ "title": "night shift" })))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "inc-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server)
        .dispatch(request(
            HttpMethod::Post,
            "/incidents",
            json!({ "title": "night shift" }),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Applied {
            server: Some(json!({ "id": "inc-1" }))
        }
    );
}

#[tokio::test]
async fn no_content_applies_without_record() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/incidents/42"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let outcome = dispatcher(&server)
        .dispatch(request(HttpMethod::Patch, "/incidents/42", json!({})))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Applied { server: None });
}

#[tokio::test]
async fn non_json_success_body_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let outcome = dispatcher(&server)
        .dispatch(request(HttpMethod::Post, "/messages", json!({})))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Applied { server: None });
}

#[tokio::test]
async fn trailing_slash_in_base_url_is_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/safety-plans/p1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher =
        HttpDispatcher::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
    dispatcher
        .dispatch(request(HttpMethod::Put, "/safety-plans/p1", json!({})))
        .await
        .unwrap();
}

// ── Headers ─────────────────────────────────────────────────────

#[tokio::test]
async fn operation_id_is_the_idempotency_key() {
    let server = MockServer::start().await;
    let req = request(HttpMethod::Post, "/alerts/emergency", json!({}));
    Mock::given(method("POST"))
        .and(header("idempotency-key", req.id.to_string().as_str()))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    dispatcher(&server).dispatch(req).await.unwrap();
}

struct StaticToken(Option<&'static str>);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        self.0.map(String::from)
    }
}

#[tokio::test]
async fn bearer_token_is_attached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    dispatcher(&server)
        .with_token_provider(Arc::new(StaticToken(Some("s3cret"))))
        .dispatch(request(HttpMethod::Post, "/messages", json!({})))
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_token_sends_no_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let outcome = dispatcher(&server)
        .with_token_provider(Arc::new(StaticToken(None)))
        .dispatch(request(HttpMethod::Post, "/messages", json!({})))
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Applied { server: None });
}

// ── Failures ────────────────────────────────────────────────────

#[tokio::test]
async fn conflict_carries_server_record() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(
            ResponseTemplate::new(409).set_body_json(json!({ "id": "p1", "updated_at": 7 })),
        )
        .mount(&server)
        .await;

    let outcome = dispatcher(&server)
        .dispatch(request(HttpMethod::Put, "/safety-plans/p1", json!({})))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Conflict {
            server: json!({ "id": "p1", "updated_at": 7 })
        }
    );
}

#[tokio::test]
async fn conflict_without_json_is_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(409).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = dispatcher(&server)
        .dispatch(request(HttpMethod::Put, "/safety-plans/p1", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidResponse(_)));
    assert!(matches!(SyncError::from(err), SyncError::Serialization(_)));
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/invalid"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;
    Mock::given(path("/slow-down"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let d = dispatcher(&server);
    for (route, status, transient) in [("/busy", 503, true), ("/invalid", 422, false), ("/slow-down", 429, true)] {
        let err = d
            .dispatch(request(HttpMethod::Post, route, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Status(s) if s == status), "{route}");
        let err = SyncError::from(err);
        assert!(matches!(err, SyncError::Http { status: s } if s == status));
        assert_eq!(err.is_transient(), transient, "{route}");
    }
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let d = HttpDispatcher::new(server.uri(), Duration::from_millis(100)).unwrap();
    let err = d
        .dispatch(request(HttpMethod::Post, "/messages", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Timeout));
    assert!(SyncError::from(err).is_transient());
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let err = HttpDispatcher::new(uri, Duration::from_secs(2))
        .unwrap()
        .dispatch(request(HttpMethod::Post, "/messages", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Network(_)));
    assert!(matches!(SyncError::from(err), SyncError::NetworkUnavailable));
}
