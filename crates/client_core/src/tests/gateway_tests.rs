use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use super::*;
use crate::{
    durable::MemoryDurableState,
    test_support::{bearer, json, mint_token, spawn_server, status, ScriptedTransport},
    transport::ReqwestTransport,
};

const BUFFER: Duration = Duration::from_secs(10);

fn gateway_over(transport: Arc<dyn HttpTransport>) -> (Arc<RequestGateway>, Arc<MemoryDurableState>) {
    let durable = Arc::new(MemoryDurableState::new());
    let gateway = RequestGateway::new(transport, durable.clone(), BUFFER);
    (gateway, durable)
}

#[derive(Clone)]
struct AuthServer {
    a1: String,
    a2: String,
    refresh_bodies: Arc<Mutex<Vec<Value>>>,
    data_calls: Arc<AtomicUsize>,
}

async fn login(State(server): State<AuthServer>) -> Json<Value> {
    Json(json!({ "token": server.a1, "refreshToken": "R1" }))
}

async fn refresh(State(server): State<AuthServer>, Json(body): Json<Value>) -> Json<Value> {
    server.refresh_bodies.lock().expect("bodies").push(body);
    Json(json!({ "token": server.a2 }))
}

async fn conversations(State(server): State<AuthServer>, headers: HeaderMap) -> Response {
    server.data_calls.fetch_add(1, Ordering::SeqCst);
    let expected = format!("Bearer {}", server.a2);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Json(json!([])).into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[tokio::test]
async fn expired_call_is_renewed_and_retried_transparently() {
    let server = AuthServer {
        a1: mint_token("A1", 300),
        a2: mint_token("A2", 600),
        refresh_bodies: Arc::new(Mutex::new(Vec::new())),
        data_calls: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/conversations", get(conversations))
        .with_state(server.clone());
    let server_url = spawn_server(app).await;
    let (gateway, durable) = gateway_over(Arc::new(ReqwestTransport::new(server_url)));

    gateway.login("alice", "secret").await.expect("login");
    assert_eq!(gateway.tokens().access_token().await.as_deref(), Some(server.a1.as_str()));

    let listed: Vec<Value> = gateway
        .fetch_json(ApiRequest::get("/conversations"))
        .await
        .expect("caller only sees the retried success");
    assert!(listed.is_empty());

    assert_eq!(server.data_calls.load(Ordering::SeqCst), 2);
    let bodies = server.refresh_bodies.lock().expect("bodies").clone();
    assert_eq!(bodies, vec![json!({ "refreshToken": "R1" })]);

    // Refresh response omitted refreshToken: only the access token rotated.
    let pair = gateway.tokens().pair().await.expect("pair");
    assert_eq!(pair.access_token(), server.a2);
    assert_eq!(pair.refresh_token(), "R1");
    let persisted = durable.load_tokens().await.expect("load").expect("stored");
    assert_eq!(persisted, pair);
    assert_eq!(gateway.refresh_state().await, RefreshState::Idle);
}

#[tokio::test(start_paused = true)]
async fn concurrent_auth_failures_share_one_renewal() {
    let a1 = mint_token("A1", 300);
    let a2 = mint_token("A2", 600);
    let renewed = a2.clone();
    let transport = ScriptedTransport::with_renewal_delay(Duration::from_millis(100), move |request| {
        match request.path.as_str() {
            "/auth/refresh" => json(200, json!({ "token": renewed })),
            "/data" if bearer(request) == Some(renewed.as_str()) => json(200, json!({ "ok": true })),
            "/data" => status(401),
            _ => status(404),
        }
    });
    let (gateway, _) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(a1, "R1"))
        .await
        .expect("tokens");

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.send(ApiRequest::get("/data")).await })
        })
        .collect();
    for call in calls {
        let response = call.await.expect("join").expect("retried call succeeds");
        assert_eq!(response.status, 200);
    }

    assert_eq!(transport.count("/auth/refresh"), 1);
    let retries: Vec<_> = transport
        .requests()
        .into_iter()
        .filter(|request| request.path == "/data" && request.retried)
        .collect();
    assert_eq!(retries.len(), 8);
    assert!(retries.iter().all(|request| bearer(request) == Some(a2.as_str())));
}

#[tokio::test]
async fn rejected_renewal_logs_out_and_surfaces_original_failure() {
    let transport = ScriptedTransport::new(|_| status(401));
    let (gateway, durable) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 300), "R1"))
        .await
        .expect("tokens");
    let mut events = gateway.subscribe();

    let err = gateway
        .send(ApiRequest::get("/data"))
        .await
        .expect_err("renewal rejected");
    assert!(matches!(err, ClientError::AuthExpired { status: 401 }), "got {err:?}");

    assert!(!gateway.is_logged_in().await);
    assert!(!gateway.session_timer_armed().await);
    assert_eq!(gateway.refresh_state().await, RefreshState::LoggedOut);
    assert!(durable.load_tokens().await.expect("load").is_none());
    assert_eq!(events.recv().await.expect("event"), SessionEvent::LoggedOut);
    assert_eq!(transport.count("/auth/refresh"), 1);
    assert_eq!(transport.count("/data"), 1);
}

#[tokio::test]
async fn a_call_is_retried_at_most_once() {
    let transport = ScriptedTransport::new(|request| match request.path.as_str() {
        "/auth/refresh" => json(200, json!({ "token": mint_token("A2", 600) })),
        _ => status(401),
    });
    let (gateway, _) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 300), "R1"))
        .await
        .expect("tokens");

    let err = gateway
        .send(ApiRequest::get("/data"))
        .await
        .expect_err("still unauthorized after retry");
    assert_eq!(err.status(), Some(401));
    assert_eq!(transport.count("/data"), 2);
    assert_eq!(transport.count("/auth/refresh"), 1);
    assert!(gateway.is_logged_in().await);
}

#[tokio::test]
async fn network_failure_is_not_retried() {
    let transport = ScriptedTransport::new(|_| Err(ClientError::Network("connection reset".into())));
    let (gateway, _) = gateway_over(transport.clone());

    let err = gateway
        .send(ApiRequest::get("/data"))
        .await
        .expect_err("network");
    assert!(matches!(err, ClientError::Network(_)));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn failed_login_is_not_refreshed() {
    let transport = ScriptedTransport::new(|_| status(401));
    let (gateway, _) = gateway_over(transport.clone());

    let err = gateway.login("alice", "wrong").await.expect_err("bad login");
    assert_eq!(err.status(), Some(401));
    assert_eq!(transport.count("/auth/refresh"), 0);
    assert!(!gateway.is_logged_in().await);
}

#[tokio::test]
async fn blank_credentials_never_reach_the_network() {
    let transport = ScriptedTransport::new(|_| status(500));
    let (gateway, _) = gateway_over(transport.clone());

    assert!(matches!(
        gateway.login("  ", "secret").await,
        Err(ClientError::Validation(_))
    ));
    assert!(matches!(
        gateway.login("alice", "").await,
        Err(ClientError::Validation(_))
    ));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn logout_is_best_effort_and_final() {
    let a1 = mint_token("A1", 300);
    let transport = ScriptedTransport::new(|request| match request.path.as_str() {
        "/auth/logout" => Err(ClientError::Network("server unreachable".into())),
        _ => status(401),
    });
    let (gateway, durable) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(a1.clone(), "R1"))
        .await
        .expect("tokens");
    durable
        .save_active_conversation(shared::domain::ConversationId(3))
        .await
        .expect("save active");

    gateway.logout().await;

    let notified = transport.requests();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].path, "/auth/logout");
    assert_eq!(bearer(&notified[0]), Some(a1.as_str()));
    assert!(!gateway.is_logged_in().await);
    assert!(durable.load_active_conversation().await.expect("load").is_none());
    assert_eq!(gateway.refresh_state().await, RefreshState::LoggedOut);

    // Nothing left to renew with; the failure just propagates.
    let err = gateway
        .send(ApiRequest::get("/data"))
        .await
        .expect_err("logged out");
    assert!(matches!(err, ClientError::AuthExpired { .. }));
    assert_eq!(transport.count("/auth/refresh"), 0);
    assert!(transport.requests().last().and_then(|r| r.bearer.clone()).is_none());
}

#[tokio::test(start_paused = true)]
async fn renewal_settling_after_logout_is_discarded() {
    let transport = ScriptedTransport::with_renewal_delay(Duration::from_millis(200), |request| {
        match request.path.as_str() {
            "/auth/refresh" => json(200, json!({ "token": mint_token("A2", 600), "refreshToken": "R2" })),
            "/auth/logout" => status(204),
            _ => status(401),
        }
    });
    let (gateway, _) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 300), "R1"))
        .await
        .expect("tokens");

    let pending = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.send(ApiRequest::get("/data")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.refresh_state().await, RefreshState::Refreshing);

    gateway.logout().await;
    let err = pending.await.expect("join").expect_err("session ended");
    assert!(matches!(err, ClientError::AuthExpired { .. }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(gateway.tokens().pair().await.is_none());
    assert_eq!(gateway.refresh_state().await, RefreshState::LoggedOut);
}

async fn stale_renewal_failure_leaves_next_session_alone(refresh_status: u16) {
    let bob_token = mint_token("bob", 600);
    let served = bob_token.clone();
    let transport = ScriptedTransport::with_renewal_delay(Duration::from_millis(200), move |request| {
        match request.path.as_str() {
            "/auth/refresh" => status(refresh_status),
            "/auth/logout" => status(204),
            "/auth/login" => json(200, json!({ "token": served, "refreshToken": "R-bob" })),
            _ => status(401),
        }
    });
    let (gateway, durable) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 300), "R1"))
        .await
        .expect("tokens");

    let pending = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.send(ApiRequest::get("/data")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.refresh_state().await, RefreshState::Refreshing);

    gateway.logout().await;
    gateway.login("bob", "hunter2").await.expect("login");
    let mut events = gateway.subscribe();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let err = pending.await.expect("join").expect_err("old session ended");
    assert!(matches!(err, ClientError::AuthExpired { .. }));

    assert!(gateway.is_logged_in().await);
    let pair = gateway.tokens().pair().await.expect("new session");
    assert_eq!(pair.access_token(), bob_token);
    assert_eq!(pair.refresh_token(), "R-bob");
    let persisted = durable.load_tokens().await.expect("load").expect("persisted");
    assert_eq!(persisted.access_token(), bob_token);
    assert_eq!(gateway.refresh_state().await, RefreshState::Idle);
    assert!(gateway.session_timer_armed().await);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(transport.count("/auth/refresh"), 1);
}

#[tokio::test(start_paused = true)]
async fn renewal_failing_after_relogin_does_not_end_new_session() {
    stale_renewal_failure_leaves_next_session_alone(500).await;
}

#[tokio::test(start_paused = true)]
async fn renewal_rejected_after_relogin_does_not_end_new_session() {
    stale_renewal_failure_leaves_next_session_alone(401).await;
}

#[tokio::test(start_paused = true)]
async fn session_timer_renews_ahead_of_expiry() {
    let transport = ScriptedTransport::new(|request| match request.path.as_str() {
        "/auth/refresh" => json(200, json!({ "token": mint_token("A2", 3_600) })),
        _ => status(404),
    });
    let (gateway, _) = gateway_over(transport.clone());
    let a1 = mint_token("A1", 60);
    gateway
        .set_tokens(TokenPair::new(a1.clone(), "R1"))
        .await
        .expect("tokens");
    assert!(gateway.session_timer_armed().await);

    tokio::time::sleep(Duration::from_secs(48)).await;
    assert_eq!(transport.count("/auth/refresh"), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(transport.count("/auth/refresh"), 1);
    let current = gateway.tokens().access_token().await.expect("token");
    assert_ne!(current, a1);
    assert!(gateway.session_timer_armed().await, "re-armed for the new token");
}

#[tokio::test(start_paused = true)]
async fn expired_token_renews_immediately() {
    let transport = ScriptedTransport::new(|request| match request.path.as_str() {
        "/auth/refresh" => json(200, json!({ "token": mint_token("A2", 3_600) })),
        _ => status(404),
    });
    let (gateway, _) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", -30), "R1"))
        .await
        .expect("tokens");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.count("/auth/refresh"), 1);
    assert_eq!(gateway.refresh_state().await, RefreshState::Idle);
}

#[tokio::test]
async fn undecodable_token_ends_the_session() {
    let transport = ScriptedTransport::new(|_| status(404));
    let (gateway, _) = gateway_over(transport);
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 300), "R1"))
        .await
        .expect("valid tokens");
    let mut events = gateway.subscribe();

    let err = gateway
        .set_tokens(TokenPair::new("not-a-jwt", "R2"))
        .await
        .expect_err("undecodable");
    assert!(matches!(err, ClientError::InvalidToken(_)));
    assert!(!gateway.is_logged_in().await);
    assert!(!gateway.session_timer_armed().await);
    assert_eq!(events.recv().await.expect("event"), SessionEvent::LoggedOut);
}

#[tokio::test]
async fn undecodable_renewed_token_fails_the_renewal() {
    let transport = ScriptedTransport::new(|request| match request.path.as_str() {
        "/auth/refresh" => json(200, json!({ "token": "garbage" })),
        _ => status(401),
    });
    let (gateway, _) = gateway_over(transport.clone());
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 300), "R1"))
        .await
        .expect("tokens");

    let err = gateway
        .send(ApiRequest::get("/data"))
        .await
        .expect_err("renewal unusable");
    assert!(matches!(err, ClientError::AuthExpired { .. }));
    assert!(!gateway.is_logged_in().await);
    assert_eq!(gateway.refresh_state().await, RefreshState::LoggedOut);
    assert_eq!(transport.count("/data"), 1);
}

#[tokio::test]
async fn login_rotates_and_restore_resumes_persisted_pair() {
    let transport = ScriptedTransport::new(|request| match request.path.as_str() {
        "/auth/login" => json(200, json!({ "token": mint_token("A1", 300), "refreshToken": "R1" })),
        _ => status(404),
    });
    let (gateway, durable) = gateway_over(transport.clone());
    let mut events = gateway.subscribe();
    let epoch = gateway.session_epoch();

    gateway.login("alice", "secret").await.expect("login");
    assert_eq!(events.recv().await.expect("event"), SessionEvent::TokensRotated);
    assert!(!gateway.is_current(epoch));

    let restored = RequestGateway::new(transport, durable, BUFFER);
    assert!(restored.restore_session().await.expect("restore"));
    assert_eq!(
        restored.tokens().pair().await,
        gateway.tokens().pair().await
    );
    assert!(restored.session_timer_armed().await);
}

#[tokio::test]
async fn restore_without_persisted_pair_is_a_no_op() {
    let transport = ScriptedTransport::new(|_| status(404));
    let (gateway, _) = gateway_over(transport.clone());
    assert!(!gateway.restore_session().await.expect("restore"));
    assert!(!gateway.is_logged_in().await);
    assert!(transport.requests().is_empty());
}
