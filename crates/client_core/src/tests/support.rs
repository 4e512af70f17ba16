use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json as json_value, Value};
use shared::{
    domain::{ConversationId, MessageId, MessageKind, UserId},
    protocol::MessagePayload,
};
use tokio::net::TcpListener;

use crate::{
    config::ClientSettings,
    conversations::ConversationStore,
    durable::MemoryDurableState,
    error::ClientError,
    gateway::RequestGateway,
    token_store::TokenPair,
    transport::{ApiRequest, ApiResponse, HttpTransport},
};

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, ClientError> + Send + Sync;

/// In-memory transport answering from a closure and recording every call.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    log: Mutex<Vec<ApiRequest>>,
    renewal_delay: Duration,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, ClientError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_renewal_delay(Duration::ZERO, handler)
    }

    /// Holds every renewal call for `delay` so concurrent callers pile up.
    pub(crate) fn with_renewal_delay(
        delay: Duration,
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, ClientError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            renewal_delay: delay,
        })
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().expect("request log").clone()
    }

    pub(crate) fn count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        self.log.lock().expect("request log").push(request.clone());
        if request.is_renewal && !self.renewal_delay.is_zero() {
            tokio::time::sleep(self.renewal_delay).await;
        }
        (self.handler)(request)
    }
}

pub(crate) fn json(status: u16, body: Value) -> Result<ApiResponse, ClientError> {
    Ok(ApiResponse::json_body(status, &body))
}

pub(crate) fn status(status: u16) -> Result<ApiResponse, ClientError> {
    Ok(ApiResponse::new(status, Vec::new()))
}

#[derive(Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    exp: i64,
}

/// HS256 token whose `exp` is `expires_in_secs` from now. `label` keeps
/// tokens minted in the same second distinct.
pub(crate) fn mint_token(label: &str, expires_in_secs: i64) -> String {
    let claims = TestClaims {
        sub: label,
        exp: Utc::now().timestamp() + expires_in_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("mint token")
}

pub(crate) fn bearer(request: &ApiRequest) -> Option<&str> {
    request.bearer.as_deref()
}

pub(crate) async fn spawn_server(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub(crate) fn query<'a>(request: &'a ApiRequest, key: &str) -> Option<&'a str> {
    request
        .query
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

pub(crate) fn at(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).expect("timestamp")
}

pub(crate) fn message(
    id: i64,
    conversation_id: i64,
    kind: MessageKind,
    offset_secs: i64,
) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        kind,
        content: format!("message {id}"),
        timestamp: at(offset_secs),
        sender_id: Some(UserId(1)),
    }
}

pub(crate) fn chat(id: i64, conversation_id: i64, offset_secs: i64) -> MessagePayload {
    message(id, conversation_id, MessageKind::Chat, offset_secs)
}

pub(crate) fn member_json(id: i64, username: &str) -> Value {
    json_value!({ "id": id, "username": username })
}

pub(crate) fn summary_json(id: i64, name: &str, unread: u32) -> Value {
    json_value!({
        "id": id,
        "name": name,
        "members": [member_json(1, "alice")],
        "unreadCount": unread,
        "muted": false
    })
}

pub(crate) fn settings(page_size: u32) -> ClientSettings {
    ClientSettings {
        page_size,
        read_receipt_quiet_period: Duration::from_millis(2_000),
        ..ClientSettings::default()
    }
}

/// Store over `transport` with a live (non-expiring within a test) session.
pub(crate) async fn logged_in_store(
    transport: Arc<ScriptedTransport>,
    page_size: u32,
) -> (Arc<ConversationStore>, Arc<MemoryDurableState>) {
    let durable = Arc::new(MemoryDurableState::new());
    let gateway = RequestGateway::new(transport, durable.clone(), Duration::from_secs(10));
    gateway
        .set_tokens(TokenPair::new(mint_token("A1", 3_600), "R1"))
        .await
        .expect("tokens");
    let store = ConversationStore::new(gateway, durable.clone(), &settings(page_size))
        .expect("store");
    (store, durable)
}
