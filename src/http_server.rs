use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::transport::{
    EventRequest, MessageSink, Reply, ReplySink, SelfInfo, Transport, UserHandle,
};

/// Chat transport speaking JSON over HTTP: every `POST /messages` is one
/// inbound event, answered with the replies its handlers sent. Requests must
/// carry the session token issued at login, either as
/// `Authorization: Bearer <token>` or as the `session` query parameter.
pub struct HttpTransport {
    port: u16,
    public_url: String,
    me: SelfInfo,
    contacts: Arc<DashMap<String, UserHandle>>,
    session: Arc<RwLock<Option<String>>>,
}

#[derive(Clone)]
pub struct AppState {
    pub sink: Arc<dyn MessageSink>,
    pub contacts: Arc<DashMap<String, UserHandle>>,
    pub session: Arc<RwLock<Option<String>>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub request_id: String,
    pub replies: Vec<String>,
}

/// Replies sent while one request is being handled.
#[derive(Default)]
struct CollectedReplies(Mutex<Vec<String>>);

#[async_trait]
impl ReplySink for CollectedReplies {
    async fn send_text(&self, content: &str) -> Result<()> {
        self.0.lock().await.push(content.to_string());
        Ok(())
    }
}

impl HttpTransport {
    pub fn new(port: u16, me: SelfInfo) -> Self {
        HttpTransport {
            port,
            public_url: format!("http://localhost:{}", port),
            me,
            contacts: Arc::new(DashMap::new()),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// Base URL clients reach the server at, used in the login URL.
    pub fn with_public_url(mut self, public_url: impl Into<String>) -> Self {
        self.public_url = public_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn from_config(config: &Config) -> Self {
        let mut transport = HttpTransport::new(
            config.http_port,
            SelfInfo {
                handle: UserHandle::new(config.bot_id.clone()),
                nickname: config.bot_nickname.clone(),
            },
        );
        if let Some(public_url) = &config.public_url {
            transport = transport.with_public_url(public_url.clone());
        }
        for (nickname, handle) in &config.contacts {
            transport.add_contact(nickname.clone(), UserHandle::new(handle.clone()));
        }
        transport
    }

    pub fn add_contact(&self, nickname: impl Into<String>, handle: UserHandle) {
        self.contacts.insert(nickname.into(), handle);
    }

    /// Token of the current session, once `login` has issued one.
    pub async fn session_token(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    pub fn router(&self, sink: Arc<dyn MessageSink>) -> Router {
        create_router(AppState {
            sink,
            contacts: self.contacts.clone(),
            session: self.session.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn login(&self, on_qrcode: &(dyn Fn(String) + Send + Sync + '_)) -> Result<()> {
        let session = uuid::Uuid::new_v4().to_string();
        *self.session.write().await = Some(session.clone());
        info!("🔑 HTTP session issued");
        on_qrcode(session);
        Ok(())
    }

    fn qrcode_url(&self, token: &str) -> String {
        format!("{}/messages?session={}", self.public_url, token)
    }

    async fn current_user(&self) -> Result<SelfInfo> {
        Ok(self.me.clone())
    }

    async fn find_friend(&self, nickname: &str) -> Result<Option<UserHandle>> {
        Ok(self.contacts.get(nickname).map(|entry| entry.value().clone()))
    }

    async fn serve(&self, sink: Arc<dyn MessageSink>) -> Result<()> {
        let app = self.router(sink);

        let listener = tokio::net::TcpListener::bind(&format!("0.0.0.0:{}", self.port))
            .await
            .map_err(|e| anyhow!("Failed to bind to port {}: {}", self.port, e))?;

        info!("HTTP server starting on port {}", self.port);
        info!("Messages endpoint: http://0.0.0.0:{}/messages", self.port);

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow!("HTTP server error: {}", e))?;

        Ok(())
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/messages", post(handle_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "chatrelay HTTP transport is running",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn verify_session(
    expected: Option<&str>,
    headers: &HeaderMap,
    query: &SessionQuery,
    request_id: uuid::Uuid,
) -> Result<()> {
    let expected = expected.ok_or_else(|| anyhow!("No session issued yet"))?;

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);

    let presented = bearer
        .or(query.session.as_deref())
        .ok_or_else(|| anyhow!("Missing session token"))?;

    if presented != expected {
        return Err(anyhow!("Session token does not match"));
    }

    debug!("[{}] ✅ Session token verified", request_id);
    Ok(())
}

async fn handle_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    Json(request): Json<EventRequest>,
) -> Result<Json<MessageResponse>, StatusCode> {
    let request_id = uuid::Uuid::new_v4();

    let session = state.session.read().await.clone();
    if let Err(e) = verify_session(session.as_deref(), &headers, &query, request_id) {
        error!("[{}] ❌ Session check failed: {}", request_id, e);
        return Err(StatusCode::UNAUTHORIZED);
    }

    info!(
        "[{}] 📥 Message received | From: {} | Group: {} | Length: {}",
        request_id,
        request.sender,
        request.is_group,
        request.content.len()
    );

    if let Some(nickname) = &request.sender_nickname {
        state.contacts.insert(nickname.clone(), request.sender.clone());
    }

    let collected = Arc::new(CollectedReplies::default());
    state
        .sink
        .deliver(request, Reply::new(collected.clone()))
        .await;

    let replies = std::mem::take(&mut *collected.0.lock().await);
    debug!("[{}] 📤 {} reply(ies)", request_id, replies.len());

    Ok(Json(MessageResponse {
        request_id: request_id.to_string(),
        replies,
    }))
}
