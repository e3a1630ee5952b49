//! # Transport Interface
//!
//! The narrow surface the dispatcher needs from a chat transport: login,
//! identity lookups, reply delivery and the inbound message loop.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.0.0: Initial transport trait with QR login callback

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Base of the URL a login QR code is displayed at.
pub const QRCODE_BASE_URL: &str = "https://login.weixin.qq.com/qrcode/";

/// Opaque sender handle. Two handles are the same user exactly when the
/// transport gave out equal strings for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserHandle(String);

impl UserHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        UserHandle(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The logged-in bot account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub handle: UserHandle,
    pub nickname: String,
}

/// One inbound chat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    pub content: String,
    pub sender: UserHandle,
    #[serde(default)]
    pub sender_nickname: Option<String>,
    #[serde(default = "default_true")]
    pub is_text: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_mentioned: bool,
}

fn default_true() -> bool {
    true
}

impl EventRequest {
    /// A direct text message from `sender`.
    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Self {
        EventRequest {
            content: content.into(),
            sender: UserHandle::new(sender),
            sender_nickname: None,
            is_text: true,
            is_group: false,
            is_mentioned: false,
        }
    }

    pub fn in_group(mut self) -> Self {
        self.is_group = true;
        self
    }

    pub fn mentioned(mut self) -> Self {
        self.is_mentioned = true;
        self
    }
}

/// Sends text back to wherever one inbound message came from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_text(&self, content: &str) -> Result<()>;
}

/// Reply capability handed to handlers alongside the request it belongs to.
#[derive(Clone)]
pub struct Reply {
    sink: Arc<dyn ReplySink>,
}

impl Reply {
    pub fn new(sink: Arc<dyn ReplySink>) -> Self {
        Reply { sink }
    }

    pub async fn text(&self, content: impl AsRef<str>) -> Result<()> {
        self.sink
            .send_text(content.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("failed to reply: {}", e))
    }
}

/// Receiver of inbound events; implemented by the dispatcher.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, request: EventRequest, reply: Reply);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Logs in, calling `on_qrcode` with the session token once a login QR
    /// code is issued.
    async fn login(&self, on_qrcode: &(dyn Fn(String) + Send + Sync + '_)) -> Result<()>;

    fn qrcode_url(&self, token: &str) -> String {
        format!("{}{}", QRCODE_BASE_URL, token)
    }

    async fn current_user(&self) -> Result<SelfInfo>;

    /// Looks a friend up by nickname.
    async fn find_friend(&self, nickname: &str) -> Result<Option<UserHandle>>;

    /// Hands inbound events to `sink` until the session ends.
    async fn serve(&self, sink: Arc<dyn MessageSink>) -> Result<()>;
}
