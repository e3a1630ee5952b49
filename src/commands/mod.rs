//! # Command System
//!
//! Slash-command definitions, parsing, lookup and permission checks.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.0.0: Registry with wildcard command, bounded argument splitting and
//!   admin override

pub mod builtin;
pub mod parser;
pub mod permission;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;

use crate::transport::{EventRequest, Reply};

pub use parser::{is_command, parse_command_with_arg, split_args, COMMAND_MARKER};
pub use permission::is_allowed;
pub use registry::{CommandRegistry, WILDCARD};

/// Runs a command once its sender has been allowed.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, args: Vec<String>, request: EventRequest, reply: Reply) -> Result<()>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Vec<String>, EventRequest, Reply) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, args: Vec<String>, request: EventRequest, reply: Reply) -> Result<()> {
        self(args, request, reply).await
    }
}

/// Decides whether a non-admin sender may run a command.
#[async_trait]
pub trait PermissionPredicate: Send + Sync {
    async fn is_allowed(&self, request: EventRequest) -> Result<bool>;
}

#[async_trait]
impl<F, Fut> PermissionPredicate for F
where
    F: Fn(EventRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn is_allowed(&self, request: EventRequest) -> Result<bool> {
        self(request).await
    }
}

/// A registered command.
pub struct Command {
    /// Upper bound on the number of argument tokens; 0 splits on every space.
    pub args_length: usize,
    pub is_allowed: Option<Box<dyn PermissionPredicate>>,
    pub handler: Box<dyn CommandHandler>,
}

impl Command {
    /// Builds a command from an async closure.
    ///
    /// # Example
    /// ```
    /// use chatrelay::commands::Command;
    ///
    /// let echo = Command::new(|args, _request, reply| async move {
    ///     reply.text(args.join(" ")).await
    /// })
    /// .with_args_length(1);
    /// assert_eq!(echo.args_length, 1);
    /// ```
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Vec<String>, EventRequest, Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_handler(handler)
    }

    pub fn from_handler(handler: impl CommandHandler + 'static) -> Self {
        Command {
            args_length: 0,
            is_allowed: None,
            handler: Box::new(handler),
        }
    }

    pub fn with_args_length(mut self, args_length: usize) -> Self {
        self.args_length = args_length;
        self
    }

    /// Lets non-admin senders run the command when `predicate` says so.
    pub fn with_permission<F, Fut>(self, predicate: F) -> Self
    where
        F: Fn(EventRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.with_predicate(predicate)
    }

    pub fn with_predicate(mut self, predicate: impl PermissionPredicate + 'static) -> Self {
        self.is_allowed = Some(Box::new(predicate));
        self
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("args_length", &self.args_length)
            .field("has_permission_check", &self.is_allowed.is_some())
            .finish()
    }
}
