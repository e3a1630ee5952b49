//! # Message Dispatcher
//!
//! Decides for every inbound message whether it is a command, who may run it
//! and which handler gets it: a command, the `*` wildcard, the free-text
//! handler or the offline handler. Handler failures are logged against the
//! message and never reach the transport.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 1.0.0: Admin/mention command classification, offline mode, wildcard
//!   command and per-message error isolation

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, log_enabled, warn, Level};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

use crate::commands::{
    builtin, is_allowed, is_command, parse_command_with_arg, split_args, Command, CommandRegistry,
    COMMAND_MARKER,
};
use crate::errors::{DispatchError, SetupError, TransportError};
use crate::mode::{Mode, ModeSwitch};
use crate::notifier::LoginReporter;
use crate::transport::{EventRequest, MessageSink, Reply, SelfInfo, Transport, UserHandle};

/// Sent while offline when no offline handler is registered.
pub const OFFLINE_REPLY: &str = "bot is offline";

/// Handles every message that is not a command.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, content: String, request: EventRequest, reply: Reply) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String, EventRequest, Reply) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, content: String, request: EventRequest, reply: Reply) -> Result<()> {
        self(content, request, reply).await
    }
}

/// Handles non-command messages while the bot is offline.
#[async_trait]
pub trait OfflineHandler: Send + Sync {
    async fn handle(&self, request: EventRequest, reply: Reply) -> Result<()>;
}

#[async_trait]
impl<F, Fut> OfflineHandler for F
where
    F: Fn(EventRequest, Reply) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, request: EventRequest, reply: Reply) -> Result<()> {
        self(request, reply).await
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotSettings {
    /// Nickname of the friend allowed to run every command.
    pub admin_nickname: Option<String>,
    /// Webhook the login QR code URL is reported to.
    pub report_url: Option<String>,
}

pub struct Dispatcher {
    settings: BotSettings,
    transport: Arc<dyn Transport>,
    reporter: LoginReporter,
    commands: CommandRegistry,
    on_message: Option<Box<dyn MessageHandler>>,
    on_offline: Option<Box<dyn OfflineHandler>>,
    mode: ModeSwitch,
    admin: OnceLock<UserHandle>,
    me: OnceCell<SelfInfo>,
}

impl Dispatcher {
    pub fn new(settings: BotSettings, transport: Arc<dyn Transport>) -> Self {
        let reporter = LoginReporter::new(settings.report_url.clone());
        Dispatcher {
            settings,
            transport,
            reporter,
            commands: builtin::default_registry(),
            on_message: None,
            on_offline: None,
            mode: ModeSwitch::new(),
            admin: OnceLock::new(),
            me: OnceCell::new(),
        }
    }

    pub fn on_message(&mut self, handler: impl MessageHandler + 'static) -> Result<(), SetupError> {
        if self.on_message.is_some() {
            return Err(SetupError::MessageHandlerRegistered);
        }

        self.on_message = Some(Box::new(handler));
        Ok(())
    }

    pub fn on_offline(&mut self, handler: impl OfflineHandler + 'static) -> Result<(), SetupError> {
        if self.on_offline.is_some() {
            return Err(SetupError::OfflineHandlerRegistered);
        }

        self.on_offline = Some(Box::new(handler));
        Ok(())
    }

    pub fn on_command(&mut self, name: impl Into<String>, command: Command) -> Result<(), SetupError> {
        self.commands.register(name, command)
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn set_online(&self) {
        info!("🟢 Bot is online");
        self.mode.set_online();
    }

    pub fn set_offline(&self) {
        info!("🔴 Bot is offline");
        self.mode.set_offline();
    }

    pub fn is_offline(&self) -> bool {
        self.mode.is_offline()
    }

    /// Shared handle onto the mode, for commands that switch it.
    pub fn mode(&self) -> ModeSwitch {
        self.mode.clone()
    }

    pub fn admin(&self) -> Option<&UserHandle> {
        self.admin.get()
    }

    fn is_admin(&self, sender: &UserHandle) -> bool {
        self.admin().is_some_and(|admin| admin == sender)
    }

    /// The bot's own account, fetched once and cached after the first success.
    pub async fn info(&self) -> Result<&SelfInfo, TransportError> {
        self.me
            .get_or_try_init(|| async {
                self.transport
                    .current_user()
                    .await
                    .map_err(TransportError::CurrentUser)
            })
            .await
    }

    /// Log in and resolve the bot's own identity and the admin.
    pub async fn login(&self) -> Result<(), TransportError> {
        let transport = self.transport.clone();
        let reporter = self.reporter.clone();
        let on_qrcode = move |token: String| {
            let url = transport.qrcode_url(&token);
            let reporter = reporter.clone();
            tokio::spawn(async move { reporter.report(&url).await });
        };

        info!("🔐 Logging in...");
        self.transport
            .login(&on_qrcode)
            .await
            .map_err(TransportError::Login)?;

        let me = self.info().await?;
        info!("✅ Logged in as {}", me.nickname);

        if let Some(nickname) = self.settings.admin_nickname.as_deref().filter(|n| !n.is_empty()) {
            let friend = self
                .transport
                .find_friend(nickname)
                .await
                .map_err(TransportError::Friends)?;

            match friend {
                Some(handle) => {
                    info!("👑 Admin {} resolved to {}", nickname, handle);
                    // The admin is fixed by the first login.
                    if let Err(handle) = self.admin.set(handle) {
                        warn!("⚠️ Admin is already resolved, ignoring {}", handle);
                    }
                }
                None => warn!("⚠️ Admin {} is not among the bot's friends", nickname),
            }
        }

        info!(
            "{}",
            json!({
                "settings": self.settings,
                "bot": me,
                "admin": self.admin(),
                "commands": self.commands.names(),
            })
        );
        Ok(())
    }

    /// Log in, then serve messages until the transport stops.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        self.login().await?;

        info!("🚀 Serving messages in {} mode", self.mode.get());
        let sink: Arc<dyn MessageSink> = self.clone();
        self.transport
            .serve(sink)
            .await
            .map_err(TransportError::Serve)
    }

    pub async fn handle_message(&self, request: EventRequest, reply: Reply) {
        if !request.is_text {
            return;
        }

        if log_enabled!(Level::Debug) {
            debug!("📥 {}", serde_json::to_string(&request).unwrap_or_default());
        }

        let is_admin = self.is_admin(&request.sender);
        let nickname = self.me.get().map(|me| me.nickname.as_str());

        if let Some(text) = command_text(&request, nickname, is_admin) {
            debug!("Command from {} (admin: {}): {}", request.sender, is_admin, text);
            self.handle_command(&text, &request, &reply).await;
            return;
        }

        if self.mode.get() == Mode::Offline {
            self.handle_offline(request, reply).await;
            return;
        }

        if let Some(wildcard) = self.commands.wildcard() {
            let args = vec![request.content.clone()];
            if let Err(e) = wildcard.handler.handle(args, request.clone(), reply.clone()).await {
                error!("❌ Failed to handle command * with common message: {:#}", e);
                return;
            }
        }

        let Some(handler) = &self.on_message else {
            warn!("⚠️ No message handler registered, dropping message from {}", request.sender);
            return;
        };

        if let Err(e) = handler.handle(request.content.clone(), request, reply).await {
            error!("❌ Failed to handle message: {:#}", e);
        }
    }

    async fn handle_command(&self, text: &str, request: &EventRequest, reply: &Reply) {
        let (name, args) = match parse_command_with_arg(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("❌ Failed to parse command({}): {}", text, e);
                return;
            }
        };

        match self.execute(&name, &args, request, reply).await {
            Ok(()) => info!("✅ Handled command: {}", text),
            Err(e) => {
                let kind = e.kind();
                error!(
                    "❌ Failed to handle command({}) [{}]: {:#}",
                    text,
                    kind,
                    anyhow::Error::from(e)
                );
            }
        }
    }

    async fn handle_offline(&self, request: EventRequest, reply: Reply) {
        match &self.on_offline {
            Some(handler) => {
                if let Err(e) = handler.handle(request, reply).await {
                    error!("❌ Failed to handle offline message: {:#}", e);
                }
            }
            None => {
                if let Err(e) = reply.text(OFFLINE_REPLY).await {
                    error!("❌ Failed to reply when offline: {:#}", e);
                }
            }
        }
    }

    /// Run command `name` for `request` once its sender is allowed to.
    pub async fn execute(
        &self,
        name: &str,
        args: &str,
        request: &EventRequest,
        reply: &Reply,
    ) -> Result<(), DispatchError> {
        let command = self
            .commands
            .lookup(name)
            .ok_or_else(|| DispatchError::CommandNotFound(name.to_string()))?;

        if !is_allowed(self.admin(), name, command, request).await? {
            return Err(DispatchError::NotAllowed {
                command: name.to_string(),
                sender: request.sender.clone(),
            });
        }

        let args = split_args(args, command.args_length);
        debug!("Running command {} with {} arg(s)", name, args.len());
        command
            .handler
            .handle(args, request.clone(), reply.clone())
            .await
            .map_err(|source| DispatchError::Execution {
                command: name.to_string(),
                source,
            })
    }
}

#[async_trait]
impl MessageSink for Dispatcher {
    async fn deliver(&self, request: EventRequest, reply: Reply) {
        self.handle_message(request, reply).await
    }
}

fn is_mention_separator(c: char) -> bool {
    c.is_whitespace() || c == '\u{fffd}'
}

/// Remove a leading `@nickname` mention and the separator after it.
///
/// The nickname has to end at a separator or at the end of the text, so a
/// longer nickname sharing the prefix is not a mention.
pub fn strip_mention<'a>(content: &'a str, nickname: &str) -> Option<&'a str> {
    if nickname.is_empty() {
        return None;
    }

    content
        .strip_prefix('@')
        .and_then(|rest| rest.strip_prefix(nickname))
        .filter(|rest| rest.is_empty() || rest.starts_with(is_mention_separator))
        .map(|rest| rest.trim_start_matches(is_mention_separator))
}

/// The command text of `request`, if it is to be treated as a command.
///
/// Group messages never are. Direct messages from the admin always are, with
/// the marker added when missing. Anyone else has to mention the bot and
/// follow the mention with a command.
pub fn command_text(request: &EventRequest, self_nickname: Option<&str>, is_admin: bool) -> Option<String> {
    // TODO: resolve the admin inside groups, where sender handles are per-group
    // member ids rather than friend handles.
    if request.is_group {
        return None;
    }

    let stripped = self_nickname.and_then(|nickname| strip_mention(&request.content, nickname));

    if is_admin {
        let text = stripped.unwrap_or(&request.content).trim();
        if is_command(text) {
            Some(text.to_string())
        } else {
            Some(format!("{}{}", COMMAND_MARKER, text))
        }
    } else {
        stripped.filter(|text| is_command(text)).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::WILDCARD;
    use crate::transport::ReplySink;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    const ADMIN: &str = "wxid_admin";
    const GUEST: &str = "wxid_guest";

    struct MockTransport {
        friends: std::sync::Mutex<HashMap<String, String>>,
        fail_login: bool,
        user_lookups: AtomicUsize,
        served: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Self {
            MockTransport {
                friends: std::sync::Mutex::new(HashMap::from([(
                    "Zero".to_string(),
                    ADMIN.to_string(),
                )])),
                fail_login: false,
                user_lookups: AtomicUsize::new(0),
                served: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn login(&self, on_qrcode: &(dyn Fn(String) + Send + Sync + '_)) -> Result<()> {
            on_qrcode("mock-session".to_string());
            if self.fail_login {
                return Err(anyhow::anyhow!("qr code expired"));
            }
            Ok(())
        }

        async fn current_user(&self) -> Result<SelfInfo> {
            self.user_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(SelfInfo {
                handle: UserHandle::new("wxid_bot"),
                nickname: "relay".to_string(),
            })
        }

        async fn find_friend(&self, nickname: &str) -> Result<Option<UserHandle>> {
            Ok(self.friends.lock().unwrap().get(nickname).map(UserHandle::new))
        }

        async fn serve(&self, _sink: Arc<dyn MessageSink>) -> Result<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ReplySink for Recorder {
        async fn send_text(&self, content: &str) -> Result<()> {
            self.0.lock().await.push(content.to_string());
            Ok(())
        }
    }

    impl Recorder {
        async fn sent(&self) -> Vec<String> {
            self.0.lock().await.clone()
        }
    }

    fn recorder() -> (Reply, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (Reply::new(recorder.clone()), recorder)
    }

    fn settings() -> BotSettings {
        BotSettings {
            admin_nickname: Some("Zero".to_string()),
            report_url: None,
        }
    }

    /// Dispatcher whose free-text handler records every content it receives.
    fn dispatcher_with_log() -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let mut dispatcher = Dispatcher::new(settings(), Arc::new(MockTransport::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        dispatcher
            .on_message(move |content: String, _request: EventRequest, _reply: Reply| {
                let log = log.clone();
                async move {
                    log.lock().await.push(content);
                    Ok(())
                }
            })
            .unwrap();
        (dispatcher, seen)
    }

    fn echo() -> Command {
        Command::new(|args, _request, reply| async move { reply.text(args.join("|")).await })
    }

    #[test]
    fn test_strip_mention() {
        assert_eq!(strip_mention("@relay\u{2005}/ping", "relay"), Some("/ping"));
        assert_eq!(strip_mention("@relay \u{fffd}/ping x", "relay"), Some("/ping x"));
        assert_eq!(strip_mention("@relay", "relay"), Some(""));
        assert_eq!(strip_mention("hi @relay", "relay"), None);
        assert_eq!(strip_mention("@someone", ""), None);
        assert_eq!(strip_mention("@relayfan what's up", "relay"), None);
        assert_eq!(strip_mention("@relay_bot /ping", "relay"), None);
    }

    #[test]
    fn test_command_text_ignores_longer_nickname() {
        let request = EventRequest::text(ADMIN, "@relayfan what's up");
        assert_eq!(
            command_text(&request, Some("relay"), true).as_deref(),
            Some("/@relayfan what's up")
        );

        let request = EventRequest::text(GUEST, "@relayfan /ping").mentioned();
        assert_eq!(command_text(&request, Some("relay"), false), None);
    }

    #[test]
    fn test_command_text_admin_adds_marker() {
        let request = EventRequest::text(ADMIN, "ping");
        assert_eq!(command_text(&request, Some("relay"), true).as_deref(), Some("/ping"));

        let request = EventRequest::text(ADMIN, "@relay\u{2005}echo a");
        assert_eq!(command_text(&request, Some("relay"), true).as_deref(), Some("/echo a"));
    }

    #[test]
    fn test_command_text_guest_needs_mention_and_marker() {
        let mentioned = EventRequest::text(GUEST, "@relay /echo a").mentioned();
        assert_eq!(command_text(&mentioned, Some("relay"), false).as_deref(), Some("/echo a"));

        let unmentioned = EventRequest::text(GUEST, "/echo a");
        assert_eq!(command_text(&unmentioned, Some("relay"), false), None);

        let question = EventRequest::text(GUEST, "@relay what time is it").mentioned();
        assert_eq!(command_text(&question, Some("relay"), false), None);
    }

    #[test]
    fn test_command_text_never_in_groups() {
        let request = EventRequest::text(ADMIN, "/ping").in_group();
        assert_eq!(command_text(&request, Some("relay"), true), None);
    }

    #[tokio::test]
    async fn test_login_resolves_admin_and_caches_info() {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Dispatcher::new(settings(), transport.clone());

        dispatcher.login().await.unwrap();
        assert_eq!(dispatcher.admin(), Some(&UserHandle::new(ADMIN)));
        assert_eq!(dispatcher.info().await.unwrap().nickname, "relay");
        assert_eq!(transport.user_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_login_keeps_admin() {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Dispatcher::new(settings(), transport.clone());
        dispatcher.login().await.unwrap();

        transport
            .friends
            .lock()
            .unwrap()
            .insert("Zero".to_string(), "wxid_impostor".to_string());
        dispatcher.login().await.unwrap();
        assert_eq!(dispatcher.admin(), Some(&UserHandle::new(ADMIN)));
    }

    #[tokio::test]
    async fn test_login_without_matching_admin() {
        let dispatcher = Dispatcher::new(
            BotSettings {
                admin_nickname: Some("Nobody".to_string()),
                report_url: None,
            },
            Arc::new(MockTransport::new()),
        );
        dispatcher.login().await.unwrap();
        assert_eq!(dispatcher.admin(), None);

        let dispatcher = Dispatcher::new(BotSettings::default(), Arc::new(MockTransport::new()));
        dispatcher.login().await.unwrap();
        assert_eq!(dispatcher.admin(), None);
    }

    #[tokio::test]
    async fn test_run_aborts_on_login_failure() {
        let mut transport = MockTransport::new();
        transport.fail_login = true;
        let transport = Arc::new(transport);
        let dispatcher = Arc::new(Dispatcher::new(settings(), transport.clone()));

        let err = dispatcher.run().await.unwrap_err();
        assert!(matches!(err, TransportError::Login(_)));
        assert_eq!(transport.served.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_serves_after_login() {
        let transport = Arc::new(MockTransport::new());
        let dispatcher = Arc::new(Dispatcher::new(settings(), transport.clone()));

        dispatcher.clone().run().await.unwrap();
        assert_eq!(transport.served.load(Ordering::SeqCst), 1);
        assert!(dispatcher.admin().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_registrations_are_rejected() {
        let (mut dispatcher, _seen) = dispatcher_with_log();

        assert_eq!(
            dispatcher.on_command("ping", echo()).unwrap_err(),
            SetupError::DuplicateCommand("ping".to_string())
        );
        assert!(dispatcher.commands().lookup("ping").unwrap().is_allowed.is_none());
        assert_eq!(
            dispatcher.on_command("/echo", echo()).unwrap_err(),
            SetupError::InvalidCommandName("/echo".to_string())
        );
        assert_eq!(
            dispatcher
                .on_message(|_c: String, _r: EventRequest, _p: Reply| async { Ok(()) })
                .unwrap_err(),
            SetupError::MessageHandlerRegistered
        );
        dispatcher
            .on_offline(|_r: EventRequest, _p: Reply| async { Ok(()) })
            .unwrap();
        assert_eq!(
            dispatcher
                .on_offline(|_r: EventRequest, _p: Reply| async { Ok(()) })
                .unwrap_err(),
            SetupError::OfflineHandlerRegistered
        );
    }

    #[tokio::test]
    async fn test_first_command_definition_still_answers() {
        let (mut dispatcher, _seen) = dispatcher_with_log();
        dispatcher.on_command("echo", echo()).unwrap();
        let second = Command::new(|_args, _request, reply| async move { reply.text("second").await });
        assert!(dispatcher.on_command("echo", second).is_err());
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(ADMIN, "/echo hi there"), reply)
            .await;
        assert_eq!(sent.sent().await, vec!["hi|there"]);
    }

    #[tokio::test]
    async fn test_admin_ping_without_marker() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        dispatcher.handle_message(EventRequest::text(ADMIN, "ping"), reply).await;
        assert_eq!(sent.sent().await, vec![builtin::PONG]);
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_admin_unknown_command_has_no_fallback() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        let request = EventRequest::text(ADMIN, "/nosuch arg");
        let err = dispatcher.execute("nosuch", "arg", &request, &reply).await.unwrap_err();
        assert!(matches!(err, DispatchError::CommandNotFound(ref name) if name == "nosuch"));

        dispatcher.handle_message(request, reply).await;
        assert!(sent.sent().await.is_empty());
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_command_goes_to_free_text() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(ADMIN, "/ping").in_group(), reply)
            .await;
        assert!(sent.sent().await.is_empty());
        assert_eq!(*seen.lock().await, vec!["/ping"]);
    }

    #[tokio::test]
    async fn test_guest_plain_text_goes_to_free_text() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();

        let (reply, _sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "how are you"), reply)
            .await;
        assert_eq!(*seen.lock().await, vec!["how are you"]);
    }

    #[tokio::test]
    async fn test_guest_mention_without_command_keeps_original_content() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();

        let (reply, _sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "@relay tell me a joke").mentioned(), reply)
            .await;
        assert_eq!(*seen.lock().await, vec!["@relay tell me a joke"]);
    }

    #[tokio::test]
    async fn test_guest_needs_permission() {
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher
            .on_command(
                "echo",
                echo().with_args_length(2).with_permission(|request: EventRequest| async move {
                    Ok(request.sender.as_str() == GUEST)
                }),
            )
            .unwrap();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "@relay /echo a b c").mentioned(), reply)
            .await;
        assert_eq!(sent.sent().await, vec!["a|b c"]);

        // ping has no predicate, so only the admin may run it
        let (reply, sent) = recorder();
        let request = EventRequest::text(GUEST, "@relay /ping").mentioned();
        let err = dispatcher.execute("ping", "", &request, &reply).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotAllowed { .. }));

        dispatcher.handle_message(request, reply).await;
        assert!(sent.sent().await.is_empty());
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_predicate_blocks_command() {
        let (mut dispatcher, _seen) = dispatcher_with_log();
        dispatcher
            .on_command(
                "echo",
                echo().with_permission(|_request| async { Err(anyhow::anyhow!("lookup failed")) }),
            )
            .unwrap();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        let request = EventRequest::text(GUEST, "@relay /echo hi");
        let err = dispatcher.execute("echo", "hi", &request, &reply).await.unwrap_err();
        assert!(matches!(err, DispatchError::Permission { .. }));
        assert!(sent.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_predicate_drops_message() {
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher
            .on_command(
                "echo",
                echo().with_permission(|_request| async { Err(anyhow::anyhow!("lookup failed")) }),
            )
            .unwrap();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "@relay /echo hi").mentioned(), reply)
            .await;
        assert!(sent.sent().await.is_empty());
        assert!(seen.lock().await.is_empty());

        // the admin bypasses the failing predicate
        let (reply, sent) = recorder();
        dispatcher.handle_message(EventRequest::text(ADMIN, "/echo hi"), reply).await;
        assert_eq!(sent.sent().await, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_handler_error_is_annotated() {
        let (mut dispatcher, _seen) = dispatcher_with_log();
        dispatcher
            .on_command(
                "fail",
                Command::new(|_args, _request, _reply| async { Err(anyhow::anyhow!("kaput")) }),
            )
            .unwrap();
        dispatcher.login().await.unwrap();

        let (reply, _sent) = recorder();
        let request = EventRequest::text(ADMIN, "/fail");
        let err = dispatcher.execute("fail", "", &request, &reply).await.unwrap_err();
        assert!(matches!(err, DispatchError::Execution { ref command, .. } if command == "fail"));
    }

    #[tokio::test]
    async fn test_offline_default_reply_and_recovery() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();
        dispatcher.set_offline();
        dispatcher.set_offline();
        assert!(dispatcher.is_offline());

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "anyone there?"), reply)
            .await;
        assert_eq!(sent.sent().await, vec![OFFLINE_REPLY]);
        assert!(seen.lock().await.is_empty());

        dispatcher.set_online();
        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "back?"), reply)
            .await;
        assert!(sent.sent().await.is_empty());
        assert_eq!(*seen.lock().await, vec!["back?"]);
    }

    #[tokio::test]
    async fn test_offline_handler_and_admin_commands() {
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher
            .on_offline(|_request: EventRequest, reply: Reply| async move {
                reply.text("away, back soon").await
            })
            .unwrap();
        dispatcher.login().await.unwrap();
        dispatcher.mode().set_offline();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "hello"), reply)
            .await;
        assert_eq!(sent.sent().await, vec!["away, back soon"]);

        let (reply, sent) = recorder();
        dispatcher.handle_message(EventRequest::text(ADMIN, "/ping"), reply).await;
        assert_eq!(sent.sent().await, vec![builtin::PONG]);
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_offline_handler_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher
            .on_offline(move |_request: EventRequest, _reply: Reply| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("away message unavailable")) }
            })
            .unwrap();
        dispatcher.login().await.unwrap();
        dispatcher.set_offline();

        for content in ["first", "second"] {
            let (reply, sent) = recorder();
            dispatcher.handle_message(EventRequest::text(GUEST, content), reply).await;
            assert!(sent.sent().await.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(seen.lock().await.is_empty());

        let (reply, sent) = recorder();
        dispatcher.handle_message(EventRequest::text(ADMIN, "/ping"), reply).await;
        assert_eq!(sent.sent().await, vec![builtin::PONG]);
    }

    #[tokio::test]
    async fn test_wildcard_skipped_while_offline() {
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher.on_command(WILDCARD, echo()).unwrap();
        dispatcher.login().await.unwrap();
        dispatcher.set_offline();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "a b c"), reply)
            .await;
        assert_eq!(sent.sent().await, vec![OFFLINE_REPLY]);
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_runs_before_free_text() {
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher.on_command(WILDCARD, echo()).unwrap();
        dispatcher.login().await.unwrap();

        let (reply, sent) = recorder();
        dispatcher
            .handle_message(EventRequest::text(GUEST, "a b c"), reply)
            .await;
        assert_eq!(sent.sent().await, vec!["a b c"]);
        assert_eq!(*seen.lock().await, vec!["a b c"]);
    }

    #[tokio::test]
    async fn test_failing_wildcard_stops_message() {
        let (mut dispatcher, seen) = dispatcher_with_log();
        dispatcher
            .on_command(
                WILDCARD,
                Command::new(|_args, _request, _reply| async { Err(anyhow::anyhow!("nope")) }),
            )
            .unwrap();
        dispatcher.login().await.unwrap();

        let (reply, _sent) = recorder();
        dispatcher.handle_message(EventRequest::text(GUEST, "hi"), reply).await;
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_free_text_handler_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut dispatcher = Dispatcher::new(settings(), Arc::new(MockTransport::new()));
        dispatcher
            .on_message(move |_content: String, _request: EventRequest, _reply: Reply| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("model unavailable")) }
            })
            .unwrap();
        let dispatcher = Arc::new(dispatcher);
        dispatcher.login().await.unwrap();

        let sink: Arc<dyn MessageSink> = dispatcher.clone();
        for content in ["first", "second"] {
            let (reply, _sent) = recorder();
            sink.deliver(EventRequest::text(GUEST, content), reply).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_text_is_ignored() {
        let (dispatcher, seen) = dispatcher_with_log();
        dispatcher.login().await.unwrap();

        let mut request = EventRequest::text(ADMIN, "/ping");
        request.is_text = false;
        let (reply, sent) = recorder();
        dispatcher.handle_message(request, reply).await;
        assert!(sent.sent().await.is_empty());
        assert!(seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_messages_before_login_use_free_text() {
        let (dispatcher, seen) = dispatcher_with_log();

        let (reply, _sent) = recorder();
        dispatcher.handle_message(EventRequest::text(ADMIN, "/ping"), reply).await;
        assert_eq!(*seen.lock().await, vec!["/ping"]);
    }
}
