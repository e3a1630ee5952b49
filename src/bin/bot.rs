use anyhow::Result;
use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;

use chatrelay::commands::Command;
use chatrelay::config::Config;
use chatrelay::dispatcher::Dispatcher;
use chatrelay::http_server::HttpTransport;
use chatrelay::transport::{EventRequest, Reply};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::from_env()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    info!("🚀 Starting chatrelay...");

    let transport = Arc::new(HttpTransport::from_config(&config));
    let mut dispatcher = Dispatcher::new(config.bot_settings(), transport);
    let mode = dispatcher.mode();

    // No permission predicate: only the admin may switch modes.
    let online = mode.clone();
    dispatcher.on_command(
        "online",
        Command::new(move |_args, _request, reply| {
            online.set_online();
            async move { reply.text("✅ bot is online").await }
        }),
    )?;

    let offline = mode;
    dispatcher.on_command(
        "offline",
        Command::new(move |_args, _request, reply| {
            offline.set_offline();
            async move { reply.text("💤 bot is offline").await }
        }),
    )?;

    dispatcher.on_command(
        "echo",
        Command::new(|args, _request, reply| async move { reply.text(args.join(" ")).await })
            .with_args_length(1)
            .with_permission(|_request| async { Ok(true) }),
    )?;

    dispatcher.on_offline(|request: EventRequest, reply: Reply| async move {
        info!("💤 Offline message from {}", request.sender);
        reply.text("I'm away right now, I'll get back to you later.").await
    })?;

    dispatcher.on_message(|content: String, request: EventRequest, reply: Reply| async move {
        info!("💬 Message from {}: {}", request.sender, content);
        reply.text(format!("Got it: {}", content)).await
    })?;

    Arc::new(dispatcher).run().await.map_err(|e| {
        let e = anyhow::Error::from(e);
        error!("❌ chatrelay stopped: {:#}", e);
        e
    })?;

    Ok(())
}
