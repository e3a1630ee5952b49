use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::dispatcher::BotSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub admin_nickname: Option<String>,
    pub report_url: Option<String>,
    pub log_level: String,
    pub http_port: u16,
    /// Base URL the HTTP transport is reached at. Defaults to localhost.
    pub public_url: Option<String>,
    pub bot_id: String,
    pub bot_nickname: String,
    /// Known friends as (nickname, handle) pairs.
    pub contacts: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            admin_nickname: non_empty_var("ADMIN_NICKNAME"),
            report_url: non_empty_var("REPORT_URL"),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            http_port: match env::var("HTTP_PORT") {
                Ok(port) => port
                    .parse()
                    .map_err(|_| anyhow::anyhow!("HTTP_PORT is not a valid port: {}", port))?,
                Err(_) => 6666,
            },
            public_url: non_empty_var("PUBLIC_URL"),
            bot_id: env::var("BOT_ID").unwrap_or_else(|_| "chatrelay".to_string()),
            bot_nickname: env::var("BOT_NICKNAME").unwrap_or_else(|_| "chatrelay".to_string()),
            contacts: match env::var("CONTACTS") {
                Ok(raw) => parse_contacts(&raw)?,
                Err(_) => Vec::new(),
            },
        })
    }

    pub fn bot_settings(&self) -> BotSettings {
        BotSettings {
            admin_nickname: self.admin_nickname.clone(),
            report_url: self.report_url.clone(),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse `nick=handle,nick=handle`
pub fn parse_contacts(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (nickname, handle) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("CONTACTS entry is not nickname=handle: {}", entry))?;
            let (nickname, handle) = (nickname.trim(), handle.trim());
            if nickname.is_empty() || handle.is_empty() {
                return Err(anyhow::anyhow!("CONTACTS entry is incomplete: {}", entry));
            }
            Ok((nickname.to_string(), handle.to_string()))
        })
        .collect()
}
