//! # Feature: Online/Offline Mode
//!
//! Operator-controlled switch between normal dispatch and offline replies.
//! Commands keep working while offline so the admin can switch back.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: true
//!
//! ## Changelog
//! - 1.0.0: Atomic mode flag shared between the dispatcher and commands

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Online,
    Offline,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Online => f.write_str("online"),
            Mode::Offline => f.write_str("offline"),
        }
    }
}

/// Cloneable handle onto one dispatcher's mode. All clones see the same flag.
#[derive(Debug, Clone, Default)]
pub struct ModeSwitch {
    offline: Arc<AtomicBool>,
}

impl ModeSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    pub fn set_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn get(&self) -> Mode {
        if self.is_offline() {
            Mode::Offline
        } else {
            Mode::Online
        }
    }
}
