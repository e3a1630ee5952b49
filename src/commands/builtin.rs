//! Commands every bot starts with: /ping

use super::{Command, CommandRegistry};

/// Reply sent by `/ping`
pub const PONG: &str = "pong";

pub fn ping() -> Command {
    Command::new(|_args, _request, reply| async move { reply.text(PONG).await })
}

/// Registry pre-filled with the built-in commands.
pub fn default_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.insert_builtin("ping", ping());
    registry
}
