use log::info;
use std::collections::HashMap;

use super::{Command, COMMAND_MARKER};
use crate::errors::SetupError;

/// Name of the command run for every message that is not a command.
pub const WILDCARD: &str = "*";

/// Registered commands by name. Names are case-sensitive and carry no
/// command marker.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, command: Command) -> Result<(), SetupError> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(SetupError::InvalidCommandName(name));
        }
        if self.commands.contains_key(&name) {
            return Err(SetupError::DuplicateCommand(name));
        }

        info!("📝 Register command: {}", name);
        self.commands.insert(name, command);
        Ok(())
    }

    /// Add one of the commands every registry starts with.
    pub(crate) fn insert_builtin(&mut self, name: &'static str, command: Command) {
        debug_assert!(is_valid_name(name));
        self.commands.entry(name.to_string()).or_insert(command);
    }

    pub fn lookup(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn wildcard(&self) -> Option<&Command> {
        self.lookup(WILDCARD)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A name has to survive `parse_command_with_arg`: non-empty, no whitespace
/// and no marker of its own.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with(COMMAND_MARKER) && !name.contains(char::is_whitespace)
}
