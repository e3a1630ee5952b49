//! Who may run a command.

use log::debug;

use super::Command;
use crate::errors::DispatchError;
use crate::transport::{EventRequest, UserHandle};

/// The admin may run anything, and its check comes before any predicate.
/// Everyone else needs the command's predicate to say yes; a command
/// without a predicate is admin-only.
pub async fn is_allowed(
    admin: Option<&UserHandle>,
    name: &str,
    command: &Command,
    request: &EventRequest,
) -> Result<bool, DispatchError> {
    if admin.is_some_and(|admin| *admin == request.sender) {
        debug!("Sender {} is admin, command {} allowed", request.sender, name);
        return Ok(true);
    }

    match &command.is_allowed {
        Some(predicate) => predicate
            .is_allowed(request.clone())
            .await
            .map_err(|source| DispatchError::Permission {
                command: name.to_string(),
                source,
            }),
        None => Ok(false),
    }
}
