//! Command text parsing: `/name rest of the arguments`

use crate::errors::ParseError;

/// Character every command starts with.
pub const COMMAND_MARKER: char = '/';

/// Check if a string looks like a command
pub fn is_command(text: &str) -> bool {
    text.trim_start().starts_with(COMMAND_MARKER)
}

/// Split command text into its name (without the marker) and the trimmed
/// argument string.
///
/// # Example
/// ```
/// use chatrelay::commands::parse_command_with_arg;
///
/// let (name, args) = parse_command_with_arg("/chatgpt hello there").unwrap();
/// assert_eq!(name, "chatgpt");
/// assert_eq!(args, "hello there");
/// ```
pub fn parse_command_with_arg(text: &str) -> Result<(String, String), ParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    let body = text
        .strip_prefix(COMMAND_MARKER)
        .ok_or_else(|| ParseError::MissingMarker(text.to_string()))?;

    let (name, args) = match body.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (body, ""),
    };

    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }

    Ok((name.to_string(), args.to_string()))
}

/// Split an argument string on single spaces into at most `max_parts`
/// tokens; the last token keeps whatever is left. `max_parts == 0` splits on
/// every space.
pub fn split_args(args: &str, max_parts: usize) -> Vec<String> {
    if max_parts == 0 {
        args.split(' ').map(str::to_string).collect()
    } else {
        args.splitn(max_parts, ' ').map(str::to_string).collect()
    }
}
