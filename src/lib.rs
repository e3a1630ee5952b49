pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod http_server;
pub mod mode;
pub mod notifier;
pub mod transport;

pub use commands::Command;
pub use dispatcher::{BotSettings, Dispatcher};
pub use transport::{EventRequest, Reply};
