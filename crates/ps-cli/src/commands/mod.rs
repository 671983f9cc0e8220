//! CLI command implementations

mod chat;
mod config;
mod status;
mod watch;

pub use chat::chat_command;
pub use config::{config_get, config_init, config_path, config_set, config_show};
pub use status::{health_command, status_command};
pub use watch::watch_command;
