pub mod app;
pub mod commands;
pub mod handlers;

pub use app::Config;
pub use commands::{Cli, Commands, ConfigCommand};
pub use handlers::{LiveUpdate, LiveViewHandler, LoggingHandler};
