use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sessionlink")]
#[command(about = "Live session viewer and diagnostic peer for the telemetry transport")]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch a live session
    ///
    /// Connects as an analyst, requests a live view of the session and prints
    /// every message and packet until the session closes or Ctrl-C is pressed.
    ///
    /// Examples:
    ///   sessionlink watch --session 6f1c...
    ///   sessionlink watch --session 6f1c... --host collector --port 443 --tls
    Watch {
        /// Session to watch
        #[arg(short, long)]
        session: Uuid,
        /// Channel id for this view (random when omitted)
        #[arg(short, long)]
        channel: Option<Uuid>,
        /// Packet sequence number to start from
        #[arg(short, long, default_value_t = 0)]
        offset: i64,
        /// Print messages as JSON lines
        #[arg(long)]
        json: bool,
        /// Override the configured host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
        /// Force TLS on
        #[arg(long)]
        tls: bool,
        /// Do not reconnect after the connection drops
        #[arg(long)]
        no_reconnect: bool,
    },
    /// Accept connections and log every message received
    Listen {
        #[arg(short, long, default_value = "127.0.0.1:4500")]
        bind: String,
    },
    /// Configuration file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the default configuration file path
    Path,
    /// Print the effective configuration
    Show,
}
