use anyhow::{Context, Result};
use clap::Parser;
use sessionlink::cli::{Cli, Commands, Config, ConfigCommand, LiveUpdate, LiveViewHandler, LoggingHandler};
use sessionlink::messages::types::{LiveViewStart, Payload};
use sessionlink::network::{ConnectionEvent, ConnectionManager, HandlerFactory, ProtocolHandler, Server};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const PACKET_PREVIEW_BYTES: usize = 32;

struct WatchOptions {
    session: Uuid,
    channel: Option<Uuid>,
    offset: i64,
    json: bool,
    host: Option<String>,
    port: Option<u16>,
    tls: bool,
    no_reconnect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Watch {
            session,
            channel,
            offset,
            json,
            host,
            port,
            tls,
            no_reconnect,
        } => {
            let options = WatchOptions {
                session,
                channel,
                offset,
                json,
                host,
                port,
                tls,
                no_reconnect,
            };
            watch(config_path, options).await?;
        }
        Commands::Listen { bind } => listen(&bind).await?,
        Commands::Config { command } => match command {
            ConfigCommand::Path => {
                let path = match config_path {
                    Some(path) => path.to_path_buf(),
                    None => Config::default_config_file()?,
                };
                println!("{}", path.display());
            }
            ConfigCommand::Show => {
                let config = Config::load(config_path)?;
                let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
                print!("{}", rendered);
            }
        },
    }

    Ok(())
}

async fn watch(config_path: Option<&Path>, options: WatchOptions) -> Result<()> {
    let mut config = Config::load(config_path).context("Failed to load configuration")?;
    if let Some(host) = options.host {
        config.host = host;
    }
    if let Some(port) = options.port {
        config.port = port;
    }
    if options.tls {
        config.tls = true;
    }
    if options.no_reconnect {
        config.auto_reconnect = false;
    }

    let request = LiveViewStart::new(
        config.repository_id,
        options.session,
        options.channel.unwrap_or_else(Uuid::new_v4),
        options.offset,
    );
    request.validate().context("Invalid live view request")?;

    let user_name = std::env::var("USER").unwrap_or_else(|_| "analyst".to_string());
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let handler = LiveViewHandler::new(request, user_name, updates_tx);

    let connection_config = config.to_connection_config()?;
    info!(endpoint = %connection_config.endpoint, session = %options.session, "Starting live view");
    let manager = ConnectionManager::new(connection_config, handler);
    manager.add_listener(|event| match event {
        ConnectionEvent::Failed(reason) => error!(reason = %reason, "Connection failed"),
        ConnectionEvent::Disconnected => warn!("Disconnected"),
        other => info!(event = ?other, "Connection event"),
    });
    let mut events = manager.subscribe();
    manager.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => {
                if let Ok(ConnectionEvent::Closed) = event {
                    break;
                }
            }
            update = updates.recv() => match update {
                Some(update) => {
                    let finished = is_session_end(&update, options.session);
                    print_update(&update, options.json)?;
                    if finished {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    manager.close().await;
    if manager.has_corrupt_data() {
        warn!(corrupted = manager.corrupted_messages(), "Some messages were dropped as corrupt");
    }
    Ok(())
}

/// True once the watched session itself has been closed
fn is_session_end(update: &LiveUpdate, session_id: Uuid) -> bool {
    matches!(
        update,
        LiveUpdate::Message(message)
            if matches!(message.payload(), Payload::SessionClosed(closed) if closed.session_id == session_id)
    )
}

fn print_update(update: &LiveUpdate, json: bool) -> Result<()> {
    match update {
        LiveUpdate::Message(message) if json => {
            let line = serde_json::to_string(message).context("Failed to encode message as JSON")?;
            println!("{}", line);
        }
        LiveUpdate::Message(message) => {
            println!("[{} v{}] {:?}", message.kind(), message.version(), message.payload());
        }
        LiveUpdate::Packet(packet) => {
            let preview = &packet[..packet.len().min(PACKET_PREVIEW_BYTES)];
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "packet": { "size": packet.len(), "hex": hex::encode(packet) } })
                );
            } else {
                println!("packet ({} bytes) {}", packet.len(), hex::encode(preview));
            }
        }
        LiveUpdate::PacketStreamEnded => println!("end of packet stream"),
        LiveUpdate::ClockDrift {
            round_trip,
            clock_skew_micros,
        } => {
            println!(
                "clock drift: round trip {:?}, skew {} us",
                round_trip,
                clock_skew_micros.map_or_else(|| "unknown".to_string(), |skew| skew.to_string())
            );
        }
    }
    Ok(())
}

async fn listen(bind: &str) -> Result<()> {
    let factory: HandlerFactory = Arc::new(|peer: SocketAddr| {
        Arc::new(LoggingHandler::new(peer)) as Arc<dyn ProtocolHandler>
    });
    let server = Server::bind(bind, factory).await?;
    info!("Listening on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for Ctrl-C: {}", e);
            }
        })
        .await
}
