//! Line-oriented SecureDrop client
//!
//! Connects to a signaling relay as one member and drives sessions from
//! stdin.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p securedrop --features cli --bin securedrop_client -- \
//!   --user-id alice \
//!   --signaling-url ws://localhost:4000 \
//!   --name bob=Bob
//! ```
//!
//! Commands: `/call <id>`, `/accept`, `/decline`, `/end`, `/send <path>`,
//! `/history`, `/quit`. Any other line is sent as a chat message.

use clap::Parser;
use securedrop::identity::label_for;
use securedrop::{
    ChunkFraming, MessagePayload, OutgoingFile, SecureDropConfig, SecureDropHandle,
    SessionEvent, SessionManager, StaticMemberDirectory, TurnServerConfig,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// SecureDrop peer-to-peer client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local member id
    #[arg(long, env = "SECUREDROP_USER_ID")]
    user_id: String,

    /// WebSocket signaling URL
    #[arg(
        long,
        default_value = "ws://localhost:4000",
        env = "SECUREDROP_SIGNALING_URL"
    )]
    signaling_url: String,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "SECUREDROP_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "SECUREDROP_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Give up on unanswered offers after this many seconds
    #[arg(long, env = "SECUREDROP_OFFER_TIMEOUT")]
    offer_timeout_secs: Option<u64>,

    /// File chunk size in bytes
    #[arg(long, default_value_t = 64 * 1024, env = "SECUREDROP_CHUNK_SIZE")]
    chunk_size: usize,

    /// Prefix every file chunk with its transfer id
    #[arg(long, default_value_t = false, env = "SECUREDROP_TAGGED_CHUNKS")]
    tagged_chunks: bool,

    /// Display names (format: id=Label, repeatable)
    #[arg(long = "name", value_parser = parse_name)]
    names: Vec<(String, String)>,
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();

    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

fn parse_name(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(id, label)| !id.is_empty() && !label.is_empty())
        .map(|(id, label)| (id.to_string(), label.to_string()))
        .ok_or_else(|| format!("Invalid name '{}'. Expected: id=Label", s))
}

fn build_config_from_args(args: &Args) -> Result<SecureDropConfig, Box<dyn std::error::Error>> {
    let turn_servers = args
        .turn_servers
        .iter()
        .map(|s| parse_turn_server(s))
        .collect::<Result<Vec<_>, _>>()?;

    let mut config = SecureDropConfig {
        stun_servers: args.stun_servers.clone(),
        offer_timeout_secs: args.offer_timeout_secs,
        ..Default::default()
    }
    .with_signaling_url(&args.signaling_url)
    .with_turn_servers(turn_servers)
    .with_chunk_size(args.chunk_size);

    if args.tagged_chunks {
        config = config.with_chunk_framing(ChunkFraming::Tagged);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let config = build_config_from_args(&args)?;
    info!(
        user_id = %args.user_id,
        signaling_url = %config.signaling_url,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        offer_timeout = ?config.offer_timeout_secs,
        chunk_size = config.transfer.chunk_size,
        chunk_framing = ?config.transfer.chunk_framing,
        "Configuration loaded"
    );

    let mut directory = StaticMemberDirectory::new();
    for (id, label) in &args.names {
        directory = directory.with_member(id, label);
    }
    let directory = Arc::new(directory);

    let (handle, task) = SessionManager::connect(config, &args.user_id).await?;
    println!("Connected as {}. Type /call <id> to start a session.", args.user_id);

    tokio::spawn(print_events(handle.subscribe(), Arc::clone(&directory)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_command(&handle, line.trim()).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    let _ = task.await;
    info!("Client shut down gracefully");
    Ok(())
}

/// Returns false when the client should exit
async fn run_command(handle: &SecureDropHandle, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let result = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/call" => handle.initiate(rest).await,
        "/accept" => handle.accept_incoming().await,
        "/decline" => handle.decline_incoming().await,
        "/end" => handle.end().await,
        "/history" => {
            print_history(handle).await;
            Ok(())
        }
        "/send" => match OutgoingFile::open(rest).await {
            Ok(file) => handle.send_file(file).await.map(|_| ()),
            Err(e) => Err(e),
        },
        _ => handle.send_message(line).await.map(|_| ()),
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

async fn print_history(handle: &SecureDropHandle) {
    for message in handle.messages().await {
        let time = message.timestamp.format("%H:%M:%S");
        match &message.payload {
            MessagePayload::Text { text } => {
                println!("[{}] {}: {}", time, message.sender_id, text)
            }
            MessagePayload::File { name, size, .. } => println!(
                "[{}] {}: file {} ({} bytes, {:?})",
                time, message.sender_id, name, size, message.status
            ),
        }
    }
}

async fn print_events(
    mut events: broadcast::Receiver<SessionEvent>,
    directory: Arc<StaticMemberDirectory>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Skipped {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SessionEvent::StateChanged(state) => println!("* session: {}", state),
            SessionEvent::IncomingOffer { from_id } => println!(
                "* {} wants to start a session. /accept or /decline",
                label_for(directory.as_ref(), &from_id).await
            ),
            SessionEvent::Declined { peer_id } => println!(
                "* {} declined",
                label_for(directory.as_ref(), &peer_id).await
            ),
            SessionEvent::Disconnected { peer_id, reason } => println!(
                "* session with {} ended ({:?})",
                label_for(directory.as_ref(), &peer_id).await,
                reason
            ),
            SessionEvent::ChannelOpen { peer_id } => println!(
                "* connected to {}",
                label_for(directory.as_ref(), &peer_id).await
            ),
            SessionEvent::MessageAppended(message) => {
                if let (Some(text), securedrop::Direction::Incoming) =
                    (message.text(), message.direction)
                {
                    println!(
                        "{}: {}",
                        label_for(directory.as_ref(), &message.sender_id).await,
                        text
                    );
                }
            }
            SessionEvent::FileStarted(meta) => {
                println!("* receiving {} ({} bytes)", meta.name, meta.size)
            }
            SessionEvent::FileReceived(file) => println!(
                "* received {} ({} bytes, {})",
                file.meta.name,
                file.data.len(),
                file.meta.mime.as_deref().unwrap_or("unknown type")
            ),
            SessionEvent::SendProgress {
                transfer_id,
                progress,
            } if progress.is_complete() => println!("* sent {}", transfer_id),
            SessionEvent::TransferFailed {
                transfer_id,
                reason,
            } => println!(
                "! transfer {} failed: {}",
                transfer_id.as_deref().unwrap_or("?"),
                reason
            ),
            SessionEvent::Error { message } => println!("! {}", message),
            _ => {}
        }
    }
}

fn init_tracing() {
    // RUST_LOG overrides the default level; logs go to stderr so stdout stays readable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
