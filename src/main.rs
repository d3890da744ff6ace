//! dm-cli - Offline-first direct-message client
//!
//! Thin command-line front end over the synchronization core. Everything
//! here consumes the public `SyncService` surface only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dm_cli::config::{Config, TransportKind};
use dm_cli::models::conversation_id;
use dm_cli::store::FsStore;
use dm_cli::transport::{push::PushTransport, rest::RestTransport, Transport};
use dm_cli::{DeliveryState, SendRequest, SyncOptions, SyncService};

#[derive(Parser)]
#[command(name = "dm-cli")]
#[command(about = "Offline-first direct-message client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the backend credential and local user id
    Login {
        /// Local user id
        #[arg(short, long)]
        user: String,

        /// API bearer token
        #[arg(short, long)]
        token: String,

        /// Token lifetime in seconds (omit for no expiry)
        #[arg(long)]
        expires_in: Option<u64>,

        /// REST API base URL
        #[arg(long)]
        api_base: Option<String>,

        /// Push stream URL (websocket endpoint)
        #[arg(long)]
        stream_url: Option<String>,

        /// Transport strategy: poll or push
        #[arg(long)]
        transport: Option<String>,
    },

    /// Clear stored credentials
    Logout,

    /// Show configuration and credential status
    Status,

    /// List conversations, newest activity first
    Chats,

    /// Print the conversation with a peer
    Read {
        /// Peer user id
        peer: String,
    },

    /// Send a direct message
    Send {
        /// Peer user id
        #[arg(short, long)]
        to: String,

        /// Message content
        message: String,
    },

    /// Run live synchronization and print updates until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            user,
            token,
            expires_in,
            api_base,
            stream_url,
            transport,
        } => {
            let mut config = Config::load()?;
            config.user_id = Some(user);
            config.set_token(token, expires_in);
            if api_base.is_some() {
                config.api_base = api_base;
            }
            if stream_url.is_some() {
                config.stream_url = stream_url;
            }
            if let Some(kind) = transport {
                config.transport = parse_transport(&kind)?;
            }
            config.save()?;
            println!("Credentials stored.");
        }
        Commands::Logout => {
            let mut config = Config::load()?;
            config.clear_credentials();
            config.save()?;
            println!("Logged out.");
        }
        Commands::Status => {
            status(&Config::load()?);
        }
        Commands::Chats => {
            let (service, _user) = start_service()?;
            if let Err(e) = service.sync_once().await {
                tracing::warn!("Sync failed, showing local data: {e}");
            }
            print_chats(&service);
            service.cleanup();
        }
        Commands::Read { peer } => {
            let (service, user) = start_service()?;
            if let Err(e) = service.sync_once().await {
                tracing::warn!("Sync failed, showing local data: {e}");
            }
            print_conversation(&service, &user, &peer);
            service.cleanup();
        }
        Commands::Send { to, message } => {
            let (service, user) = start_service()?;
            send(&service, &user, &to, message).await?;
            service.cleanup();
        }
        Commands::Watch => {
            watch().await?;
        }
    }

    Ok(())
}

fn parse_transport(kind: &str) -> Result<TransportKind> {
    match kind {
        "poll" => Ok(TransportKind::Poll),
        "push" => Ok(TransportKind::Push),
        other => bail!("Unknown transport '{}'. Use 'poll' or 'push'.", other),
    }
}

/// Build the service from stored config and bind the logged-in user.
fn start_service() -> Result<(SyncService, String)> {
    let config = Config::load()?;
    let user = config
        .user_id
        .clone()
        .context("No user configured. Run 'dm-cli login' first.")?;

    let api_base = config
        .api_base
        .clone()
        .context("No API base configured. Run 'dm-cli login --api-base ...'.")?;
    let token = config.valid_token();
    if token.is_none() {
        tracing::warn!("No valid credential; operating on local data only");
    }

    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Poll => Arc::new(RestTransport::new(api_base, token)),
        TransportKind::Push => {
            let stream_url = config
                .stream_url
                .clone()
                .context("Push transport selected but no stream URL configured.")?;
            Arc::new(PushTransport::new(api_base, stream_url, token))
        }
    };

    let store = FsStore::open()?;
    let options = SyncOptions {
        poll_interval: Duration::from_secs(config.poll_interval_secs.unwrap_or(2)),
    };
    let service = SyncService::new(Box::new(store), transport, options);
    service.set_current_user(Some(&user));
    Ok((service, user))
}

fn status(config: &Config) {
    match &config.user_id {
        Some(user) => println!("User: {}", user),
        None => println!("User: (not logged in)"),
    }
    match &config.bearer_token {
        Some(t) if t.is_expired() => println!("Token: expired"),
        Some(_) => println!("Token: valid"),
        None => println!("Token: none"),
    }
    println!(
        "API base: {}",
        config.api_base.as_deref().unwrap_or("(not set)")
    );
    println!(
        "Transport: {}",
        match config.transport {
            TransportKind::Poll => "poll",
            TransportKind::Push => "push",
        }
    );
}

fn print_chats(service: &SyncService) {
    let chats = service.conversation_summaries();

    println!("\nConversations:");
    println!("{:-<60}", "");

    if chats.is_empty() {
        println!("  (no conversations)");
        return;
    }

    for chat in &chats {
        let unread = if chat.unread_count > 0 {
            format!(" ({} unread)", chat.unread_count)
        } else {
            String::new()
        };
        println!("{}{}", chat.other_participant_id, unread);
        if let Some(ref time) = chat.last_message_time {
            println!("  Last: {}", time.to_rfc3339());
        }
        if let Some(ref preview) = chat.last_message {
            let sender = chat.last_message_sender.as_deref().unwrap_or("?");
            println!("  [{}]: {}", sender, preview.trim());
        }
        println!();
    }
}

fn print_conversation(service: &SyncService, user: &str, peer: &str) {
    let conv_id = conversation_id(user, peer);
    let messages = service.conversation_messages(&conv_id);

    if messages.is_empty() {
        println!("(no messages)");
        return;
    }

    for msg in &messages {
        let marker = match &msg.delivery {
            DeliveryState::Pending => " [sending]",
            DeliveryState::Failed { .. } => " [failed]",
            DeliveryState::Delivered => "",
        };
        println!(
            "[{}] {}: {}{}",
            msg.sent_at.to_rfc3339(),
            msg.sender_id,
            msg.content,
            marker
        );
    }
}

async fn send(service: &SyncService, user: &str, to: &str, message: String) -> Result<()> {
    let temp_id = service.send_message(SendRequest {
        recipient_id: to.to_string(),
        content: message,
        media: None,
    })?;
    let conv_id = conversation_id(user, to);

    // The optimistic copy is already stored; wait briefly for confirmation.
    for _ in 0..50 {
        match service.delivery_state(&conv_id, &temp_id) {
            Some(DeliveryState::Delivered) => {
                println!("Message sent.");
                return Ok(());
            }
            Some(DeliveryState::Failed { reason }) => {
                println!(
                    "Send failed ({}). Message kept locally; it will be retried.",
                    reason
                );
                return Ok(());
            }
            _ => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
    println!("Send still pending; it will complete in the background.");
    Ok(())
}

async fn watch() -> Result<()> {
    let (service, user) = start_service()?;

    service.set_connection_status_callback(|status| {
        println!("[status] {}", status.as_str());
    });

    let list_user = user.clone();
    let _list_guard = service.listen_to_conversation_list(move |chats| {
        for chat in chats {
            if chat.unread_count > 0 {
                println!(
                    "[{}] {} unread from {}",
                    list_user, chat.unread_count, chat.other_participant_id
                );
            }
        }
    });

    println!("Watching for updates... (Ctrl-C to stop)");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    service.cleanup();
    Ok(())
}
