//! Parley: terminal client for the chat backend
//!
//! Subcommands:
//! - `chats`: List chats, newest first
//! - `watch`: Follow the chat list live until interrupted
//! - `open`: Show a chat's messages, optionally following them live
//! - `new`: Create a chat
//! - `rename`: Rename a chat
//! - `send`: Send a message, optionally asking the responder for a reply

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use parley_backend::{
    BackendConfig, Chat, ChatBackend, ChatId, GraphqlClient, MemoryBackend, Message,
};
use parley_sync::{ChatListView, MessageView, Store, SyncConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Chat client with a live-synced local cache", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BackendArgs {
    /// GraphQL HTTP endpoint
    #[arg(long, env = "PARLEY_GRAPHQL_URL", global = true)]
    graphql_url: Option<String>,

    /// GraphQL WebSocket endpoint (derived from the HTTP endpoint if unset)
    #[arg(long, env = "PARLEY_WS_URL", global = true)]
    ws_url: Option<String>,

    /// Nhost project subdomain, used when no GraphQL URL is given
    #[arg(long, env = "PARLEY_NHOST_SUBDOMAIN", global = true)]
    nhost_subdomain: Option<String>,

    /// Nhost project region
    #[arg(long, env = "PARLEY_NHOST_REGION", default_value = "eu-central-1", global = true)]
    nhost_region: String,

    /// Bearer token for the signed-in user
    #[arg(long, env = "PARLEY_ACCESS_TOKEN", global = true, hide_env_values = true)]
    access_token: Option<String>,

    /// Use an in-process backend seeded with a demo chat
    #[arg(long, global = true)]
    memory: bool,

    /// Refetch messages this many milliseconds after asking the responder
    #[arg(long, env = "PARLEY_RESPONDER_REFETCH_MS", global = true)]
    responder_refetch_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// List chats, newest first
    Chats,

    /// Follow the chat list live until interrupted
    Watch,

    /// Show a chat's messages
    Open {
        chat_id: String,

        /// Keep following new messages until interrupted
        #[arg(long)]
        follow: bool,
    },

    /// Create a chat
    New { title: String },

    /// Rename a chat
    Rename { chat_id: String, title: String },

    /// Send a message to a chat
    Send {
        chat_id: String,
        content: String,

        /// Forward the message to the responder and wait for its reply
        #[arg(long)]
        ai: bool,

        /// Send as the bot
        #[arg(long, conflicts_with = "ai")]
        bot: bool,

        /// How long to wait for the responder's reply, in seconds
        #[arg(long, default_value = "30")]
        reply_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "parley=info,parley_sync=info,parley_backend=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let backend = connect(&cli.backend)?;
    let config = sync_config(&cli.backend);
    let store = Store::new();

    match cli.command {
        Commands::Chats => {
            let view = ChatListView::new(backend, store, config);
            view.refresh().await;
            let state = view.state();
            if let Some(e) = state.error {
                return Err(miette::miette!("{}", e.user_message()));
            }
            print_chats(&state.chats, cli.json)
        }

        Commands::Watch => watch_chats(backend, store, config, cli.json).await,

        Commands::Open { chat_id, follow } => {
            let view = MessageView::new(backend, store, ChatId::from(chat_id), config);
            view.refresh_with_chat().await;
            let state = view.state();
            if let Some(e) = state.error {
                return Err(miette::miette!("{}", e.user_message()));
            }
            if let Some(chat) = view.chat()
                && !cli.json
            {
                println!("# {} ({} messages)", chat.title, chat.message_count);
            }
            print_messages(&state.messages, cli.json)?;

            if follow {
                follow_messages(&view, cli.json).await?;
            }
            Ok(())
        }

        Commands::New { title } => {
            let view = ChatListView::new(backend, store, config);
            let id = view
                .create_chat(&title)
                .await
                .map_err(|e| miette::miette!("{}", e.user_message()))?;
            println!("{}", id);
            Ok(())
        }

        Commands::Rename { chat_id, title } => {
            let view = ChatListView::new(backend, store, config);
            if !view.update_chat_title(&ChatId::from(chat_id), &title).await {
                return Err(miette::miette!("failed to rename chat"));
            }
            Ok(())
        }

        Commands::Send {
            chat_id,
            content,
            ai,
            bot,
            reply_timeout,
        } => {
            let view = MessageView::new(backend, store, ChatId::from(chat_id), config);
            if ai {
                ask_responder(&view, &content, Duration::from_secs(reply_timeout), cli.json).await
            } else if view.send_message(&content, bot).await {
                Ok(())
            } else {
                Err(miette::miette!("failed to send message"))
            }
        }
    }
}

fn connect(args: &BackendArgs) -> Result<Arc<dyn ChatBackend>> {
    if args.memory {
        let backend = MemoryBackend::new();
        let chat_id = backend.seed_chat("Welcome");
        backend.seed_message(
            &chat_id,
            "Hello from the in-memory backend",
            true,
            chrono::Utc::now(),
        );
        return Ok(Arc::new(backend));
    }

    let mut config = match (&args.graphql_url, &args.nhost_subdomain) {
        (Some(url), _) => BackendConfig::new(url.clone()),
        (None, Some(subdomain)) => BackendConfig::nhost(subdomain, &args.nhost_region),
        (None, None) => {
            return Err(miette::miette!(
                "no backend configured: pass --graphql-url, --nhost-subdomain or --memory"
            ));
        }
    };
    if let Some(ws_url) = &args.ws_url {
        config = config.with_ws_url(ws_url.clone());
    }
    if let Some(token) = &args.access_token {
        config = config.with_access_token(token.clone());
    }

    let client = GraphqlClient::new(config).map_err(|e| miette::miette!("{}", e))?;
    tracing::info!(url = %client.graphql_url(), "using GraphQL backend");
    Ok(Arc::new(client))
}

fn sync_config(args: &BackendArgs) -> SyncConfig {
    let config = SyncConfig::default();
    match args.responder_refetch_ms {
        Some(ms) => config.with_responder_refetch(Duration::from_millis(ms)),
        None => config,
    }
}

async fn watch_chats(
    backend: Arc<dyn ChatBackend>,
    store: Arc<Store>,
    config: SyncConfig,
    json: bool,
) -> Result<()> {
    let mut events = store.subscribe();
    let view = ChatListView::new(backend, store, config);
    view.start_live();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let state = view.state();
                    if let Some(e) = &state.error {
                        view.stop_live().await;
                        return Err(miette::miette!("{}", e.user_message()));
                    }
                    tracing::debug!(connection = %state.connection, "chat list changed");
                    print_chats(&state.chats, json)?;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    view.stop_live().await;
    Ok(())
}

async fn follow_messages(view: &MessageView, json: bool) -> Result<()> {
    view.start_live();
    let mut shown = view.message_count();

    let mut tick = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                let state = view.state();
                if let Some(e) = &state.error {
                    view.stop_live().await;
                    return Err(miette::miette!("{}", e.user_message()));
                }
                if state.messages.len() > shown {
                    print_messages(&state.messages[shown..], json)?;
                    shown = state.messages.len();
                }
            }
        }
    }

    view.stop_live().await;
    Ok(())
}

async fn ask_responder(
    view: &MessageView,
    content: &str,
    reply_timeout: Duration,
    json: bool,
) -> Result<()> {
    view.refresh().await;
    view.start_live();
    let before = view.message_count();

    if !view.send_message(content, false).await {
        view.stop_live().await;
        return Err(miette::miette!("failed to send message"));
    }
    if !view.send_to_responder(content).await {
        view.stop_live().await;
        return Err(miette::miette!("responder did not accept the message"));
    }

    let reply = tokio::time::timeout(reply_timeout, async {
        loop {
            let state = view.state();
            if let Some(reply) = state.messages.iter().skip(before).find(|m| m.is_bot) {
                return reply.clone();
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    view.stop_live().await;

    match reply {
        Ok(reply) => print_messages(std::slice::from_ref(&reply), json),
        Err(_) => Err(miette::miette!(
            "no reply within {}s",
            reply_timeout.as_secs()
        )),
    }
}

fn print_chats(chats: &[Chat], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(chats).into_diagnostic()?);
        return Ok(());
    }
    for chat in chats {
        let latest = chat
            .latest
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        println!(
            "{}  {}  [{}]  {}  {}",
            chat.id,
            chat.updated_at.format("%Y-%m-%d %H:%M"),
            chat.message_count,
            chat.title,
            latest
        );
    }
    Ok(())
}

fn print_messages(messages: &[Message], json: bool) -> Result<()> {
    if json {
        for message in messages {
            println!("{}", serde_json::to_string(message).into_diagnostic()?);
        }
        return Ok(());
    }
    for message in messages {
        let who = if message.is_bot { "bot" } else { "you" };
        let pending = if message.id.is_optimistic() {
            " (sending)"
        } else {
            ""
        };
        println!(
            "{} {:>3}: {}{}",
            message.created_at.format("%H:%M:%S"),
            who,
            message.content,
            pending
        );
    }
    Ok(())
}
