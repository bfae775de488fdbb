//! # Pagewise CLI (`pagewise`)
//!
//! ## Usage
//!
//! ```bash
//! pagewise --config ./config/pagewise.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pagewise init` | Create the SQLite database and run schema migrations |
//! | `pagewise serve` | Start the HTTP server |
//! | `pagewise upload <key>` | Register a stored file and ingest it now |
//! | `pagewise reingest <id>` | Retry a failed ingestion |
//! | `pagewise status <id>` | Show a document's ingestion status |
//! | `pagewise chat <id>` | Chat with a document through a running server |

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use pagewise::chat::{ChatEngine, ChatEvent, SendOutcome};
use pagewise::client::HttpChatClient;
use pagewise::config::{self, Config};
use pagewise::server::{self, AppState};
use pagewise::{migrate, status};

/// Pagewise: chat with your documents.
#[derive(Parser)]
#[command(name = "pagewise", version, about = "Pagewise: upload a document, then chat with it")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pagewise.toml")]
    config: PathBuf,

    /// Log at debug level unless PAGEWISE_LOG or RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Register a file already in storage and ingest it inline.
    Upload {
        /// Storage key of the uploaded bytes.
        key: String,

        /// Display name (defaults to the key).
        #[arg(long)]
        name: Option<String>,

        /// Public URL of the file.
        #[arg(long, default_value = "")]
        url: String,

        /// Owning user id.
        #[arg(long)]
        user: String,
    },

    /// Re-run ingestion for a FAILED document.
    Reingest {
        id: String,

        #[arg(long)]
        user: String,
    },

    /// Print a document's ingestion status.
    Status {
        id: String,

        #[arg(long)]
        user: String,
    },

    /// Interactive chat against a running server.
    ///
    /// Type a question to send it, `/more` to load older messages,
    /// `/quit` to leave.
    Chat {
        id: String,

        /// Server URL (defaults to `[chat].server_url`, then `[server].bind`).
        #[arg(long)]
        server: Option<String>,

        /// User id (defaults to `[chat].user_id`).
        #[arg(long)]
        user: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("PAGEWISE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Upload {
            key,
            name,
            url,
            user,
        } => {
            let state = AppState::from_config(&cfg).await?;
            let name = name.unwrap_or_else(|| key.clone());
            let doc = state.pipeline.register(&user, &key, &name, &url).await?;
            println!("Registered {} ({})", doc.id, doc.name);
            let status = state.pipeline.ingest(&doc).await;
            println!("{} {}", doc.id, status);
        }
        Commands::Reingest { id, user } => {
            let state = AppState::from_config(&cfg).await?;
            let doc = state.pipeline.reopen_failed(&id, &user).await?;
            let status = state.pipeline.ingest(&doc).await;
            println!("{} {}", doc.id, status);
        }
        Commands::Status { id, user } => {
            let state = AppState::from_config(&cfg).await?;
            let status = status::get_status(state.records.as_ref(), &id, &user).await?;
            println!("{}", status);
        }
        Commands::Chat { id, server, user } => {
            run_chat(&cfg, id, server, user).await?;
        }
    }

    Ok(())
}

async fn run_chat(
    cfg: &Config,
    document_id: String,
    server: Option<String>,
    user: Option<String>,
) -> Result<()> {
    let base_url = server
        .or_else(|| cfg.chat.server_url.clone())
        .unwrap_or_else(|| format!("http://{}", cfg.server.bind));
    let user_id = user
        .or_else(|| cfg.chat.user_id.clone())
        .ok_or_else(|| anyhow!("no user id: pass --user or set [chat].user_id"))?;

    let client = Arc::new(HttpChatClient::new(&base_url, user_id.clone())?);
    client.health().await?;

    let engine = Arc::new(ChatEngine::new(
        document_id,
        user_id,
        cfg.chat.page_size,
        client.clone(),
        client,
    ));
    engine.load().await?;
    print_transcript(&engine);

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        let mut printed = 0usize;
        loop {
            match events.recv().await {
                Ok(ChatEvent::Reply { text }) => {
                    print!("{}", text.get(printed..).unwrap_or(""));
                    let _ = std::io::stdout().flush();
                    printed = text.len();
                }
                Ok(ChatEvent::Settled { truncated, .. }) => {
                    println!();
                    if truncated {
                        println!("[reply cut short]");
                    }
                    printed = 0;
                    let _ = done_tx.send(());
                }
                Ok(ChatEvent::RolledBack { notice }) => {
                    eprintln!("! {}", notice);
                    printed = 0;
                    let _ = done_tx.send(());
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let interactive = atty::is(atty::Stream::Stdin);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        if interactive {
            print!("> ");
            let _ = std::io::stdout().flush();
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "/quit" => break,
            "/more" => {
                if engine.fetch_next_page().await? {
                    print_transcript(&engine);
                } else {
                    println!("(no older messages)");
                }
            }
            _ => {
                // Errors were already surfaced through the event stream.
                if let Ok(SendOutcome::Settled { .. }) | Err(_) = engine.send_text(line).await {
                    let _ = done_rx.recv().await;
                }
            }
        }
    }
    Ok(())
}

fn print_transcript(engine: &ChatEngine) {
    for m in engine.timeline() {
        let who = if m.is_user_message { "you" } else { "pagewise" };
        println!("[{}] {}: {}", m.created_at.format("%H:%M"), who, m.text);
    }
}
