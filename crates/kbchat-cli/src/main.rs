use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;

use kbchat_core::config::{expand_path, Config, HistoryConfig, LoggingConfig};
use kbchat_core::types::Session;
use kbchat_exchange::SessionHistory;
use kbchat_upstream::client::RagflowClient;
use kbchat_upstream::{ChatBackend, ListSessionsParams};

mod chat;

#[derive(Parser)]
#[command(
    name = "kbchat",
    about = "Chat with a knowledge-base assistant from the terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask questions (one-shot or interactive)
    Chat {
        /// Question to ask (omit for interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Session management
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, most recently updated first
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long)]
        page_size: Option<u32>,

        /// Oldest first
        #[arg(long)]
        asc: bool,

        /// Fetch every page
        #[arg(long, conflicts_with = "page")]
        all: bool,
    },
    /// Rename a session
    Rename { id: String, name: String },
    /// Delete one or more sessions
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let directives = std::iter::once(level)
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

fn backend(config: &Config) -> anyhow::Result<Arc<dyn ChatBackend>> {
    let client = RagflowClient::from_config(config).context("cannot reach the chat service")?;
    Ok(Arc::new(client))
}

fn print_session(session: &Session) {
    let updated = session
        .updated_at()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{:<34} {updated:<16} {}", session.id, session.name);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Loaded config");

    match cli.command {
        Commands::Chat { message, session } => {
            chat::run(&config, backend(&config)?, message, session).await?;
        }
        Commands::Sessions { action } => {
            let backend = backend(&config)?;
            match action {
                SessionAction::List {
                    page,
                    page_size,
                    asc,
                    all,
                } => {
                    let mut history_config = config.history();
                    if let Some(size) = page_size {
                        history_config.page_size = size;
                    }
                    if asc {
                        history_config.desc = false;
                    }
                    list_sessions(backend, history_config, page, all).await?;
                }
                SessionAction::Rename { id, name } => {
                    let mut history = SessionHistory::new(backend, config.history());
                    history.rename(&id, &name).await?;
                    println!("Renamed {id}");
                }
                SessionAction::Delete { ids, yes } => {
                    let confirmed = yes
                        || tokio::task::spawn_blocking({
                            let prompt = format!("Delete {} session(s)?", ids.len());
                            move || Confirm::new().with_prompt(prompt).default(false).interact()
                        })
                        .await??;
                    if !confirmed {
                        println!("Nothing deleted");
                        return Ok(());
                    }
                    let mut history = SessionHistory::new(backend, config.history());
                    history.delete(&ids).await?;
                    println!("Deleted {} session(s)", ids.len());
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at `{key}`"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

async fn list_sessions(
    backend: Arc<dyn ChatBackend>,
    history_config: HistoryConfig,
    page: u32,
    all: bool,
) -> anyhow::Result<()> {
    if all {
        let mut history = SessionHistory::new(backend, history_config);
        history.refresh().await?;
        while history.has_more() {
            history.load_more().await?;
        }
        history.sessions().iter().for_each(print_session);
        return Ok(());
    }

    let params = ListSessionsParams {
        page: page.max(1),
        page_size: history_config.page_size.max(1),
        orderby: history_config.orderby,
        desc: history_config.desc,
        ..ListSessionsParams::default()
    };
    let sessions = backend.list_sessions(&params).await?;
    if sessions.is_empty() {
        println!("No sessions on page {}", params.page);
    }
    sessions.iter().for_each(print_session);
    Ok(())
}
