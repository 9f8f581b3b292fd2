use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use mimi_core::config::{self, Config};
use mimi_core::store::{Database, NewEulaVersion};
use mimi_core::util::mask_secret;

#[derive(Parser)]
#[command(
    name = "mimi",
    about = "AI 小咪 - LINE health-coach chatbot backend",
    version = mimi_core::VERSION,
)]
struct Cli {
    /// Path to a JSON config file (default: ~/.mimi/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file to fill in
    Init,
    /// Start the HTTP service (LINE webhook, LIFF consent, Make.com chat)
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Manage EULA versions
    Eula {
        #[command(subcommand)]
        command: EulaCommands,
    },
    /// Show configuration status
    Status,
}

#[derive(Subcommand)]
enum EulaCommands {
    /// Publish a new EULA version
    Add {
        /// Version label, e.g. "V2"
        #[arg(long)]
        label: String,
        /// URL of the document
        #[arg(long)]
        url: String,
        /// When the version takes effect (RFC 3339)
        #[arg(long)]
        effective_from: Option<String>,
    },
    /// Show the version users must currently agree to
    Latest,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mimi=info".parse()?)
                .add_directive("mimi_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config_from_env(cli.config.as_deref());

    match cli.command {
        Commands::Init => cmd_init(cli.config.as_deref())?,
        Commands::Serve { host, port } => cmd_serve(cfg, host, port).await?,
        Commands::Migrate => cmd_migrate(&cfg).await?,
        Commands::Eula { command } => match command {
            EulaCommands::Add {
                label,
                url,
                effective_from,
            } => cmd_eula_add(&cfg, label, url, effective_from).await?,
            EulaCommands::Latest => cmd_eula_latest(&cfg).await?,
        },
        Commands::Status => cmd_status(&cfg, cli.config.as_deref()),
    }

    Ok(())
}

// ====== Commands ======

fn cmd_init(config_path: Option<&std::path::Path>) -> Result<()> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(config::get_config_path);

    if path.exists() {
        println!("Config already exists at {}", path.display());
        println!("Delete it first to re-initialize.");
        return Ok(());
    }

    config::save_config(&Config::default(), Some(&path))
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Created config at {}", path.display());
    println!("\nNext steps:");
    println!("  1. Fill in provider.apiKey, line.channelAccessToken and line.channelSecret");
    println!("  2. Publish a EULA: mimi eula add --label V1 --url <url>");
    println!("  3. Start the service: mimi serve");
    Ok(())
}

async fn open_database(cfg: &Config) -> Result<Database> {
    let db = Database::connect(&cfg.database.url)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database.url))?;
    db.migrate().await.context("failed to apply migrations")?;
    Ok(db)
}

#[cfg(feature = "http-api")]
async fn cmd_serve(mut cfg: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    use mimi_core::agent::ConversationAgent;
    use mimi_core::channel::{LineChannel, MessagingChannel};
    use mimi_core::provider;
    use mimi_core::service::http::{serve, AppState};

    if let Some(host) = host {
        cfg.gateway.host = host;
    }
    if let Some(port) = port {
        cfg.gateway.port = port;
    }

    if cfg.api_key().is_none() {
        tracing::warn!("No completion API key configured; chat requests will fail");
    }
    if cfg.line.channel_access_token.is_empty() {
        tracing::warn!("No LINE channel access token configured; replies will fail");
    }
    if cfg.line.channel_secret.is_empty() {
        tracing::warn!("No LINE channel secret configured; webhook signatures are not checked");
    }

    let db = open_database(&cfg).await?;
    let provider = provider::create_provider(&cfg.provider);
    let channel: Arc<dyn MessagingChannel> = Arc::new(LineChannel::new(cfg.line.clone()));
    let agent = Arc::new(ConversationAgent::new(&db, provider, channel, &cfg));

    let addr = cfg.bind_addr();
    println!("Starting mimi v{} on {}...", mimi_core::VERSION, addr);
    let state = Arc::new(AppState::new(cfg, agent));
    serve(&addr, state).await?;

    db.pool().close().await;
    Ok(())
}

#[cfg(not(feature = "http-api"))]
async fn cmd_serve(_cfg: Config, _host: Option<String>, _port: Option<u16>) -> Result<()> {
    eprintln!("HTTP API not available. Rebuild with: cargo build --features http-api");
    std::process::exit(1);
}

async fn cmd_migrate(cfg: &Config) -> Result<()> {
    open_database(cfg).await?;
    println!("Database {} is up to date", cfg.database.url);
    Ok(())
}

async fn cmd_eula_add(
    cfg: &Config,
    label: String,
    url: String,
    effective_from: Option<String>,
) -> Result<()> {
    let mut new = NewEulaVersion::new(label, url);
    if let Some(raw) = effective_from {
        let at = DateTime::parse_from_rfc3339(&raw)
            .with_context(|| format!("invalid --effective-from {raw:?}; expected RFC 3339"))?;
        new = new.effective_from(at.with_timezone(&Utc));
    }

    let db = open_database(cfg).await?;
    let version = db.eula().create_version(&new).await?;
    println!("Created EULA {} (id {}): {}", version.version, version.id, version.url);

    if let Some(latest) = db.eula().latest_version().await? {
        if latest.id != version.id {
            println!(
                "Note: {} (id {}) is still the latest version users must agree to",
                latest.version, latest.id
            );
        }
    }
    Ok(())
}

async fn cmd_eula_latest(cfg: &Config) -> Result<()> {
    let db = open_database(cfg).await?;
    match db.eula().latest_version().await? {
        Some(v) => {
            println!("Latest EULA: {} (id {})", v.version, v.id);
            println!("  URL: {}", v.url);
            match v.effective_from {
                Some(at) => println!("  Effective from: {}", at.to_rfc3339()),
                None => println!("  Effective from: (created {})", v.created_at.to_rfc3339()),
            }
        }
        None => println!("No EULA version configured; the consent gate is open."),
    }
    Ok(())
}

fn cmd_status(cfg: &Config, config_path: Option<&std::path::Path>) {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(config::get_config_path);

    println!("mimi v{} Status\n", mimi_core::VERSION);
    println!(
        "Config: {} {}",
        path.display(),
        if path.exists() { "✓" } else { "✗ (using defaults + env)" }
    );
    println!("Database: {}", cfg.database.url);
    println!("Listen: {}", cfg.bind_addr());
    println!("Chat model: {}", cfg.models.chat_model);
    println!("Vision model: {}", cfg.models.vision_model);
    println!("History window: {}h", cfg.history.window_hours);
    println!();
    println!("Completion API key: {}", mask_secret(&cfg.provider.api_key));
    println!("LINE access token: {}", mask_secret(&cfg.line.channel_access_token));
    println!("LINE channel secret: {}", mask_secret(&cfg.line.channel_secret));
    println!("Make.com API key: {}", mask_secret(&cfg.make.api_key));
}
