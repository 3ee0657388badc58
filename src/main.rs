//! linguagate CLI - Self-hosted machine translation gateway.

use anyhow::Context;
use clap::{Parser, Subcommand};
use linguagate::api::{create_router_with_state, AppState};
use linguagate::auth::{Authenticator, SqliteKeyStore};
use linguagate::catalog::ModelCatalog;
use linguagate::config::{Config, LogVerbosity};
use linguagate::gateway::Gateway;
use linguagate::inference::{LanguageDetector, ModelLoader, RemoteWorker};
use linguagate::limiter::RateLimiter;
use linguagate::registry::ModelRegistry;
use linguagate::router::TranslationRouter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "linguagate")]
#[command(about = "Self-hosted machine translation gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Log verbosity level
        #[arg(short, long, value_enum)]
        log_level: Option<LogLevel>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show current configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Manage API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// List catalog models with their local state
    Models,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Issue a new key
    Add {
        /// Requests per key window
        #[arg(long)]
        req_limit: Option<u64>,

        /// Characters per key window
        #[arg(long)]
        char_limit: Option<u64>,

        /// Lifetime in seconds
        #[arg(long)]
        expires_in_secs: Option<u64>,
    },
    /// Revoke a key
    Remove { key: String },
    /// List every key
    List,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogLevel {
    Minimal,
    Compact,
    Verbose,
}

impl From<LogLevel> for LogVerbosity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Minimal => LogVerbosity::Minimal,
            LogLevel::Compact => LogVerbosity::Compact,
            LogLevel::Verbose => LogVerbosity::Verbose,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            host,
            port,
            log_level,
            config,
        }) => {
            run_server(host, port, log_level, config).await?;
        }
        Some(Commands::Config { path }) => {
            show_config(path)?;
        }
        Some(Commands::Keys { action }) => {
            manage_keys(action).await?;
        }
        Some(Commands::Models) => {
            list_models().await?;
        }
        None => {
            // Default: run server
            run_server(None, None, None, None).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config.with_env_overrides())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("linguagate={},tower_http=info", config.logging.level)));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

fn build_registry(config: &Config, worker: Arc<RemoteWorker>) -> anyhow::Result<Arc<ModelRegistry>> {
    let index = match &config.models.index_url {
        Some(url) => url.clone(),
        None => config.saved_index_path().display().to_string(),
    };
    let catalog = ModelCatalog::new(&index)?
        .with_saved_index(config.saved_index_path())
        .with_cache_ttl_secs(config.models.catalog_ttl_secs);

    let registry = ModelRegistry::new(
        catalog,
        worker as Arc<dyn ModelLoader>,
        config.registry_options()?,
    )?;
    Ok(Arc::new(registry))
}

fn build_authenticator(config: &Config) -> anyhow::Result<Authenticator> {
    let store = SqliteKeyStore::open(&config.auth.key_db)
        .with_context(|| format!("opening key store {}", config.auth.key_db.display()))?;
    Ok(Authenticator::new(Arc::new(store), config.auth_policy()?)
        .with_cache_ttl(Duration::from_secs(config.auth.cache_ttl_secs)))
}

async fn run_server(
    host_override: Option<String>,
    port_override: Option<u16>,
    log_level: Option<LogLevel>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    init_tracing(&config);

    let host = host_override.unwrap_or_else(|| config.gateway.host.clone());
    let port = port_override.unwrap_or(config.gateway.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;

    let auth = Arc::new(build_authenticator(&config)?);
    let worker = Arc::new(RemoteWorker::new(&config.models.worker_url)?);
    let registry = build_registry(&config, Arc::clone(&worker))?;

    let report = registry.boot().await;
    if report.loaded.is_empty() {
        anyhow::bail!(
            "no translation models could be loaded ({} failures); check models.dir and models.index_url",
            report.failures.len()
        );
    }

    let limiter = Arc::new(RateLimiter::new(config.limits.stripes));
    let router = Arc::new(TranslationRouter::new(
        Arc::clone(&registry),
        &config.models.pivot,
    )?);
    let gateway = Gateway::new(
        auth,
        Arc::clone(&limiter),
        router,
        Arc::clone(&registry),
        worker as Arc<dyn LanguageDetector>,
        config.gateway_settings(),
    );

    let purge_every = Duration::from_secs(config.limits.purge_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            let purged = limiter.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired quota windows dropped");
            }
        }
    });

    let verbosity: LogVerbosity = log_level
        .map(Into::into)
        .unwrap_or(config.logging.verbosity);
    let mut state = AppState::new(Arc::new(gateway))
        .with_admin_token(config.gateway.admin_token.clone())
        .with_verbosity(verbosity)
        .with_trust_forwarded_for(config.api.trust_forwarded_for);
    state.default_req_limit = config.auth.default_req_limit;
    let app = create_router_with_state(state);

    match verbosity {
        LogVerbosity::Minimal => {
            println!("linguagate:{}", port);
        }
        LogVerbosity::Compact => {
            println!("→ linguagate starting on http://{}", addr);
            println!("→ {} models loaded, pivot {}", report.loaded.len(), config.models.pivot);
        }
        LogVerbosity::Verbose => {
            println!("────────────────────────────────────────");
            println!("linguagate v{}", env!("CARGO_PKG_VERSION"));
            println!("────────────────────────────────────────");
            println!("Gateway:    http://{}", addr);
            println!("Translate:  http://{}/translate", addr);
            println!("Health:     http://{}/health", addr);
            println!("Languages:  http://{}/languages", addr);
            println!("────────────────────────────────────────");
            for pair in &report.loaded {
                println!("Model:      {}", pair);
            }
            for failure in &report.failures {
                println!("Failed:     {} ({})", failure.message, failure.kind);
            }
            println!("Pivot:      {}", config.models.pivot);
            println!("API keys:   {}", if config.auth.require_key { "required" } else { "optional" });
            println!("Admin API:  {}", if config.gateway.admin_token.is_some() { "enabled" } else { "disabled" });
            println!("────────────────────────────────────────");
        }
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    registry.unload_all().await;
    println!("\nGateway stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

fn show_config(show_path: bool) -> anyhow::Result<()> {
    if show_path {
        println!("{}", Config::default_path().display());
        return Ok(());
    }

    let config = Config::load()?.with_env_overrides();
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn manage_keys(action: KeyAction) -> anyhow::Result<()> {
    let config = load_config(None)?;
    let auth = build_authenticator(&config)?;

    match action {
        KeyAction::Add {
            req_limit,
            char_limit,
            expires_in_secs,
        } => {
            let key = auth
                .issue_key(
                    req_limit.unwrap_or(config.auth.default_req_limit),
                    char_limit,
                    expires_in_secs.map(Duration::from_secs),
                )
                .await?;
            println!("{}", key.key);
        }
        KeyAction::Remove { key } => {
            if !auth.revoke(&key).await? {
                anyhow::bail!("API key not found");
            }
            println!("Revoked {}", key);
        }
        KeyAction::List => {
            for key in auth.list_keys().await? {
                let chars = key
                    .char_limit
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unlimited".to_string());
                let state = if key.revoked { " (revoked)" } else { "" };
                println!("{}  req={}  chars={}{}", key.key, key.req_limit, chars, state);
            }
        }
    }
    Ok(())
}

async fn list_models() -> anyhow::Result<()> {
    let config = load_config(None)?;
    let worker = Arc::new(RemoteWorker::new(&config.models.worker_url)?);
    let registry = build_registry(&config, worker)?;

    for model in registry.list_models().await? {
        let installed = model.installed_version.as_deref().unwrap_or("-");
        println!(
            "{:<8} {:<10} installed={:<10} {} bytes",
            format!("{}", model.pair),
            model.version,
            installed,
            model.size_bytes
        );
    }
    Ok(())
}
