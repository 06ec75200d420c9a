use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, info, warn};
use tokio::net::TcpListener;

use claude_broker::agent::ClaudeRuntime;
use claude_broker::api::{self, AppState};
use claude_broker::maintenance::Maintainer;
use claude_broker::session::SessionManager;
use claude_broker::settings::AppConfig;
use claude_broker::storage;

const APP_NAME: &str = "claude-broker";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.common);
    let config = AppConfig::load(cli.common.config.as_deref())?;

    match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
        Command::Config { command } => handle_config(&cli.common, &config, command),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    handle_serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Multi-tenant HTTP broker for Claude Code agent sessions.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show {
        #[arg(long, value_enum, default_value_t = ConfigFormat::Yaml)]
        format: ConfigFormat,
    },
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigFormat {
    Yaml,
    Json,
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = effective_log_level(common);
    let level_name = match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("claude_broker={level_name},tower_http={level_name}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let disable_color =
            std::env::var_os("NO_COLOR").is_some() || !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }

    // Bridge for modules logging through the log facade.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug {
        LevelFilter::Debug
    } else {
        match common.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn handle_config(common: &CommonOpts, config: &AppConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show { format } => {
            let output = match format {
                ConfigFormat::Yaml => {
                    serde_yaml::to_string(config).context("serializing config to YAML")?
                }
                ConfigFormat::Json => {
                    serde_json::to_string_pretty(config).context("serializing config to JSON")?
                }
            };
            println!("{output}");
            Ok(())
        }
        ConfigCommand::Path => {
            let path = common
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from("config.yaml"));
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn handle_serve(mut config: AppConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(host) = cmd.host {
        config.api.host = host;
    }
    if let Some(port) = cmd.port {
        config.api.port = port;
    }

    info!("starting {APP_NAME} {}", claude_broker::VERSION);

    // Missing upstream credentials are an unrecoverable startup failure.
    config
        .validate_agent_env()
        .context("validating agent environment")?;

    let config = Arc::new(config);

    // A broken storage contract is fatal here, before the listener binds.
    let store = storage::create_store(&config.storage)
        .await
        .context("initializing session storage")?;
    info!(
        "storage backend: {} (ttl {}s)",
        store.backend_name(),
        config.storage.ttl_seconds
    );

    let runtime = Arc::new(ClaudeRuntime::new(&config.agent));
    let manager = SessionManager::new(Arc::clone(&config), Arc::clone(&store), runtime);

    info!(
        "limits: {} sessions, {} per user, {} concurrent turns, {} MiB memory ceiling",
        config.limits.max_sessions,
        config.limits.max_sessions_per_user,
        config.limits.max_concurrent_requests,
        config.limits.memory_limit_mb,
    );

    let maintainer = Maintainer::start(Arc::clone(&manager));

    let state = AppState::new(Arc::clone(&manager));
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.api.host, config.api.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    maintainer.stop().await;
    manager.shutdown().await;
    store.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("installing Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => warn!("installing SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
