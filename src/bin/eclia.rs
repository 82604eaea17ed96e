//! eclia — local multi-surface assistant gateway
//!
//! Usage:
//!   eclia                          → start the gateway on the configured port
//!   eclia --config path.json       → load config from a specific file
//!   eclia --no-auth                → disable bearer-token auth (loopback dev)
//!   eclia version                  → show version

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eclia_core::{AuthConfig, AuthMode, BindMode, EcliaConfig};
use eclia_gateway::{start_gateway, ExtendedConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "eclia",
    about = "Local multi-surface assistant gateway",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the gateway config file (JSON)
    #[arg(short, long, default_value = "eclia.json")]
    config: PathBuf,

    /// Workspace root the session store and artifacts live under
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Port override for the gateway server
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind mode override: lan or loopback
    #[arg(short, long)]
    bind: Option<String>,

    /// Auth token override (or set ECLIA_GATEWAY_TOKEN)
    #[arg(short, long)]
    token: Option<String>,

    /// Disable authentication
    #[arg(long, default_value_t = false)]
    no_auth: bool,

    /// Write logs to a file (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Custom system prompt prepended ahead of tool-use instructions
    #[arg(long)]
    system_prompt: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("eclia v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        None => {}
    }

    let _log_guard = init_tracing(cli.log_file.as_deref());
    run_gateway(&cli).await
}

fn init_tracing(log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "eclia=info,tower_http=info".into());

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "eclia.log".to_string());
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

async fn run_gateway(cli: &Cli) -> anyhow::Result<()> {
    let mut gateway = EcliaConfig::load(&cli.config)?;

    if let Some(port) = cli.port {
        gateway.port = port;
    }
    if let Some(bind) = &cli.bind {
        gateway.bind = match bind.as_str() {
            "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        };
    }
    if cli.no_auth {
        gateway.auth = AuthConfig { mode: AuthMode::None, token: None };
    } else if let Some(token) = &cli.token {
        gateway.auth = AuthConfig { mode: AuthMode::Token, token: Some(token.clone()) };
    }

    let workspace_root = cli
        .workspace
        .clone()
        .or_else(|| gateway.workspace_root.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    tracing::info!(port = gateway.port, ?workspace_root, "starting eclia gateway");

    let config = ExtendedConfig {
        gateway,
        workspace_root,
        system_prompt: cli.system_prompt.clone(),
    };
    start_gateway(config).await
}
