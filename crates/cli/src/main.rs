use std::path::{Path, PathBuf};

use {
    clap::{Parser, Subcommand},
    cqlink_config::CqlinkConfig,
    cqlink_gateway::{
        Gateway, LogBuffer, LogCaptureLayer,
        server::{AppState, build_app, serve},
    },
    tokio::net::TcpListener,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "cqlink", about = "cqlink: CQHTTP bot gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind the status server to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port for the status server (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Explicit config file instead of the standard search locations.
    #[arg(long, global = true, env = "CQLINK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the backend and serve the status endpoints (default).
    Gateway,
    /// Query the backend's HTTP status endpoint once and print the result.
    Status,
    /// Load and validate the config, then print it with secrets redacted.
    CheckConfig,
}

/// Initialise tracing, attaching a [`LogCaptureLayer`] when the gateway
/// needs captured entries for its log endpoints.
fn init_telemetry(cli: &Cli, log_buffer: Option<LogBuffer>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    let capture = log_buffer.map(LogCaptureLayer::new);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .with(capture)
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .with(capture)
            .init();
    }
}

/// Load the config named by `--config`, or discover one. A file that fails
/// to load aborts startup.
fn load(cli: &Cli) -> anyhow::Result<(Option<PathBuf>, CqlinkConfig)> {
    match &cli.config {
        Some(path) => Ok((Some(path.clone()), cqlink_config::load_config(path)?)),
        None => cqlink_config::discover_and_load(),
    }
}

fn log_config_source(source: Option<&Path>) {
    match source {
        Some(path) => info!(path = %path.display(), "config loaded"),
        None => info!("no config file found, using defaults"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let (source, config) = load(&cli)?;

    match &cli.command {
        None | Some(Commands::Gateway) => {
            let logs = LogBuffer::new(config.logs.capacity);
            init_telemetry(&cli, Some(logs.clone()));
            info!(version = env!("CARGO_PKG_VERSION"), "cqlink starting");
            log_config_source(source.as_deref());
            if let Some(dir) = &config.logs.dir
                && let Err(e) = logs.enable_persistence(dir.clone())
            {
                warn!(dir = %dir.display(), error = %e, "log persistence disabled");
            }
            run_gateway(&cli, config, logs).await
        },
        Some(Commands::Status) => {
            init_telemetry(&cli, None);
            log_config_source(source.as_deref());
            let gateway = Gateway::build(config, Vec::new()).await;
            match gateway.client().status().await {
                Some(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                    Ok(())
                },
                None => anyhow::bail!("backend status unavailable"),
            }
        },
        Some(Commands::CheckConfig) => {
            match &source {
                Some(path) => println!("# {}", path.display()),
                None => println!("# no config file found, defaults"),
            }
            println!("{config:#?}");
            Ok(())
        },
    }
}

async fn run_gateway(cli: &Cli, config: CqlinkConfig, logs: LogBuffer) -> anyhow::Result<()> {
    let bind = cli.bind.clone().unwrap_or_else(|| config.server.bind.clone());
    let port = cli.port.unwrap_or(config.server.port);
    let webroot = config.server.webroot.clone();

    // Plugins are linked in by embedding crates; the stock binary runs none.
    let gateway = Gateway::build(config, Vec::new()).await;
    gateway.start().await;

    let state = AppState {
        client: gateway.client().clone(),
        logs,
        started_at: gateway.started_at(),
    };
    let app = build_app(state, webroot.as_deref());
    let listener = TcpListener::bind((bind.as_str(), port)).await?;

    let result = serve(listener, app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
    })
    .await;

    gateway.shutdown().await;
    result.map_err(Into::into)
}
