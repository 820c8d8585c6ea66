use anyhow::Context;
use clap::Parser;
use llm_broker::config::config_search_paths;
use llm_broker::{build_router, AppState, BrokerConfig, BrokerSnapshot, LlmProxy, RequestLog, SnapshotHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-broker",
    about = "Unified chat-completion gateway across LLM vendors",
    version
)]
struct Cli {
    /// Path to config file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Request log file (JSONL)
    #[arg(long, default_value = "llm-broker-requests.jsonl")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_broker=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        println!("  (falls back to built-in defaults)");
        return Ok(());
    }

    let (mut config, config_path) = BrokerConfig::find_and_load(cli.config.as_deref())
        .context("failed to load configuration")?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let client = reqwest::Client::builder()
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()?;

    let snapshot = SnapshotHandle::new(BrokerSnapshot::from_config(&config, &client)?);
    let mut proxy = LlmProxy::new(snapshot.clone());
    if config.proxy.enable_request_logging {
        let log = RequestLog::open(&cli.log_file)
            .with_context(|| format!("failed to open request log {}", cli.log_file.display()))?;
        proxy = proxy.with_request_log(log);
    }

    info!("llm-broker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "  Config:    {}",
        config_path
            .as_deref()
            .map_or_else(|| "<built-in>".to_string(), |p| p.display().to_string())
    );
    info!("  Proxy:     {}", config.proxy.name);
    info!("  Default:   {}", config.proxy.default_model);
    info!("  Models:    {}", proxy.available_models().join(", "));
    info!("  Timeout:   {}s", config.proxy.timeout_secs);
    if config.proxy.enable_request_logging {
        info!("  Log file:  {}", cli.log_file.display());
    }

    if let Some(path) = config_path.clone() {
        spawn_reload_on_sighup(path, snapshot.clone(), client.clone())?;
    }

    let state = Arc::new(AppState { proxy });
    let app = build_router(state);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Rebuild the snapshot from `path` on every SIGHUP. A bad config keeps the
/// running snapshot.
#[cfg(unix)]
fn spawn_reload_on_sighup(
    path: PathBuf,
    snapshot: SnapshotHandle,
    client: reqwest::Client,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!(path = %path.display(), "SIGHUP received, reloading configuration");
            match BrokerConfig::load(&path)
                .and_then(|config| BrokerSnapshot::from_config(&config, &client))
            {
                Ok(next) => snapshot.install(next),
                Err(e) => tracing::error!(error = %e, "reload failed, keeping previous configuration"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(
    _path: PathBuf,
    _snapshot: SnapshotHandle,
    _client: reqwest::Client,
) -> anyhow::Result<()> {
    Ok(())
}
