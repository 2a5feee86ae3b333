use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxima::{config, server, settings, Dispatcher, Renderer};

/// Configuration-driven HTTP rewriting reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "proxima", version, about)]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config", env = "PROXIMA_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Base64-encoded configuration blob.
    #[arg(long = "config-b64", env = "PROXIMA_CONFIG_B64", conflicts_with = "config")]
    config_b64: Option<String>,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 29574)]
    port: u16,

    /// Serve fully rendered requests back as JSON instead of proxying.
    #[arg(long = "test-mode")]
    test_mode: bool,

    /// Settings file base path relative to $HOME; the extensions .json,
    /// .yaml, .yml, .toml are tried in order.
    #[arg(long, default_value = ".proxima/settings")]
    settings: String,

    /// Extra template variables (key=value), merged over the settings file.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxima=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match (&cli.config, &cli.config_b64) {
        (Some(path), _) => config::load(path)?,
        (None, Some(blob)) => config::from_base64(blob)?,
        (None, None) => anyhow::bail!("either --config or --config-b64 is required"),
    };

    let user_settings = settings::read(&cli.settings)?;

    let mut vars = user_settings.vars;
    for pair in &cli.vars {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid --var '{pair}', expected key=value"))?;
        vars.insert(key.to_string(), Value::String(value.to_string()));
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.port,
        test_mode = cli.test_mode,
        uri_groups = cfg.uri_groups.len(),
        "starting proxy"
    );

    let renderer = Arc::new(Renderer::new());
    let dispatcher = Arc::new(Dispatcher::new(
        &cfg,
        Value::Object(vars),
        renderer,
        cli.test_mode,
    )?);

    server::run(dispatcher, cli.port).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
