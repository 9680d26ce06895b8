use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mt5bridge_runtime::{Bridge, BridgeConfig, EmbeddedRuntime, OfflineRuntime, SUPPORTED_METHODS};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt};

const LOG_ENV: &str = "MT5BRIDGE_LOG";

#[derive(Parser)]
#[command(name = "mt5bridge-cli", version)]
#[command(about = "Query a MetaTrader5 terminal through the embedded bridge")]
struct Cli {
    /// Configuration file (defaults to MT5BRIDGE_CONFIG, then the per-user config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Interpreter home, overriding the configuration
    #[arg(long, global = true)]
    python_home: Option<PathBuf>,

    /// Use the offline backend instead of embedded Python
    #[arg(long, global = true)]
    offline: bool,

    /// Let the offline backend serve synthetic market data
    #[arg(long, global = true)]
    connected: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a raw JSON request, e.g. '{"method":"version"}'
    Eval {
        request: String,
    },

    /// Fetch the most recent bars of a symbol
    Bars {
        #[arg(long)]
        symbol: String,

        #[arg(long, default_value_t = 10)]
        count: i64,

        /// M1 M5 M15 M30 H1 H4 D1 W1 MN1
        #[arg(long, default_value = "M1")]
        timeframe: String,
    },

    /// Show terminal information
    Info,

    /// List the supported request methods
    Methods,
}

impl Commands {
    /// The bridge request this command sends, if it needs the bridge at all.
    fn request(&self) -> Result<Option<Value>> {
        Ok(Some(match self {
            Commands::Eval { request } => {
                serde_json::from_str(request).context("request is not valid JSON")?
            }
            Commands::Bars {
                symbol,
                count,
                timeframe,
            } => json!({
                "method": "get_bars",
                "symbol": symbol,
                "timeframe": timeframe,
                "count": count,
            }),
            Commands::Info => json!({"method": "terminal_info"}),
            Commands::Methods => return Ok(None),
        }))
    }
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only the JSON answer
    fmt()
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(request) = cli.command.request()? else {
        for method in SUPPORTED_METHODS {
            println!("{method}");
        }
        return Ok(());
    };

    let config = match &cli.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::load()?,
    }
    .with_home(cli.python_home.clone());

    let response = if cli.offline || !cfg!(feature = "python") {
        let runtime = if cli.connected {
            OfflineRuntime::connected()
        } else {
            OfflineRuntime::new()
        };
        run(Bridge::new(runtime), &config, &request)?
    } else {
        run_python(&config, &request)?
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[cfg(feature = "python")]
fn run_python(config: &BridgeConfig, request: &Value) -> Result<Value> {
    run(Bridge::new(mt5bridge_runtime::PythonRuntime::new()), config, request)
}

#[cfg(not(feature = "python"))]
fn run_python(_config: &BridgeConfig, _request: &Value) -> Result<Value> {
    anyhow::bail!("built without the `python` feature; use --offline")
}

fn run<R: EmbeddedRuntime>(bridge: Bridge<R>, config: &BridgeConfig, request: &Value) -> Result<Value> {
    tracing::info!(module = %config.terminal.module, "Starting bridge");
    bridge
        .initialize(config)
        .context("failed to initialize the bridge")?;

    let response = bridge.eval(request);
    bridge.shutdown();
    Ok(response?)
}
