use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use capvcd::config::OperatorConfig;
use capvcd::vcd::{InfraAdapter, VcdClient};
use capvcd::{controller, telemetry};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the provider
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to a TOML configuration file
    #[arg(long, env = "CAPVCD_CONFIG")]
    config: Option<PathBuf>,

    /// Cloud Director endpoint, e.g. https://vcd.example.com
    #[arg(long, env = "VCD_ENDPOINT")]
    endpoint: Option<String>,

    /// Cloud Director API token
    #[arg(long, env = "VCD_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Maximum concurrent reconciles per controller
    #[arg(long, env = "CAPVCD_CONCURRENCY")]
    concurrency: Option<u16>,

    /// Log output format
    #[arg(long, env = "CAPVCD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Listen address for health and metrics
    #[arg(long, env = "CAPVCD_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Listen address for the conversion webhook
    #[arg(long, env = "CAPVCD_WEBHOOK_ADDR")]
    webhook_addr: Option<String>,

    /// PEM certificate for the conversion webhook
    #[arg(long, env = "CAPVCD_WEBHOOK_CERT")]
    webhook_cert: Option<String>,

    /// PEM private key for the conversion webhook
    #[arg(long, env = "CAPVCD_WEBHOOK_KEY")]
    webhook_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("capvcd-manager v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_manager(run_args).await,
    }
}

fn load_config(args: RunArgs) -> anyhow::Result<OperatorConfig> {
    let mut config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };

    if let Some(endpoint) = args.endpoint {
        config.platform.endpoint = endpoint;
    }
    if args.api_token.is_some() {
        config.platform.api_token = args.api_token;
    }
    if let Some(concurrency) = args.concurrency {
        config.reconcile.concurrency = concurrency;
    }
    if let Some(addr) = args.metrics_addr {
        config.server.metrics_addr = addr;
    }
    if let Some(addr) = args.webhook_addr {
        config.server.webhook_addr = addr;
    }
    if args.webhook_cert.is_some() {
        config.server.webhook_cert_path = args.webhook_cert;
    }
    if args.webhook_key.is_some() {
        config.server.webhook_key_path = args.webhook_key;
    }

    config.validate()?;
    Ok(config)
}

fn parse_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    raw.parse()
        .with_context(|| format!("invalid listen address '{raw}'"))
}

async fn run_manager(args: RunArgs) -> anyhow::Result<()> {
    telemetry::init(args.log_format == LogFormat::Json);

    let config = load_config(args)?;
    info!(
        "Starting capvcd-manager v{} against {}",
        env!("CARGO_PKG_VERSION"),
        config.platform.endpoint
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let api = Arc::new(VcdClient::new(&config.platform)?);
    let adapter = Arc::new(InfraAdapter::new(api, &config.tasks));
    let ready = Arc::new(AtomicBool::new(false));

    #[cfg(feature = "rest-api")]
    {
        let addr = parse_addr(&config.server.metrics_addr)?;
        let state = capvcd::rest_api::ApiState {
            ready: Arc::clone(&ready),
        };
        tokio::spawn(async move {
            if let Err(e) = capvcd::rest_api::run_server(addr, state).await {
                error!("Health/metrics server error: {:?}", e);
            }
        });
    }

    #[cfg(feature = "conversion-webhook")]
    {
        let addr = parse_addr(&config.server.webhook_addr)?;
        let mut server = capvcd::webhook::WebhookServer::new();
        if let (Some(cert), Some(key)) = (
            config.server.webhook_cert_path.clone(),
            config.server.webhook_key_path.clone(),
        ) {
            server = server.with_tls(cert, key);
        }
        tokio::spawn(async move {
            if let Err(e) = server.start(addr).await {
                error!("Conversion webhook error: {:?}", e);
            }
        });
    }

    let result = controller::run_controllers(client, adapter, config.reconcile, ready).await;

    telemetry::shutdown();

    result.map_err(Into::into)
}
