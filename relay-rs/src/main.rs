use anyhow::Context;
use clap::Parser;
use relay_rs::config::{Config, LogFormat, RelayProvider};
use relay_rs::relay::{CredentialsProvider, MockRelay, RelayClient, SesClient};
use relay_rs::session::context::fields;
use relay_rs::session::{DiagnosticContext, SessionFactory};
use relay_rs::smtp::SmtpServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "relay-rs")]
#[command(about = "SMTP relay forwarding mail to AWS SES", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides config file and ADDR
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if Path::new("config.toml").exists() => Config::from_file("config.toml")?,
        None => Config::default(),
    }
    .apply_env();

    if let Some(listen) = cli.listen {
        config.smtp.listen_addr = listen;
    }

    init_logging(&config);
    config.validate()?;

    info!("Starting relay-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Domain: {}", config.server.domain);
    info!("  Relay: {:?} ({})", config.relay.provider, config.relay.region);

    let relay = build_relay(&config)?;
    let base_context = DiagnosticContext::new().with_base(fields::SERVICE, "relay-rs");
    let factory = SessionFactory::new(relay, base_context);

    SmtpServer::new(&config, Arc::new(factory)).run().await?;
    Ok(())
}

fn init_logging(config: &Config) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

fn build_relay(config: &Config) -> anyhow::Result<Arc<dyn RelayClient>> {
    match config.relay.provider {
        RelayProvider::Ses => {
            let credentials = CredentialsProvider::from_env().context("AWS credentials")?;
            let mut client = SesClient::new(config.relay.region.clone(), credentials)?;
            if let Some(ref endpoint) = config.relay.endpoint {
                client = client.with_endpoint(url::Url::parse(endpoint)?);
            }
            info!("SES endpoint: {}", client.endpoint());
            Ok(Arc::new(client))
        }
        RelayProvider::Mock => {
            warn!("Mock relay enabled: messages are logged and dropped");
            Ok(Arc::new(MockRelay::new()))
        }
    }
}
