use std::{net::IpAddr, path::PathBuf};
use anyhow::Context;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use storra::{BackendKind, StorraConfig, StorraServer};

/// HTTP document store with embedded and MongoDB backends.
#[derive(Debug, Parser)]
#[command(name = "storra", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage backend, overriding the configuration file.
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Builds the effective configuration, plus the config path if that file was missing.
    fn into_config(self) -> anyhow::Result<(StorraConfig, Option<PathBuf>)> {
        let (mut config, missing) = match self.config {
            Some(path) => match StorraConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?
            {
                Some(config) => (config, None),
                None => (StorraConfig::default(), Some(path)),
            },
            None => (StorraConfig::default(), None),
        };

        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }

        Ok((config, missing))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, missing) = Cli::parse().into_config()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = missing {
        warn!(path = %path.display(), "configuration file not found, using defaults");
    }

    StorraServer::from_config(config)
        .await
        .context("failed to initialize backend")?
        .serve()
        .await?;

    Ok(())
}
