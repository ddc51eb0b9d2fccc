use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rift_mitm::ca::generate_ca;
use rift_mitm::config::Config;
use rift_mitm::server::ProxyServer;
use rift_mitm::{LoggingDelegate, Proxy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rift-mitm", version, about = "Intercepting HTTP/HTTPS forward proxy")]
struct Cli {
    /// Log filter, overridden by RUST_LOG.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy.
    Run {
        #[arg(short, long, env = "RIFT_MITM_CONFIG")]
        config: Option<PathBuf>,
        /// Overrides `listen.port`.
        #[arg(short, long)]
        port: Option<u16>,
        /// Decrypt HTTPS tunnels regardless of `mitm.enabled`.
        #[arg(long)]
        mitm: bool,
    },

    /// Write a new root certificate and key.
    GenCa {
        #[arg(long, value_name = "FILE")]
        cert: PathBuf,
        #[arg(long, value_name = "FILE")]
        key: PathBuf,
        #[arg(long, default_value = "Rift MITM Root")]
        common_name: String,
        #[arg(long, default_value = "10")]
        years: u32,
    },

    /// Print the root certificate clients must trust.
    PrintCa {
        #[arg(short, long, env = "RIFT_MITM_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_tracing(level: &str, format: LogFormat) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("Failed to initialize tracing subscriber")
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr = config.listen.socket_addr()?;
    let parent = config.parent_proxy()?;
    if let Some(parent) = &parent {
        info!("Chaining through parent proxy {}", parent);
    }

    let mut builder = Proxy::builder()
        .delegate(Arc::new(LoggingDelegate::new(parent)))
        .transport_config(config.transport.clone())
        .dns_ttl(config.dns.ttl())
        .handshake_timeout(config.mitm.handshake_timeout());
    if config.mitm.enabled {
        if config.mitm.ca_cert_path.is_none() {
            tracing::warn!("Using the bundled development root CA; do not trust it outside test machines");
        }
        let authority = config
            .mitm
            .build_authority()
            .context("Failed to load root CA")?;
        builder = builder.decrypt_https(authority);
    }
    let proxy = builder.build().context("Failed to build proxy")?;

    let server = ProxyServer::bind(addr, proxy)
        .with_context(|| format!("Failed to bind {addr}"))?;
    server
        .run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format)?;

    match cli.command {
        Command::Run { config, port, mitm } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(port) = port {
                config.listen.port = port;
            }
            config.mitm.enabled |= mitm;
            run(config).await
        }
        Command::GenCa {
            cert,
            key,
            common_name,
            years,
        } => {
            let (cert_pem, key_pem) = generate_ca(&common_name, years)?;
            std::fs::write(&cert, cert_pem)
                .with_context(|| format!("Failed to write {}", cert.display()))?;
            std::fs::write(&key, key_pem)
                .with_context(|| format!("Failed to write {}", key.display()))?;
            info!("Wrote root certificate to {} and key to {}", cert.display(), key.display());
            Ok(())
        }
        Command::PrintCa { config } => {
            let config = load_config(config.as_ref())?;
            let root = config.mitm.load_root().context("Failed to load root CA")?;
            print!("{}", root.cert_pem());
            Ok(())
        }
    }
}
