//! quietproxy binary
//!
//! Usage:
//! ```text
//! quietproxy --config ~/.config/quietproxy/config.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use quietproxy::api::start_proxy;
use quietproxy::config::ProxyConfig;
use quietproxy::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let config = load_config(&args).await?;
    let _log_guard = init_logging(&config.logging)?;

    tracing::info!("Starting quietproxy {}", quietproxy::VERSION);
    let handle = start_proxy(&config).await?;
    if let Some(admin) = handle.admin_addr() {
        tracing::info!("Admin endpoint at http://{}", admin);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    handle.shutdown().await
}

struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args {
        config: None,
        port: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    parsed.config = Some(PathBuf::from(path));
                }
            }
            "--port" | "-p" => match args.next().map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => parsed.port = Some(port),
                _ => eprintln!("--port expects a number between 0 and 65535"),
            },
            "--help" | "-h" => {
                eprintln!("quietproxy {}", quietproxy::VERSION);
                eprintln!();
                eprintln!("Usage: quietproxy [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config, -c <PATH>   TOML config file (default: <config dir>/quietproxy/config.toml)");
                eprintln!("  --port, -p <PORT>     Override the listening port");
                eprintln!("  --help, -h            Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    parsed
}

async fn load_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::load(path).await?,
        None => match dirs::config_dir().map(|d| d.join("quietproxy").join("config.toml")) {
            Some(path) if path.exists() => ProxyConfig::load(&path).await?,
            _ => ProxyConfig::default(),
        },
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}
