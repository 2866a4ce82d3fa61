use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard_gateway::bridge::client::NoMethods;
use switchboard_gateway::{BridgeClient, Config, Gateway};

/// Switchboard - multi-channel messaging gateway
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.config/switchboard/config.toml)
    #[arg(long, env = "SWITCHBOARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Do not start the host bridge
    #[arg(long)]
    disable_bridge: bool,

    /// Bridge listen address, overrides the config file
    #[arg(long)]
    bridge_addr: Option<String>,

    /// Admin API port, overrides the config file
    #[arg(long)]
    api_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved configuration as JSON
    Config,
    /// Call a gateway method over the bridge
    Call {
        /// Method name, e.g. "lanes.status"
        method: String,
        /// JSON arguments
        #[arg(default_value = "null")]
        args: String,
        /// Bridge address (default: configured bind address)
        #[arg(long)]
        addr: Option<String>,
        /// Give up after this many milliseconds
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },
    /// Print events broadcast by the gateway until interrupted
    Events {
        /// Bridge address (default: configured bind address)
        #[arg(long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,switchboard_gateway=info",
        1 => "info,switchboard_gateway=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load_with_options(cli.config.as_deref(), cli.disable_bridge)?;
    if let Some(addr) = cli.bridge_addr {
        config.bridge.bind = addr;
    }
    if let Some(port) = cli.api_port {
        config.api.port = port;
    }

    match cli.command {
        None => {
            let gateway = Gateway::new(config).await?;
            gateway.run().await?;
        }
        Some(Command::Config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(Command::Call {
            method,
            args,
            addr,
            timeout_ms,
        }) => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("arguments must be JSON")?;
            let addr = addr.unwrap_or(config.bridge.bind);
            let (client, _events) = BridgeClient::connect(addr.as_str(), Arc::new(NoMethods))
                .await
                .with_context(|| format!("cannot connect to bridge at {addr}"))?;
            let result = client
                .call_with_timeout(&method, args, Duration::from_millis(timeout_ms))
                .await;
            client.close().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Some(Command::Events { addr }) => {
            let addr = addr.unwrap_or(config.bridge.bind);
            let (client, mut events) = BridgeClient::connect(addr.as_str(), Arc::new(NoMethods))
                .await
                .with_context(|| format!("cannot connect to bridge at {addr}"))?;
            client.subscribe().await?;
            tracing::info!(addr = %addr, "listening for events");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => println!("{}", serde_json::to_string(&event)?),
                        None => {
                            tracing::warn!("bridge connection closed");
                            break;
                        }
                    },
                }
            }
            client.close().await;
        }
    }
    Ok(())
}
