//! CLI entry point for daq-link
//!
//! Bench tool for bringing up instruments on a link without writing a driver:
//! - `send`: one command to one address, reply printed as JSON
//! - `discover`: walk a daisy chain and list responding addresses
//! - `check-config`: load and validate a link configuration
//! - `ports`: list local serial ports
//!
//! # Usage
//!
//! ```bash
//! daq-link --config pump.toml check-config
//! daq-link send --config pump.toml --address 0 ver
//! daq-link send --config pump.toml --address 0 irate 5 --arg ml/min --retry
//! daq-link discover --config valves.toml U --execute --expect MVP
//! ```

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_link::format::Hamilton;
use daq_link::{
    load_config, AddressAllocator, CommandTemplate, DeviceSession, LinkConfig, LinkRegistry,
    ProtocolFamily,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::logging::TracingConfig;

#[derive(Parser)]
#[command(name = "daq-link")]
#[command(about = "Talk to serial and ethernet lab instruments", long_about = None)]
struct Cli {
    /// Link configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log span close events with timing (per-transaction latency)
    #[arg(long, global = true)]
    log_spans: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one command and print the reply
    Send {
        /// Device address
        #[arg(long, default_value = "0")]
        address: u16,

        /// Command mnemonic
        mnemonic: String,

        /// Command value
        #[arg(default_value = "")]
        value: String,

        /// Optional argument appended after the separator
        #[arg(long, default_value = "")]
        arg: String,

        /// Separator written before the argument
        #[arg(long, default_value = " ")]
        separator: String,

        /// Append the family's execute marker
        #[arg(long)]
        execute: bool,

        /// Reply lines to wait for (0 sends without waiting)
        #[arg(long, default_value = "1")]
        lines: usize,

        /// Override the configured timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Retry busy replies with the configured policy
        #[arg(long)]
        retry: bool,
    },

    /// Probe a daisy chain for responding devices
    Discover {
        /// Probe command mnemonic (e.g. a firmware query)
        probe: String,

        /// Append the family's execute marker to the probe
        #[arg(long)]
        execute: bool,

        /// Require replies to start with this text
        #[arg(long)]
        expect: Option<String>,

        /// Skip the Hamilton address-assignment broadcast
        #[arg(long)]
        no_init: bool,

        /// Wait after the broadcast
        #[arg(long, default_value = "1000")]
        settle_ms: u64,

        /// Per-address probe timeout
        #[arg(long, default_value = "300")]
        probe_timeout_ms: u64,

        /// Stop after this many devices
        #[arg(long)]
        max_devices: Option<usize>,
    },

    /// Load and validate a configuration, then print it
    CheckConfig,

    /// List serial ports
    #[cfg(feature = "serial")]
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(
        TracingConfig::from_args(&cli.log_level, cli.json_logs)?.with_span_events(cli.log_spans),
    )?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Send {
            address,
            mnemonic,
            value,
            arg,
            separator,
            execute,
            lines,
            timeout_ms,
            retry,
        } => {
            let config = load(cli.config.as_deref())?;
            let template = build_template(mnemonic, separator, execute, lines);
            let registry = LinkRegistry::new();
            let link = config
                .acquire(&registry)
                .await
                .with_context(|| format!("Failed to open {}", config.endpoint()))?;

            let mut session =
                DeviceSession::new(config.display_name(), link, address, config.format());
            if let Some(ms) = timeout_ms {
                session = session.with_timeout(Duration::from_millis(ms));
            }

            let session = &session;
            let (template, value, arg, cancel) = (&template, &value, &arg, &cancel);
            let result = if retry {
                config
                    .retry_policy()
                    .with_retry_cancellable(cancel, || async move {
                        session.send_with_cancel(template, value, arg, cancel).await
                    })
                    .await
            } else {
                session.send_with_cancel(template, value, arg, cancel).await
            };
            registry.close_all().await.ok();

            let reply = result.context("Command failed")?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }

        Commands::Discover {
            probe,
            execute,
            expect,
            no_init,
            settle_ms,
            probe_timeout_ms,
            max_devices,
        } => {
            let config = load(cli.config.as_deref())?;
            let template = build_template(probe, " ".to_string(), execute, 1);
            let registry = LinkRegistry::new();
            let link = config
                .acquire(&registry)
                .await
                .with_context(|| format!("Failed to open {}", config.endpoint()))?;

            let mut allocator = AddressAllocator::new()
                .with_probe_timeout(Duration::from_millis(probe_timeout_ms));
            if config.family == ProtocolFamily::Hamilton && !no_init {
                allocator = allocator.with_init_broadcast(
                    Hamilton::INIT_BROADCAST,
                    Duration::from_millis(settle_ms),
                );
            }
            if let Some(max) = max_devices {
                allocator = allocator.with_max_devices(max);
            }

            let result = allocator
                .discover_with_cancel(
                    &link,
                    config.format(),
                    &template,
                    |reply| {
                        expect
                            .as_deref()
                            .is_none_or(|prefix| reply.text().starts_with(prefix))
                    },
                    &cancel,
                )
                .await;
            registry.close_all().await.ok();

            let addresses = result.context("Discovery failed")?;
            info!(count = addresses.len(), "Devices found");
            println!("{}", serde_json::to_string(&addresses)?);
        }

        Commands::CheckConfig => {
            let config = load(cli.config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        #[cfg(feature = "serial")]
        Commands::Ports => {
            let ports = daq_link::serial::available_ports()?;
            if ports.is_empty() {
                anyhow::bail!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
        }
    }

    Ok(())
}

fn load(path: Option<&Path>) -> Result<LinkConfig> {
    let path = path.context("--config is required for this command")?;
    load_config(path).with_context(|| format!("Failed to load config {}", path.display()))
}

/// Template for a mnemonic given on the command line.
///
/// Templates hold `'static` strings; the CLI builds one per run, so the
/// leaked strings live exactly as long as the process needs them.
fn build_template(
    mnemonic: String,
    separator: String,
    execute: bool,
    lines: usize,
) -> CommandTemplate {
    let mnemonic: &'static str = Box::leak(mnemonic.into_boxed_str());
    let separator: &'static str = Box::leak(separator.into_boxed_str());
    let mut template = CommandTemplate::new(mnemonic).with_optional_argument(separator);
    if execute {
        template = template.executed();
    }
    if lines == 0 {
        template.without_reply()
    } else {
        template.with_reply_lines(lines)
    }
}
