use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewise::admission::VendorRegistry;
use ratewise::config::RatewiseConfig;
use ratewise::dispatch::{Dispatcher, SimulatedVendor};

#[derive(Parser, Debug)]
#[command(name = "ratewise", version, about = "Adaptive per-vendor admission control")]
struct Cli {
    /// YAML configuration file; RATEWISE__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

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
    /// Drive simulated vendors through the dispatcher and print their status
    Simulate {
        /// Vendor names; each gets its own simulated endpoint
        #[arg(long = "vendor", default_value = "acme")]
        vendors: Vec<String>,

        /// Calls to make per vendor
        #[arg(long, default_value_t = 20)]
        requests: u32,

        /// Hidden per-minute limit of each simulated vendor
        #[arg(long, default_value_t = 12)]
        true_limit: u32,

        /// Fraction of calls that fail with a 503
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        /// Do not advertise x-ratelimit-* headers
        #[arg(long)]
        no_headers: bool,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = RatewiseConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            vendors,
            requests,
            true_limit,
            failure_rate,
            no_headers,
            seed,
        } => {
            info!(version = env!("CARGO_PKG_VERSION"), vendors = vendors.len(), "Starting simulation");
            let dispatcher = Dispatcher::new(Arc::new(VendorRegistry::new(config)));

            let runs = vendors.iter().enumerate().map(|(i, vendor)| {
                let endpoint = SimulatedVendor::new(true_limit, seed.wrapping_add(i as u64))
                    .advertise_headers(!no_headers)
                    .failure_rate(failure_rate);
                let dispatcher = &dispatcher;
                async move {
                    let mut succeeded = 0u32;
                    for _ in 0..requests {
                        match dispatcher.dispatch_with_retry(vendor, &endpoint).await {
                            Ok(_) => succeeded += 1,
                            Err(err) => warn!(vendor = %vendor, error = %err, "Call failed"),
                        }
                    }
                    info!(vendor = %vendor, succeeded = succeeded, requested = requests, "Vendor run finished");
                }
            });
            join_all(runs).await;

            let statuses = dispatcher.registry().statuses();
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
    }

    Ok(())
}
