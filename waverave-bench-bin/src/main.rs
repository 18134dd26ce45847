mod config;
mod os_signal;
mod report;
mod sim;
mod usb;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Context;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use waverave_bench::{Benchmark, Termination, Transport};

use crate::config::BenchArgs;
use crate::report::Presenter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Benchmark a simulated device
    Sim(sim::Cmd),
    /// Benchmark a USB device streaming over a bulk endpoint
    Usb(usb::Cmd),
}

/// Run the requested number of benchmarks back to back.
///
/// Returns false if any run found the link faulty.
pub async fn run_all<T: Transport>(
    transport: &mut T,
    args: &BenchArgs,
    cancel: &CancellationToken,
) -> color_eyre::Result<bool> {
    let mut bench = Benchmark::new(args.params()?);
    let config = args.stream_config();
    let mut presenter = Presenter::default();
    let mut healthy = true;
    for _ in 0..args.runs {
        if cancel.is_cancelled() {
            break;
        }
        let result = bench
            .run(transport, &config, Some(cancel), |e| presenter.event(e))
            .await
            .wrap_err("Failed to start")?;
        presenter.summary(&result);
        match result.termination {
            Termination::Completed => (),
            Termination::Cancelled => break,
            Termination::InvalidSamples { .. } | Termination::ReadError => {
                healthy = false;
                break;
            }
        }
    }
    debug!(
        "Read buffer allocated {} time(s)",
        bench.pool().allocations()
    );
    Ok(healthy)
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Cli::parse();
    let cancel = os_signal::quit_token();

    let healthy = match args.command {
        Commands::Sim(c) => c.cmd(&cancel).await?,
        Commands::Usb(c) => c.cmd(&cancel).await?,
    };
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
