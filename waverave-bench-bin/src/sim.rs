use std::time::Duration;

use clap::{Args, ValueEnum};
use color_eyre::eyre::eyre;
use tokio_util::sync::CancellationToken;
use waverave_bench::{
    DeviceConfigurator, Direction,
    sim::{Fault, FaultKind, SimDevice},
};

use crate::config::{BenchArgs, ToneArgs};
use crate::report::print_sample_rates;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FaultArg {
    /// Send all-zero samples
    Zeros,
    /// Stop sending data
    Stall,
}

impl From<FaultArg> for FaultKind {
    fn from(value: FaultArg) -> Self {
        match value {
            FaultArg::Zeros => FaultKind::Zeros,
            FaultArg::Stall => FaultKind::Stall,
        }
    }
}

#[derive(Args, Debug)]
pub struct Cmd {
    #[command(flatten)]
    bench: BenchArgs,

    #[command(flatten)]
    tone: ToneArgs,

    /// Inject a fault this many seconds into each run
    #[arg(long)]
    fault_after: Option<f64>,

    /// Kind of fault to inject
    #[arg(long, value_enum, default_value_t = FaultArg::Zeros)]
    fault: FaultArg,
}

impl Cmd {
    fn fault(&self) -> color_eyre::Result<Option<Fault>> {
        let Some(after) = self.fault_after else {
            return Ok(None);
        };
        if !(after >= 0.0) {
            return Err(eyre!("fault time can't be negative, but got {after}"));
        }
        Ok(Some(Fault {
            after: Duration::from_secs_f64(after),
            kind: self.fault.into(),
        }))
    }

    pub async fn cmd(self, cancel: &CancellationToken) -> color_eyre::Result<bool> {
        let mut dev = SimDevice::new();
        if let Some(fault) = self.fault()? {
            dev = dev.with_fault(fault);
        }
        println!("Connected to: {}", dev.description());

        self.tone.configure(&mut dev)?;
        let channel = self.bench.stream_config().channel;
        print_sample_rates(
            dev.sample_rate(Direction::Tx, channel).ok(),
            dev.sample_rate(Direction::Rx, channel).ok(),
        );

        crate::run_all(&mut dev, &self.bench, cancel).await
    }
}
