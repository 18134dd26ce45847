use std::{path::PathBuf, time::Duration};

use clap::{Args, ValueEnum};
use color_eyre::eyre::{Context, eyre};
use waverave_bench::{
    BenchParams, DeviceConfigurator, Direction, SampleFormat, StreamConfig, ToneParams,
    ValidityWindow,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// 12-bit samples, packed 2 components to 3 bytes
    I12,
    /// 16-bit samples
    I16,
}

impl From<Format> for SampleFormat {
    fn from(value: Format) -> Self {
        match value {
            Format::I12 => SampleFormat::I12Compressed,
            Format::I16 => SampleFormat::I16,
        }
    }
}

/// Benchmark loop and stream settings.
#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Length of each run, in seconds.
    #[arg(short = 't', long, default_value_t = 10.0)]
    duration: f64,

    /// Longest wait for a single read, in milliseconds.
    #[arg(long = "timeout", default_value_t = 1000)]
    timeout_ms: u64,

    /// Minimum time between link rate probes, in milliseconds.
    #[arg(long = "probe", default_value_t = 1100)]
    probe_ms: u64,

    /// Smallest acceptable test tone amplitude.
    #[arg(long, default_value_t = 1900)]
    min_amp: u32,

    /// Largest acceptable test tone amplitude.
    #[arg(long, default_value_t = 2100)]
    max_amp: u32,

    /// Samples per batch. The read buffer holds `frames` batches.
    #[arg(long, default_value_t = 680)]
    batch_size: usize,

    /// Number of batches in the read buffer.
    #[arg(long, default_value_t = 32)]
    frames: usize,

    /// Sample format on the link.
    #[arg(long, value_enum, default_value_t = Format::I12)]
    format: Format,

    /// Buffering hint, 0 (lowest latency) to 1 (highest throughput).
    #[arg(long, default_value_t = 1.0)]
    latency: f32,

    /// Channel to stream from.
    #[arg(long, default_value_t = 0)]
    channel: u8,

    /// Number of back-to-back runs.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub runs: usize,
}

impl BenchArgs {
    pub fn params(&self) -> color_eyre::Result<BenchParams> {
        if !(self.duration > 0.0) {
            return Err(eyre!("duration must be positive, but got {}", self.duration));
        }
        if self.batch_size == 0 || self.frames == 0 {
            return Err(eyre!("batch size and frame count must both be nonzero"));
        }
        let window = ValidityWindow::from_amplitudes(self.min_amp, self.max_amp)
            .wrap_err("Invalid amplitude window")?;
        Ok(BenchParams {
            duration: Duration::from_secs_f64(self.duration),
            read_timeout: Duration::from_millis(self.timeout_ms),
            probe_interval: Duration::from_millis(self.probe_ms),
            batch_size: self.batch_size,
            frame_multiplier: self.frames,
            window,
        })
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channel: self.channel,
            direction: Direction::Rx,
            format: self.format.into(),
            link_format: self.format.into(),
            performance_latency: self.latency,
        }
    }
}

/// Test tone generation settings.
#[derive(Args, Debug)]
pub struct ToneArgs {
    /// Reference clock in Hz
    #[arg(short, long = "ref-clk", default_value_t = 30.72e6)]
    ref_clk: f64,

    /// Clock generator (CGEN) frequency in Hz
    #[arg(short = 'g', long, default_value_t = 640e6)]
    cgen: f64,

    /// Decimation stage, 0-4. Each step halves the sample rate.
    #[arg(short = 'i', long, default_value_t = 0)]
    decimation: u8,

    /// Test tone amplitude
    #[arg(long, default_value_t = 2000)]
    amplitude: i16,

    /// Device profile to use instead of the clock settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ToneArgs {
    /// Put the device into test-tone mode, returning the receive sample rate.
    pub fn configure(&self, dev: &mut impl DeviceConfigurator) -> color_eyre::Result<f64> {
        if let Some(path) = self.config.as_ref() {
            return dev
                .load_profile(path)
                .wrap_err_with(|| format!("Failed loading profile {}", path.display()));
        }
        let params = ToneParams {
            reference_clock_hz: self.ref_clk,
            cgen_freq_hz: self.cgen,
            decimation: self.decimation,
            tone_amplitude: self.amplitude,
        };
        dev.prepare_test_tone(&params)
            .wrap_err("Failed setting up test tone")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        bench: BenchArgs,
        #[command(flatten)]
        tone: ToneArgs,
    }

    #[test]
    fn defaults_match_library() {
        let cli = TestCli::try_parse_from(["test"]).unwrap();
        assert_eq!(cli.bench.params().unwrap(), BenchParams::default());
        let config = cli.bench.stream_config();
        assert_eq!(config.format, StreamConfig::default().format);
        assert_eq!(cli.bench.runs, 1);
        assert_eq!(cli.tone.cgen, ToneParams::default().cgen_freq_hz);
    }

    #[test]
    fn rejects_bad_window() {
        let cli = TestCli::try_parse_from(["test", "--min-amp", "2200"]).unwrap();
        assert!(cli.bench.params().is_err());
        let cli = TestCli::try_parse_from(["test", "--duration", "0"]).unwrap();
        assert!(cli.bench.params().is_err());
    }

    #[test]
    fn custom_settings() {
        let cli = TestCli::try_parse_from([
            "test", "-t", "2.5", "--format", "i16", "--probe", "500", "-i", "2",
        ])
        .unwrap();
        let params = cli.bench.params().unwrap();
        assert_eq!(params.duration, Duration::from_millis(2500));
        assert_eq!(params.probe_interval, Duration::from_millis(500));
        assert_eq!(cli.bench.stream_config().link_format, SampleFormat::I16);
        assert_eq!(cli.tone.decimation, 2);
    }
}
