//! A simulated test-tone device.
//!
//! [`SimDevice`] behaves like a device in test-tone mode attached over a
//! perfect link: once a stream is started, frames of tone samples become
//! available at the configured sample rate, and reads return as soon as
//! enough frames have "arrived" to fill the read buffer. If the reader falls
//! too far behind, the oldest frames are discarded and counted as an
//! overrun, the same as a hardware FIFO overflowing.
//!
//! Faults can be injected to check that a benchmark reacts to them:
//!
//! - [`FaultKind::Zeros`] - Frames after the fault time carry all-zero
//!   samples, as if the transport were delivering empty buffers.
//! - [`FaultKind::Stall`] - No more frames arrive after the fault time.
//!
//! ```no_run
//! # use anyhow::Result;
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! use std::time::Duration;
//! use waverave_bench::sim::{Fault, FaultKind, SimDevice};
//! use waverave_bench::{DeviceConfigurator, ToneParams};
//!
//! let mut device = SimDevice::new().with_fault(Fault {
//!     after: Duration::from_secs(3),
//!     kind: FaultKind::Zeros,
//! });
//! device.prepare_test_tone(&ToneParams::default())?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::{self, FRAME_SIZE, FrameDecoder, FrameHeader};
use crate::{
    ComplexI16, DeviceConfigurator, Direction, Error, Metadata, SampleFormat, StreamChannel,
    StreamConfig, StreamInfo, ToneParams, Transport,
};

/// Frames the simulated device buffers before it starts dropping them, at
/// the lowest latency setting.
const MIN_FIFO_FRAMES: u64 = 16;
/// Frames the simulated device buffers at the highest latency setting.
const MAX_FIFO_FRAMES: u64 = 256;
/// Test tone period, in samples.
const TONE_PERIOD: usize = 8;

/// What goes wrong when a [`Fault`] triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Send all-zero samples.
    Zeros,
    /// Stop sending frames.
    Stall,
}

/// A fault to inject into simulated streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Time after stream start at which the fault begins.
    pub after: Duration,
    /// What the fault does.
    pub kind: FaultKind,
}

/// A simulated device in test-tone mode.
#[derive(Debug, Default)]
pub struct SimDevice {
    rx_rate: Option<f64>,
    tx_rate: Option<f64>,
    amplitude: i16,
    fault: Option<Fault>,
    stream_open: bool,
}

impl SimDevice {
    /// Make a new, unconfigured device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a fault into every stream opened on this device.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// A human-readable description of the device.
    pub fn description(&self) -> String {
        String::from("Simulated test-tone device")
    }
}

impl DeviceConfigurator for SimDevice {
    fn prepare_test_tone(&mut self, params: &ToneParams) -> Result<f64, Error> {
        let rate = params.interface_rate()?;
        if params.tone_amplitude <= 0 {
            return Err(Error::InvalidParameter("tone amplitude must be positive"));
        }
        debug!(
            "Simulated test tone: amplitude {}, ref clock {} Hz, interface rate {} Hz",
            params.tone_amplitude, params.reference_clock_hz, rate
        );
        self.rx_rate = Some(rate);
        self.tx_rate = Some(rate);
        self.amplitude = params.tone_amplitude;
        Ok(rate)
    }

    fn load_profile(&mut self, path: &std::path::Path) -> Result<f64, Error> {
        let text = std::fs::read_to_string(path)?;
        let params = ToneParams::parse_profile(&text)?;
        self.prepare_test_tone(&params)
    }

    fn sample_rate(&self, direction: Direction, channel: u8) -> Result<f64, Error> {
        if channel != 0 {
            return Err(Error::ValueRange {
                range: 0..1,
                val: channel as u64,
            });
        }
        let rate = match direction {
            Direction::Rx => self.rx_rate,
            Direction::Tx => self.tx_rate,
        };
        rate.ok_or(Error::InvalidParameter("device hasn't been configured"))
    }
}

impl Transport for SimDevice {
    type Stream = SimStream;

    async fn setup_stream(&mut self, config: &StreamConfig) -> Result<SimStream, Error> {
        let rate = self
            .rx_rate
            .ok_or(Error::InvalidParameter("device hasn't been configured"))?;
        if config.direction != Direction::Rx {
            return Err(Error::InvalidParameter(
                "simulated device can only stream receive data",
            ));
        }
        if config.channel != 0 {
            return Err(Error::ValueRange {
                range: 0..1,
                val: config.channel as u64,
            });
        }
        if self.stream_open {
            return Err(Error::Busy);
        }
        if self.amplitude > config.link_format.max_component() {
            return Err(Error::InvalidParameter(
                "tone amplitude doesn't fit the link sample format",
            ));
        }
        let latency = config.performance_latency.clamp(0.0, 1.0) as f64;
        let fifo_frames = MIN_FIFO_FRAMES
            + ((MAX_FIFO_FRAMES - MIN_FIFO_FRAMES) as f64 * latency).round() as u64;
        self.stream_open = true;
        Ok(SimStream::new(
            config.link_format,
            rate,
            self.amplitude,
            fifo_frames,
            self.fault,
        ))
    }

    async fn control_stream(&mut self, stream: &mut SimStream, start: bool) -> Result<(), Error> {
        if start {
            stream.start();
            Ok(())
        } else if stream.started.take().is_some() {
            Ok(())
        } else {
            Err(Error::NotStreaming)
        }
    }

    async fn close_stream(&mut self, stream: SimStream) -> Result<(), Error> {
        trace!(
            "Closing simulated stream after {} frames, {} overruns",
            stream.frames_sent, stream.overruns
        );
        self.stream_open = false;
        Ok(())
    }
}

/// A stream on a [`SimDevice`].
#[derive(Debug)]
pub struct SimStream {
    format: SampleFormat,
    rate: f64,
    per_frame: usize,
    fifo_frames: u64,
    fault: Option<Fault>,
    tone: [ComplexI16; TONE_PERIOD],
    zeros: Vec<ComplexI16>,
    frame: Vec<ComplexI16>,
    started: Option<Instant>,
    frames_sent: u64,
    overruns: u64,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
    probe_bytes: u64,
    last_probe: Instant,
}

impl SimStream {
    fn new(
        format: SampleFormat,
        rate: f64,
        amplitude: i16,
        fifo_frames: u64,
        fault: Option<Fault>,
    ) -> Self {
        let per_frame = codec::samples_per_frame(format);
        let amp = amplitude as f64;
        let tone: [ComplexI16; TONE_PERIOD] = core::array::from_fn(|k| {
            let phase = core::f64::consts::TAU * k as f64 / TONE_PERIOD as f64;
            ComplexI16::new(
                (amp * phase.cos()).round() as i16,
                (amp * phase.sin()).round() as i16,
            )
        });
        let frame = (0..per_frame).map(|i| tone[i % TONE_PERIOD]).collect();
        Self {
            format,
            rate,
            per_frame,
            fifo_frames,
            fault,
            tone,
            zeros: vec![ComplexI16::new(0, 0); per_frame],
            frame,
            started: None,
            frames_sent: 0,
            overruns: 0,
            decoder: FrameDecoder::new(format),
            scratch: Vec::new(),
            probe_bytes: 0,
            last_probe: Instant::now(),
        }
    }

    /// The samples of one period of the test tone.
    pub fn tone(&self) -> &[ComplexI16] {
        &self.tone
    }

    /// Returns true if the stream has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    fn start(&mut self) {
        let now = Instant::now();
        self.started = Some(now);
        self.last_probe = now;
        self.probe_bytes = 0;
    }

    fn fault_active(&self, start: Instant, now: Instant, kind: FaultKind) -> bool {
        self.fault
            .is_some_and(|f| f.kind == kind && now.duration_since(start) >= f.after)
    }

    /// Total frames the device has produced since starting.
    fn frames_produced(&self, start: Instant, now: Instant) -> u64 {
        let mut elapsed = now.duration_since(start);
        if let Some(f) = self.fault {
            if f.kind == FaultKind::Stall {
                elapsed = elapsed.min(f.after);
            }
        }
        (elapsed.as_secs_f64() * self.rate / self.per_frame as f64) as u64
    }

    /// When the device will have produced `frames` frames in total.
    fn frame_time(&self, start: Instant, frames: u64) -> Instant {
        start + Duration::from_secs_f64(frames as f64 * self.per_frame as f64 / self.rate)
    }

    fn generate(&mut self, start: Instant, now: Instant, frames: u64) {
        let zeros = self.fault_active(start, now, FaultKind::Zeros);
        self.scratch.clear();
        for _ in 0..frames {
            let header = FrameHeader {
                flags: 0,
                counter: self.frames_sent * self.per_frame as u64,
            };
            let samples = if zeros { &self.zeros } else { &self.frame };
            codec::encode_frame(self.format, header, samples, &mut self.scratch);
            self.frames_sent += 1;
        }
        self.probe_bytes += (frames as usize * FRAME_SIZE) as u64;
    }
}

impl StreamChannel for SimStream {
    async fn read(
        &mut self,
        buf: &mut [ComplexI16],
        meta: &mut Metadata,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let Some(start) = self.started else {
            return Err(Error::NotStreaming);
        };
        if self.decoder.pending() >= buf.len() {
            return Ok(self.decoder.drain_into(buf, meta));
        }

        let missing = buf.len() - self.decoder.pending();
        let wanted = missing.div_ceil(self.per_frame) as u64;
        let deadline = Instant::now() + timeout;
        let mut now = Instant::now();
        let backlog = loop {
            let backlog = self
                .frames_produced(start, now)
                .saturating_sub(self.frames_sent);
            if backlog >= wanted || now >= deadline {
                break backlog;
            }
            let wake = if self.fault_active(start, now, FaultKind::Stall) {
                deadline
            } else {
                self.frame_time(start, self.frames_sent + wanted)
                    .max(now + Duration::from_micros(1))
                    .min(deadline)
            };
            tokio::time::sleep_until(wake).await;
            now = Instant::now();
        };

        let mut backlog = backlog;
        if backlog > self.fifo_frames {
            // Frames that overflowed the FIFO are gone for good.
            let lost = backlog - self.fifo_frames;
            self.frames_sent += lost;
            self.overruns += 1;
            backlog -= lost;
            trace!("Simulated FIFO overrun, {} frames lost", lost);
        }
        let frames = backlog.min(wanted);
        if frames > 0 {
            self.generate(start, now, frames);
            self.decoder.push_frames(&self.scratch)?;
        }
        Ok(self.decoder.drain_into(buf, meta))
    }

    fn info(&mut self) -> StreamInfo {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_probe).as_secs_f64();
        let link_rate = if elapsed > 0.0 {
            self.probe_bytes as f64 / elapsed
        } else {
            0.0
        };
        self.last_probe = now;
        self.probe_bytes = 0;
        StreamInfo {
            link_rate,
            overruns: self.overruns,
            dropped_frames: self.decoder.dropped_frames(),
        }
    }
}
