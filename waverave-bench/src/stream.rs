//! Stream configuration and the transport traits the benchmark runs against.
//!
//! A [`Transport`] is an open connection to a device. It can set up a single
//! receive stream at a time, which is handed back as the transport's
//! associated [`StreamChannel`] type. That value is the ownership token for
//! the stream: it is started and stopped through the transport, read from
//! directly, and finally consumed by [`Transport::close_stream`].

use std::time::Duration;

use crate::{ComplexI16, Error};

/// Direction of a stream, relative to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    Rx,
    /// Host to device.
    Tx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rx => f.write_str("Rx"),
            Self::Tx => f.write_str("Tx"),
        }
    }
}

/// Sample packing, either on the host side or on the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Each of I and Q as a little-endian 16-bit integer. 4 bytes per sample.
    I16,
    /// Each of I and Q as a 12-bit integer, two of them packed into 3 bytes.
    #[default]
    I12Compressed,
}

impl SampleFormat {
    /// Number of link bytes that make up one complex sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::I16 => 4,
            Self::I12Compressed => 3,
        }
    }

    /// Largest magnitude a single I or Q component can take on.
    pub fn max_component(self) -> i16 {
        match self {
            Self::I16 => i16::MAX,
            Self::I12Compressed => 2047,
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I16 => f.write_str("16-bit"),
            Self::I12Compressed => f.write_str("12-bit compressed"),
        }
    }
}

/// Parameters for setting up a stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Channel on the device to stream from.
    pub channel: u8,
    /// Stream direction. The benchmark only supports [`Direction::Rx`].
    pub direction: Direction,
    /// Sample format handed to the host.
    pub format: SampleFormat,
    /// Sample format used on the wire.
    pub link_format: SampleFormat,
    /// Buffering hint, from 0.0 (lowest latency, smallest transfers) to 1.0
    /// (highest throughput, largest transfers).
    pub performance_latency: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            direction: Direction::Rx,
            format: SampleFormat::I12Compressed,
            link_format: SampleFormat::I12Compressed,
            performance_latency: 1.0,
        }
    }
}

/// Auxiliary data returned alongside a read.
///
/// Taken from the header of the most recently decoded frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Device sample counter at the start of the frame.
    pub timestamp: u64,
    /// Raw header flag bits.
    pub flags: u64,
}

/// A snapshot of stream statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamInfo {
    /// Achieved link throughput since the last call to
    /// [`StreamChannel::info`], in bytes per second.
    pub link_rate: f64,
    /// Number of times the host failed to keep up and data was discarded.
    pub overruns: u64,
    /// Number of frames that arrived with a gap in their sample counter.
    pub dropped_frames: u64,
}

/// An open stream on a [`Transport`].
#[allow(async_fn_in_trait)]
pub trait StreamChannel {
    /// Read up to `buf.len()` samples into `buf`, waiting no longer than
    /// `timeout` for data to show up.
    ///
    /// Returns the number of samples written, which is 0 on a timeout.
    async fn read(
        &mut self,
        buf: &mut [ComplexI16],
        meta: &mut Metadata,
        timeout: Duration,
    ) -> Result<usize, Error>;

    /// Get stream statistics. This resets the link rate measurement window.
    fn info(&mut self) -> StreamInfo;
}

/// An open connection to a streaming device.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// The stream handle type for this transport.
    type Stream: StreamChannel;

    /// Open a stream with the given configuration. It doesn't start moving
    /// data until [`control_stream`][Self::control_stream] is called.
    async fn setup_stream(&mut self, config: &StreamConfig) -> Result<Self::Stream, Error>;

    /// Start (`true`) or stop (`false`) a stream.
    async fn control_stream(&mut self, stream: &mut Self::Stream, start: bool)
    -> Result<(), Error>;

    /// Close a stream, releasing everything associated with it.
    async fn close_stream(&mut self, stream: Self::Stream) -> Result<(), Error>;
}

/// A device that can be put into test-tone generation mode.
///
/// Configuration errors are not recoverable; callers report them and give up.
pub trait DeviceConfigurator {
    /// Program the device to emit a constant-amplitude test tone, returning
    /// the effective receive sample rate in Hz.
    fn prepare_test_tone(&mut self, params: &ToneParams) -> Result<f64, Error>;

    /// Load a named configuration profile from a file instead of using
    /// [`prepare_test_tone`][Self::prepare_test_tone]. Returns the effective
    /// receive sample rate in Hz.
    fn load_profile(&mut self, path: &std::path::Path) -> Result<f64, Error>;

    /// Get the currently configured sample rate for a channel, in Hz.
    fn sample_rate(&self, direction: Direction, channel: u8) -> Result<f64, Error>;
}

/// Clocking and signal settings for test-tone mode.
#[derive(Clone, Debug, PartialEq)]
pub struct ToneParams {
    /// Reference clock frequency, in Hz.
    pub reference_clock_hz: f64,
    /// Clock generator frequency, in Hz. The digital front-end runs at a
    /// quarter of this.
    pub cgen_freq_hz: f64,
    /// Decimation (receive) and interpolation (transmit) stage, as a power of
    /// two beyond the fixed divide-by-two. 0-4.
    pub decimation: u8,
    /// Linear amplitude of each test tone sample.
    pub tone_amplitude: i16,
}

impl Default for ToneParams {
    fn default() -> Self {
        Self {
            reference_clock_hz: 30.72e6,
            cgen_freq_hz: 640e6,
            decimation: 0,
            tone_amplitude: 2000,
        }
    }
}

impl ToneParams {
    /// The interface sample rate these settings produce, in Hz.
    pub fn interface_rate(&self) -> Result<f64, Error> {
        if self.decimation > 4 {
            return Err(Error::ValueRange {
                range: 0..5,
                val: self.decimation as u64,
            });
        }
        if !(self.cgen_freq_hz > 0.0) || !(self.reference_clock_hz > 0.0) {
            return Err(Error::InvalidParameter("clock frequencies must be positive"));
        }
        Ok(self.cgen_freq_hz / 4.0 / (2u32 << self.decimation) as f64)
    }

    /// Parse a device profile.
    ///
    /// A profile is a list of `key = value` lines, with `#` starting a
    /// comment. Recognized keys are the field names of this struct. Any key
    /// not given keeps its default value.
    pub fn parse_profile(text: &str) -> Result<Self, Error> {
        let mut params = Self::default();
        for (n, line) in text.lines().enumerate() {
            let line_no = n + 1;
            let line = line.split_once('#').map_or(line, |(l, _)| l).trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Profile {
                    line: line_no,
                    reason: "expected `key = value`",
                });
            };
            let value = value.trim();
            let bad_value = Error::Profile {
                line: line_no,
                reason: "value isn't a valid number",
            };
            match key.trim() {
                "reference_clock_hz" => {
                    params.reference_clock_hz = value.parse().map_err(|_| bad_value)?
                }
                "cgen_freq_hz" => params.cgen_freq_hz = value.parse().map_err(|_| bad_value)?,
                "decimation" => params.decimation = value.parse().map_err(|_| bad_value)?,
                "tone_amplitude" => {
                    params.tone_amplitude = value.parse().map_err(|_| bad_value)?
                }
                _ => {
                    return Err(Error::Profile {
                        line: line_no,
                        reason: "unknown key",
                    });
                }
            }
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_rate() {
        let params = ToneParams::default();
        assert_eq!(params.interface_rate().unwrap(), 80e6);
        let params = ToneParams {
            decimation: 2,
            ..Default::default()
        };
        assert_eq!(params.interface_rate().unwrap(), 20e6);
        let params = ToneParams {
            decimation: 5,
            ..Default::default()
        };
        assert!(matches!(
            params.interface_rate(),
            Err(Error::ValueRange { val: 5, .. })
        ));
    }

    #[test]
    fn profile_parsing() {
        let params = ToneParams::parse_profile(
            "# tone profile\n\
             reference_clock_hz = 40e6\n\
             \n\
             decimation=3   # 10 MS/s\n\
             tone_amplitude = 1500\n",
        )
        .unwrap();
        assert_eq!(params.reference_clock_hz, 40e6);
        assert_eq!(params.cgen_freq_hz, 640e6);
        assert_eq!(params.decimation, 3);
        assert_eq!(params.tone_amplitude, 1500);
        assert_eq!(params.interface_rate().unwrap(), 10e6);
    }

    #[test]
    fn profile_errors() {
        assert!(matches!(
            ToneParams::parse_profile("decimation = 1\nbogus"),
            Err(Error::Profile { line: 2, .. })
        ));
        assert!(matches!(
            ToneParams::parse_profile("color = blue"),
            Err(Error::Profile {
                line: 1,
                reason: "unknown key"
            })
        ));
        assert!(matches!(
            ToneParams::parse_profile("decimation = -1"),
            Err(Error::Profile { line: 1, .. })
        ));
    }
}
