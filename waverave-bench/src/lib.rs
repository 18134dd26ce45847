/*!

A streaming link benchmark for SDR-style devices. It measures the sustained
throughput of the data link between host and device, while checking that
every received sample belongs to a known test tone.

The device is first put into a test-tone mode with a [`DeviceConfigurator`],
so that every sample it sends should have the same amplitude. The benchmark
engine then opens a receive stream on a [`Transport`], reads from it as fast
as the link allows for a fixed duration, validates each batch against a
[`ValidityWindow`], and periodically samples the link rate. Any sample out of
the window means the transport dropped or corrupted data, and ends the run
early.

Two transports are provided:

- [`sim::SimDevice`] - A simulated device generating a test tone at the
  configured sample rate, with optional fault injection.
- [`usb::UsbTransport`] - A generic USB bulk-in stream, for a device that has
  already been put into test-tone mode.

Running a benchmark against the simulated device looks like this:

```no_run
use std::time::Duration;

use anyhow::Result;
use waverave_bench::{DeviceConfigurator, StreamConfig, ToneParams, ValidityWindow};

#[tokio::main]
async fn main() -> Result<()> {
    let mut device = waverave_bench::sim::SimDevice::new();
    let rate = device.prepare_test_tone(&ToneParams::default())?;
    println!("Rx sample rate: {} MHz", rate / 1e6);

    let result = waverave_bench::run_benchmark(
        &mut device,
        &StreamConfig::default(),
        ValidityWindow::default(),
        Duration::from_secs(10),
    )
    .await?;

    println!("{}", result.termination);
    match result.summary.mean() {
        Some(rate) => println!("Average Rx transfer speed: {} MB/s", rate / 1e6),
        None => println!("No rate samples collected"),
    }
    Ok(())
}
```

*/

#![warn(missing_docs)]

mod bench;
pub mod codec;
mod error;
mod rate;
pub mod sim;
mod stream;
pub mod usb;
mod validate;

use std::sync::mpsc;

pub use crate::bench::{BenchParams, Benchmark, Event, RunResult, Termination, run_benchmark};
pub use crate::error::{BenchError, Error};
pub use crate::rate::{RateAggregator, RateObservation, RateSummary, aggregate};
pub use crate::stream::{
    DeviceConfigurator, Direction, Metadata, SampleFormat, StreamChannel, StreamConfig,
    StreamInfo, ToneParams, Transport,
};
pub use crate::validate::{ValidityWindow, Verdict, amplitude_sq, validate};

/// Complex 16-bit signed sample. `re` is the in-phase component, `im` the
/// quadrature component.
pub type ComplexI16 = num_complex::Complex<i16>;

/// A fixed-capacity buffer of samples, reused across reads.
///
/// The whole capacity is handed to each read with
/// [`read_target`][SampleBuffer::read_target], and the number of samples
/// actually filled in is recorded with [`set_len`][SampleBuffer::set_len].
///
/// When dropped, this buffer returns its allocation to the [`BufferPool`] it
/// came from.
pub struct SampleBuffer {
    buf: Vec<ComplexI16>,
    len: usize,
    pool: mpsc::Sender<Vec<ComplexI16>>,
}

impl SampleBuffer {
    /// Get how many samples this buffer can hold.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid samples in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no valid samples in the buffer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the buffer as empty.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Get the full capacity of the buffer to read into. This also clears the
    /// buffer.
    pub fn read_target(&mut self) -> &mut [ComplexI16] {
        self.len = 0;
        &mut self.buf
    }

    /// Set how many samples are valid, after a read.
    ///
    /// # Panics
    /// - If `len` is larger than the buffer's capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.buf.len());
        self.len = len;
    }

    /// Get the valid samples in the buffer.
    pub fn samples(&self) -> &[ComplexI16] {
        &self.buf[..self.len]
    }
}

impl Drop for SampleBuffer {
    fn drop(&mut self) {
        let inner = core::mem::take(&mut self.buf);
        if inner.capacity() > 0 {
            let _ = self.pool.send(inner);
        }
    }
}

/// A pool of sample buffer allocations.
///
/// Buffers handed out by [`get`][BufferPool::get] come back to the pool when
/// they're dropped, and are reused by later calls asking for the same
/// capacity.
pub struct BufferPool {
    free: Vec<Vec<ComplexI16>>,
    returned: mpsc::Receiver<Vec<ComplexI16>>,
    returned_send: mpsc::Sender<Vec<ComplexI16>>,
    allocations: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Make an empty pool.
    pub fn new() -> Self {
        let (returned_send, returned) = mpsc::channel();
        Self {
            free: Vec::new(),
            returned,
            returned_send,
            allocations: 0,
        }
    }

    fn reclaim(&mut self) {
        self.free.extend(self.returned.try_iter());
    }

    /// Get a buffer holding `capacity` samples, reusing a returned allocation
    /// if one of the right size is available.
    pub fn get(&mut self, capacity: usize) -> SampleBuffer {
        self.reclaim();
        let buf = match self.free.iter().position(|b| b.len() == capacity) {
            Some(pos) => self.free.swap_remove(pos),
            None => {
                self.allocations += 1;
                vec![ComplexI16::new(0, 0); capacity]
            }
        };
        SampleBuffer {
            buf,
            len: 0,
            pool: self.returned_send.clone(),
        }
    }

    /// Number of buffers currently sitting in the pool.
    pub fn available(&mut self) -> usize {
        self.reclaim();
        self.free.len()
    }

    /// Total number of buffers this pool has ever allocated.
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}
