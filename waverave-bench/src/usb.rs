//! A generic USB bulk-in transport.
//!
//! This streams frames from a bulk IN endpoint, using the [`nusb`] queue
//! interface with a fixed number of transfers kept in flight. The device is
//! expected to already be in test-tone mode, set up through whatever means
//! the device needs. Optionally, a vendor control request can be used to tell
//! the device to start and stop streaming, with `wValue` set to 1 for start
//! and 0 for stop.
//!
//! ```no_run
//! # use anyhow::Result;
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! use waverave_bench::usb::{UsbOptions, list_usb_devices};
//!
//! let devices = list_usb_devices(0x1d50, 0x6108)?;
//! let transport = devices
//!     .into_iter()
//!     .next()
//!     .ok_or_else(|| anyhow::anyhow!("No devices found"))?
//!     .open(UsbOptions::default())?;
//! println!("Connected to: {}", transport.description());
//! # Ok(())
//! # }
//! ```

use std::{sync::mpsc, time::Duration};

use nusb::transfer::{ControlOut, ControlType, Queue, Recipient, RequestBuffer};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{FRAME_SIZE, FrameDecoder};
use crate::{
    ComplexI16, Direction, Error, Metadata, StreamChannel, StreamConfig, StreamInfo, Transport,
};

/// Largest single transfer, in frames.
const MAX_TRANSFER_FRAMES: usize = 16;
/// Amount of data to keep queued up, in bytes.
const QUEUED_BYTES: usize = 1 << 20;

/// Options for opening a USB device as a stream transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbOptions {
    /// Interface number to claim.
    pub interface: u8,
    /// Bulk IN endpoint address to stream from.
    pub endpoint: u8,
    /// Vendor request used to start and stop streaming, if the device needs
    /// one.
    pub control_request: Option<u8>,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            interface: 0,
            endpoint: 0x81,
            control_request: None,
        }
    }
}

/// A USB device descriptor, which can be opened.
///
/// These are returned from calling [`list_usb_devices`].
pub struct UsbDescriptor {
    info: nusb::DeviceInfo,
}

impl UsbDescriptor {
    /// Get the serial number of this device, as a string.
    pub fn serial(&self) -> Option<&str> {
        self.info.serial_number()
    }

    /// A human-readable description of the device.
    pub fn description(&self) -> String {
        describe(&self.info)
    }

    /// Try and open this device.
    pub fn open(self, options: UsbOptions) -> Result<UsbTransport, std::io::Error> {
        let description = describe(&self.info);
        let device = self.info.open()?;
        let interface = device.detach_and_claim_interface(options.interface)?;
        Ok(UsbTransport {
            interface,
            options,
            description,
            stream_open: false,
        })
    }
}

fn describe(info: &nusb::DeviceInfo) -> String {
    let product = info.product_string().unwrap_or("Unknown device");
    let manufacturer = info.manufacturer_string().unwrap_or("unknown vendor");
    match info.serial_number() {
        Some(serial) => format!(
            "{product} ({manufacturer}, {:04x}:{:04x}, serial {serial})",
            info.vendor_id(),
            info.product_id()
        ),
        None => format!(
            "{product} ({manufacturer}, {:04x}:{:04x})",
            info.vendor_id(),
            info.product_id()
        ),
    }
}

/// List all attached USB devices with a matching vendor & product ID.
pub fn list_usb_devices(vid: u16, pid: u16) -> Result<Vec<UsbDescriptor>, std::io::Error> {
    Ok(nusb::list_devices()?
        .filter(|d| d.vendor_id() == vid && d.product_id() == pid)
        .map(|d| UsbDescriptor { info: d })
        .collect::<Vec<UsbDescriptor>>())
}

/// An open USB device, used as a stream transport.
pub struct UsbTransport {
    interface: nusb::Interface,
    options: UsbOptions,
    description: String,
    stream_open: bool,
}

impl UsbTransport {
    /// A human-readable description of the device.
    pub fn description(&self) -> &str {
        &self.description
    }

    async fn stream_request(&self, start: bool) -> Result<(), Error> {
        let Some(request) = self.options.control_request else {
            return Ok(());
        };
        Ok(self
            .interface
            .control_out(ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request,
                value: start as u16,
                index: 0,
                data: &[],
            })
            .await
            .status?)
    }
}

/// Pick the transfer size and queue depth for a latency hint.
///
/// Returns `(transfer_size, depth)`, with the transfer size in bytes.
fn transfer_params(performance_latency: f32) -> (usize, usize) {
    let latency = performance_latency.clamp(0.0, 1.0);
    let frames = 1 + ((MAX_TRANSFER_FRAMES - 1) as f32 * latency).round() as usize;
    let size = frames * FRAME_SIZE;
    let depth = (QUEUED_BYTES / size).max(4);
    (size, depth)
}

impl Transport for UsbTransport {
    type Stream = UsbStream;

    async fn setup_stream(&mut self, config: &StreamConfig) -> Result<UsbStream, Error> {
        if config.direction != Direction::Rx {
            return Err(Error::InvalidParameter(
                "USB transport only supports receive streams",
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
        let (transfer_size, depth) = transfer_params(config.performance_latency);
        debug!(
            "USB stream: {} byte transfers, {} deep, endpoint 0x{:02x}",
            transfer_size, depth, self.options.endpoint
        );
        let (buf_pool_send, buf_pool) = mpsc::channel();
        self.stream_open = true;
        Ok(UsbStream {
            queue: self.interface.bulk_in_queue(self.options.endpoint),
            buf_pool,
            buf_pool_send,
            transfer_size,
            depth,
            decoder: FrameDecoder::new(config.link_format),
            running: false,
            probe_bytes: 0,
            last_probe: Instant::now(),
        })
    }

    async fn control_stream(&mut self, stream: &mut UsbStream, start: bool) -> Result<(), Error> {
        if start {
            self.stream_request(true).await?;
            while stream.queue.pending() < stream.depth {
                stream.submit();
            }
            stream.running = true;
            stream.last_probe = Instant::now();
            stream.probe_bytes = 0;
            Ok(())
        } else {
            if !stream.running {
                return Err(Error::NotStreaming);
            }
            stream.running = false;
            // Stop the device first so no new data gets dropped halfway.
            let res = self.stream_request(false).await;
            stream.cancel_all().await;
            res
        }
    }

    async fn close_stream(&mut self, mut stream: UsbStream) -> Result<(), Error> {
        if stream.queue.pending() > 0 {
            stream.cancel_all().await;
        }
        self.stream_open = false;
        Ok(())
    }
}

/// A receive stream on a [`UsbTransport`].
pub struct UsbStream {
    queue: Queue<RequestBuffer>,
    buf_pool: mpsc::Receiver<Vec<u8>>,
    buf_pool_send: mpsc::Sender<Vec<u8>>,
    transfer_size: usize,
    depth: usize,
    decoder: FrameDecoder,
    running: bool,
    probe_bytes: u64,
    last_probe: Instant,
}

impl UsbStream {
    /// Get the chosen transfer size, in bytes.
    pub fn transfer_size(&self) -> usize {
        self.transfer_size
    }

    /// Get the number of pending requests.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    fn submit(&mut self) {
        let req = if let Ok(buf) = self.buf_pool.try_recv() {
            RequestBuffer::reuse(buf, self.transfer_size)
        } else {
            RequestBuffer::new(self.transfer_size)
        };
        self.queue.submit(req);
    }

    /// Cancel all transfers and wait for them to finish. Transfer errors are
    /// ignored.
    async fn cancel_all(&mut self) {
        self.queue.cancel_all();
        while self.queue.pending() > 0 {
            let done = self.queue.next_complete().await;
            let _ = self.buf_pool_send.send(done.data);
        }
    }
}

impl StreamChannel for UsbStream {
    async fn read(
        &mut self,
        buf: &mut [ComplexI16],
        meta: &mut Metadata,
        timeout: Duration,
    ) -> Result<usize, Error> {
        if !self.running {
            return Err(Error::NotStreaming);
        }
        if self.decoder.pending() > 0 {
            return Ok(self.decoder.drain_into(buf, meta));
        }

        // next_complete is cancel-safe, so a timeout doesn't lose data.
        let Ok(done) = tokio::time::timeout(timeout, self.queue.next_complete()).await else {
            trace!("USB read timed out");
            return Ok(0);
        };
        let result = match done.status {
            Ok(()) => {
                self.probe_bytes += done.data.len() as u64;
                self.decoder.push_frames(&done.data)
            }
            Err(e) => Err(e.into()),
        };
        // Reuse the buffer and keep the queue full, even in the event of an
        // error.
        let _ = self.buf_pool_send.send(done.data);
        self.submit();
        if let Err(e) = result {
            warn!("USB receive error: {}", e);
            return Err(e);
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
            overruns: 0,
            dropped_frames: self.decoder.dropped_frames(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_sizing() {
        assert_eq!(transfer_params(0.0), (FRAME_SIZE, 256));
        assert_eq!(transfer_params(1.0), (16 * FRAME_SIZE, 16));
        assert_eq!(transfer_params(7.0), transfer_params(1.0));
        let (size, depth) = transfer_params(0.5);
        assert_eq!(size, 9 * FRAME_SIZE);
        assert_eq!(depth, (1 << 20) / size);
    }

    #[test]
    fn default_options() {
        let opts = UsbOptions::default();
        assert_eq!(opts.endpoint, 0x81);
        assert_eq!(opts.control_request, None);
    }
}
