use std::num::ParseIntError;

use clap::Args;
use color_eyre::eyre::{Context, eyre};
use tokio_util::sync::CancellationToken;
use waverave_bench::usb::{UsbOptions, list_usb_devices};

use crate::config::BenchArgs;
use crate::report::print_sample_rates;

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_hex_u16(s: &str) -> Result<u16, ParseIntError> {
    u16::from_str_radix(strip_hex(s), 16)
}

fn parse_hex_u8(s: &str) -> Result<u8, ParseIntError> {
    u8::from_str_radix(strip_hex(s), 16)
}

#[derive(Args, Debug)]
pub struct Cmd {
    #[command(flatten)]
    bench: BenchArgs,

    /// USB vendor ID, in hex
    #[arg(long, value_parser = parse_hex_u16, default_value = "1d50")]
    vid: u16,

    /// USB product ID, in hex
    #[arg(long, value_parser = parse_hex_u16, default_value = "6108")]
    pid: u16,

    /// Index of the device to open, if more than one matches
    #[arg(short, long)]
    device: Option<usize>,

    /// Interface number to claim
    #[arg(long, default_value_t = 0)]
    interface: u8,

    /// Bulk IN endpoint address, in hex
    #[arg(long, value_parser = parse_hex_u8, default_value = "81")]
    endpoint: u8,

    /// Vendor request used to start & stop streaming, in hex
    #[arg(long, value_parser = parse_hex_u8)]
    control_request: Option<u8>,

    /// Receive sample rate the device was set up with, in Hz. Display only.
    #[arg(long)]
    sample_rate: Option<f64>,
}

impl Cmd {
    fn options(&self) -> UsbOptions {
        UsbOptions {
            interface: self.interface,
            endpoint: self.endpoint,
            control_request: self.control_request,
        }
    }

    pub async fn cmd(self, cancel: &CancellationToken) -> color_eyre::Result<bool> {
        let devices =
            list_usb_devices(self.vid, self.pid).wrap_err("Couldn't list USB devices")?;
        let count = devices.len();
        if count == 0 {
            println!("No devices found");
            return Ok(false);
        }
        let index = match self.device {
            Some(i) => i,
            None if count == 1 => 0,
            None => {
                println!("Found {count} devices:");
                for (i, dev) in devices.iter().enumerate() {
                    println!("  {i}: {}", dev.description());
                }
                return Err(eyre!("Multiple devices found, pick one with --device"));
            }
        };
        let Some(chosen) = devices.into_iter().nth(index) else {
            return Err(eyre!(
                "Device index {index} is out of range, only {count} device(s) found"
            ));
        };

        let mut transport = chosen
            .open(self.options())
            .wrap_err("Couldn't open USB device")?;
        println!("Connected to: {}", transport.description());
        print_sample_rates(None, self.sample_rate);

        crate::run_all(&mut transport, &self.bench, cancel).await
    }
}
