//! Link frame layout and sample packing.
//!
//! Data arrives from the device as fixed-size frames of [`FRAME_SIZE`]
//! bytes. Each frame starts with a 16-byte [`FrameHeader`] followed by a
//! payload of packed samples:
//!
//! - [`SampleFormat::I16`]: I then Q, each a little-endian `i16`.
//! - [`SampleFormat::I12Compressed`]: I and Q as 12-bit two's-complement
//!   values packed into 3 bytes. Byte 0 holds the low 8 bits of I, the low
//!   nibble of byte 1 holds the top 4 bits of I, the high nibble of byte 1
//!   holds the low 4 bits of Q, and byte 2 holds the top 8 bits of Q.
//!
//! A USB transfer may carry several frames back-to-back; [`FrameDecoder`]
//! unpacks them and hands out samples in whatever chunk size the reader
//! asks for.

use crate::{ComplexI16, Error, Metadata, SampleFormat};

/// Size of one link frame, in bytes.
pub const FRAME_SIZE: usize = 4096;
/// Size of the frame header, in bytes.
pub const HEADER_SIZE: usize = 16;
/// Size of the frame payload, in bytes.
pub const PAYLOAD_SIZE: usize = FRAME_SIZE - HEADER_SIZE;

/// The header at the start of every frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct FrameHeader {
    /// Status flags from the device.
    pub flags: u64,
    /// Sample counter of the first sample in the frame.
    pub counter: u64,
}

impl FrameHeader {
    fn le_convert(&mut self) {
        self.flags = self.flags.to_le();
        self.counter = self.counter.to_le();
    }

    /// Parse the header from the start of a frame.
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() < HEADER_SIZE {
            return Err(Error::ReturnData);
        }
        let mut header: Self = bytemuck::pod_read_unaligned(&frame[..HEADER_SIZE]);
        header.le_convert();
        Ok(header)
    }

    /// Append the header's on-the-wire form to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut wire = *self;
        wire.le_convert();
        out.extend_from_slice(bytemuck::bytes_of(&wire));
    }
}

/// Number of samples carried in one frame of the given format.
pub fn samples_per_frame(format: SampleFormat) -> usize {
    PAYLOAD_SIZE / format.bytes_per_sample()
}

fn sign_extend_12(v: u16) -> i16 {
    ((v << 4) as i16) >> 4
}

/// Unpack samples from a payload into `out`, returning how many were
/// written.
///
/// Any trailing partial sample in `payload` is ignored.
pub fn unpack(format: SampleFormat, payload: &[u8], out: &mut [ComplexI16]) -> usize {
    let step = format.bytes_per_sample();
    let mut count = 0;
    for (chunk, sample) in payload.chunks_exact(step).zip(out.iter_mut()) {
        *sample = match format {
            SampleFormat::I16 => ComplexI16::new(
                i16::from_le_bytes([chunk[0], chunk[1]]),
                i16::from_le_bytes([chunk[2], chunk[3]]),
            ),
            SampleFormat::I12Compressed => {
                let (b0, b1, b2) = (chunk[0] as u16, chunk[1] as u16, chunk[2] as u16);
                ComplexI16::new(
                    sign_extend_12(((b1 & 0x0F) << 8) | b0),
                    sign_extend_12((b2 << 4) | (b1 >> 4)),
                )
            }
        };
        count += 1;
    }
    count
}

/// Pack samples onto the end of `out`.
///
/// For compressed formats, each component is truncated to 12 bits.
pub fn pack(format: SampleFormat, samples: &[ComplexI16], out: &mut Vec<u8>) {
    out.reserve(samples.len() * format.bytes_per_sample());
    for s in samples {
        match format {
            SampleFormat::I16 => {
                out.extend_from_slice(&s.re.to_le_bytes());
                out.extend_from_slice(&s.im.to_le_bytes());
            }
            SampleFormat::I12Compressed => {
                let i = (s.re as u16) & 0xFFF;
                let q = (s.im as u16) & 0xFFF;
                out.push(i as u8);
                out.push(((i >> 8) as u8 & 0x0F) | ((q as u8 & 0x0F) << 4));
                out.push((q >> 4) as u8);
            }
        }
    }
}

/// Turns a sequence of raw frames into samples.
///
/// Frames are pushed in as they arrive, and samples are drained out in
/// arbitrarily-sized chunks. Samples that don't fit into a read stay queued
/// for the next one.
#[derive(Debug)]
pub struct FrameDecoder {
    format: SampleFormat,
    staged: Vec<ComplexI16>,
    pos: usize,
    next_counter: Option<u64>,
    meta: Metadata,
    dropped_frames: u64,
}

impl FrameDecoder {
    /// Make a new decoder for frames holding the given sample format.
    pub fn new(format: SampleFormat) -> Self {
        Self {
            format,
            staged: Vec::new(),
            pos: 0,
            next_counter: None,
            meta: Metadata::default(),
            dropped_frames: 0,
        }
    }

    /// Number of decoded samples not yet drained.
    pub fn pending(&self) -> usize {
        self.staged.len() - self.pos
    }

    /// Number of frames whose counter didn't follow on from the previous one.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Decode a block of whole frames.
    ///
    /// Fails with [`Error::ReturnData`] if `data` isn't a multiple of
    /// [`FRAME_SIZE`]. Nothing from a failed block is kept.
    pub fn push_frames(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() % FRAME_SIZE != 0 {
            return Err(Error::ReturnData);
        }
        if self.pos > 0 {
            self.staged.drain(..self.pos);
            self.pos = 0;
        }
        let per_frame = samples_per_frame(self.format);
        for frame in data.chunks_exact(FRAME_SIZE) {
            let header = FrameHeader::parse(frame)?;
            if let Some(expected) = self.next_counter {
                if header.counter != expected {
                    self.dropped_frames += 1;
                }
            }
            self.next_counter = Some(header.counter.wrapping_add(per_frame as u64));
            self.meta = Metadata {
                timestamp: header.counter,
                flags: header.flags,
            };
            let start = self.staged.len();
            self.staged.resize(start + per_frame, ComplexI16::new(0, 0));
            unpack(self.format, &frame[HEADER_SIZE..], &mut self.staged[start..]);
        }
        Ok(())
    }

    /// Move as many pending samples as fit into `buf`, returning the count.
    pub fn drain_into(&mut self, buf: &mut [ComplexI16], meta: &mut Metadata) -> usize {
        let count = self.pending().min(buf.len());
        buf[..count].copy_from_slice(&self.staged[self.pos..self.pos + count]);
        self.pos += count;
        if count > 0 {
            *meta = self.meta;
        }
        count
    }
}

/// Build one complete frame from exactly [`samples_per_frame`] samples.
pub fn encode_frame(
    format: SampleFormat,
    header: FrameHeader,
    samples: &[ComplexI16],
    out: &mut Vec<u8>,
) {
    debug_assert_eq!(samples.len(), samples_per_frame(format));
    let start = out.len();
    header.write(out);
    pack(format, samples, out);
    out.resize(start + FRAME_SIZE, 0);
}
