use std::ops::Range;

/// An error from operating a transport or device.
///
/// Some errors are recoverable:
///
/// - `Io` & `Transfer` may just be a failed packet operation on the USB cable,
///   and a later transfer on the same stream can still succeed.
/// - `ValueRange` and `InvalidParameter` mean the arguments to a function were
///   out of range, and may even provide a hint of how to fix them.
/// - `Busy` means the device already has a stream open. Close it first.
/// - `NotStreaming` means a stream operation was attempted on a stream that
///   was never started or has already been stopped.
/// - `ReturnData` means the device replied with something unintelligible,
///   usually a frame with a bad length. Most of the time this means something
///   is seriously wrong with the link.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying OS I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Transfer error from `nusb`.
    #[error("USB transfer error")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// The provided argument value is out of range.
    #[error("Value ({val}) out of range ({}..{})", .range.start, .range.end)]
    #[allow(missing_docs)]
    ValueRange { range: Range<u64>, val: u64 },

    /// Some argument to a function is invalid in a way not easily expressed as
    /// a range.
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(&'static str),

    /// The device already has a stream open.
    #[error("Device is busy with another stream")]
    Busy,

    /// The stream isn't running.
    #[error("Stream is not running")]
    NotStreaming,

    /// Returned data from the device didn't make any sense.
    #[error("Invalid return data")]
    ReturnData,

    /// A device profile couldn't be parsed.
    #[error("Bad profile line {line}: {reason}")]
    #[allow(missing_docs)]
    Profile { line: usize, reason: &'static str },
}

/// An error that stopped a benchmark run before it could produce a result.
///
/// Anything that goes wrong once samples are flowing (timeouts, invalid
/// samples, read failures) ends the run early instead, and shows up in the
/// [`Termination`][crate::Termination] of the returned
/// [`RunResult`][crate::RunResult].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BenchError {
    /// The transport refused to open a stream with the requested
    /// configuration.
    #[error("Failed to set up stream")]
    StreamSetup(#[source] Error),

    /// The device didn't acknowledge the stream start. The stream has already
    /// been closed when this is returned.
    #[error("Failed to start stream")]
    StreamControl(#[source] Error),
}
