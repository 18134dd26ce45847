//! Test-tone sample validation.

use crate::{ComplexI16, Error};

/// The acceptable squared-amplitude range for a test-tone sample.
///
/// A device in test-tone mode emits samples of constant amplitude, so every
/// received sample should land in a narrow band around it. Anything outside
/// means the transport dropped or mangled data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidityWindow {
    min_amplitude_sq: u64,
    max_amplitude_sq: u64,
}

impl ValidityWindow {
    /// Make a window from squared amplitude bounds.
    ///
    /// Both bounds must be nonzero, and `min` must be strictly less than
    /// `max`.
    pub fn new(min_amplitude_sq: u64, max_amplitude_sq: u64) -> Result<Self, Error> {
        if min_amplitude_sq == 0 {
            return Err(Error::InvalidParameter(
                "minimum squared amplitude must be nonzero",
            ));
        }
        if min_amplitude_sq >= max_amplitude_sq {
            return Err(Error::InvalidParameter(
                "minimum squared amplitude must be below the maximum",
            ));
        }
        Ok(Self {
            min_amplitude_sq,
            max_amplitude_sq,
        })
    }

    /// Make a window from linear amplitude bounds.
    pub fn from_amplitudes(min: u32, max: u32) -> Result<Self, Error> {
        Self::new((min as u64).pow(2), (max as u64).pow(2))
    }

    /// Lower squared-amplitude bound, inclusive.
    pub fn min_amplitude_sq(&self) -> u64 {
        self.min_amplitude_sq
    }

    /// Upper squared-amplitude bound, inclusive.
    pub fn max_amplitude_sq(&self) -> u64 {
        self.max_amplitude_sq
    }

    /// Check if a squared amplitude falls inside the window.
    pub fn contains(&self, amplitude_sq: u64) -> bool {
        amplitude_sq != 0
            && amplitude_sq >= self.min_amplitude_sq
            && amplitude_sq <= self.max_amplitude_sq
    }
}

impl Default for ValidityWindow {
    /// The window for a 2000-count test tone, +/- 100 counts.
    fn default() -> Self {
        Self {
            min_amplitude_sq: 1900 * 1900,
            max_amplitude_sq: 2100 * 2100,
        }
    }
}

/// Outcome of validating one batch of samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Every sample was within the window.
    Valid,
    /// A sample fell outside the window.
    Invalid {
        /// Position of the first bad sample in the batch.
        index: usize,
        /// Squared amplitude of that sample.
        amplitude_sq: u64,
    },
}

impl Verdict {
    /// Returns true if the batch was valid.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Squared magnitude of a sample.
///
/// Computed in 64 bits, so even full-scale 16-bit components can't overflow.
pub fn amplitude_sq(s: ComplexI16) -> u64 {
    let i = s.re as i64;
    let q = s.im as i64;
    (i * i + q * q) as u64
}

/// Check a batch of samples against a window, stopping at the first invalid
/// one.
///
/// An empty batch is valid.
pub fn validate(samples: &[ComplexI16], window: &ValidityWindow) -> Verdict {
    samples
        .iter()
        .map(|&s| amplitude_sq(s))
        .enumerate()
        .find(|&(_, amp)| !window.contains(amp))
        .map_or(Verdict::Valid, |(index, amplitude_sq)| Verdict::Invalid {
            index,
            amplitude_sq,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(re: i16, im: i16) -> ComplexI16 {
        ComplexI16::new(re, im)
    }

    #[test]
    fn window_construction() {
        assert!(ValidityWindow::new(0, 10).is_err());
        assert!(ValidityWindow::new(10, 10).is_err());
        assert!(ValidityWindow::new(11, 10).is_err());
        let w = ValidityWindow::from_amplitudes(1900, 2100).unwrap();
        assert_eq!(w, ValidityWindow::default());
        assert_eq!(w.min_amplitude_sq(), 3_610_000);
        assert_eq!(w.max_amplitude_sq(), 4_410_000);
    }

    #[test]
    fn bounds_are_inclusive() {
        let w = ValidityWindow::default();
        assert!(validate(&[c(1900, 0)], &w).is_valid());
        assert!(validate(&[c(0, -2100)], &w).is_valid());
        assert!(!validate(&[c(1899, 0)], &w).is_valid());
        assert!(!validate(&[c(2101, 0)], &w).is_valid());
    }

    #[test]
    fn full_scale_does_not_overflow() {
        let s = c(i16::MIN, i16::MIN);
        assert_eq!(amplitude_sq(s), 2 * 32768 * 32768);
        let w = ValidityWindow::new(1, u64::MAX).unwrap();
        assert!(validate(&[s], &w).is_valid());
    }

    #[test]
    fn zero_amplitude_is_invalid() {
        let w = ValidityWindow::new(1, 100).unwrap();
        assert_eq!(
            validate(&[c(1, 0), c(0, 0)], &w),
            Verdict::Invalid {
                index: 1,
                amplitude_sq: 0
            }
        );
    }

    #[test]
    fn empty_batch_is_valid() {
        assert_eq!(validate(&[], &ValidityWindow::default()), Verdict::Valid);
    }

    #[test]
    fn single_bad_sample_anywhere() {
        let w = ValidityWindow::default();
        let good = c(1414, 1414);
        assert!(validate(&[good; 64], &w).is_valid());
        for pos in 0..64 {
            let mut batch = [good; 64];
            batch[pos] = c(100, 100);
            let before = batch;
            assert_eq!(
                validate(&batch, &w),
                Verdict::Invalid {
                    index: pos,
                    amplitude_sq: 20_000
                }
            );
            assert_eq!(batch, before);
        }
    }

    #[test]
    fn reports_first_bad_sample() {
        let w = ValidityWindow::default();
        let batch = [c(2000, 0), c(3000, 0), c(0, 0)];
        assert_eq!(
            validate(&batch, &w),
            Verdict::Invalid {
                index: 1,
                amplitude_sq: 9_000_000
            }
        );
    }
}
