//! Baud rate resolution.
//!
//! A requested rate resolves to either an entry of the backend's standard
//! table or a custom divisor of the device's base clock. A divisor is only
//! accepted when the rate it produces is within [`TOLERANCE_PERCENT`] of the
//! request; anything else is an error, never a silent rounding.

use thiserror::Error;

/// Maximum deviation of an achievable custom rate from the request.
pub const TOLERANCE_PERCENT: u64 = 2;

/// Why a requested rate cannot be programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BaudError {
    /// The rate is not meaningful on this backend (for example 0).
    #[error("invalid baud rate {0}")]
    InvalidRate(u32),

    /// The request is faster than half the base clock.
    #[error("baud rate {requested} needs a zero divisor of base clock {base}")]
    DivisorZero { requested: u32, base: u32 },

    /// The nearest divisor misses the request by more than the tolerance.
    #[error("baud rate {requested} not achievable: divisor {divisor} gives {actual}")]
    OutOfTolerance {
        requested: u32,
        divisor: u32,
        actual: u32,
    },

    /// Not a standard rate, and the device exposes no divisor to program.
    #[error("baud rate {0} is not a standard rate and the device has no custom divisor")]
    NoCustomDivisor(u32),
}

/// A custom divisor that passed the tolerance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomDivisor {
    /// Rate the caller asked for.
    pub requested: u32,
    /// Device base clock.
    pub base: u32,
    /// Divisor to program.
    pub divisor: u32,
    /// Rate the divisor actually produces, rounded.
    pub actual: u32,
}

/// Outcome of resolving a rate against a backend's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudSetting<T> {
    /// Exact match in the standard table.
    Standard { rate: u32, native: T },
    /// Programmed through a divisor of the base clock.
    Custom(CustomDivisor),
}

impl<T> BaudSetting<T> {
    /// The line rate the device will run at.
    pub fn actual_rate(&self) -> u32 {
        match self {
            Self::Standard { rate, .. } => *rate,
            Self::Custom(c) => c.actual,
        }
    }
}

/// Compute and validate `round(base / requested)`.
pub fn custom_divisor(requested: u32, base: u32) -> Result<CustomDivisor, BaudError> {
    if requested == 0 || base == 0 {
        return Err(BaudError::InvalidRate(requested));
    }

    let req = u64::from(requested);
    let clock = u64::from(base);
    let divisor = (clock + req / 2) / req;
    if divisor == 0 {
        return Err(BaudError::DivisorZero { requested, base });
    }

    let actual = ((clock + divisor / 2) / divisor) as u32;
    // actual / requested within [0.98, 1.02], in integers.
    let scaled = clock * 100;
    let low = req * divisor * (100 - TOLERANCE_PERCENT);
    let high = req * divisor * (100 + TOLERANCE_PERCENT);
    if scaled < low || scaled > high {
        return Err(BaudError::OutOfTolerance {
            requested,
            divisor: divisor as u32,
            actual,
        });
    }

    Ok(CustomDivisor {
        requested,
        base,
        divisor: divisor as u32,
        actual,
    })
}

/// Resolve `requested` against a standard table, falling back to a custom
/// divisor when the device reports a base clock.
pub fn resolve<T: Copy>(
    requested: u32,
    table: &[(u32, T)],
    base: Option<u32>,
) -> Result<BaudSetting<T>, BaudError> {
    if let Some(&(rate, native)) = table.iter().find(|(rate, _)| *rate == requested) {
        return Ok(BaudSetting::Standard { rate, native });
    }
    if requested == 0 {
        return Err(BaudError::InvalidRate(0));
    }
    match base {
        Some(base) => custom_divisor(requested, base).map(BaudSetting::Custom),
        None => Err(BaudError::NoCustomDivisor(requested)),
    }
}

/// Reverse lookup: the baud value of a native constant.
pub fn lookup_rate<T: Copy + PartialEq>(native: T, table: &[(u32, T)]) -> Option<u32> {
    table
        .iter()
        .find(|(_, constant)| *constant == native)
        .map(|(rate, _)| *rate)
}
