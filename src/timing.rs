//! Timer values carried in D7A headers
//!
//! `Tc` and the listen timeout travel as one-byte compressed time: a 3-bit
//! exponent (base 4) and a 5-bit mantissa. Every value is measured by the
//! remote party from a timestamp, so it must be corrected for the ticks that
//! already elapsed locally before a timer is armed.

/// Local timer tick count (wrapping)
pub type Tick = u32;

const MANTISSA_MASK: u8 = 0x1F;
const EXPONENT_SHIFT: u8 = 5;
const MAX_MANTISSA: Tick = MANTISSA_MASK as Tick;
const MAX_EXPONENT: u32 = 7;

/// Largest duration a compressed time byte can express
pub const MAX_COMPRESSED_TICKS: Tick = 4u32.pow(MAX_EXPONENT) * MAX_MANTISSA;

/// Expand a compressed time byte to ticks: `4^exp * mantissa`
pub fn to_ticks(ct: u8) -> Tick {
    let exponent = u32::from(ct >> EXPONENT_SHIFT);
    4u32.pow(exponent) * Tick::from(ct & MANTISSA_MASK)
}

/// Encode a duration as compressed time
///
/// Picks the smallest exponent able to represent `ticks` and rounds the
/// mantissa up, so the encoded window is never shorter than requested.
/// Durations beyond `MAX_COMPRESSED_TICKS` saturate.
pub fn from_ticks(ticks: Tick) -> u8 {
    for exponent in 0..=MAX_EXPONENT {
        let unit = 4u32.pow(exponent);
        let mantissa = ticks.div_ceil(unit);
        if mantissa <= MAX_MANTISSA {
            return ((exponent as u8) << EXPONENT_SHIFT) | mantissa as u8;
        }
    }
    ((MAX_EXPONENT as u8) << EXPONENT_SHIFT) | MANTISSA_MASK
}

/// Ticks elapsed between `timestamp` and `now` on a wrapping counter
pub fn elapsed_since(timestamp: Tick, now: Tick) -> Tick {
    now.wrapping_sub(timestamp)
}

/// Remaining part of a window of `timeout` ticks that opened at `timestamp`
///
/// Returns 0 once the window has elapsed; callers treat 0 as immediate
/// expiry.
pub fn adjust_timeout(timeout: Tick, timestamp: Tick, now: Tick) -> Tick {
    timeout.saturating_sub(elapsed_since(timestamp, now))
}

/// `adjust_timeout` for a compressed time byte
pub fn adjust_compressed_timeout(ct: u8, timestamp: Tick, now: Tick) -> Tick {
    adjust_timeout(to_ticks(ct), timestamp, now)
}
