//! Nonce arithmetic for sequencer-issued nonces
//!
//! Nonces are `NONCE_LENGTH`-byte big-endian integers. Allocation only ever
//! moves forward: `increase_nonce` refuses to step past the device's max.

use std::cmp::Ordering;

use ctrv_core::types::NONCE_LENGTH;
use ctrv_core::{CtrvError, CtrvResult};

/// Fewest nonces a device must keep when handing half its range to another
const MIN_SPLIT_RANGE: u64 = 256;

pub fn nonce_to_u64(nonce: &[u8]) -> CtrvResult<u64> {
    let bytes: [u8; NONCE_LENGTH] = nonce.try_into().map_err(|_| {
        CtrvError::Security(format!(
            "nonce must be {NONCE_LENGTH} bytes, got {}",
            nonce.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn nonce_from_u64(value: u64) -> [u8; NONCE_LENGTH] {
    value.to_be_bytes()
}

/// Numeric comparison of two big-endian nonces of any length.
pub fn compare_nonce(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Return `nonce + 1`, failing with `RangeExceeded` if it would pass `max`.
pub fn increase_nonce(nonce: &[u8], max: &[u8]) -> CtrvResult<[u8; NONCE_LENGTH]> {
    let current = nonce_to_u64(nonce)?;
    let max = nonce_to_u64(max)?;
    match current.checked_add(1) {
        Some(next) if next <= max => Ok(nonce_from_u64(next)),
        _ => Err(CtrvError::RangeExceeded(
            "cannot increase nonce, maximum nonce exceeded".into(),
        )),
    }
}

/// Midpoint of `[start, max]`. The caller keeps `[start, mid)` and hands
/// `[mid, max]` to another device.
pub fn split_nonce_range(start: &[u8], max: &[u8]) -> CtrvResult<[u8; NONCE_LENGTH]> {
    let start = nonce_to_u64(start)?;
    let max = nonce_to_u64(max)?;
    if max < start || max - start < MIN_SPLIT_RANGE {
        return Err(CtrvError::RangeExceeded("not enough nonces left to split".into()));
    }
    Ok(nonce_from_u64(start + (max - start) / 2))
}
