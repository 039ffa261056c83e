//! Human-readable size strings.
//!
//! Sizes are written as a whole number followed by a single unit letter, all
//! base 1024: `512K`, `500M`, `2G`. The suffix is case-insensitive.

use crate::error::{ImageError, Result};

const SUFFIXES: [char; 9] = ['B', 'K', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y'];

/// Parses a size string such as `"500M"` into a byte count.
///
/// The number must be a non-negative integer and the last character one of
/// `B, K, M, G, T, P, E, Z, Y`. Values that do not fit in a `u64` are
/// rejected rather than saturated.
pub fn parse(input: &str) -> Result<u64> {
    let invalid = || ImageError::InvalidSize(input.to_string());

    let trimmed = input.trim();
    let suffix = trimmed.chars().last().ok_or_else(invalid)?;
    let number = &trimmed[..trimmed.len() - suffix.len_utf8()];

    let index = SUFFIXES
        .iter()
        .position(|s| s.eq_ignore_ascii_case(&suffix))
        .ok_or_else(invalid)?;

    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let number: u128 = number.parse().map_err(|_| invalid())?;

    // 1024^8 fits in a u128, so only the product can overflow.
    let bytes = number
        .checked_mul(1024u128.pow(index as u32))
        .ok_or_else(invalid)?;
    u64::try_from(bytes).map_err(|_| invalid())
}

/// Like [`parse`], but rejects a zero size. Used for transfer buffers.
pub fn parse_nonzero(input: &str) -> Result<u64> {
    match parse(input)? {
        0 => Err(ImageError::InvalidSize(input.to_string())),
        n => Ok(n),
    }
}
