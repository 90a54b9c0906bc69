//! Human-readable byte sizes.
//!
//! Formats byte counts with SI (`44.00 kB`) or IEC (`44.00 KiB`) units and
//! parses `44kB`-style size specifications back into byte counts. Formatted
//! values are padded to a uniform five-column width so size columns line up
//! in log output.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Decimal kilobyte.
pub const KB: i64 = 1000;
/// Decimal megabyte.
pub const MB: i64 = 1000 * KB;
/// Decimal gigabyte.
pub const GB: i64 = 1000 * MB;
/// Decimal terabyte.
pub const TB: i64 = 1000 * GB;
/// Decimal petabyte.
pub const PB: i64 = 1000 * TB;

/// Binary kibibyte.
pub const KIB: i64 = 1024;
/// Binary mebibyte.
pub const MIB: i64 = 1024 * KIB;
/// Binary gibibyte.
pub const GIB: i64 = 1024 * MIB;
/// Binary tebibyte.
pub const TIB: i64 = 1024 * GIB;
/// Binary pebibyte.
pub const PIB: i64 = 1024 * TIB;

const DECIMAL_ABBRS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
const BINARY_ABBRS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

#[allow(clippy::expect_used)]
static SIZE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)([kKmMgGtTpP])?[bB]?$").expect("size pattern is a valid regex")
});

/// Error type for size parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitsError {
    /// The input did not match the `<digits>[kKmMgGtTpP][bB]` shape, or the
    /// multiplied value overflowed.
    #[error("invalid size: '{0}'")]
    InvalidSize(String),
}

/// Returns a human-readable approximation of a size using SI units
/// (e.g. `44.00 kB`, `17.00 MB`).
#[must_use]
pub fn human_size(size: f64) -> String {
    let (value, unit) = scaled(size, 1000.0, &DECIMAL_ABBRS);
    format!("{value} {unit}")
}

/// Returns a base-2 approximation of a size using IEC units
/// (e.g. `44.00 KiB`, `17.00 MiB`).
#[must_use]
pub fn bytes_size(size: f64) -> String {
    let (value, unit) = scaled(size, 1024.0, &BINARY_ABBRS);
    format!("{value} {unit}")
}

/// Parses a human-readable SI size specification (e.g. `44kB`, `17MB`)
/// into a byte count.
///
/// # Errors
///
/// Returns [`UnitsError::InvalidSize`] if the input does not parse or the
/// result overflows.
pub fn from_human_size(size: &str) -> Result<i64, UnitsError> {
    parse_size(size, KB)
}

/// Parses a binary size specification (e.g. `64m`, `2GiB`-style `2g`) into a
/// byte count. Units are case-insensitive and the `b` suffix is optional.
///
/// # Errors
///
/// Returns [`UnitsError::InvalidSize`] if the input does not parse or the
/// result overflows.
pub fn ram_in_bytes(size: &str) -> Result<i64, UnitsError> {
    parse_size(size, KIB)
}

fn scaled(mut size: f64, unit: f64, abbrs: &[&'static str; 9]) -> (String, &'static str) {
    let mut index = 0;
    while size >= unit && index < abbrs.len() - 1 {
        size /= unit;
        index += 1;
    }
    (pad(significant(size)), abbrs[index])
}

/// Formats with four significant digits and trims trailing zeroes.
fn significant(value: f64) -> String {
    let integer_digits = if value >= 1000.0 {
        4
    } else if value >= 100.0 {
        3
    } else if value >= 10.0 {
        2
    } else {
        1
    };
    let precision = 4_usize.saturating_sub(integer_digits);
    let formatted = format!("{value:.precision$}");
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

/// Re-adds trailing zeroes for a uniform width. Only 1000-1023 in binary
/// mode stands out with a width of four.
fn pad(mut value: String) -> String {
    while value.len() < 5 && (value.len() != 4 || value.contains('.')) {
        if value.contains('.') {
            value.push('0');
        } else {
            value.push_str(".0");
        }
    }
    value
}

fn parse_size(input: &str, base: i64) -> Result<i64, UnitsError> {
    let invalid = || UnitsError::InvalidSize(input.to_string());
    let captures = SIZE_PATTERN.captures(input).ok_or_else(invalid)?;
    let digits = captures.get(1).ok_or_else(invalid)?.as_str();
    let mut size: i64 = digits.parse().map_err(|_| invalid())?;

    if let Some(prefix) = captures.get(2) {
        let exponent = match prefix.as_str().to_ascii_lowercase().as_str() {
            "k" => 1,
            "m" => 2,
            "g" => 3,
            "t" => 4,
            "p" => 5,
            _ => return Err(invalid()),
        };
        for _ in 0..exponent {
            size = size.checked_mul(base).ok_or_else(invalid)?;
        }
    }

    Ok(size)
}
