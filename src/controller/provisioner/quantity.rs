//! Storage quantity arithmetic.
//!
//! Parses Kubernetes quantity strings (`10Gi`, `1.5G`, `500M`, `1e9`, `2048`)
//! into byte counts and renders byte counts back as `Mi`/`Gi` quantities.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub const MIB: i64 = 1024 * 1024;
pub const GIB: i64 = 1024 * MIB;

/// Parse a quantity into bytes, rounding fractional bytes up
pub fn parse_bytes(quantity: &Quantity) -> Result<i64> {
    let raw = quantity.0.trim();
    let invalid = |reason: &str| Error::InvalidObject(format!("invalid quantity {raw:?}: {reason}"));

    let (negative, unsigned) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };
    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);
    if number.is_empty() || number == "." {
        return Err(invalid("missing number"));
    }

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if fraction.contains('.') {
        return Err(invalid("more than one decimal point"));
    }
    let digits = format!("{whole}{fraction}");
    let mut numerator: i128 = digits.parse().map_err(|e: std::num::ParseIntError| invalid(&e.to_string()))?;
    let mut denominator: i128 = pow(10, fraction.len()).ok_or_else(|| invalid("too many decimals"))?;

    match suffix {
        "" => {}
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => {
            let exp = "KMGTPE".find(&suffix[..1]).unwrap_or(0) + 1;
            numerator = numerator
                .checked_mul(pow(1024, exp).ok_or_else(|| invalid("overflow"))?)
                .ok_or_else(|| invalid("overflow"))?;
        }
        "k" | "M" | "G" | "T" | "P" | "E" => {
            let exp = ["k", "M", "G", "T", "P", "E"]
                .iter()
                .position(|s| *s == suffix)
                .unwrap_or(0)
                + 1;
            numerator = numerator
                .checked_mul(pow(1000, exp).ok_or_else(|| invalid("overflow"))?)
                .ok_or_else(|| invalid("overflow"))?;
        }
        "m" => {
            denominator = denominator
                .checked_mul(1000)
                .ok_or_else(|| invalid("too many decimals"))?;
        }
        other => {
            let exponent = other
                .strip_prefix('e')
                .or_else(|| other.strip_prefix('E'))
                .and_then(|e| e.parse::<u32>().ok())
                .ok_or_else(|| invalid("unknown suffix"))?;
            numerator = numerator
                .checked_mul(pow(10, exponent as usize).ok_or_else(|| invalid("overflow"))?)
                .ok_or_else(|| invalid("overflow"))?;
        }
    }

    let mut bytes = numerator / denominator;
    if numerator % denominator != 0 {
        bytes += 1;
    }
    if negative {
        bytes = -bytes;
    }
    i64::try_from(bytes).map_err(|e| invalid(&e.to_string()))
}

fn pow(base: i128, exp: usize) -> Option<i128> {
    let exp = u32::try_from(exp).ok()?;
    base.checked_pow(exp)
}

/// Render a byte count, rounding up to whole `Mi` below one GiB and whole `Gi` otherwise
#[must_use]
pub fn bytes_to_quantity(bytes: i64) -> Quantity {
    if bytes < GIB {
        Quantity(format!("{}Mi", div_ceil(bytes, MIB)))
    } else {
        Quantity(format!("{}Gi", div_ceil(bytes, GIB)))
    }
}

fn div_ceil(value: i64, unit: i64) -> i64 {
    if value <= 0 {
        0
    } else {
        value / unit + i64::from(value % unit != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_bytes(&q("1Ki")).unwrap(), 1024);
        assert_eq!(parse_bytes(&q("512Mi")).unwrap(), 512 * MIB);
        assert_eq!(parse_bytes(&q("3Gi")).unwrap(), 3 * GIB);
        assert_eq!(parse_bytes(&q("1Ti")).unwrap(), 1024 * GIB);
    }

    #[test]
    fn test_parse_decimal_suffixes_and_plain_numbers() {
        assert_eq!(parse_bytes(&q("1k")).unwrap(), 1000);
        assert_eq!(parse_bytes(&q("5G")).unwrap(), 5_000_000_000);
        assert_eq!(parse_bytes(&q("2048")).unwrap(), 2048);
        assert_eq!(parse_bytes(&q("1e3")).unwrap(), 1000);
    }

    #[test]
    fn test_parse_fractions_round_up() {
        assert_eq!(parse_bytes(&q("1.5Gi")).unwrap(), GIB + GIB / 2);
        assert_eq!(parse_bytes(&q("0.5")).unwrap(), 1);
        assert_eq!(parse_bytes(&q("1500m")).unwrap(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "Gi", "abc", "1.2.3Gi", "10Xi", "1.Gi."] {
            assert!(parse_bytes(&q(bad)).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_parse_rejects_overflowing_quantities() {
        for huge in [
            "100000000000000000000000000000Ei",
            "100000000000000000000000000000E",
            "10000000000000000000Ei",
            "9223372036854775808",
            "0.00000000000000000000000000000000000001m",
        ] {
            assert!(
                matches!(parse_bytes(&q(huge)), Err(Error::InvalidObject(_))),
                "{huge:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_bytes_to_quantity() {
        assert_eq!(bytes_to_quantity(3 * GIB).0, "3Gi");
        assert_eq!(bytes_to_quantity(512 * MIB).0, "512Mi");
        assert_eq!(bytes_to_quantity(GIB + 1).0, "2Gi");
        assert_eq!(bytes_to_quantity(MIB + 1).0, "2Mi");
        assert_eq!(bytes_to_quantity(GIB).0, "1Gi");
        assert_eq!(bytes_to_quantity(i64::MAX).0, "8589934592Gi");
    }
}
