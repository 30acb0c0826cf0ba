//! Resource quantity parsing
//!
//! Converts cluster quantity strings ("10Gi", "1.5G", "1e3", "500m") into a
//! whole number of bytes, rounding fractional results up.

use crate::error::{Error, Result};

/// Parse a quantity string into bytes
pub fn parse_bytes(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty quantity string".into()));
    }

    let (sign, unsigned) = match s.as_bytes()[0] {
        b'-' => (-1, &s[1..]),
        b'+' => (1, &s[1..]),
        _ => (1, s),
    };

    // Find where the number ends and the suffix begins
    let num_end = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (num_str, suffix) = unsigned.split_at(num_end);

    if num_str.is_empty() || num_str == "." || num_str.matches('.').count() > 1 {
        return Err(Error::CapacityParse(format!("invalid number: {}", s)));
    }

    let (int_part, frac_part) = num_str.split_once('.').unwrap_or((num_str, ""));

    // Represent the value as mantissa / 10^scale
    let digits = format!("{}{}", int_part, frac_part);
    let mut mantissa: u128 = digits
        .parse()
        .map_err(|_| Error::CapacityParse(format!("number out of range: {}", s)))?;
    let mut scale = frac_part.len() as i32;

    let (multiplier, decimal_exp): (u128, i32) = match suffix {
        "" => (1, 0),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        "m" => (1, -3),
        "k" => (1, 3),
        "M" => (1, 6),
        "G" => (1, 9),
        "T" => (1, 12),
        "P" => (1, 15),
        "E" => (1, 18),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let e: i32 = exp[1..]
                .parse()
                .map_err(|_| Error::CapacityParse(format!("invalid exponent: {}", s)))?;
            (1, e)
        }
        other => {
            return Err(Error::CapacityParse(format!("unknown suffix: {}", other)));
        }
    };

    if sign < 0 && mantissa != 0 {
        return Err(Error::CapacityParse(format!("negative quantity: {}", s)));
    }

    mantissa = mantissa
        .checked_mul(multiplier)
        .ok_or_else(|| Error::CapacityParse(format!("quantity too large: {}", s)))?;
    scale = scale
        .checked_sub(decimal_exp)
        .ok_or_else(|| Error::CapacityParse(format!("exponent out of range: {}", s)))?;

    let bytes = if scale <= 0 {
        10u128
            .checked_pow(scale.unsigned_abs())
            .and_then(|p| mantissa.checked_mul(p))
            .ok_or_else(|| Error::CapacityParse(format!("quantity too large: {}", s)))?
    } else {
        match 10u128.checked_pow(scale as u32) {
            Some(divisor) => mantissa.div_ceil(divisor),
            // Divisor exceeds any representable mantissa
            None => u128::from(mantissa != 0),
        }
    };

    u64::try_from(bytes).map_err(|_| Error::CapacityParse(format!("quantity too large: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_bytes("100").unwrap(), 100);
        assert_eq!(parse_bytes("1Ki").unwrap(), 1024);
        assert_eq!(parse_bytes("10Gi").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("1.5Gi").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_bytes("2Ti").unwrap(), 2 * (1u64 << 40));
    }

    #[test]
    fn test_parse_decimal_suffixes() {
        assert_eq!(parse_bytes("1k").unwrap(), 1_000);
        assert_eq!(parse_bytes("5G").unwrap(), 5_000_000_000);
        assert_eq!(parse_bytes("1.5M").unwrap(), 1_500_000);
        assert_eq!(parse_bytes("1e3").unwrap(), 1_000);
        assert_eq!(parse_bytes("12E2").unwrap(), 1_200);
    }

    #[test]
    fn test_parse_rounds_up() {
        assert_eq!(parse_bytes("500m").unwrap(), 1);
        assert_eq!(parse_bytes("0.1").unwrap(), 1);
        assert_eq!(parse_bytes("1001m").unwrap(), 2);
        assert_eq!(parse_bytes("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_matches!(parse_bytes(""), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("abc"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("10X"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("1.2.3"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("-1Gi"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("100Ei"), Err(Error::CapacityParse(_)));
    }

    #[test]
    fn test_parse_extreme_exponents() {
        assert_matches!(parse_bytes("1e-2147483648"), Err(Error::CapacityParse(_)));
        assert_matches!(parse_bytes("1e2147483647"), Err(Error::CapacityParse(_)));
        assert_eq!(parse_bytes("1e-2147483647").unwrap(), 1);
        assert_eq!(parse_bytes("0e-2147483647").unwrap(), 0);
    }
}
