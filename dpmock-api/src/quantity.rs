//! Integer conversion of Kubernetes resource quantities.
//!
//! Capacities are counts of mock devices, so only whole numbers are
//! accepted. Supported forms are a plain decimal number, optionally followed
//! by a decimal SI suffix (`m k M G T P E`) or a binary one (`Ki .. Ei`).

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("quantity {0:?} is not an integer")]
    NotInteger(String),

    #[error("quantity {0:?} overflows a 64-bit integer")]
    Overflow(String),
}

/// Suffix to `(multiplier, divisor)`.
const SUFFIXES: [(&str, i128, i128); 13] = [
    ("Ki", 1 << 10, 1),
    ("Mi", 1 << 20, 1),
    ("Gi", 1 << 30, 1),
    ("Ti", 1 << 40, 1),
    ("Pi", 1 << 50, 1),
    ("Ei", 1 << 60, 1),
    ("m", 1, 1_000),
    ("k", 1_000, 1),
    ("M", 1_000_000, 1),
    ("G", 1_000_000_000, 1),
    ("T", 1_000_000_000_000, 1),
    ("P", 1_000_000_000_000_000, 1),
    ("E", 1_000_000_000_000_000_000, 1),
];

/// Convert a quantity to an exact `i64`. Fractional values are rejected.
pub fn quantity_as_i64(quantity: &Quantity) -> Result<i64, QuantityError> {
    let raw = quantity.0.trim();
    let invalid = || QuantityError::Invalid(raw.to_string());
    let overflow = || QuantityError::Overflow(raw.to_string());

    let (number, multiplier, divisor) = SUFFIXES
        .iter()
        .find_map(|(suffix, mul, div)| raw.strip_suffix(*suffix).map(|n| (n, *mul, *div)))
        .unwrap_or((raw, 1, 1));

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
        return Err(invalid());
    }

    // value = digits * multiplier / (divisor * 10^frac_len)
    let digits: i128 = format!("{}{}", whole, frac).parse().map_err(|_| overflow())?;
    let scale = u32::try_from(frac.len())
        .ok()
        .and_then(|len| 10i128.checked_pow(len))
        .and_then(|p| p.checked_mul(divisor))
        .ok_or_else(overflow)?;
    let numerator = digits.checked_mul(multiplier).ok_or_else(overflow)?;

    if numerator % scale != 0 {
        return Err(QuantityError::NotInteger(raw.to_string()));
    }
    let value = numerator / scale;
    i64::try_from(if negative { -value } else { value }).map_err(|_| overflow())
}

/// Quantity holding a plain integer.
pub fn quantity_from_i64(value: i64) -> Quantity {
    Quantity(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn test_plain_integers() {
        assert_eq!(quantity_as_i64(&q("4")), Ok(4));
        assert_eq!(quantity_as_i64(&q("0")), Ok(0));
        assert_eq!(quantity_as_i64(&q("-3")), Ok(-3));
        assert_eq!(quantity_as_i64(&q("+7")), Ok(7));
        assert_eq!(quantity_as_i64(&q(" 12 ")), Ok(12));
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(quantity_as_i64(&q("2k")), Ok(2000));
        assert_eq!(quantity_as_i64(&q("1Ki")), Ok(1024));
        assert_eq!(quantity_as_i64(&q("1.5k")), Ok(1500));
        assert_eq!(quantity_as_i64(&q("3000m")), Ok(3));
        assert_eq!(quantity_as_i64(&q("1Gi")), Ok(1 << 30));
        assert_eq!(quantity_as_i64(&q("2M")), Ok(2_000_000));
    }

    #[test]
    fn test_rejects_fractions() {
        assert_eq!(
            quantity_as_i64(&q("1.5")),
            Err(QuantityError::NotInteger("1.5".to_string()))
        );
        assert_eq!(
            quantity_as_i64(&q("500m")),
            Err(QuantityError::NotInteger("500m".to_string()))
        );
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", ".", "four", "4X", "1e3", "k", "1.2.3", "--1"] {
            assert!(
                matches!(quantity_as_i64(&q(bad)), Err(QuantityError::Invalid(_))),
                "{:?} should be invalid",
                bad
            );
        }
    }

    #[test]
    fn test_overflow() {
        assert!(matches!(
            quantity_as_i64(&q("100E")),
            Err(QuantityError::Overflow(_))
        ));
        assert!(matches!(
            quantity_as_i64(&q("99999999999999999999")),
            Err(QuantityError::Overflow(_))
        ));
    }

    #[test]
    fn test_from_i64() {
        assert_eq!(quantity_from_i64(8), q("8"));
        assert_eq!(quantity_as_i64(&quantity_from_i64(-5)), Ok(-5));
    }
}
