//! Fixed-point formatting of raw on-chain integer amounts

use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::OnceLock;

/// Largest power of ten `Decimal` represents exactly (scale limit is 28)
pub const MAX_DECIMAL_EXPONENT: u32 = 28;

static POWERS_OF_TEN: OnceLock<Vec<Decimal>> = OnceLock::new();

fn powers_of_ten() -> &'static [Decimal] {
    POWERS_OF_TEN.get_or_init(|| {
        (0..=MAX_DECIMAL_EXPONENT)
            .map(|exp| Decimal::from_i128_with_scale(10i128.pow(exp), 0))
            .collect()
    })
}

/// `10^exp`, clamped to `10^MAX_DECIMAL_EXPONENT`
pub fn pow10(exp: u32) -> Decimal {
    powers_of_ten()[exp.min(MAX_DECIMAL_EXPONENT) as usize]
}

/// Divide a raw integer amount by `10^decimals`.
///
/// Returns `None` for non-numeric input. Raw amounts wider than the decimal
/// mantissa keep their leading 28 digits and shift the exponent instead.
pub fn format_amount(raw: &str, decimals: u32) -> Option<Decimal> {
    let digits = raw.trim();
    if digits.is_empty() {
        return None;
    }

    if let Ok(value) = Decimal::from_str(digits) {
        return value.checked_div(pow10(decimals));
    }

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let excess = digits.len().saturating_sub(MAX_DECIMAL_EXPONENT as usize);
    let head = Decimal::from_str(&digits[..digits.len() - excess]).ok()?;
    let excess = excess as u32;
    if decimals >= excess {
        head.checked_div(pow10(decimals - excess))
    } else {
        head.checked_mul(pow10(excess - decimals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_format_amount_basic() {
        assert_eq!(format_amount("1500000", 6), Some(dec!(1.5)));
        assert_eq!(format_amount("1", 0), Some(dec!(1)));
        assert_eq!(format_amount("1000000000000000000", 18), Some(dec!(1)));
    }

    #[test]
    fn test_pow10_clamps_above_max_exponent() {
        assert_eq!(pow10(40), pow10(MAX_DECIMAL_EXPONENT));
        assert_eq!(pow10(2), dec!(100));
    }

    #[test]
    fn test_format_amount_rejects_garbage() {
        assert_eq!(format_amount("", 18), None);
        assert_eq!(format_amount("0xdeadbeef", 18), None);
    }

    #[test]
    fn test_format_amount_wide_raw_value() {
        // 35 digits overflows the mantissa; the result keeps its magnitude
        let raw = "12345678901234567890123456789012345";
        let formatted = format_amount(raw, 18).unwrap();
        assert!(formatted > dec!(12345678901234567));
        assert!(formatted < dec!(12345678901234568));
    }
}
