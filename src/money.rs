//! src/money.rs
//! Lossless bridge between integer minor units (i64 cents) and the
//! NUMERIC(15,0) storage column, plus the decimal-string helpers used at the
//! provider boundary.
//!
//! Public surface intentionally small; extend as needed.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

#[inline]
pub fn to_storage(n: i64) -> Decimal {
    // coefficient = n, exponent = 0
    Decimal::from(n)
}

#[inline]
pub fn from_storage(d: Option<Decimal>) -> Result<i64, String> {
    let d = d.ok_or_else(|| "NULL numeric in storage column".to_string())?;
    // scale > 0 should never come back from a NUMERIC(15,0) column; truncate
    // rather than round so the bridge never invents money.
    d.trunc()
        .to_i64()
        .ok_or_else(|| format!("numeric value {d} does not fit in 64 bits"))
}

/// Parse a provider decimal string ("10.5", "10", "10.555") into cents.
/// The fractional part is padded to exactly two digits; further digits are
/// truncated. "10.5" -> 1050, "10.555" -> 1055, "10" -> 1000.
pub fn parse_decimal_to_cents(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty amount string".to_string());
    }

    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("malformed amount string: {s:?}"));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(format!("malformed amount string: {s:?}"));
    }

    let whole: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| format!("amount out of range: {s:?}"))?
    };

    // pad to two fractional digits, truncate anything further
    let mut frac_digits = frac_part.chars().take(2).collect::<String>();
    while frac_digits.len() < 2 {
        frac_digits.push('0');
    }
    let frac: i128 = frac_digits.parse().expect("two ascii digits");

    // accumulate in i128 so i64::MIN survives the sign flip
    let magnitude = whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac))
        .ok_or_else(|| format!("amount out of range: {s:?}"))?;
    let cents = if negative { -magnitude } else { magnitude };
    i64::try_from(cents).map_err(|_| format!("amount out of range: {s:?}"))
}

/// Canonical two-fraction-digit rendering of a cents amount: 1050 -> "10.50".
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn storage_round_trip_is_identity(n in any::<i64>()) {
            prop_assert_eq!(from_storage(Some(to_storage(n))).unwrap(), n);
        }

        #[test]
        fn format_then_parse_is_identity(cents in any::<i64>()) {
            let rendered = format_cents(cents);
            prop_assert_eq!(parse_decimal_to_cents(&rendered).unwrap(), cents);
        }
    }

    #[test]
    fn null_storage_is_rejected() {
        assert!(from_storage(None).is_err());
    }

    #[test]
    fn fractional_storage_truncates() {
        let d = Decimal::new(10555, 3); // 10.555
        assert_eq!(from_storage(Some(d)).unwrap(), 10);
    }

    #[test]
    fn provider_amounts_normalize_to_cents() {
        assert_eq!(parse_decimal_to_cents("10.5").unwrap(), 1050);
        assert_eq!(parse_decimal_to_cents("10.555").unwrap(), 1055);
        assert_eq!(parse_decimal_to_cents("10").unwrap(), 1000);
        assert_eq!(parse_decimal_to_cents("0.01").unwrap(), 1);
        assert_eq!(parse_decimal_to_cents("-1.5").unwrap(), -150);
        assert_eq!(parse_decimal_to_cents(".5").unwrap(), 50);
    }

    #[test]
    fn garbage_amounts_are_rejected() {
        for bad in ["", " ", "abc", "1,50", "1.5.0", "-", "10e2"] {
            assert!(parse_decimal_to_cents(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn format_cents_boundaries() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(1050), "10.50");
        assert_eq!(format_cents(-150), "-1.50");
        assert_eq!(format_cents(i64::MIN), "-92233720368547758.08");
    }
}
