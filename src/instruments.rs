// =============================================================================
// Instrument Identifiers — canonical option ids across native encodings
// =============================================================================
//
// Venues encode the same option differently:
//
//   BTC-240927-19000-C        (YYMMDD)
//   BTC-27SEP24-19000-C       (DDMMMYY)
//   BTC-2024-09-27-19000-C    (already canonical)
//
// The scanner intersects symbol universes on the canonical form
// `BASE-YYYY-MM-DD-STRIKE-[C|P]` while still reading quotes under each
// venue's native id. Anything that does not parse as an option (spot
// symbols, malformed dates) passes through unchanged, so spot universes
// intersect on their own names.
// =============================================================================

use chrono::NaiveDate;

/// Derive the canonical id for a native instrument id. Unrecognized inputs
/// are returned unchanged. The function is idempotent: feeding a canonical
/// id back in yields the same canonical id.
pub fn canonicalize(native: &str) -> String {
    let tokens: Vec<&str> = native.split('-').collect();

    match tokens.len() {
        // BASE-YYYY-MM-DD-STRIKE-[C|P]
        6 => {
            let (base, y, m, d, strike, cp) =
                (tokens[0], tokens[1], tokens[2], tokens[3], tokens[4], tokens[5]);
            let date = match (y.parse::<i32>(), m.parse::<u32>(), d.parse::<u32>()) {
                (Ok(y), Ok(m), Ok(d)) if y >= 1970 => NaiveDate::from_ymd_opt(y, m, d),
                _ => None,
            };
            match (date, valid_strike(strike), option_kind(cp)) {
                (Some(date), true, Some(kind)) => format_canonical(base, date, strike, kind),
                _ => native.to_string(),
            }
        }
        // BASE-<date>-STRIKE-[C|P] with a compact date encoding
        4 => {
            let (base, raw_date, strike, cp) = (tokens[0], tokens[1], tokens[2], tokens[3]);
            let date = parse_yymmdd(raw_date).or_else(|| parse_ddmmmyy(raw_date));
            match (date, valid_strike(strike), option_kind(cp)) {
                (Some(date), true, Some(kind)) => format_canonical(base, date, strike, kind),
                _ => native.to_string(),
            }
        }
        _ => native.to_string(),
    }
}

fn format_canonical(base: &str, date: NaiveDate, strike: &str, kind: char) -> String {
    format!(
        "{}-{}-{}-{}",
        base.to_ascii_uppercase(),
        date.format("%Y-%m-%d"),
        strike,
        kind
    )
}

fn option_kind(s: &str) -> Option<char> {
    match s.to_ascii_uppercase().as_str() {
        "C" => Some('C'),
        "P" => Some('P'),
        _ => None,
    }
}

fn valid_strike(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// `240927` → 2024-09-27. Two-digit years are anchored to 2000.
fn parse_yymmdd(s: &str) -> Option<NaiveDate> {
    if s.len() != 6 || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let yy: i32 = s[0..2].parse().ok()?;
    let mm: u32 = s[2..4].parse().ok()?;
    let dd: u32 = s[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
}

/// `27SEP24` (or `1SEP24`) → 2024-09-27.
fn parse_ddmmmyy(s: &str) -> Option<NaiveDate> {
    let s = s.to_ascii_uppercase();
    let digits_end = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if !(1..=2).contains(&digits_end) || s.len() != digits_end + 5 {
        return None;
    }
    let dd: u32 = s[..digits_end].parse().ok()?;
    let month = match &s[digits_end..digits_end + 3] {
        "JAN" => 1,
        "FEB" => 2,
        "MAR" => 3,
        "APR" => 4,
        "MAY" => 5,
        "JUN" => 6,
        "JUL" => 7,
        "AUG" => 8,
        "SEP" => 9,
        "OCT" => 10,
        "NOV" => 11,
        "DEC" => 12,
        _ => return None,
    };
    let yy: i32 = s[digits_end + 3..].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + yy, month, dd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yymmdd_encoding_canonicalizes() {
        assert_eq!(canonicalize("BTC-240927-19000-C"), "BTC-2024-09-27-19000-C");
    }

    #[test]
    fn ddmmmyy_encoding_canonicalizes() {
        assert_eq!(canonicalize("BTC-27SEP24-19000-C"), "BTC-2024-09-27-19000-C");
    }

    #[test]
    fn cross_encoding_ids_converge() {
        // Two adapters publishing different natives must intersect.
        let a = canonicalize("BTC-240927-19000-C");
        let b = canonicalize("BTC-27SEP24-19000-C");
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_form_is_idempotent() {
        let once = canonicalize("ETH-241227-4000-P");
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "ETH-2024-12-27-4000-P");
    }

    #[test]
    fn single_digit_day_parses() {
        assert_eq!(canonicalize("BTC-1SEP24-500-P"), "BTC-2024-09-01-500-P");
    }

    #[test]
    fn lowercase_kind_normalizes() {
        assert_eq!(canonicalize("btc-240927-19000-c"), "BTC-2024-09-27-19000-C");
    }

    #[test]
    fn spot_symbols_pass_through() {
        assert_eq!(canonicalize("BTCUSDT"), "BTCUSDT");
        assert_eq!(canonicalize("ETH-PERP"), "ETH-PERP");
    }

    #[test]
    fn invalid_dates_pass_through() {
        assert_eq!(canonicalize("BTC-249940-19000-C"), "BTC-249940-19000-C");
        assert_eq!(canonicalize("BTC-99XYZ24-1-C"), "BTC-99XYZ24-1-C");
    }

    #[test]
    fn invalid_strike_passes_through() {
        assert_eq!(canonicalize("BTC-240927-19k-C"), "BTC-240927-19k-C");
    }

    #[test]
    fn decimal_strike_is_preserved() {
        assert_eq!(canonicalize("XRP-27SEP24-0.55-C"), "XRP-2024-09-27-0.55-C");
    }
}
