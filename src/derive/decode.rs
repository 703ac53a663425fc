//! Bit-layout and textual decoders for location, device and time fields.

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use crate::ber::hex_decode;

fn tail(chars: &[char], n: usize) -> &[char] {
    &chars[chars.len().saturating_sub(n)..]
}

fn span(chars: &[char], from_end: usize, to_end: usize) -> String {
    let len = chars.len();
    chars[len.saturating_sub(from_end)..len.saturating_sub(to_end)]
        .iter()
        .collect()
}

/// Last 14 characters split 6-4-4. Shorter input is split from the right.
pub fn split_location(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    format!(
        "{}-{}-{}",
        span(&chars, 14, 8),
        span(&chars, 8, 4),
        span(&chars, 4, 0)
    )
}

/// Last 13 characters split 5-4-4. Shorter input is returned as is.
pub fn split_short_location(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    if chars.len() < 13 {
        return raw.trim().to_string();
    }
    format!(
        "{}-{}-{}",
        span(&chars, 13, 8),
        span(&chars, 8, 4),
        span(&chars, 4, 0)
    )
}

/// Decodes the trailing `TAC(4) MCCMNC(6) ECI(8)` hex layout into
/// `mccmnc-tac-enb-cell`. Fewer than 18 characters use [`split_location`].
pub fn decode_location(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    if chars.len() < 18 {
        return split_location(raw);
    }
    let s = tail(&chars, 18);

    let tac_hex: String = s[0..4].iter().collect();
    let tac = u32::from_str_radix(&tac_hex, 16).unwrap_or(0);

    let mccmnc: String = s[4..10]
        .chunks(2)
        .flat_map(|pair| pair.iter().rev())
        .filter(|c| !matches!(c, 'F' | 'f'))
        .collect();

    let eci_hex: String = s[10..18].iter().collect();
    let eci = u64::from_str_radix(&eci_hex, 16).unwrap_or(0);

    format!("{}-{}-{}-{}", mccmnc, tac, eci % 256, eci / 256)
}

/// Location by radio access type: full decode for E-UTRAN (6), plain split
/// otherwise.
pub fn location_for_rat(raw: &str, rat: Option<&str>) -> String {
    match rat.map(str::trim) {
        Some("6") => decode_location(raw),
        _ => split_location(raw),
    }
}

/// 16-digit device identifier from a user-equipment value: hex-decoded to
/// ASCII when possible, every second character (1-based even positions),
/// digits only, truncated or right-padded with `0`.
pub fn decode_device_id(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let decoded = hex_decode(raw)
        .map(|bytes| {
            bytes
                .into_iter()
                .filter(u8::is_ascii)
                .map(char::from)
                .collect::<String>()
        })
        .filter(|s| !s.is_empty());
    let source = decoded.as_deref().unwrap_or(raw);

    let mut digits: String = source
        .chars()
        .skip(1)
        .step_by(2)
        .filter(char::is_ascii_digit)
        .take(16)
        .collect();
    while digits.len() < 16 {
        digits.push('0');
    }
    digits
}

/// Short national numbers lose leading zeros and gain the country prefix.
pub fn normalize_msisdn(number: &str, country_code: &str) -> String {
    if number.is_empty() || number.starts_with(country_code) || number.chars().count() >= 10 {
        return number.to_string();
    }
    format!("{}{}", country_code, number.trim_start_matches('0'))
}

/// `dd/mm/YYYY HH:MM:SS[+hh:mm|Z]`; the offset is ignored, local fields kept.
pub fn parse_generation_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let local = raw.get(..19).unwrap_or(raw);
    NaiveDateTime::parse_from_str(local, "%d/%m/%Y %H:%M:%S").ok()
}

pub fn format_generation_time(raw: &str) -> Option<String> {
    parse_generation_time(raw).map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Calendar date from the leading `dd/mm/YYYY` token. Two-digit years are
/// read as 20xx.
pub fn generation_date(raw: &str) -> Option<NaiveDate> {
    let token = raw.split_whitespace().next()?;
    let mut parts = token.split('/');
    let day: u32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let year_text = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let mut year: i32 = year_text.parse().ok()?;
    if year_text.len() == 2 {
        year += 2000;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `YYYYMMDD`, or `00000000` when the timestamp does not parse.
pub fn date_key(raw: &str) -> String {
    generation_date(raw)
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "00000000".to_string())
}

/// Two-digit month, `00` when the timestamp does not parse.
pub fn month_key(raw: &str) -> String {
    generation_date(raw)
        .map(|d| format!("{:02}", d.month()))
        .unwrap_or_else(|| "00".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_eutran_location() {
        let raw = format!("{}{}{}", "0012", "00F1F2", "00000101");
        assert_eq!(decode_location(&raw), "0012-18-1-1");
        assert_eq!(location_for_rat(&format!("8200{}", raw), Some("6")), "0012-18-1-1");
    }

    #[test]
    fn location_nibble_swap_and_filler() {
        // 64F010 -> 46 0F 01, filler dropped
        assert_eq!(decode_location("1A2B64F0100003E805"), "46001-6699-5-1000");
    }

    #[test]
    fn short_location_falls_back_to_split() {
        assert_eq!(decode_location("ABCDEF12345678"), "ABCDEF-1234-5678");
        assert_eq!(split_location("XXABCDEF12345678"), "ABCDEF-1234-5678");
        assert_eq!(split_location("12345678"), "-1234-5678");
        assert_eq!(location_for_rat("0012", Some("1")), "--0012");
        assert_eq!(split_location(""), "");
    }

    #[test]
    fn thirteen_character_location_split() {
        assert_eq!(split_short_location("XX4600112341234"), "46001-1234-1234");
        assert_eq!(split_short_location("46001"), "46001");
    }

    #[test]
    fn device_id_from_hex_ascii() {
        // "01234567" as hex
        assert_eq!(decode_device_id("3031323334353637"), "1357000000000000");
        assert_eq!(decode_device_id("z1z2z3"), "1230000000000000");
        let long: String = "x9".repeat(20);
        assert_eq!(decode_device_id(&long), "9999999999999999");
        assert_eq!(decode_device_id(""), "");
    }

    #[test]
    fn msisdn_normalization() {
        assert_eq!(normalize_msisdn("0911223344", "251"), "0911223344");
        assert_eq!(normalize_msisdn("091122334", "251"), "25191122334");
        assert_eq!(normalize_msisdn("251911", "251"), "251911");
        assert_eq!(normalize_msisdn("", "251"), "");
    }

    #[test]
    fn generation_timestamps() {
        assert_eq!(
            format_generation_time("15/08/2025 15:26:53+03:00").as_deref(),
            Some("2025-08-15 15:26:53")
        );
        assert_eq!(
            format_generation_time("15/08/2025 15:26:53").as_deref(),
            Some("2025-08-15 15:26:53")
        );
        assert_eq!(format_generation_time("2025-08-15"), None);
        assert_eq!(date_key("05/11/25 00:00:01"), "20251105");
        assert_eq!(month_key("05/11/2025 00:00:01"), "11");
        assert_eq!(date_key("garbage"), "00000000");
        assert_eq!(month_key(""), "00");
    }
}
