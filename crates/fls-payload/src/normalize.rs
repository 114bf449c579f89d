//! Field normalizers applied while turning HR rows into API payloads.
//! Tolerant by design: upstream data mixes strings, sentinel dates and
//! legacy encodings, and a bad optional field must not drop the row.

use chrono::{NaiveDate, NaiveDateTime};

/// Digits-only CPF, left-padded to 11 and formatted `###.###.###-##`.
/// Returns None when the input carries no digits at all. Inputs longer
/// than 11 digits are returned unformatted.
pub fn format_cpf(value: Option<&str>) -> Option<String> {
    let raw = value?;
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    while digits.len() < 11 {
        digits.insert(0, '0');
    }
    if digits.len() == 11 {
        return Some(format!(
            "{}.{}.{}-{}",
            &digits[..3],
            &digits[3..6],
            &digits[6..9],
            &digits[9..]
        ));
    }
    Some(digits)
}

/// Digits-only CNPJ, left-padded to 14 and formatted `##.###.###/####-##`.
pub fn format_cnpj(value: Option<&str>) -> Option<String> {
    let raw = value?;
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    while digits.len() < 14 {
        digits.insert(0, '0');
    }
    if digits.len() == 14 {
        return Some(format!(
            "{}.{}.{}/{}-{}",
            &digits[..2],
            &digits[2..5],
            &digits[5..8],
            &digits[8..12],
            &digits[12..]
        ));
    }
    Some(digits)
}

pub fn date_to_yyyy_mm_dd(value: Option<NaiveDate>) -> Option<String> {
    value.map(|d| d.format("%Y-%m-%d").to_string())
}

pub fn datetime_to_yyyy_mm_dd(value: Option<NaiveDateTime>) -> Option<String> {
    value.map(|d| d.format("%Y-%m-%d").to_string())
}

/// ISO date from free text. Known formats are parsed; anything else is
/// sliced to its first 10 characters, which covers `YYYY-MM-DDTHH:MM:SS`
/// strings from intermediate exports.
pub fn text_to_yyyy_mm_dd(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.format("%Y-%m-%d").to_string());
        }
    }
    Some(text.chars().take(10).collect())
}

/// Upstream truthiness: `1/true/t/sim/s/y/yes` (any case) and non-zero
/// numbers are true; everything else is false.
pub fn to_bool(value: Option<&str>) -> bool {
    let Some(raw) = value else { return false };
    let text = raw.trim().to_lowercase();
    if let Ok(n) = text.parse::<f64>() {
        return n != 0.0;
    }
    matches!(text.as_str(), "1" | "true" | "t" | "sim" | "s" | "y" | "yes")
}

pub fn int_to_bool(value: Option<i32>) -> bool {
    matches!(value, Some(n) if n != 0)
}

/// HR gender code to the API's closed set.
pub fn map_gender(code: Option<&str>) -> &'static str {
    match code.map(|c| c.trim().to_uppercase()) {
        Some(c) if c == "M" || c == "1" => "M",
        Some(c) if c == "F" || c == "2" => "F",
        _ => "Outro",
    }
}

/// Trimmed text, or the given placeholder when empty/absent.
pub fn text_or_default(value: Option<&str>, default: &str) -> String {
    match value.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpf_pads_and_formats() {
        assert_eq!(format_cpf(Some("12345678909")).as_deref(), Some("123.456.789-09"));
        assert_eq!(format_cpf(Some("345678909")).as_deref(), Some("003.456.789-09"));
        assert_eq!(format_cpf(Some("123.456.789-09")).as_deref(), Some("123.456.789-09"));
        // 12 digits: left alone, digits only
        assert_eq!(format_cpf(Some("123456789012")).as_deref(), Some("123456789012"));
        assert_eq!(format_cpf(Some("sem digitos")), None);
        assert_eq!(format_cpf(None), None);
    }

    #[test]
    fn cnpj_pads_and_formats() {
        assert_eq!(
            format_cnpj(Some("12345678000195")).as_deref(),
            Some("12.345.678/0001-95")
        );
        assert_eq!(
            format_cnpj(Some("345678000195")).as_deref(),
            Some("00.345.678/0001-95")
        );
        assert_eq!(format_cnpj(Some("")), None);
    }

    #[test]
    fn text_dates_tolerate_unknown_formats() {
        assert_eq!(text_to_yyyy_mm_dd("2024-05-10").as_deref(), Some("2024-05-10"));
        assert_eq!(
            text_to_yyyy_mm_dd("2024-05-10 08:30:00").as_deref(),
            Some("2024-05-10")
        );
        assert_eq!(
            text_to_yyyy_mm_dd("2024-05-10T08:30:00.123").as_deref(),
            Some("2024-05-10")
        );
        assert_eq!(text_to_yyyy_mm_dd("   "), None);
    }

    #[test]
    fn truthiness_accepts_portuguese_tokens() {
        for v in ["1", "true", "T", "Sim", "s", "Y", "yes", "2", "-1"] {
            assert!(to_bool(Some(v)), "{v} should be true");
        }
        for v in ["0", "false", "nao", "n", "no", "", "  "] {
            assert!(!to_bool(Some(v)), "{v} should be false");
        }
        assert!(!to_bool(None));
    }

    #[test]
    fn gender_maps_to_closed_set() {
        assert_eq!(map_gender(Some("M")), "M");
        assert_eq!(map_gender(Some("1")), "M");
        assert_eq!(map_gender(Some("f")), "F");
        assert_eq!(map_gender(Some("2")), "F");
        assert_eq!(map_gender(Some("X")), "Outro");
        assert_eq!(map_gender(None), "Outro");
    }
}
