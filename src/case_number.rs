// =============================================================================
// case_number.rs - CASE IDENTIFIER PARSER
// =============================================================================
//
// Court case numbers arrive from upstream in every shape a human can type:
// "2024가단12345", "서울가정법원 2024드단 12345", "２０２４카단-123",
// "2024 (드단) 0001108". They all mean <year><type><serial>.
//
// We normalize first (whitespace, separators, full-width digits, court-name
// prefixes), then match strictly. Anything that does not match after
// normalization is rejected outright. No partial acceptance, no guessing.
// =============================================================================

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::classifier;
use crate::error::ParseError;

/// Serials are padded to this width in portal requests.
pub const SERIAL_WIDTH: usize = 7;

const MIN_YEAR: u16 = 1950;
const MAX_YEAR: u16 = 2100;

/// <court hangul run>? <4-digit year> <1-4 hangul type token> <digits>
/// Applied to the normalized form only, so no whitespace can appear.
static CASE_NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<court>[가-힣]*?)(?P<year>\d{4})(?P<kind>[가-힣]{1,4})(?P<serial>\d+)$")
        .expect("case number pattern is a valid regex")
});

/// Characters upstream data uses as decoration around the type token.
const SEPARATORS: &[char] = &['-', '(', ')', '[', ']', '·'];

/// A parsed case identifier. `Display` produces the canonical text form, which
/// parses back to an equal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseIdentifier {
    /// Court designator that preceded the number upstream, if any.
    pub court_code: Option<String>,
    pub year: u16,
    pub type_code: String,
    pub serial: u32,
}

impl CaseIdentifier {
    /// Serial zero-padded to the portal's fixed width.
    pub fn padded_serial(&self) -> String {
        format!("{:0width$}", self.serial, width = SERIAL_WIDTH)
    }

    /// The portal's compact case number: year + type code + padded serial.
    /// Uses the numeric type code where one is known.
    pub fn portal_case_no(&self) -> String {
        let kind = classifier::numeric_type_code(&self.type_code).unwrap_or(&self.type_code);
        format!("{}{}{}", self.year, kind, self.padded_serial())
    }

    /// The identifier without any court prefix. Used as the lookup key.
    pub fn case_key(&self) -> String {
        format!("{}{}{}", self.year, self.type_code, self.serial)
    }
}

impl fmt::Display for CaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(court) = &self.court_code {
            write!(f, "{court}")?;
        }
        write!(f, "{}{}{}", self.year, self.type_code, self.serial)
    }
}

impl FromStr for CaseIdentifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Normalize a raw case number: drop whitespace and separator decoration and
/// fold full-width digits to ASCII.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !SEPARATORS.contains(c))
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            _ => c,
        })
        .collect()
}

/// Parse a raw case number into a [`CaseIdentifier`].
pub fn parse(raw: &str) -> Result<CaseIdentifier, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let normalized = normalize(trimmed);
    let caps = CASE_NUMBER_PATTERN
        .captures(&normalized)
        .ok_or_else(|| ParseError::Malformed(trimmed.to_string()))?;

    let year: u16 = caps["year"]
        .parse()
        .map_err(|_| ParseError::Malformed(trimmed.to_string()))?;
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(ParseError::InvalidYear(year as u32));
    }

    let serial_text = &caps["serial"];
    let significant = serial_text.trim_start_matches('0');
    if significant.is_empty() || significant.len() > SERIAL_WIDTH {
        return Err(ParseError::InvalidSerial(serial_text.to_string()));
    }
    let serial: u32 = significant
        .parse()
        .map_err(|_| ParseError::InvalidSerial(serial_text.to_string()))?;

    let court = &caps["court"];
    Ok(CaseIdentifier {
        court_code: (!court.is_empty()).then(|| court.to_string()),
        year,
        type_code: caps["kind"].to_string(),
        serial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_plain_identifier() {
        let id = parse("2024가단12345").unwrap();
        assert_eq!(id.year, 2024);
        assert_eq!(id.type_code, "가단");
        assert_eq!(id.serial, 12345);
        assert_eq!(id.court_code, None);
    }

    #[test]
    fn test_normalizes_whitespace_separators_and_fullwidth_digits() {
        let id = parse(" ２０２５ (즈기) - 1108 ").unwrap();
        assert_eq!(id.year, 2025);
        assert_eq!(id.type_code, "즈기");
        assert_eq!(id.serial, 1108);
    }

    #[test]
    fn test_strips_court_prefixes() {
        let id = parse("수원가정법원 평택지원 2024드단26718").unwrap();
        assert_eq!(id.court_code.as_deref(), Some("수원가정법원평택지원"));
        assert_eq!(id.case_key(), "2024드단26718");

        let short = parse("평택가정2024드단26718").unwrap();
        assert_eq!(short.court_code.as_deref(), Some("평택가정"));
        assert_eq!(short.type_code, "드단");
    }

    #[test]
    fn test_leading_zero_serials_collapse() {
        let id = parse("2025즈기0001108").unwrap();
        assert_eq!(id.serial, 1108);
        assert_eq!(id.to_string(), "2025즈기1108");
        assert_eq!(id.padded_serial(), "0001108");
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(parse(""), Err(ParseError::Empty));
        assert_eq!(parse("   "), Err(ParseError::Empty));
        assert!(matches!(parse("abc"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("24가단123"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("2024가단"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("2024가단123abc"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("2024가나다라마1"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("2024-12345"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_rejects_out_of_range_year_and_serial() {
        assert_eq!(parse("1800가단1"), Err(ParseError::InvalidYear(1800)));
        assert!(matches!(parse("2024가단0000000"), Err(ParseError::InvalidSerial(_))));
        assert!(matches!(parse("2024가단123456789"), Err(ParseError::InvalidSerial(_))));
    }

    #[test]
    fn test_display_round_trip_is_stable() {
        let inputs = [
            "2024가단12345",
            "서울가정법원 2023드합7",
            "2025 카단 0001234",
            "２０２２고단１",
            "대구지방법원 서부지원2021타채99",
        ];
        for raw in inputs {
            let first = parse(raw).unwrap();
            let again = parse(&first.to_string()).unwrap();
            assert_eq!(first, again, "round trip for {raw}");
        }
    }

    #[test]
    fn test_portal_case_no_uses_numeric_code_when_known() {
        let id = parse("2024드단26718").unwrap();
        assert_eq!(id.portal_case_no(), "20241500026718");

        let unknown = parse("2024가단5").unwrap();
        assert_eq!(unknown.portal_case_no(), "2024가단0000005");
    }

    #[test]
    fn test_from_str() {
        let id: CaseIdentifier = "2024카합100".parse().unwrap();
        assert_eq!(id.type_code, "카합");
        assert!("카합100".parse::<CaseIdentifier>().is_err());
    }
}
