//! Brazilian license plate normalization.
//!
//! Two plate grammars are in use: the legacy `LLL-DDDD` and the Mercosul
//! `LLL-DLDD`. OCR routinely confuses `0/O`, `1/I`, `8/B`, `5/S` and `4/A`, so
//! we correct each character according to what its position must hold, then
//! validate against both grammars. Position 4 is a letter in Mercosul plates
//! and a digit in legacy ones, so we can't correct it.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use schemars::JsonSchema;

use crate::prelude::*;

/// What we report when no plate could be read.
pub const PLATE_NOT_FOUND: &str = "NOT_FOUND";

/// Length of a plate without its separator.
const PLATE_LEN: usize = 7;

/// Candidates shorter than this aren't worth trying.
const MIN_CANDIDATE_LEN: usize = 6;

static LEGACY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{3}[0-9]{4}$").expect("failed to compile regex"));

static MERCOSUL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{3}[0-9][A-Z][0-9]{2}$").expect("failed to compile regex")
});

/// Which plate grammar matched.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateFormat {
    /// `LLL-DDDD`.
    Legacy,
    /// `LLL-DLDD`.
    Mercosul,
}

/// The result of plate normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlateText {
    Valid { text: String, format: PlateFormat },
    NotFound,
}

impl PlateText {
    /// The plate text, or [`PLATE_NOT_FOUND`].
    pub fn as_str(&self) -> &str {
        match self {
            PlateText::Valid { text, .. } => text,
            PlateText::NotFound => PLATE_NOT_FOUND,
        }
    }

    /// Did we find a plate?
    pub fn is_found(&self) -> bool {
        matches!(self, PlateText::Valid { .. })
    }
}

impl fmt::Display for PlateText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn digit_to_letter(c: char) -> char {
    match c {
        '0' => 'O',
        '1' => 'I',
        '8' => 'B',
        '5' => 'S',
        '4' => 'A',
        other => other,
    }
}

fn letter_to_digit(c: char) -> char {
    match c {
        'O' => '0',
        'I' => '1',
        'B' => '8',
        'S' => '5',
        'A' => '4',
        other => other,
    }
}

/// Normalize one candidate string.
///
/// Separators and other punctuation are ignored. Candidates are truncated to
/// seven characters before correction.
pub fn normalize_plate(candidate: &str) -> PlateText {
    let cleaned: Vec<char> = candidate
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(PLATE_LEN)
        .collect();
    if cleaned.len() < MIN_CANDIDATE_LEN {
        return PlateText::NotFound;
    }

    let corrected: String = cleaned
        .iter()
        .enumerate()
        .map(|(i, &c)| match i {
            0..=2 => digit_to_letter(c),
            3 | 5 | 6 => letter_to_digit(c),
            _ => c,
        })
        .collect();

    if LEGACY_RE.is_match(&corrected) {
        PlateText::Valid {
            text: corrected,
            format: PlateFormat::Legacy,
        }
    } else if MERCOSUL_RE.is_match(&corrected) {
        PlateText::Valid {
            text: corrected,
            format: PlateFormat::Mercosul,
        }
    } else {
        PlateText::NotFound
    }
}

/// Find a plate in multi-line OCR output.
///
/// Plates are usually on a line of their own, surrounded by "BRASIL" and
/// other badge text, so we try each line before falling back to the whole
/// text run together.
pub fn extract_plate(raw_text: &str) -> PlateText {
    raw_text
        .lines()
        .map(normalize_plate)
        .find(PlateText::is_found)
        .unwrap_or_else(|| {
            let joined: String = raw_text.split_whitespace().collect();
            normalize_plate(&joined)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate(text: &str, format: PlateFormat) -> PlateText {
        PlateText::Valid {
            text: text.to_owned(),
            format,
        }
    }

    #[test]
    fn test_corrects_by_position() {
        assert_eq!(normalize_plate("A8C1234"), plate("ABC1234", PlateFormat::Legacy));
        assert_eq!(normalize_plate("0PQ-I567"), plate("OPQ1567", PlateFormat::Legacy));
        assert_eq!(normalize_plate("bra2e19"), plate("BRA2E19", PlateFormat::Mercosul));
    }

    #[test]
    fn test_fifth_position_is_left_alone() {
        // An `O` there is a valid Mercosul letter, not a misread zero.
        assert_eq!(normalize_plate("ABC1O23"), plate("ABC1O23", PlateFormat::Mercosul));
    }

    #[test]
    fn test_short_or_invalid_is_not_found() {
        assert_eq!(normalize_plate("AB12"), PlateText::NotFound);
        assert_eq!(normalize_plate(""), PlateText::NotFound);
        assert_eq!(normalize_plate("ABC123"), PlateText::NotFound);
        assert_eq!(normalize_plate("ABCDEFG"), PlateText::NotFound);
        assert_eq!(PlateText::NotFound.as_str(), "NOT_FOUND");
    }

    #[test]
    fn test_long_candidates_are_truncated() {
        assert_eq!(normalize_plate("ABC1234XYZ"), plate("ABC1234", PlateFormat::Legacy));
    }

    #[test]
    fn test_idempotent_on_valid_plates() {
        for valid in ["ABC1234", "BRA2E19", "OIB8540", "XYZ9Z99"] {
            let once = normalize_plate(valid);
            assert_eq!(once.as_str(), valid);
            assert_eq!(normalize_plate(once.as_str()), once);
        }
    }

    #[test]
    fn test_extract_prefers_single_lines() {
        let text = "BRASIL\nMERCOSUL\nRIO2A18\nSAO PAULO";
        assert_eq!(extract_plate(text), plate("RIO2A18", PlateFormat::Mercosul));
    }

    #[test]
    fn test_extract_joins_split_plates() {
        assert_eq!(extract_plate("ABC\n1234"), plate("ABC1234", PlateFormat::Legacy));
        assert_eq!(extract_plate("no plate here"), PlateText::NotFound);
    }
}
