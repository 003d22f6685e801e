//! Total field extractors shared by catalog and offering records.
//!
//! Every function here is total: a missing pattern yields the documented
//! sentinel (`-1` or an empty string) instead of an error.

use std::sync::LazyLock;

use regex::Regex;

/// Sentinel for an integer field that could not be extracted.
pub const MISSING: i32 = -1;

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{4}").expect("year pattern compiles"));
static DEPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{3,4})\b").expect("dept pattern compiles"));
static BOUNDED_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9]{3,4})\b").expect("number pattern compiles"));
static LOOSE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{3,4}").expect("number pattern compiles"));
static ROMAN_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+(X|IX|VIII|VII|VI|V|IV|III|II|I)$").expect("roman pattern compiles")
});

const ROMAN_NUMERALS: [&str; 10] = ["I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X"];

/// Lower-case and drop every non-alphanumeric character.
pub fn normalize_alnum(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// First run of four digits in a catalog year string such as `2024-2025`.
pub fn parse_catalog_year(year_text: &str) -> i32 {
    YEAR_RE
        .find(year_text.trim())
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(MISSING)
}

/// Offering years are a bare integer string.
pub fn parse_offering_year(year_text: &str) -> i32 {
    year_text.trim().parse().unwrap_or(MISSING)
}

/// First standalone run of 3-4 uppercase letters, e.g. `ENGL` in `ENGL 1310`.
pub fn dept_code(code: &str) -> String {
    DEPT_RE
        .captures(code.trim())
        .map(|c| c[1].to_string())
        .unwrap_or_default()
}

/// Word-bounded 3-4 digit course number used on the catalog side.
pub fn course_number(code: &str) -> String {
    BOUNDED_NUMBER_RE
        .captures(code)
        .map(|c| c[1].to_string())
        .unwrap_or_default()
}

/// Leading digit of a course number, or [`MISSING`].
pub fn grade_level(course_number: &str) -> i32 {
    course_number
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as i32)
        .unwrap_or(MISSING)
}

/// Unbounded 3-4 digit run; offering codes like `CSCE1030` still yield `1030`.
pub fn loose_course_number(code: &str) -> String {
    LOOSE_NUMBER_RE
        .find(code.trim())
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// First digit anywhere in the code.
pub fn loose_grade_level(code: &str) -> i32 {
    code.trim()
        .chars()
        .find_map(|c| c.to_digit(10))
        .map(|d| d as i32)
        .unwrap_or(MISSING)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SemanticName {
    pub base: String,
    pub roman_numeral: String,
    pub subtitle: String,
}

/// Split `Calculus I: Limits` into base `Calculus`, numeral `I`, subtitle `Limits`.
pub fn split_semantic_name(name: &str) -> SemanticName {
    let name = name.trim();
    let (head, subtitle) = match name.split_once(':') {
        Some((head, rest)) => (head.trim(), rest.trim().to_string()),
        None => (name, String::new()),
    };

    match ROMAN_SUFFIX_RE.captures(head) {
        Some(caps) => {
            let whole = caps.get(0).expect("group 0 always present");
            SemanticName {
                base: head[..whole.start()].trim().to_string(),
                roman_numeral: caps[1].to_string(),
                subtitle,
            }
        }
        None => SemanticName {
            base: head.to_string(),
            roman_numeral: String::new(),
            subtitle,
        },
    }
}

/// `I` = 1 through `X` = 10.
pub fn roman_rank(numeral: &str) -> Option<u8> {
    ROMAN_NUMERALS
        .iter()
        .position(|n| *n == numeral)
        .map(|idx| idx as u8 + 1)
}
