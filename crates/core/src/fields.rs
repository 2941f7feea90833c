//! Field kinds and the conversion of raw cell text into typed writes.
//!
//! Every supported downstream field kind is a [`FieldSpec`] variant, and
//! every conversion returns either a [`FieldValue`] of the matching kind or
//! a [`ConversionError`]. There is no untyped fallback.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Field kinds
// ---------------------------------------------------------------------------

/// A selectable option of a choice field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub name: String,
}

/// Type information for one mapped downstream field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSpec {
    Text,
    Numeric,
    Currency {
        /// ISO 4217 code forwarded with every amount, if the field has one.
        #[serde(default)]
        code: Option<String>,
    },
    Date,
    Choice { options: Vec<ChoiceOption> },
}

impl FieldSpec {
    /// Convert a raw, non-blank cell value into a typed write value.
    pub fn convert(&self, raw: &str, opts: &ParseOptions) -> Result<FieldValue, ConversionError> {
        match self {
            FieldSpec::Text => Ok(FieldValue::Text(raw.trim().to_string())),
            FieldSpec::Numeric => parse_number(raw, opts.locale).map(FieldValue::Numeric),
            FieldSpec::Currency { code } => Ok(FieldValue::Currency {
                amount: parse_currency(raw, opts.locale)?,
                code: code.clone(),
            }),
            FieldSpec::Date => parse_date(raw, opts.date_order).map(FieldValue::Date),
            FieldSpec::Choice { options } => {
                resolve_choice(raw, options).map(|option_id| FieldValue::Choice { option_id })
            }
        }
    }
}

/// A typed value ready to be written to a downstream field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Numeric(f64),
    Currency { amount: f64, code: Option<String> },
    Date(Timestamp),
    Choice { option_id: String },
}

// ---------------------------------------------------------------------------
// Parse options
// ---------------------------------------------------------------------------

/// Decimal/grouping convention used by numeric and currency cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberLocale {
    /// `1,234.56`
    #[default]
    En,
    /// `1.234,56`
    Eu,
}

/// Component order for ambiguous `a/b/yyyy` dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateOrder {
    #[default]
    Mdy,
    Dmy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    pub locale: NumberLocale,
    pub date_order: DateOrder,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("'{0}' is not a valid number")]
    InvalidNumber(String),

    #[error("'{0}' is not a valid currency amount")]
    InvalidCurrency(String),

    #[error("'{0}' is not a recognised date")]
    InvalidDate(String),

    #[error("'{value}' does not match any option (expected one of: {expected})")]
    UnknownOption { value: String, expected: String },
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

/// Parse a locale-formatted number.
///
/// The locale's group separator (or a space) is accepted only between
/// digit groups of the integer part: one to three leading digits, then
/// groups of exactly three. Exponents, `inf` and `NaN` are rejected.
pub fn parse_number(raw: &str, locale: NumberLocale) -> Result<f64, ConversionError> {
    let text = raw.trim();
    let invalid = || ConversionError::InvalidNumber(text.to_string());

    let (group, decimal) = match locale {
        NumberLocale::En => (',', '.'),
        NumberLocale::Eu => ('.', ','),
    };

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let (int_part, frac_part) = match unsigned.split_once(decimal) {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (unsigned, None),
    };

    let digits = ungroup(int_part, group).ok_or_else(invalid)?;
    let mut normalized = String::with_capacity(text.len());
    if negative {
        normalized.push('-');
    }
    normalized.push_str(if digits.is_empty() { "0" } else { &digits });

    let frac = frac_part.unwrap_or("");
    if !frac.chars().all(|c| c.is_ascii_digit()) || (digits.is_empty() && frac.is_empty()) {
        return Err(invalid());
    }
    if !frac.is_empty() {
        normalized.push('.');
        normalized.push_str(frac);
    }

    normalized
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(invalid)
}

/// Strip well-placed group separators from an integer part.
///
/// Returns `None` when a separator is misplaced or a non-digit appears.
fn ungroup(int_part: &str, group: char) -> Option<String> {
    let is_separator = |c: char| c == group || c == ' ' || c == '\u{a0}';
    if !int_part.contains(is_separator) {
        return int_part
            .chars()
            .all(|c| c.is_ascii_digit())
            .then(|| int_part.to_string());
    }

    let mut groups = int_part.split(is_separator);
    let first = groups.next()?;
    if first.is_empty() || first.len() > 3 || !first.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut digits = first.to_string();
    for g in groups {
        if g.len() != 3 || !g.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.push_str(g);
    }
    Some(digits)
}

/// Currency symbols stripped before parsing an amount.
const CURRENCY_SYMBOLS: [char; 7] = ['$', '€', '£', '¥', '₹', '₩', '₽'];

/// ISO 4217 codes recognised as a leading or trailing amount label.
const CURRENCY_CODES: [&str; 24] = [
    "AUD", "BRL", "CAD", "CHF", "CNY", "CZK", "DKK", "EUR", "GBP", "HKD", "HUF", "INR",
    "JPY", "KRW", "MXN", "NOK", "NZD", "PLN", "RUB", "SEK", "SGD", "TRY", "USD", "ZAR",
];

/// Parse a currency amount: symbols and a leading/trailing ISO currency
/// code are stripped, `(12.50)` is read as a negative amount.
pub fn parse_currency(raw: &str, locale: NumberLocale) -> Result<f64, ConversionError> {
    let invalid = || ConversionError::InvalidCurrency(raw.trim().to_string());

    let mut text = raw.trim();
    let mut negative = false;
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        negative = true;
        text = inner.trim();
    }

    let without_symbols: String = text
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c))
        .collect();
    let stripped = strip_currency_code(without_symbols.trim());

    let amount = parse_number(stripped, locale).map_err(|_| invalid())?;
    Ok(if negative { -amount.abs() } else { amount })
}

fn strip_currency_code(text: &str) -> &str {
    let is_code = |s: &str| CURRENCY_CODES.iter().any(|code| code.eq_ignore_ascii_case(s));

    let mut out = text;
    if out.len() > 3 && out.is_char_boundary(3) && is_code(&out[..3]) {
        out = out[3..].trim_start();
    }
    if out.len() > 3 && out.is_char_boundary(out.len() - 3) && is_code(&out[out.len() - 3..]) {
        out = out[..out.len() - 3].trim_end();
    }
    out
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse a date or date-time into its canonical UTC instant.
///
/// Accepted: RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS`, `YYYY/MM/DD`,
/// and `a/b/y`, `a.b.y`, `a-b-y` read according to `order`. Two-digit
/// years below 70 are 20xx, the rest 19xx. Date-only values resolve to
/// midnight UTC.
pub fn parse_date(raw: &str, order: DateOrder) -> Result<Timestamp, ConversionError> {
    let text = raw.trim();
    let invalid = || ConversionError::InvalidDate(text.to_string());

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    let parts: Vec<&str> = text.split(['/', '.', '-']).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit())) {
        return Err(invalid());
    }
    let nums: Vec<u32> = parts
        .iter()
        .map(|p| p.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid())?;

    let (year, month, day) = if parts[0].len() == 4 {
        (nums[0] as i32, nums[1], nums[2])
    } else {
        let year = expand_year(parts[2], nums[2]).ok_or_else(invalid)?;
        match order {
            DateOrder::Mdy => (year, nums[0], nums[1]),
            DateOrder::Dmy => (year, nums[1], nums[0]),
        }
    };

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(invalid)
}

fn expand_year(text: &str, value: u32) -> Option<i32> {
    match text.len() {
        4 => Some(value as i32),
        2 if value < 70 => Some(2000 + value as i32),
        2 => Some(1900 + value as i32),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Choices
// ---------------------------------------------------------------------------

/// Resolve an option name (case-insensitive, trimmed) or an exact option
/// id to the option id.
pub fn resolve_choice(raw: &str, options: &[ChoiceOption]) -> Result<String, ConversionError> {
    let wanted = raw.trim();
    let wanted_lower = wanted.to_lowercase();

    options
        .iter()
        .find(|o| o.name.trim().to_lowercase() == wanted_lower)
        .or_else(|| options.iter().find(|o| o.id == wanted))
        .map(|o| o.id.clone())
        .ok_or_else(|| ConversionError::UnknownOption {
            value: wanted.to_string(),
            expected: options
                .iter()
                .map(|o| o.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
}
