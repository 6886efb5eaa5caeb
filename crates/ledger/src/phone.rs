//! Phone number normalization
//!
//! Providers and staff enter numbers as `0712 345 678`, `+254712345678`,
//! `712345678` or `00254712345678`. Everything is reduced to the bare
//! international form (`254712345678`) before any lookup; matching is exact
//! string equality on that form.

/// Default country calling code (Kenya)
pub const DEFAULT_COUNTRY_CODE: &str = "254";

/// Subscriber numbers shorter than this cannot be a mobile number
const MIN_SUBSCRIBER_DIGITS: usize = 9;

/// Normalize a phone number to `<country code><subscriber number>`.
///
/// Returns `None` for empty input, input that is too short, or input that is
/// not a phone number at all (e.g. a hashed MSISDN).
pub fn normalize(raw: &str, country_code: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.chars().any(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let mut digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    }

    let normalized = if digits.starts_with(country_code)
        && digits.len() >= country_code.len() + MIN_SUBSCRIBER_DIGITS
    {
        digits
    } else if let Some(local) = digits.strip_prefix('0') {
        format!("{country_code}{local}")
    } else if digits.len() == MIN_SUBSCRIBER_DIGITS {
        format!("{country_code}{digits}")
    } else {
        digits
    };

    if normalized.len() < country_code.len() + MIN_SUBSCRIBER_DIGITS {
        return None;
    }

    Some(normalized)
}

/// Whether a directory phone, stored as entered, is the normalized number
///
/// Every store matches through this so a guardian saved as `0712 345 678`
/// resolves the same way in memory and in Postgres.
pub fn matches(stored: &str, normalized: &str, country_code: &str) -> bool {
    normalize(stored, country_code).is_some_and(|p| p == normalized)
}

/// Trailing subscriber digits of a number, ignoring all formatting
///
/// Normalization only rewrites the prefix, so two spellings of the same
/// number always share this key. Stores use it to narrow candidates before
/// applying [`matches`]; the SQL form is
/// `right(regexp_replace(phone, '[^0-9]', '', 'g'), 9)`.
pub fn match_key(raw: &str) -> Option<String> {
    let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_SUBSCRIBER_DIGITS {
        return None;
    }
    Some(digits[digits.len() - MIN_SUBSCRIBER_DIGITS..].iter().collect())
}
