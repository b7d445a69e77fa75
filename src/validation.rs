// 📐 Field Validator - syntactic checks per CSV row
//
// Collects EVERY violation (not fail-fast) so one report lists all problems
// of a row.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::FieldError;
use crate::record::{digits_only, RawRow, DATE_FORMAT};
use crate::states::BrazilianState;

/// Length of a CPF (Brazilian individual taxpayer ID)
pub const DOCUMENT_LENGTH: usize = 11;

pub const MIN_NAME_LENGTH: usize = 2;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$",
    )
    .expect("email pattern is valid")
});

// ============================================================================
// FIELD VALIDATOR
// ============================================================================

pub struct FieldValidator {
    date_format: &'static str,
}

impl Default for FieldValidator {
    fn default() -> Self {
        FieldValidator::new()
    }
}

impl FieldValidator {
    pub fn new() -> Self {
        FieldValidator {
            date_format: DATE_FORMAT,
        }
    }

    /// Validate a raw row, returning all field errors found
    pub fn validate(&self, row: &RawRow) -> Vec<FieldError> {
        let mut errors = Vec::new();

        let name = row.get("name").trim();
        if name.chars().count() < MIN_NAME_LENGTH {
            errors.push(FieldError::new(
                "name",
                format!("Name is required and must have at least {} characters", MIN_NAME_LENGTH),
            ));
        }

        let email = row.get("email").trim();
        if !is_valid_email(email) {
            errors.push(FieldError::new("email", "Email is required and must be a valid address"));
        }

        if let Some(message) = document_problem(row.get("document")) {
            errors.push(FieldError::new("document", message));
        }

        if row.get("city").trim().is_empty() {
            errors.push(FieldError::new("city", "City is required"));
        }

        if let Some(message) = state_problem(row.get("state")) {
            errors.push(FieldError::new("state", message));
        }

        if let Some(message) = self.date_problem(row.get("start_date")) {
            errors.push(FieldError::new("start_date", message));
        }

        errors
    }

    /// Parse then reformat must reproduce the input exactly
    fn date_problem(&self, raw: &str) -> Option<String> {
        let value = raw.trim();
        if value.is_empty() {
            return Some("Start date is required".to_string());
        }

        match NaiveDate::parse_from_str(value, self.date_format) {
            Ok(date) if date.format(self.date_format).to_string() == value => None,
            _ => Some(format!(
                "Start date '{}' is not a calendar date in format YYYY-MM-DD",
                value
            )),
        }
    }
}

pub fn is_valid_email(email: &str) -> bool {
    !email.is_empty() && email.len() <= 254 && EMAIL_RE.is_match(email)
}

fn document_problem(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    if digits.is_empty() {
        return Some("Document (CPF) is required".to_string());
    }
    if !is_valid_cpf(&digits) {
        return Some(format!("Document (CPF) '{}' is not valid", raw.trim()));
    }
    None
}

/// Accepts a 2-letter UF from the fixed set, or a full state name the
/// normalizer can map to one
fn state_problem(raw: &str) -> Option<String> {
    let token = raw.trim();
    if token.is_empty() {
        return Some("State is required".to_string());
    }

    let looks_like_code = token.chars().count() == 2 && token.chars().all(|c| c.is_ascii_alphabetic());
    if looks_like_code {
        return match BrazilianState::from_uf(token) {
            Some(_) => None,
            None => Some(format!("State code '{}' is not a Brazilian state", token)),
        };
    }

    match BrazilianState::from_name(token) {
        Some(_) => None,
        None => Some(format!("State '{}' must be a 2-letter state code (e.g. SP)", token)),
    }
}

// ============================================================================
// CPF CHECKSUM
// ============================================================================

/// Two check digits, each `(sum * 10) % 11` (10 → 0) over weighted digits
pub fn is_valid_cpf(digits: &str) -> bool {
    if digits.len() != DOCUMENT_LENGTH || !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    let d: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();

    // 000.000.000-00, 111.111.111-11, ... pass the checksum but are not issued
    if d.iter().all(|&x| x == d[0]) {
        return false;
    }

    check_digit(&d[..9]) == d[9] && check_digit(&d[..10]) == d[10]
}

fn check_digit(digits: &[u32]) -> u32 {
    let top_weight = digits.len() as u32 + 1;
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, &digit)| digit * (top_weight - i as u32))
        .sum();

    let rest = (sum * 10) % 11;
    if rest == 10 {
        0
    } else {
        rest
    }
}
