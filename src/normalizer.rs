// 🧹 Record Normalizer - raw row → canonical EmployeeRecord
//
// Change detection compares NORMALIZED values, so every cleaning rule lives
// here and nowhere else. The input row is never mutated.

use chrono::NaiveDate;

use crate::error::NormalizationError;
use crate::record::{digits_only, EmployeeRecord, RawRow, DATE_FORMAT};
use crate::states::BrazilianState;

/// Normalize a raw row into an unsaved record owned by `owner_id`
///
/// - strings trimmed (inner spacing and case preserved)
/// - document reduced to digits
/// - state token (UF or full name) mapped to the canonical UF
/// - start date parsed into a calendar date
pub fn normalize(row: &RawRow, owner_id: i64) -> Result<EmployeeRecord, NormalizationError> {
    let natural_key = digits_only(row.get("document"));
    if natural_key.is_empty() {
        return Err(NormalizationError::MissingField("document"));
    }

    let state_token = row.get("state").trim();
    let state = BrazilianState::resolve(state_token)
        .ok_or_else(|| NormalizationError::UnknownState(state_token.to_string()))?;

    let start_date = parse_date(row.get("start_date"))?;

    Ok(EmployeeRecord {
        id: None,
        natural_key,
        name: row.get("name").trim().to_string(),
        email: row.get("email").trim().to_string(),
        city: row.get("city").trim().to_string(),
        state,
        start_date,
        owner_id,
        needs_notification: false,
        created_at: None,
        updated_at: None,
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate, NormalizationError> {
    let value = raw.trim();
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| NormalizationError::InvalidDate(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(state: &str) -> RawRow {
        RawRow::from_values([
            "  John Doe  ",
            "  JOHN@x.com ",
            "111.444.777-35",
            "  São Paulo  ",
            state,
            "2024-01-15",
        ])
    }

    #[test]
    fn test_normalizes_scenario_row() {
        let record = normalize(&row("SP"), 7).unwrap();

        assert_eq!(record.natural_key, "11144477735");
        assert_eq!(record.name, "John Doe");
        assert_eq!(record.email, "JOHN@x.com", "email case is preserved");
        assert_eq!(record.city, "São Paulo");
        assert_eq!(record.state, BrazilianState::SaoPaulo);
        assert_eq!(record.start_date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(record.owner_id, 7);
        assert!(!record.needs_notification);
        assert!(record.id.is_none());
    }

    #[test]
    fn test_maps_full_state_names() {
        assert_eq!(normalize(&row(" sao paulo "), 1).unwrap().state, BrazilianState::SaoPaulo);
        assert_eq!(normalize(&row("rj"), 1).unwrap().state, BrazilianState::RioDeJaneiro);
    }

    #[test]
    fn test_unknown_state() {
        let err = normalize(&row("Narnia"), 1).unwrap_err();
        assert_eq!(err, NormalizationError::UnknownState("Narnia".to_string()));
        assert_eq!(err.to_field_error().field, "state");
    }

    #[test]
    fn test_invalid_date() {
        let input = row("SP").with("start_date", "2024-02-30");
        assert_eq!(
            normalize(&input, 1).unwrap_err(),
            NormalizationError::InvalidDate("2024-02-30".to_string())
        );
    }

    #[test]
    fn test_missing_document() {
        let input = row("SP").with("document", "--");
        assert_eq!(normalize(&input, 1).unwrap_err(), NormalizationError::MissingField("document"));
    }

    #[test]
    fn test_input_row_is_untouched() {
        let input = row("SP");
        let before = input.clone();
        let _ = normalize(&input, 1);
        assert_eq!(input, before);
    }
}
