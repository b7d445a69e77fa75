// 👤 Employee Record - the reconciled entity
//
// Identity = natural_key (national ID, digits only)
// Values   = name, email, city, state, start_date (observable fields)
// Owner    = owner_id (account notified about changes)

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::states::BrazilianState;

/// Date format accepted in the CSV and stored in the database
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Expected CSV columns (after header normalization)
pub const COLUMNS: [&str; 6] = ["name", "email", "document", "city", "state", "start_date"];

// ============================================================================
// RAW ROW (as read from the file)
// ============================================================================

/// One CSV row as a field map, untouched by cleaning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    fields: HashMap<String, String>,
}

impl RawRow {
    pub fn new() -> Self {
        RawRow::default()
    }

    /// Build a row from header/value pairs; headers are normalized
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let fields = pairs
            .into_iter()
            .map(|(header, value)| (normalize_header(header), value.to_string()))
            .collect();
        RawRow { fields }
    }

    /// Build a row from the positional columns `name,email,document,city,state,start_date`
    pub fn from_values(values: [&str; 6]) -> Self {
        RawRow::from_pairs(COLUMNS.iter().copied().zip(values))
    }

    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.fields.insert(normalize_header(field), value.to_string());
        self
    }

    /// Raw value of a field ("" when the column is absent)
    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or("")
    }

    /// Digits-only document, the form used as natural key
    pub fn document_digits(&self) -> String {
        digits_only(self.get("document"))
    }

    pub fn is_blank(&self) -> bool {
        self.fields.values().all(|v| v.trim().is_empty())
    }
}

/// "Start Date" / "start-date" / " START_DATE " → "start_date"
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace([' ', '-'], "_")
}

pub fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ============================================================================
// EMPLOYEE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeRecord {
    /// Storage id (None until persisted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// National ID, digits only, unique across all records
    pub natural_key: String,

    pub name: String,
    pub email: String,
    pub city: String,
    pub state: BrazilianState,
    pub start_date: NaiveDate,

    /// Owning account (receives notifications)
    pub owner_id: i64,

    /// True between a persisted create/update and a confirmed notification
    pub needs_notification: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EmployeeRecord {
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Display form of the document: 111.444.777-35
    pub fn formatted_document(&self) -> String {
        let d = &self.natural_key;
        if d.len() == 11 {
            format!("{}.{}.{}-{}", &d[0..3], &d[3..6], &d[6..9], &d[9..11])
        } else {
            d.clone()
        }
    }

    /// Copy marked dirty, as written for a create or a real update
    pub fn marked_dirty(&self) -> EmployeeRecord {
        EmployeeRecord {
            needs_notification: true,
            ..self.clone()
        }
    }

    /// JSON shape used in notification bodies and audit events
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "email": self.email,
            "document": self.formatted_document(),
            "city": self.city,
            "state": self.state.uf(),
            "start_date": self.start_date.format(DATE_FORMAT).to_string(),
        })
    }
}

// ============================================================================
// TIMESTAMPS (fixed precision so text order == time order)
// ============================================================================

pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_normalization() {
        assert_eq!(normalize_header(" Start Date "), "start_date");
        assert_eq!(normalize_header("start-date"), "start_date");
        assert_eq!(normalize_header("\u{feff}Name"), "name");
    }

    #[test]
    fn test_raw_row_lookup() {
        let row = RawRow::from_values([
            "John Doe",
            "john@x.com",
            "111.444.777-35",
            "São Paulo",
            "SP",
            "2024-01-15",
        ]);

        assert_eq!(row.get("name"), "John Doe");
        assert_eq!(row.get("missing"), "");
        assert_eq!(row.document_digits(), "11144477735");
        assert!(!row.is_blank());
        assert!(RawRow::new().with("name", "  ").is_blank());
    }

    #[test]
    fn test_formatted_document() {
        let record = EmployeeRecord {
            id: None,
            natural_key: "11144477735".to_string(),
            name: "John Doe".to_string(),
            email: "john@x.com".to_string(),
            city: "São Paulo".to_string(),
            state: BrazilianState::SaoPaulo,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            owner_id: 1,
            needs_notification: false,
            created_at: None,
            updated_at: None,
        };

        assert_eq!(record.formatted_document(), "111.444.777-35");
        assert!(record.marked_dirty().needs_notification);
        assert_eq!(record.summary()["state"], "SP");
    }

    #[test]
    fn test_timestamp_text_order_matches_time_order() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);

        assert!(format_timestamp(early) < format_timestamp(late));
        let parsed = parse_timestamp(&format_timestamp(early)).unwrap();
        assert_eq!(format_timestamp(parsed), format_timestamp(early));
    }
}
