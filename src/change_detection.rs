// 🔍 Change-Detection Engine - create / real update / no change
//
// `decide` compares an incoming NORMALIZED record against the stored record
// for the same natural key. Neither input is mutated; the updated record is
// built fresh from both.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::FieldError;
use crate::record::{EmployeeRecord, DATE_FORMAT};

// ============================================================================
// CHANGE DECISION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDecision {
    /// First sighting of the natural key
    Create(EmployeeRecord),

    /// Stored record differs in at least one observable field
    UpdateWithChanges {
        old: EmployeeRecord,
        new: EmployeeRecord,
        changes: Vec<ChangedField>,
    },

    /// Stored record already matches; nothing is written or notified
    UpdateNoChanges,

    /// Row failed validation or normalization
    Invalid(Vec<FieldError>),
}

impl ChangeDecision {
    /// Record to persist, if this decision writes
    pub fn record_to_write(&self) -> Option<&EmployeeRecord> {
        match self {
            ChangeDecision::Create(record) => Some(record),
            ChangeDecision::UpdateWithChanges { new, .. } => Some(new),
            ChangeDecision::UpdateNoChanges | ChangeDecision::Invalid(_) => None,
        }
    }

    pub fn is_write(&self) -> bool {
        self.record_to_write().is_some()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeDecision::Create(_) => "create",
            ChangeDecision::UpdateWithChanges { .. } => "update",
            ChangeDecision::UpdateNoChanges => "unchanged",
            ChangeDecision::Invalid(_) => "invalid",
        }
    }
}

/// One observable field that differs between stored and incoming values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedField {
    pub field: String,
    pub old: String,
    pub new: String,
}

// ============================================================================
// DECIDE / DIFF
// ============================================================================

/// Decide what to do with `normalized` given the stored record for its key
pub fn decide(normalized: &EmployeeRecord, existing: Option<&EmployeeRecord>) -> ChangeDecision {
    let Some(old) = existing else {
        return ChangeDecision::Create(normalized.marked_dirty());
    };

    let changes = diff(old, normalized);
    if changes.is_empty() {
        return ChangeDecision::UpdateNoChanges;
    }

    // Identity, owner and timestamps carry over from the stored record
    let new = EmployeeRecord {
        id: old.id,
        natural_key: old.natural_key.clone(),
        name: normalized.name.clone(),
        email: normalized.email.clone(),
        city: normalized.city.clone(),
        state: normalized.state,
        start_date: normalized.start_date,
        owner_id: old.owner_id,
        needs_notification: true,
        created_at: old.created_at,
        updated_at: old.updated_at,
    };

    ChangeDecision::UpdateWithChanges {
        old: old.clone(),
        new,
        changes,
    }
}

/// `decide` against a keyed lookup of stored records
pub fn decide_in(
    normalized: &EmployeeRecord,
    existing_by_key: &HashMap<String, EmployeeRecord>,
) -> ChangeDecision {
    decide(normalized, existing_by_key.get(&normalized.natural_key))
}

/// Observable fields that differ; exact (case- and whitespace-sensitive)
/// comparison of normalized values
pub fn diff(old: &EmployeeRecord, new: &EmployeeRecord) -> Vec<ChangedField> {
    let mut changes = Vec::new();

    let mut compare = |field: &str, old_value: String, new_value: String| {
        if old_value != new_value {
            changes.push(ChangedField {
                field: field.to_string(),
                old: old_value,
                new: new_value,
            });
        }
    };

    compare("name", old.name.clone(), new.name.clone());
    compare("email", old.email.clone(), new.email.clone());
    compare("city", old.city.clone(), new.city.clone());
    compare("state", old.state.uf().to_string(), new.state.uf().to_string());
    compare(
        "start_date",
        old.start_date.format(DATE_FORMAT).to_string(),
        new.start_date.format(DATE_FORMAT).to_string(),
    );

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::BrazilianState;
    use chrono::{NaiveDate, Utc};

    fn stored(name: &str, city: &str) -> EmployeeRecord {
        EmployeeRecord {
            id: Some(42),
            natural_key: "11144477735".to_string(),
            name: name.to_string(),
            email: "john@x.com".to_string(),
            city: city.to_string(),
            state: BrazilianState::SaoPaulo,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            owner_id: 1,
            needs_notification: false,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        }
    }

    fn incoming(name: &str, city: &str) -> EmployeeRecord {
        EmployeeRecord {
            id: None,
            owner_id: 9,
            created_at: None,
            updated_at: None,
            ..stored(name, city)
        }
    }

    #[test]
    fn test_not_found_creates() {
        let decision = decide(&incoming("A", "X"), None);

        match decision {
            ChangeDecision::Create(record) => {
                assert!(record.needs_notification);
                assert_eq!(record.owner_id, 9);
            }
            other => panic!("expected Create, got {:?}", other),
        }
    }

    #[test]
    fn test_changed_city_updates() {
        let old = stored("A", "X");
        let decision = decide(&incoming("A", "Y"), Some(&old));

        match decision {
            ChangeDecision::UpdateWithChanges { old: before, new, changes } => {
                assert_eq!(before, old, "old record is passed through untouched");
                assert_eq!(new.city, "Y");
                assert_eq!(new.id, Some(42));
                assert_eq!(new.owner_id, 1, "owner carries over from the stored record");
                assert!(new.needs_notification);
                assert_eq!(new.created_at, old.created_at);
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].field, "city");
                assert_eq!(changes[0].old, "X");
                assert_eq!(changes[0].new, "Y");
            }
            other => panic!("expected UpdateWithChanges, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_is_no_change() {
        let old = stored("A", "X");
        let decision = decide(&incoming("A", "X"), Some(&old));

        assert_eq!(decision, ChangeDecision::UpdateNoChanges);
        assert!(!decision.is_write());
    }

    #[test]
    fn test_comparison_is_case_sensitive() {
        let old = stored("A", "X");
        let decision = decide(&incoming("a", "X"), Some(&old));
        assert_eq!(decision.kind(), "update");
    }

    #[test]
    fn test_ignores_owner_and_flags() {
        let mut old = stored("A", "X");
        old.needs_notification = true;
        old.owner_id = 3;

        assert_eq!(decide(&incoming("A", "X"), Some(&old)), ChangeDecision::UpdateNoChanges);
    }

    #[test]
    fn test_decide_in_map() {
        let mut existing = HashMap::new();
        existing.insert("11144477735".to_string(), stored("A", "X"));

        assert_eq!(decide_in(&incoming("A", "X"), &existing), ChangeDecision::UpdateNoChanges);
        assert_eq!(decide_in(&incoming("A", "X"), &HashMap::new()).kind(), "create");
    }

    #[test]
    fn test_diff_lists_every_changed_field() {
        let old = stored("A", "X");
        let mut new = incoming("B", "Y");
        new.state = BrazilianState::Bahia;

        let fields: Vec<String> = diff(&old, &new).into_iter().map(|c| c.field).collect();
        assert_eq!(fields, vec!["name", "city", "state"]);
    }
}
