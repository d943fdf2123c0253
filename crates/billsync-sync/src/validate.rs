use billsync_core::{CandidateRecord, SourceValue};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed record before it is stored. An empty result means valid.
pub fn validate(candidate: &CandidateRecord) -> Vec<Violation> {
    let mut violations = Vec::new();
    let bill = &candidate.bill_id;

    if bill.bill_type.trim().is_empty() {
        violations.push(Violation::new("bill_type", "bill type is empty"));
    }
    if bill.number < 1 {
        violations.push(Violation::new("bill_number", "bill number must be at least 1"));
    }
    if bill.to_string().trim().is_empty() {
        violations.push(Violation::new("bill_id", "bill id is empty"));
    }
    if candidate.description.trim().is_empty() {
        violations.push(Violation::new("description", "description is blank"));
    }
    if candidate.status.as_str().is_empty() {
        violations.push(Violation::new("status", "status label is empty"));
    }

    for (field, names) in [
        ("primary_authors", &candidate.primary_authors),
        ("co_authors", &candidate.co_authors),
        ("sponsors", &candidate.sponsors),
        ("co_sponsors", &candidate.co_sponsors),
        ("subjects", &candidate.subjects),
    ] {
        if names.iter().any(|n| n.trim().is_empty()) {
            violations.push(Violation::new(field, "contains a blank entry"));
        }
    }

    check_date(&mut violations, "last_action_date", &candidate.last_action_date);
    check_date(&mut violations, "last_updated", &candidate.last_updated);
    for (idx, action) in candidate.actions.iter().enumerate() {
        check_date(&mut violations, &format!("actions[{idx}].date"), &action.date);
    }

    violations
}

fn check_date<T>(violations: &mut Vec<Violation>, field: &str, value: &SourceValue<T>) {
    if value.is_unparsed() {
        violations.push(Violation::new(
            field,
            format!(
                "unrecognized date {:?}",
                value.raw.as_deref().unwrap_or_default()
            ),
        ));
    }
}

#[cfg(test)]
mod tests {
    use billsync_core::{BillAction, BillId, BillStatus};
    use chrono::NaiveDate;

    use super::*;

    fn candidate() -> CandidateRecord {
        CandidateRecord {
            bill_id: BillId::new("HB", 4),
            description: "Relating to water.".into(),
            primary_authors: vec!["King".into()],
            co_authors: vec![],
            sponsors: vec![],
            co_sponsors: vec![],
            subjects: vec![],
            committees: vec![],
            actions: vec![BillAction {
                number: Some("H001".into()),
                chamber: Some("House".into()),
                date: SourceValue::parsed(
                    NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(),
                    "01/09/2025",
                ),
                description: "Filed".into(),
                comment: None,
            }],
            status: BillStatus::Filed,
            last_action: Some("Filed".into()),
            last_action_date: SourceValue::empty(),
            last_updated: SourceValue::empty(),
            full_text_url: None,
            companion: None,
        }
    }

    #[test]
    fn well_formed_record_has_no_violations() {
        assert!(validate(&candidate()).is_empty());
    }

    #[test]
    fn blank_description_and_bad_number_are_reported() {
        let mut record = candidate();
        record.description = "   ".into();
        record.bill_id = BillId::new("HB", 0);
        let fields: Vec<String> = validate(&record).into_iter().map(|v| v.field).collect();
        assert!(fields.contains(&"description".to_string()));
        assert!(fields.contains(&"bill_number".to_string()));
    }

    #[test]
    fn unparsed_dates_are_violations_but_absent_dates_are_not() {
        let mut record = candidate();
        record.actions[0].date = SourceValue::from_raw("02/30/2025", |_| None::<NaiveDate>);
        record.last_updated = SourceValue::from_raw("sometime", |_| None);
        let violations = validate(&record);
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["last_updated", "actions[0].date"]);
        assert!(violations[1].message.contains("02/30/2025"));
    }

    #[test]
    fn blank_list_entries_are_reported() {
        let mut record = candidate();
        record.subjects = vec!["Water".into(), " ".into()];
        let violations = validate(&record);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "subjects");
    }
}
