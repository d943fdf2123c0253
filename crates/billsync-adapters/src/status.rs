//! Bill status heuristic over the action log.

use billsync_core::{BillAction, BillStatus};

pub struct StatusRule {
    pub status: BillStatus,
    /// Lower-case phrases; the rule matches when any action description contains one.
    pub phrases: &'static [&'static str],
}

/// Evaluated top to bottom; the first matching rule decides. Stored statuses
/// depend on this order, so reordering or tightening a phrase reclassifies
/// existing bills.
pub const STATUS_RULES: &[StatusRule] = &[
    StatusRule {
        status: BillStatus::Vetoed,
        phrases: &["vetoed by the governor"],
    },
    StatusRule {
        status: BillStatus::Signed,
        phrases: &["signed by the governor"],
    },
    StatusRule {
        status: BillStatus::SentToGovernor,
        phrases: &["sent to the governor"],
    },
    StatusRule {
        status: BillStatus::Passed,
        phrases: &["passed"],
    },
    StatusRule {
        status: BillStatus::InCommittee,
        phrases: &["committee", "referred to"],
    },
];

pub fn classify_status(actions: &[BillAction]) -> BillStatus {
    let descriptions: Vec<String> = actions
        .iter()
        .map(|a| a.description.to_lowercase())
        .collect();
    STATUS_RULES
        .iter()
        .find(|rule| {
            rule.phrases
                .iter()
                .any(|phrase| descriptions.iter().any(|d| d.contains(phrase)))
        })
        .map(|rule| rule.status)
        .unwrap_or(BillStatus::Filed)
}
