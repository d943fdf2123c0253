use billsync_core::{CandidateRecord, StoredBill};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::store::{StoreError, SyncStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Insert or refresh the stored bill for `candidate`, keyed by bill id.
///
/// An existing row keeps its `id` and `created_at`; `updated_at` moves only
/// when a stored field actually changes. Stored full text is replaced only by
/// newly available text.
pub async fn upsert(
    store: &dyn SyncStore,
    session_id: &str,
    candidate: &CandidateRecord,
    full_text: Option<String>,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    store.ensure_session(session_id).await?;
    let bill_id = candidate.bill_id.to_string();

    let Some(existing) = store.find_bill(&bill_id).await? else {
        let bill = StoredBill {
            id: Uuid::new_v4(),
            bill_id,
            bill_type: candidate.bill_id.bill_type.clone(),
            bill_number: candidate.bill_id.number,
            session_id: session_id.to_string(),
            description: String::new(),
            primary_authors: Vec::new(),
            co_authors: Vec::new(),
            sponsors: Vec::new(),
            co_sponsors: Vec::new(),
            subjects: Vec::new(),
            committees: Vec::new(),
            actions: Vec::new(),
            status: candidate.status,
            last_action: None,
            last_action_date: None,
            last_updated: None,
            full_text_url: None,
            full_text: None,
            companion: None,
            created_at: now,
            updated_at: now,
        };
        let bill = merge(bill, session_id, candidate, full_text);
        store.insert_bill(&bill).await?;
        debug!(bill_id = %bill.bill_id, "bill created");
        return Ok(UpsertOutcome::Created);
    };

    let mut merged = merge(existing.clone(), session_id, candidate, full_text);
    if merged != existing {
        merged.updated_at = now;
        store.update_bill(&merged).await?;
        debug!(bill_id = %merged.bill_id, "bill changed");
    }
    Ok(UpsertOutcome::Updated)
}

fn merge(
    mut bill: StoredBill,
    session_id: &str,
    candidate: &CandidateRecord,
    full_text: Option<String>,
) -> StoredBill {
    bill.session_id = session_id.to_string();
    bill.description = candidate.description.clone();
    bill.primary_authors = candidate.primary_authors.clone();
    bill.co_authors = candidate.co_authors.clone();
    bill.sponsors = candidate.sponsors.clone();
    bill.co_sponsors = candidate.co_sponsors.clone();
    bill.subjects = candidate.subjects.clone();
    bill.committees = candidate.committees.clone();
    bill.actions = candidate.actions.clone();
    bill.status = candidate.status;
    bill.last_action = candidate.last_action.clone();
    bill.last_action_date = candidate.last_action_date.value;
    bill.last_updated = candidate.last_updated.value;
    bill.full_text_url = candidate.full_text_url.clone();
    bill.companion = candidate.companion.clone();
    if let Some(text) = full_text {
        bill.full_text = Some(text);
    }
    bill
}

#[cfg(test)]
mod tests {
    use billsync_core::{BillId, BillStatus, SourceValue};
    use chrono::Duration;

    use super::*;
    use crate::store::MemorySyncStore;

    fn candidate() -> CandidateRecord {
        CandidateRecord {
            bill_id: BillId::new("SB", 12),
            description: "Relating to parental rights.".into(),
            primary_authors: vec!["Middleton".into()],
            co_authors: vec![],
            sponsors: vec![],
            co_sponsors: vec![],
            subjects: vec!["Minors (I0560)".into()],
            committees: vec![],
            actions: vec![],
            status: BillStatus::Filed,
            last_action: None,
            last_action_date: SourceValue::empty(),
            last_updated: SourceValue::empty(),
            full_text_url: Some("https://example.test/SB00012I.htm".into()),
            companion: None,
        }
    }

    #[tokio::test]
    async fn first_upsert_creates_and_repeat_is_a_no_op_update() {
        let store = MemorySyncStore::new();
        let t0 = Utc::now();
        let record = candidate();

        let first = upsert(&store, "89R", &record, Some("AN ACT".into()), t0).await.unwrap();
        assert_eq!(first, UpsertOutcome::Created);
        let created = store.bills().await.remove(0);
        assert_eq!(created.bill_id, "SB 12");
        assert_eq!(created.created_at, t0);
        assert_eq!(store.sessions().await, vec!["89R".to_string()]);

        let later = t0 + Duration::minutes(5);
        let second = upsert(&store, "89R", &record, Some("AN ACT".into()), later).await.unwrap();
        assert_eq!(second, UpsertOutcome::Updated);
        let bills = store.bills().await;
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0], created);
    }

    #[tokio::test]
    async fn changes_bump_updated_at_and_keep_identity() {
        let store = MemorySyncStore::new();
        let t0 = Utc::now();
        upsert(&store, "89R", &candidate(), None, t0).await.unwrap();
        let before = store.bills().await.remove(0);

        let mut record = candidate();
        record.status = BillStatus::InCommittee;
        let t1 = t0 + Duration::hours(1);
        upsert(&store, "89R", &record, None, t1).await.unwrap();
        let after = store.bills().await.remove(0);

        assert_eq!(after.id, before.id);
        assert_eq!(after.created_at, t0);
        assert_eq!(after.updated_at, t1);
        assert_eq!(after.status, BillStatus::InCommittee);
    }

    #[tokio::test]
    async fn stored_full_text_survives_a_fetch_that_found_none() {
        let store = MemorySyncStore::new();
        let t0 = Utc::now();
        upsert(&store, "89R", &candidate(), Some("AN ACT".into()), t0).await.unwrap();
        upsert(&store, "89R", &candidate(), None, t0 + Duration::hours(1))
            .await
            .unwrap();
        let bill = store.bills().await.remove(0);
        assert_eq!(bill.full_text.as_deref(), Some("AN ACT"));
        assert_eq!(bill.updated_at, t0);
    }
}
