//! Core domain model for billsync: bill records and synchronization jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "billsync-core";

/// Natural key of a bill: type code plus number, displayed as `"HB 1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillId {
    pub bill_type: String,
    pub number: u32,
}

impl BillId {
    pub fn new(bill_type: impl Into<String>, number: u32) -> Self {
        Self {
            bill_type: bill_type.into(),
            number,
        }
    }
}

impl fmt::Display for BillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.bill_type, self.number)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid bill identifier {0:?}")]
pub struct BillIdParseError(pub String);

impl FromStr for BillId {
    type Err = BillIdParseError;

    /// Accepts `"HB 1"`, `"HB1"` and `"hb  001"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let split = compact
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| BillIdParseError(s.to_string()))?;
        let (prefix, digits) = compact.split_at(split);
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillIdParseError(s.to_string()));
        }
        let number: u32 = digits.parse().map_err(|_| BillIdParseError(s.to_string()))?;
        if number == 0 {
            return Err(BillIdParseError(s.to_string()));
        }
        Ok(Self::new(prefix.to_ascii_uppercase(), number))
    }
}

/// A parsed value paired with the source text it was read from.
///
/// `raw` without `value` means the source carried something that could not be
/// interpreted; both empty means the source had nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceValue<T> {
    pub value: Option<T>,
    pub raw: Option<String>,
}

impl<T> Default for SourceValue<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> SourceValue<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            raw: None,
        }
    }

    pub fn parsed(value: T, raw: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            raw: Some(raw.into()),
        }
    }

    /// Wrap raw text with the outcome of parsing it. Blank text becomes empty.
    pub fn from_raw(raw: &str, parse: impl FnOnce(&str) -> Option<T>) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::empty();
        }
        Self {
            value: parse(trimmed),
            raw: Some(trimmed.to_string()),
        }
    }

    pub fn is_unparsed(&self) -> bool {
        self.value.is_none() && self.raw.as_deref().is_some_and(|r| !r.trim().is_empty())
    }
}

/// Legislative progress derived from a bill's action log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Filed,
    InCommittee,
    Passed,
    SentToGovernor,
    Signed,
    Vetoed,
}

impl BillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filed => "FILED",
            Self::InCommittee => "IN_COMMITTEE",
            Self::Passed => "PASSED",
            Self::SentToGovernor => "SENT_TO_GOVERNOR",
            Self::Signed => "SIGNED",
            Self::Vetoed => "VETOED",
        }
    }
}

impl fmt::Display for BillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for BillStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FILED" => Ok(Self::Filed),
            "IN_COMMITTEE" => Ok(Self::InCommittee),
            "PASSED" => Ok(Self::Passed),
            "SENT_TO_GOVERNOR" => Ok(Self::SentToGovernor),
            "SIGNED" => Ok(Self::Signed),
            "VETOED" => Ok(Self::Vetoed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeReferral {
    pub chamber: String,
    pub name: String,
    pub status: String,
}

/// One entry of a bill's chronological action log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillAction {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub chamber: Option<String>,
    #[serde(default)]
    pub date: SourceValue<NaiveDate>,
    pub description: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Parser output for one bill, not yet validated or stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub bill_id: BillId,
    pub description: String,
    #[serde(default)]
    pub primary_authors: Vec<String>,
    #[serde(default)]
    pub co_authors: Vec<String>,
    #[serde(default)]
    pub sponsors: Vec<String>,
    #[serde(default)]
    pub co_sponsors: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub committees: Vec<CommitteeReferral>,
    #[serde(default)]
    pub actions: Vec<BillAction>,
    pub status: BillStatus,
    #[serde(default)]
    pub last_action: Option<String>,
    #[serde(default)]
    pub last_action_date: SourceValue<NaiveDate>,
    #[serde(default)]
    pub last_updated: SourceValue<DateTime<Utc>>,
    #[serde(default)]
    pub full_text_url: Option<String>,
    #[serde(default)]
    pub companion: Option<String>,
}

/// Persisted bill. Superset of [`CandidateRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBill {
    pub id: Uuid,
    pub bill_id: String,
    pub bill_type: String,
    pub bill_number: u32,
    pub session_id: String,
    pub description: String,
    pub primary_authors: Vec<String>,
    pub co_authors: Vec<String>,
    pub sponsors: Vec<String>,
    pub co_sponsors: Vec<String>,
    pub subjects: Vec<String>,
    pub committees: Vec<CommitteeReferral>,
    pub actions: Vec<BillAction>,
    pub status: BillStatus,
    pub last_action: Option<String>,
    pub last_action_date: Option<NaiveDate>,
    pub last_updated: Option<DateTime<Utc>>,
    pub full_text_url: Option<String>,
    pub full_text: Option<String>,
    pub companion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 3] = [Self::Pending, Self::Running, Self::Paused];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "STOPPED" => Ok(Self::Stopped),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Inclusive number range a job walks for one bill type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRange {
    pub bill_type: String,
    pub first: u32,
    pub last: u32,
}

impl TypeRange {
    pub fn new(bill_type: impl Into<String>, first: u32, last: u32) -> Self {
        Self {
            bill_type: bill_type.into(),
            first: first.max(1),
            last,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            u64::from(self.last - self.first) + 1
        }
    }
}

/// Next identifier a job will attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub bill_type: String,
    pub next_number: u32,
}

impl SyncCursor {
    pub fn bill_id(&self) -> BillId {
        BillId::new(self.bill_type.clone(), self.next_number)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped_not_found: u64,
    pub errors: u64,
}

impl JobCounters {
    pub fn attempted(&self) -> u64 {
        self.created + self.updated + self.skipped_not_found + self.errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub plan: Vec<TypeRange>,
    /// `None` once every range of the plan has been walked.
    pub cursor: Option<SyncCursor>,
    pub counters: JobCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_item_error: Option<String>,
}

impl SyncJob {
    pub fn new_pending(plan: Vec<TypeRange>, now: DateTime<Utc>) -> Self {
        let cursor = plan.iter().find(|r| !r.is_empty()).map(|r| SyncCursor {
            bill_type: r.bill_type.clone(),
            next_number: r.first,
        });
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            plan,
            cursor,
            counters: JobCounters::default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            last_error: None,
            last_item_error: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    /// Move the cursor past its current identifier, rolling over to the next
    /// non-empty range of the plan. Returns `false` once the plan is exhausted.
    pub fn advance_cursor(&mut self) -> bool {
        let Some(cursor) = self.cursor.take() else {
            return false;
        };
        let Some(idx) = self.plan.iter().position(|r| r.bill_type == cursor.bill_type) else {
            return false;
        };
        let current = &self.plan[idx];
        if cursor.next_number < current.last {
            self.cursor = Some(SyncCursor {
                bill_type: cursor.bill_type,
                next_number: cursor.next_number + 1,
            });
            return true;
        }
        self.cursor = self.plan[idx + 1..]
            .iter()
            .find(|r| !r.is_empty())
            .map(|r| SyncCursor {
                bill_type: r.bill_type.clone(),
                next_number: r.first,
            });
        self.cursor.is_some()
    }

    pub fn planned_total(&self) -> u64 {
        self.plan.iter().map(TypeRange::len).sum()
    }
}
