//! Bill history parsing.
//!
//! Each supported document shape has a [`ParserStrategy`] that lifts raw text
//! out of the document into a [`RawHistory`]; [`assemble`] then turns that into
//! a [`CandidateRecord`] the same way for every shape.

mod html;
mod xml;

use std::fmt;

use billsync_core::{BillAction, BillId, CandidateRecord, CommitteeReferral, SourceValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::entities::normalize_entities;
use crate::status::classify_status;

pub use html::LegacyHistoryHtml;
pub use xml::BillHistoryXml;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    /// `<billhistory>` XML published on the FTP site.
    BillHistoryXml,
    /// Older HTML bill history pages.
    LegacyHistoryHtml,
}

impl fmt::Display for DocumentShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BillHistoryXml => "billhistory-xml",
            Self::LegacyHistoryHtml => "legacy-history-html",
        })
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is empty")]
    Empty,
    #[error("document is not valid utf-8")]
    Encoding,
    #[error("document shape not recognized")]
    UnknownShape,
    #[error("malformed {shape} document: {message}")]
    Malformed { shape: DocumentShape, message: String },
    #[error("document describes {found}, expected {expected}")]
    IdentifierMismatch { expected: BillId, found: String },
}

impl ParseError {
    pub(crate) fn malformed(shape: DocumentShape, message: impl Into<String>) -> Self {
        Self::Malformed {
            shape,
            message: message.into(),
        }
    }
}

pub trait ParserStrategy: Send + Sync {
    fn shape(&self) -> DocumentShape;

    /// Cheap check on the document's leading text.
    fn sniff(&self, text: &str) -> bool;

    fn extract(&self, text: &str) -> Result<RawHistory, ParseError>;
}

/// Field text lifted from a document before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHistory {
    /// Identifier as printed in the document, e.g. `89(R) HB 1`.
    pub bill_label: Option<String>,
    pub last_update: Option<String>,
    pub caption: Option<String>,
    pub authors: Option<String>,
    pub coauthors: Option<String>,
    pub sponsors: Option<String>,
    pub cosponsors: Option<String>,
    pub subjects: Vec<String>,
    pub committees: Vec<RawCommittee>,
    pub actions: Vec<RawAction>,
    pub last_action: Option<String>,
    pub text_urls: Vec<String>,
    pub companion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCommittee {
    pub chamber: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAction {
    pub number: Option<String>,
    pub date: Option<String>,
    pub description: String,
    pub comment: Option<String>,
}

pub fn default_strategies() -> Vec<Box<dyn ParserStrategy>> {
    vec![Box::new(BillHistoryXml), Box::new(LegacyHistoryHtml)]
}

/// First registered strategy whose sniff accepts `text`.
pub fn parser_for<'a>(
    strategies: &'a [Box<dyn ParserStrategy>],
    text: &str,
) -> Option<&'a dyn ParserStrategy> {
    strategies
        .iter()
        .find(|s| s.sniff(text))
        .map(|s| s.as_ref())
}

/// Parse a raw history document for `bill` with the default strategies.
pub fn parse(raw: &[u8], bill: &BillId) -> Result<CandidateRecord, ParseError> {
    DocumentParser::default().parse(raw, bill)
}

pub struct DocumentParser {
    strategies: Vec<Box<dyn ParserStrategy>>,
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
        }
    }
}

impl DocumentParser {
    pub fn with_strategies(strategies: Vec<Box<dyn ParserStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn parse(&self, raw: &[u8], bill: &BillId) -> Result<CandidateRecord, ParseError> {
        let text = decode_text(raw)?;
        let strategy = parser_for(&self.strategies, text).ok_or(ParseError::UnknownShape)?;
        let history = strategy.extract(text)?;
        assemble(history, bill, strategy.shape())
    }
}

fn decode_text(raw: &[u8]) -> Result<&str, ParseError> {
    let raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::Encoding)?;
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(text)
}

/// Normalize extracted text into a candidate record for `bill`.
pub fn assemble(
    raw: RawHistory,
    bill: &BillId,
    shape: DocumentShape,
) -> Result<CandidateRecord, ParseError> {
    if let Some(label) = raw.bill_label.as_deref().and_then(clean_text) {
        let found = bill_id_from_label(&label)
            .ok_or_else(|| ParseError::malformed(shape, format!("unreadable bill label {label:?}")))?;
        if &found != bill {
            return Err(ParseError::IdentifierMismatch {
                expected: bill.clone(),
                found: found.to_string(),
            });
        }
    }

    let actions: Vec<BillAction> = raw
        .actions
        .iter()
        .filter_map(|a| {
            let description = clean_text(&a.description)?;
            let number = a.number.as_deref().and_then(clean_text);
            Some(BillAction {
                chamber: number.as_deref().and_then(chamber_from_action_number),
                number,
                date: SourceValue::from_raw(a.date.as_deref().unwrap_or_default(), parse_date),
                description,
                comment: a.comment.as_deref().and_then(clean_text),
            })
        })
        .collect();

    let (last_action, last_action_date) = match raw.last_action.as_deref().and_then(clean_text) {
        Some(text) => split_last_action(&text),
        None => match actions.last() {
            Some(action) => (Some(action.description.clone()), action.date.clone()),
            None => (None, SourceValue::empty()),
        },
    };

    Ok(CandidateRecord {
        bill_id: bill.clone(),
        description: raw.caption.as_deref().and_then(clean_text).unwrap_or_default(),
        primary_authors: split_names(raw.authors.as_deref()),
        co_authors: split_names(raw.coauthors.as_deref()),
        sponsors: split_names(raw.sponsors.as_deref()),
        co_sponsors: split_names(raw.cosponsors.as_deref()),
        subjects: raw.subjects.iter().filter_map(|s| clean_text(s)).collect(),
        committees: raw
            .committees
            .iter()
            .filter_map(|c| {
                Some(CommitteeReferral {
                    chamber: clean_text(&c.chamber).unwrap_or_default(),
                    name: clean_text(&c.name)?,
                    status: clean_text(&c.status).unwrap_or_default(),
                })
            })
            .collect(),
        status: classify_status(&actions),
        actions,
        last_action,
        last_action_date,
        last_updated: SourceValue::from_raw(
            raw.last_update.as_deref().unwrap_or_default(),
            parse_timestamp,
        ),
        full_text_url: raw.text_urls.iter().find_map(|u| clean_text(u)),
        companion: raw.companion.as_deref().and_then(clean_text),
    })
}

/// Decode entities and collapse whitespace; `None` when nothing is left.
pub(crate) fn clean_text(input: &str) -> Option<String> {
    let decoded = normalize_entities(input);
    let collapsed = decoded
        .split(|c: char| c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Name lists are pipe separated: `Bonnen | Burrows | Bell, Keith`.
fn split_names(input: Option<&str>) -> Vec<String> {
    input
        .map(|s| s.split('|').filter_map(clean_text).collect())
        .unwrap_or_default()
}

/// Read the trailing `TYPE NUMBER` of labels such as `89(R) HB 1`.
fn bill_id_from_label(label: &str) -> Option<BillId> {
    let tokens: Vec<&str> = label.split_whitespace().collect();
    match tokens.as_slice() {
        [.., kind, number] if kind.chars().all(|c| c.is_ascii_alphabetic()) => {
            format!("{kind} {number}").parse().ok()
        }
        [.., last] => last.parse().ok(),
        [] => None,
    }
}

fn chamber_from_action_number(number: &str) -> Option<String> {
    match number.chars().next()? {
        'H' | 'h' => Some("House".to_string()),
        'S' | 's' => Some("Senate".to_string()),
        'E' | 'e' => Some("Executive".to_string()),
        _ => None,
    }
}

/// `05/28/2025 E Signed by the Governor` -> (`Signed by the Governor`, 2025-05-28).
fn split_last_action(text: &str) -> (Option<String>, SourceValue<NaiveDate>) {
    let mut parts = text.splitn(2, ' ');
    let head = parts.next().unwrap_or_default();
    let Some(date) = parse_date(head) else {
        return (Some(text.to_string()), SourceValue::empty());
    };
    let rest = parts.next().unwrap_or_default().trim();
    let rest = match rest.split_once(' ') {
        Some((flag, tail)) if matches!(flag, "H" | "S" | "E") => tail.trim(),
        _ => rest,
    };
    let description = (!rest.is_empty()).then(|| rest.to_string());
    (description, SourceValue::parsed(date, head))
}

pub(crate) fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    ["%m/%d/%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
}

/// Source timestamps carry no offset; they are stored as UTC.
pub(crate) fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%m/%d/%Y %I:%M:%S %p", "%m/%d/%Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .or_else(|| parse_date(input).and_then(|d| d.and_hms_opt(0, 0, 0)))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use billsync_core::BillStatus;

    struct NeverMatches;

    impl ParserStrategy for NeverMatches {
        fn shape(&self) -> DocumentShape {
            DocumentShape::BillHistoryXml
        }

        fn sniff(&self, _text: &str) -> bool {
            false
        }

        fn extract(&self, _text: &str) -> Result<RawHistory, ParseError> {
            unreachable!("never selected")
        }
    }

    #[test]
    fn registry_selects_by_sniffing() {
        let strategies = default_strategies();
        let xml = "<?xml version=\"1.0\"?>\n<billhistory bill=\"89(R) HB 1\"></billhistory>";
        let html = "<!DOCTYPE html><html><body><td id=\"cellCaptionText\">x</td></body></html>";
        assert_eq!(
            parser_for(&strategies, xml).map(|s| s.shape()),
            Some(DocumentShape::BillHistoryXml)
        );
        assert_eq!(
            parser_for(&strategies, html).map(|s| s.shape()),
            Some(DocumentShape::LegacyHistoryHtml)
        );
        assert!(parser_for(&strategies, "{\"bill\": 1}").is_none());
    }

    #[test]
    fn unrecognized_and_empty_documents_fail() {
        let bill = BillId::new("HB", 1);
        assert!(matches!(parse(b"   ", &bill), Err(ParseError::Empty)));
        assert!(matches!(parse(&[0xff, 0xfe, 0x00], &bill), Err(ParseError::Encoding)));
        assert!(matches!(parse(b"plain text", &bill), Err(ParseError::UnknownShape)));
        let parser = DocumentParser::with_strategies(vec![Box::new(NeverMatches)]);
        assert!(matches!(
            parser.parse(b"<billhistory/>", &bill),
            Err(ParseError::UnknownShape)
        ));
    }

    #[test]
    fn assemble_normalizes_and_derives() {
        let raw = RawHistory {
            bill_label: Some("89(R) HB 7".into()),
            last_update: Some("5/28/2025 10:31:54 PM".into()),
            caption: Some("  Relating to  parks &amp;amp; wildlife.\n".into()),
            authors: Some("Smith | Jones |  ".into()),
            coauthors: None,
            sponsors: Some("Garcia".into()),
            cosponsors: Some("".into()),
            subjects: vec!["Parks &amp; Wildlife".into(), "  ".into()],
            committees: vec![RawCommittee {
                chamber: "house".into(),
                name: "Culture, Recreation &amp; Tourism".into(),
                status: "Out of committee".into(),
            }],
            actions: vec![
                RawAction {
                    number: Some("H001".into()),
                    date: Some("01/10/2025".into()),
                    description: "Filed".into(),
                    comment: Some(" ".into()),
                },
                RawAction {
                    number: Some("H010".into()),
                    date: Some("02/30/2025".into()),
                    description: "Referred to Culture, Recreation &amp; Tourism".into(),
                    comment: None,
                },
            ],
            last_action: None,
            text_urls: vec!["".into(), "https://example.test/HB00007I.htm".into()],
            companion: None,
        };
        let bill = BillId::new("HB", 7);
        let record = assemble(raw, &bill, DocumentShape::BillHistoryXml).unwrap();

        assert_eq!(record.description, "Relating to parks & wildlife.");
        assert_eq!(record.primary_authors, vec!["Smith", "Jones"]);
        assert!(record.co_authors.is_empty());
        assert_eq!(record.sponsors, vec!["Garcia"]);
        assert!(record.co_sponsors.is_empty());
        assert_eq!(record.subjects, vec!["Parks & Wildlife"]);
        assert_eq!(record.committees[0].name, "Culture, Recreation & Tourism");
        assert_eq!(record.status, BillStatus::InCommittee);
        assert_eq!(record.actions[0].chamber.as_deref(), Some("House"));
        assert_eq!(record.actions[0].comment, None);
        assert!(record.actions[1].date.is_unparsed());
        assert_eq!(
            record.last_action.as_deref(),
            Some("Referred to Culture, Recreation & Tourism")
        );
        assert!(record.last_action_date.is_unparsed());
        assert_eq!(
            record.last_updated.value.map(|ts| ts.to_rfc3339()),
            Some("2025-05-28T22:31:54+00:00".to_string())
        );
        assert_eq!(
            record.full_text_url.as_deref(),
            Some("https://example.test/HB00007I.htm")
        );
    }

    #[test]
    fn mismatched_label_is_rejected() {
        let raw = RawHistory {
            bill_label: Some("89(R) HB 8".into()),
            ..RawHistory::default()
        };
        let err = assemble(raw, &BillId::new("HB", 7), DocumentShape::BillHistoryXml).unwrap_err();
        assert!(matches!(err, ParseError::IdentifierMismatch { .. }));
        assert_eq!(err.to_string(), "document describes HB 8, expected HB 7");
    }

    #[test]
    fn last_action_text_is_split_into_date_and_description() {
        let (text, date) = split_last_action("05/28/2025 E Signed by the Governor");
        assert_eq!(text.as_deref(), Some("Signed by the Governor"));
        assert_eq!(date.value, NaiveDate::from_ymd_opt(2025, 5, 28));

        let (text, date) = split_last_action("Effective immediately");
        assert_eq!(text.as_deref(), Some("Effective immediately"));
        assert_eq!(date, SourceValue::empty());
    }

    #[test]
    fn labels_with_and_without_session_prefix() {
        assert_eq!(bill_id_from_label("89(R) HB 1"), Some(BillId::new("HB", 1)));
        assert_eq!(bill_id_from_label("SJR 12"), Some(BillId::new("SJR", 12)));
        assert_eq!(bill_id_from_label("HB12"), Some(BillId::new("HB", 12)));
        assert_eq!(bill_id_from_label("89(R)"), None);
    }
}
