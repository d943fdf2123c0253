use scraper::{ElementRef, Html, Selector};

use super::{
    bill_id_from_label, DocumentShape, ParseError, ParserStrategy, RawAction, RawCommittee,
    RawHistory,
};

const SHAPE: DocumentShape = DocumentShape::LegacyHistoryHtml;

/// Older bill history pages, one `<td id="cell...">` per field and an
/// `tblActions` table for the action log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyHistoryHtml;

impl ParserStrategy for LegacyHistoryHtml {
    fn shape(&self) -> DocumentShape {
        SHAPE
    }

    fn sniff(&self, text: &str) -> bool {
        let lowered = text.to_ascii_lowercase();
        lowered.contains("<html") && lowered.contains("cellcaptiontext")
    }

    fn extract(&self, text: &str) -> Result<RawHistory, ParseError> {
        let document = Html::parse_document(text);
        let label = select_first_text(&document, "#cellBillNumber")?;
        let caption = select_first_text(&document, "#cellCaptionText")?;
        if label.is_none() && caption.is_none() {
            return Err(ParseError::malformed(SHAPE, "no bill number or caption cell"));
        }

        let house_first = label
            .as_deref()
            .and_then(bill_id_from_label)
            .map_or(true, |id| !id.bill_type.starts_with('S'));
        let (first_chamber, second_chamber) = if house_first {
            ("House", "Senate")
        } else {
            ("Senate", "House")
        };

        let mut committees = Vec::new();
        for (prefix, chamber) in [("#cellComm1", first_chamber), ("#cellComm2", second_chamber)] {
            let name = select_first_text(&document, &format!("{prefix}Committee"))?;
            if let Some(name) = name {
                committees.push(RawCommittee {
                    chamber: chamber.to_string(),
                    name,
                    status: select_first_text(&document, &format!("{prefix}CommitteeStatus"))?
                        .unwrap_or_default(),
                });
            }
        }

        Ok(RawHistory {
            bill_label: label,
            last_update: select_first_text(&document, "#cellLastUpdate")?,
            caption,
            authors: select_first_text(&document, "#cellAuthors")?,
            coauthors: select_first_text(&document, "#cellCoauthors")?,
            sponsors: select_first_text(&document, "#cellSponsors")?,
            cosponsors: select_first_text(&document, "#cellCosponsors")?,
            subjects: select_subjects(&document)?,
            committees,
            actions: select_actions(&document)?,
            last_action: select_first_text(&document, "#cellLastAction")?,
            text_urls: select_all_attrs(&document, "#cellBillText a[href]", "href")?,
            companion: select_first_text(&document, "#cellCompanions a")?
                .or(select_first_text(&document, "#cellCompanions")?),
        })
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::malformed(SHAPE, format!("selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(element_text(n))))
}

fn select_all_attrs(document: &Html, css: &str, attr: &str) -> Result<Vec<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

/// Subjects are `<br>`-separated text nodes inside one cell.
fn select_subjects(document: &Html) -> Result<Vec<String>, ParseError> {
    let sel = selector("#cellSubjects")?;
    Ok(document
        .select(&sel)
        .flat_map(|cell| cell.text())
        .filter_map(|t| text_or_none(t.to_string()))
        .collect())
}

/// Columns: Description | Comment | Date | Time | Journal page. The action
/// number lives on the row id, e.g. `<tr id="H010">`.
fn select_actions(document: &Html) -> Result<Vec<RawAction>, ParseError> {
    let rows = selector("table#tblActions tr")?;
    let cells = selector("td")?;
    let mut actions = Vec::new();
    for row in document.select(&rows) {
        let columns: Vec<String> = row.select(&cells).map(element_text).collect();
        let Some(description) = columns.first().and_then(|d| text_or_none(d.clone())) else {
            continue;
        };
        actions.push(RawAction {
            number: row.value().id().and_then(|id| text_or_none(id.to_string())),
            date: columns.get(2).and_then(|d| text_or_none(d.clone())),
            description,
            comment: columns.get(1).and_then(|c| text_or_none(c.clone())),
        });
    }
    Ok(actions)
}
