use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{DocumentShape, ParseError, ParserStrategy, RawAction, RawCommittee, RawHistory};

const SHAPE: DocumentShape = DocumentShape::BillHistoryXml;

/// Current `<billhistory>` documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct BillHistoryXml;

impl ParserStrategy for BillHistoryXml {
    fn shape(&self) -> DocumentShape {
        SHAPE
    }

    fn sniff(&self, text: &str) -> bool {
        let head = text
            .trim_start()
            .chars()
            .take(512)
            .collect::<String>()
            .to_ascii_lowercase();
        (head.starts_with("<?xml") || head.starts_with("<billhistory"))
            && head.contains("<billhistory")
    }

    fn extract(&self, text: &str) -> Result<RawHistory, ParseError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut out = RawHistory::default();
        let mut path: Vec<String> = Vec::new();
        let mut buffer = String::new();
        let mut action: Option<RawAction> = None;
        let mut saw_root = false;

        loop {
            let event = reader.read_event().map_err(|e| {
                ParseError::malformed(SHAPE, format!("at byte {}: {e}", reader.buffer_position()))
            })?;
            match event {
                Event::Start(start) => {
                    let name = element_name(&start);
                    open_element(&mut out, &path, &name, &start, &mut saw_root)?;
                    if path_is(&path, &["billhistory", "actions"]) && name == "action" {
                        action = Some(RawAction::default());
                    }
                    path.push(name);
                    buffer.clear();
                }
                Event::Empty(start) => {
                    let name = element_name(&start);
                    open_element(&mut out, &path, &name, &start, &mut saw_root)?;
                }
                Event::Text(text) => buffer.push_str(&String::from_utf8_lossy(&text)),
                Event::CData(data) => buffer.push_str(&String::from_utf8_lossy(&data)),
                Event::End(_) => {
                    let text = std::mem::take(&mut buffer);
                    close_element(&mut out, &path, text, &mut action);
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(ParseError::malformed(SHAPE, "missing <billhistory> root element"));
        }
        if !path.is_empty() {
            return Err(ParseError::malformed(
                SHAPE,
                format!("document ends inside <{}>", path.join("/")),
            ));
        }
        Ok(out)
    }
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).to_ascii_lowercase()
}

fn attribute(start: &BytesStart<'_>, key: &str) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref().eq_ignore_ascii_case(key.as_bytes()))
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

fn path_is(path: &[String], expected: &[&str]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a == b)
}

fn open_element(
    out: &mut RawHistory,
    path: &[String],
    name: &str,
    start: &BytesStart<'_>,
    saw_root: &mut bool,
) -> Result<(), ParseError> {
    if path.is_empty() {
        if name != "billhistory" {
            return Err(ParseError::malformed(
                SHAPE,
                format!("unexpected root element <{name}>"),
            ));
        }
        *saw_root = true;
        out.bill_label = attribute(start, "bill");
        out.last_update = attribute(start, "lastUpdate");
        return Ok(());
    }
    // <committees><house name=".." status=".."/><senate .../></committees>
    if path_is(path, &["billhistory", "committees"]) {
        if let Some(committee) = attribute(start, "name") {
            out.committees.push(RawCommittee {
                chamber: name.to_string(),
                name: committee,
                status: attribute(start, "status").unwrap_or_default(),
            });
        }
    }
    if path_is(path, &["billhistory", "companions"]) && name == "companion" {
        if let Some(bill) = attribute(start, "bill") {
            out.companion.get_or_insert(bill);
        }
    }
    Ok(())
}

fn close_element(
    out: &mut RawHistory,
    path: &[String],
    text: String,
    action: &mut Option<RawAction>,
) {
    let Some(name) = path.last().map(String::as_str) else {
        return;
    };
    let parents = &path[..path.len() - 1];

    if path_is(parents, &["billhistory"]) {
        let slot = match name {
            "caption" => &mut out.caption,
            "authors" => &mut out.authors,
            "coauthors" => &mut out.coauthors,
            "sponsors" => &mut out.sponsors,
            "cosponsors" => &mut out.cosponsors,
            "lastaction" => &mut out.last_action,
            _ => return,
        };
        *slot = Some(text);
        return;
    }

    if path_is(parents, &["billhistory", "subjects"]) && name == "subject" {
        out.subjects.push(text);
        return;
    }

    if path_is(parents, &["billhistory", "companions"]) && name == "companion" {
        if !text.trim().is_empty() {
            out.companion.get_or_insert(text);
        }
        return;
    }

    if path_is(parents, &["billhistory", "actions", "action"]) {
        if let Some(current) = action.as_mut() {
            match name {
                "date" => current.date = Some(text),
                "description" => current.description = text,
                "comment" => current.comment = Some(text),
                "actionnumber" => current.number = Some(text),
                _ => {}
            }
        }
        return;
    }

    if path_is(parents, &["billhistory", "actions"]) && name == "action" {
        if let Some(done) = action.take() {
            out.actions.push(done);
        }
        return;
    }

    // billtext/docTypes/bill/versions/version/WebHTMLURL
    if name == "webhtmlurl" && path.iter().any(|p| p == "billtext") {
        out.text_urls.push(text);
    }
}
