//! Legislature source adapter: remote document access, bill history parsing
//! and text normalization.

pub mod entities;
pub mod parser;
mod remote;
pub mod status;

use scraper::Html;

pub use entities::{escape_entities, normalize_entities};
pub use parser::{
    default_strategies, parse, parser_for, BillHistoryXml, DocumentParser, DocumentShape,
    LegacyHistoryHtml, ParseError, ParserStrategy, RawHistory,
};
pub use remote::{LegislatureSource, MirrorSource, RemoteLayout, RemoteSource, SourceError};
pub use status::{classify_status, STATUS_RULES};

pub const CRATE_NAME: &str = "billsync-adapters";

/// Visible text of an HTML page, one line per text block. Script, style and
/// head content is dropped.
pub fn html_to_plain_text(bytes: &[u8]) -> String {
    let source = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&source);
    document
        .root_element()
        .descendants()
        .filter(|node| {
            !node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| matches!(e.name(), "script" | "style" | "head"))
            })
        })
        .filter_map(|node| node.value().as_text().and_then(|t| parser::clean_text(t)))
        .collect::<Vec<_>>()
        .join("\n")
}
