//! Character entity normalization for free-text fields.
//!
//! Source documents are frequently escaped more than once (`&amp;amp;`), so
//! decoding runs until nothing decodable remains. Every decode shortens the
//! string, which bounds the loop, and a fixpoint makes [`normalize_entities`]
//! idempotent.

/// Named entities understood by [`normalize_entities`].
pub const NAMED_ENTITIES: &[(&str, char)] = &[
    ("amp", '&'),
    ("lt", '<'),
    ("gt", '>'),
    ("quot", '"'),
    ("apos", '\''),
    ("nbsp", '\u{a0}'),
];

/// Longest entity body we try to decode, e.g. `#x10FFFF`.
const MAX_ENTITY_LEN: usize = 8;

/// Decode supported entity references until a fixpoint is reached.
pub fn normalize_entities(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = decode_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Escape the characters [`normalize_entities`] decodes back.
///
/// `normalize_entities(&escape_entities(s)) == s` holds for any `s` that does
/// not itself contain an entity reference.
pub fn escape_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            other => out.push(other),
        }
    }
    out
}

fn decode_once(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let decoded = tail
            .find(';')
            .filter(|end| *end <= MAX_ENTITY_LEN)
            .and_then(|end| decode_entity(&tail[..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(body: &str) -> Option<char> {
    if let Some(numeric) = body.strip_prefix('#') {
        let code = match numeric.strip_prefix(&['x', 'X'][..]) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse::<u32>().ok()?,
        };
        return char::from_u32(code).filter(|c| *c != '\0');
    }
    NAMED_ENTITIES
        .iter()
        .find(|(name, _)| *name == body)
        .map(|(_, ch)| *ch)
}
