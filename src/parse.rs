//! Raw response parsing: header blocks, cookies, charsets.
//!
//! Everything here is a pure function of the raw bytes captured during the
//! transfer. The raw header buffer may hold several blocks — one per
//! redirect hop plus the final response — each opened by a
//! `HTTP/<version> <code> <reason>` status line. Malformed individual
//! header or cookie lines are logged and skipped; only a header section
//! yielding no parsable block at all is a hard failure (for that response
//! only, never for the session).

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use url::Url;

/// Insertion-ordered header collection with case-insensitive lookup.
///
/// Headers are serialized on the wire in exactly the order they were
/// inserted; duplicate names are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping any existing entries with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all entries with this name by a single entry. The new entry
    /// takes the position of the first replaced one, or goes last.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let position = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name));
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        match position {
            Some(index) => self.entries.insert(index.min(self.entries.len()), (name, value)),
            None => self.entries.push((name, value)),
        }
    }

    /// First value for a name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// The header section could not be parsed at all.
#[derive(Debug, thiserror::Error)]
#[error("unparsable header section: {0}")]
pub struct HeaderParseError(pub String);

/// Parsed status line of one header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// Protocol token, e.g. `HTTP/1.1`.
    pub version: String,
    pub code: u16,
    /// Reason phrase kept as raw bytes; servers localise these, so decoding
    /// is deferred until a charset is known.
    pub reason: Vec<u8>,
}

/// The fully parsed view of a raw header buffer, computed exactly once at
/// transfer completion.
#[derive(Debug, Clone)]
pub struct ParsedHeaders {
    /// Status line of the final block.
    pub status: StatusLine,
    /// Headers of the final block, insertion order preserved.
    pub headers: HeaderMap,
    /// Redirect hops: every `Location` seen in a non-final block, resolved
    /// against the URL current at that hop. Empty when no redirect occurred.
    pub history: Vec<String>,
    /// Cookie map from all `Set-Cookie` headers across all blocks; a later
    /// cookie with the same name wins.
    pub cookies: Vec<(String, String)>,
}

/// Split a raw header buffer into blocks of lines.
///
/// A line starting with `HTTP` opens a new block; blank lines and anything
/// before the first status line are skipped.
pub fn split_header_blocks(raw: &[u8]) -> Vec<Vec<Vec<u8>>> {
    let mut blocks: Vec<Vec<Vec<u8>>> = Vec::new();
    for line in raw.split(|&b| b == b'\n') {
        let line = strip_cr(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with(b"HTTP") {
            blocks.push(vec![line.to_vec()]);
        } else if let Some(block) = blocks.last_mut() {
            block.push(line.to_vec());
        }
    }
    blocks
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Parse a `HTTP/<version> <code> <reason>` status line. Returns `None`
/// for anything that does not match.
pub fn parse_status_line(line: &[u8]) -> Option<StatusLine> {
    if !line.starts_with(b"HTTP") {
        return None;
    }
    let first_space = line.iter().position(|&b| b == b' ')?;
    let version = String::from_utf8_lossy(&line[..first_space]).into_owned();
    let rest = &line[first_space + 1..];
    let code_end = rest
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(rest.len());
    let code_bytes = &rest[..code_end];
    if code_bytes.len() != 3 || !code_bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = String::from_utf8_lossy(code_bytes).parse::<u16>().ok()?;
    let reason = if code_end < rest.len() {
        strip_cr(&rest[code_end + 1..]).to_vec()
    } else {
        Vec::new()
    };
    Some(StatusLine {
        version,
        code,
        reason,
    })
}

/// Parse a `Field: value` line. Values wrapped in symmetric double quotes
/// are unwrapped. Returns `None` for lines with no colon.
pub fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(line);
    let (field, value) = text.split_once(':')?;
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    let mut value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = &value[1..value.len() - 1];
    }
    Some((field.to_string(), value.trim().to_string()))
}

/// Parse the whole raw header buffer against the response's effective URL.
///
/// `Location` headers in non-final blocks are resolved relative to the URL
/// current at that hop and recorded as redirect history. An empty or fully
/// unparsable buffer is an error; individual bad lines are logged at warn
/// level and skipped.
pub fn parse_header_blocks(
    raw: &[u8],
    effective_url: &str,
) -> Result<ParsedHeaders, HeaderParseError> {
    let blocks = split_header_blocks(raw);
    if blocks.is_empty() {
        return Err(HeaderParseError("no status line found".into()));
    }

    let mut history = Vec::new();
    let mut cookies: Vec<(String, String)> = Vec::new();
    let mut current_url = Url::parse(effective_url).ok();
    let mut final_status = None;
    let mut final_headers = HeaderMap::new();
    let last_index = blocks.len() - 1;

    for (index, block) in blocks.iter().enumerate() {
        let status = match parse_status_line(&block[0]) {
            Some(status) => status,
            None => {
                tracing::warn!(
                    line = %String::from_utf8_lossy(&block[0]),
                    "skipping malformed status line"
                );
                continue;
            }
        };
        let mut headers = HeaderMap::new();
        for line in &block[1..] {
            let Some((field, value)) = parse_header_line(line) else {
                tracing::warn!(
                    line = %String::from_utf8_lossy(line),
                    "skipping malformed header line"
                );
                continue;
            };
            if field.eq_ignore_ascii_case("location") && index < last_index {
                let resolved = resolve_location(current_url.as_ref(), &value);
                if let Ok(url) = Url::parse(&resolved) {
                    current_url = Some(url);
                }
                history.push(resolved);
            }
            if field.to_ascii_lowercase().starts_with("set-cookie") {
                match parse_set_cookie(&value) {
                    Some((name, cookie_value)) => {
                        cookies.retain(|(n, _)| n != &name);
                        cookies.push((name, cookie_value));
                    }
                    None => {
                        tracing::warn!(value = %value, "skipping malformed cookie");
                    }
                }
            }
            headers.append(field, value);
        }
        if index == last_index {
            final_status = Some(status);
            final_headers = headers;
        }
    }

    let status = final_status
        .ok_or_else(|| HeaderParseError("final block has no valid status line".into()))?;
    Ok(ParsedHeaders {
        status,
        headers: final_headers,
        history,
        cookies,
    })
}

fn resolve_location(base: Option<&Url>, value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }
    match base.and_then(|b| b.join(value).ok()) {
        Some(resolved) => resolved.to_string(),
        None => value.to_string(),
    }
}

/// Lenient `Set-Cookie` value parse: the first `name=value` pair wins and
/// attributes are ignored. Returns `None` for entries with no `=` or an
/// empty name.
pub fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let first = value.split(';').next()?;
    let (name, cookie_value) = first.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    Some((name.to_string(), cookie_value.trim().to_string()))
}

/// Extract a lowercased charset parameter from a `Content-Type` value.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    for part in content_type.split(';').skip(1) {
        let part = part.trim();
        if let Some(charset) = part
            .strip_prefix("charset=")
            .or_else(|| part.strip_prefix("CHARSET="))
        {
            let charset = charset.trim_matches('"').trim();
            if !charset.is_empty() {
                return Some(charset.to_ascii_lowercase());
            }
        }
    }
    None
}

/// Guess the encoding of a body with no declared charset.
pub fn sniff_encoding(content: &[u8]) -> &'static Encoding {
    let mut detector = EncodingDetector::new();
    detector.feed(content, true);
    detector.guess(None, true)
}

/// Decode body bytes with the declared charset, falling back to content
/// sniffing. UTF-8 goes through the BOM-aware decode so a leading BOM is
/// stripped; undecodable sequences become replacement characters.
pub fn decode_text(content: &[u8], declared_charset: Option<&str>) -> String {
    if content.is_empty() {
        return String::new();
    }
    let encoding = declared_charset
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or_else(|| sniff_encoding(content));
    if encoding == UTF_8 {
        let (text, _, _) = UTF_8.decode(content);
        text.into_owned()
    } else {
        let (text, _) = encoding.decode_without_bom_handling(content);
        text.into_owned()
    }
}

/// Decode a reason phrase: declared charset first, then UTF-8, then a
/// Latin-1-compatible fallback that never fails.
pub fn decode_reason(reason: &[u8], declared_charset: Option<&str>) -> String {
    if let Some(encoding) = declared_charset.and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        let (text, had_errors) = encoding.decode_without_bom_handling(reason);
        if !had_errors {
            return text.into_owned();
        }
    }
    match std::str::from_utf8(reason) {
        Ok(text) => text.to_string(),
        Err(_) => decode_latin1(reason),
    }
}

/// Latin-1 decode: every byte maps to the code point of the same value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
