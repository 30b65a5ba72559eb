//! # plist
//!
//! Parser for the property-list documents written by the sampler.
//!
//! A document is turned into a [`DocumentNode`] tree. Only the value tags the
//! attribution cares about are typed (`integer`, `real`, `string`, `array`, `dict`).
//! Any other value tag (`true`, `false`, `date`, `data`...) is kept as a
//! string holding the tag name, so that fields added by newer sampler versions
//! never break the parsing of the fields we do read.
use crate::errors::{MalformedDocument, ScalarParseError};
use std::fmt::Write as _;

const PLIST_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
<plist version=\"1.0\">\n";

/// Closing marker of a complete document.
pub const PLIST_CLOSING_TAG: &str = "</plist>";

/// A node of a parsed document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentNode {
    Integer(i64),
    Real(f64),
    String(String),
    Sequence(Vec<DocumentNode>),
    Mapping(Mapping),
}

impl DocumentNode {
    /// Looks up `key` when this node is a mapping.
    pub fn get(&self, key: &str) -> Option<&DocumentNode> {
        self.as_mapping().and_then(|m| m.get(key))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DocumentNode::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value of an integer or real node.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DocumentNode::Integer(v) => Some(*v as f64),
            DocumentNode::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DocumentNode::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[DocumentNode]> {
        match self {
            DocumentNode::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            DocumentNode::Mapping(m) => Some(m),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            DocumentNode::Integer(_) => "integer",
            DocumentNode::Real(_) => "real",
            DocumentNode::String(_) => "string",
            DocumentNode::Sequence(_) => "array",
            DocumentNode::Mapping(_) => "dict",
        }
    }
}

/// Key-ordered mapping. Keys are unique.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mapping {
    entries: Vec<(String, DocumentNode)>,
}

impl Mapping {
    pub fn new() -> Mapping {
        Mapping { entries: vec![] }
    }

    /// Appends a new entry. Gives the value back if the key is already present.
    pub fn insert(&mut self, key: String, value: DocumentNode) -> Result<(), DocumentNode> {
        if self.contains_key(&key) {
            return Err(value);
        }
        self.entries.push((key, value));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&DocumentNode> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DocumentNode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses one complete document. The root has to be a `dict`, usually
/// wrapped in a `plist` element.
///
///# Examples
///
/// ```
/// use power_observer::sensors::plist;
///
/// let root = plist::parse(
///     "<plist version=\"1.0\"><dict><key>elapsed_ns</key><integer>5000</integer></dict></plist>",
/// ).unwrap();
/// assert_eq!(root.get("elapsed_ns").and_then(|n| n.as_i64()), Some(5000));
/// ```
pub fn parse(text: &str) -> Result<DocumentNode, MalformedDocument> {
    let mut parser = Parser::new(text);
    let (offset, token) = parser.expect_significant()?;
    let root = match token {
        Token::Start { name: "plist", self_closing: false } => {
            let (value_offset, value_token) = parser.expect_significant()?;
            let root = parser.parse_value(value_offset, value_token)?;
            let (end_offset, end) = parser.expect_significant()?;
            if end != (Token::End { name: "plist" }) {
                return Err(parser.error(end_offset, "expected </plist>"));
            }
            root
        }
        Token::Start { name: "dict", .. } => parser.parse_value(offset, token)?,
        _ => return Err(parser.error(offset, "expected <plist> or <dict>")),
    };
    if !matches!(root, DocumentNode::Mapping(_)) {
        return Err(parser.error(offset, format!("root is {}, not dict", root.kind())));
    }
    if let Some((trailing, _)) = parser.next_significant()? {
        return Err(parser.error(trailing, "content after the end of the document"));
    }
    Ok(root)
}

/// Writes a tree back as a plist document, `root` being the top-level mapping.
pub fn to_plist_string(root: &DocumentNode) -> String {
    let mut out = String::from(PLIST_HEADER);
    write_node(&mut out, root, 0);
    out.push_str(PLIST_CLOSING_TAG);
    out.push('\n');
    out
}

fn write_node(out: &mut String, node: &DocumentNode, depth: usize) {
    let indent = "\t".repeat(depth);
    match node {
        DocumentNode::Integer(v) => {
            let _ = writeln!(out, "{indent}<integer>{v}</integer>");
        }
        DocumentNode::Real(v) => {
            let _ = writeln!(out, "{indent}<real>{v:?}</real>");
        }
        DocumentNode::String(s) => {
            let _ = writeln!(out, "{indent}<string>{}</string>", escape(s));
        }
        DocumentNode::Sequence(items) => {
            let _ = writeln!(out, "{indent}<array>");
            for item in items {
                write_node(out, item, depth + 1);
            }
            let _ = writeln!(out, "{indent}</array>");
        }
        DocumentNode::Mapping(m) => {
            let _ = writeln!(out, "{indent}<dict>");
            for (key, value) in m.iter() {
                let _ = writeln!(out, "{indent}\t<key>{}</key>", escape(key));
                write_node(out, value, depth + 1);
            }
            let _ = writeln!(out, "{indent}</dict>");
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Start { name: &'a str, self_closing: bool },
    End { name: &'a str },
    Text(String),
}

impl Token<'_> {
    fn is_blank(&self) -> bool {
        matches!(self, Token::Text(t) if t.trim().is_empty())
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Parser<'a> {
        Parser { text, pos: 0 }
    }

    fn error(&self, offset: usize, reason: impl Into<String>) -> MalformedDocument {
        MalformedDocument::new(self.text, offset, reason)
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    /// Moves past `marker`, failing at `from` when it can't be found.
    fn skip_past(&mut self, marker: &str, from: usize) -> Result<(), MalformedDocument> {
        match self.rest().find(marker) {
            Some(i) => {
                self.pos += i + marker.len();
                Ok(())
            }
            None => Err(self.error(from, format!("unterminated markup, missing {marker:?}"))),
        }
    }

    /// Returns the next token with its byte offset, None at the end of the text.
    /// Prolog, doctype and comments are skipped.
    fn next_token(&mut self) -> Result<Option<(usize, Token<'a>)>, MalformedDocument> {
        loop {
            let start = self.pos;
            let rest = self.rest();
            if rest.is_empty() {
                return Ok(None);
            }
            if !rest.starts_with('<') {
                let len = rest.find('<').unwrap_or(rest.len());
                self.pos += len;
                let text = decode_entities(&rest[..len])
                    .map_err(|(i, reason)| self.error(start + i, reason))?;
                return Ok(Some((start, Token::Text(text))));
            }
            if rest.starts_with("<?") {
                self.skip_past("?>", start)?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->", start)?;
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let body_start = self.pos;
                self.skip_past("]]>", start)?;
                let body = &self.text[body_start..self.pos - "]]>".len()];
                return Ok(Some((start, Token::Text(body.to_string()))));
            } else if rest.starts_with("<!") {
                self.skip_past(">", start)?;
            } else {
                return self.read_tag(start).map(Some);
            }
        }
    }

    fn read_tag(&mut self, start: usize) -> Result<(usize, Token<'a>), MalformedDocument> {
        let rest = self.rest();
        let closing = rest.starts_with("</");
        let name_start = if closing { 2 } else { 1 };
        let name_len = rest[name_start..]
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .ok_or_else(|| self.error(start, "unterminated tag"))?;
        if name_len == 0 {
            return Err(self.error(start, "tag without a name"));
        }
        let name = &rest[name_start..name_start + name_len];

        // attributes are skipped, quoted values may contain '>'
        let mut quote: Option<char> = None;
        let mut end = None;
        for (i, c) in rest[name_start + name_len..].char_indices() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"') | (None, '\'') => quote = Some(c),
                (None, '>') => {
                    end = Some(name_start + name_len + i);
                    break;
                }
                _ => {}
            }
        }
        let end = end.ok_or_else(|| self.error(start, "unterminated tag"))?;
        let self_closing = rest[..end].ends_with('/');
        self.pos += end + 1;
        if closing {
            Ok((start, Token::End { name }))
        } else {
            Ok((start, Token::Start { name, self_closing }))
        }
    }

    fn next_significant(&mut self) -> Result<Option<(usize, Token<'a>)>, MalformedDocument> {
        while let Some((offset, token)) = self.next_token()? {
            if token.is_blank() {
                continue;
            }
            return Ok(Some((offset, token)));
        }
        Ok(None)
    }

    fn expect_significant(&mut self) -> Result<(usize, Token<'a>), MalformedDocument> {
        let end = self.text.len();
        self.next_significant()?
            .ok_or_else(|| self.error(end, "unexpected end of document"))
    }

    fn parse_value(
        &mut self,
        offset: usize,
        token: Token<'a>,
    ) -> Result<DocumentNode, MalformedDocument> {
        let (name, self_closing) = match token {
            Token::Start { name, self_closing } => (name, self_closing),
            Token::End { name } => {
                return Err(self.error(offset, format!("unexpected </{name}>, expected a value")))
            }
            Token::Text(_) => return Err(self.error(offset, "unexpected text, expected a value")),
        };
        match name {
            "integer" => {
                let text = self.read_scalar(offset, name, self_closing)?;
                parse_integer(&text)
                    .map(DocumentNode::Integer)
                    .map_err(|e| self.error(offset, e.to_string()))
            }
            "real" => {
                let text = self.read_scalar(offset, name, self_closing)?;
                parse_real(&text)
                    .map(DocumentNode::Real)
                    .map_err(|e| self.error(offset, e.to_string()))
            }
            "string" => Ok(DocumentNode::String(self.read_scalar(offset, name, self_closing)?)),
            "array" => {
                let mut items = vec![];
                if self_closing {
                    return Ok(DocumentNode::Sequence(items));
                }
                loop {
                    let (item_offset, item) = self.expect_significant()?;
                    if item == (Token::End { name: "array" }) {
                        return Ok(DocumentNode::Sequence(items));
                    }
                    items.push(self.parse_value(item_offset, item)?);
                }
            }
            "dict" => {
                let mut mapping = Mapping::new();
                if self_closing {
                    return Ok(DocumentNode::Mapping(mapping));
                }
                loop {
                    let (key_offset, key_token) = self.expect_significant()?;
                    let key = match key_token {
                        Token::End { name: "dict" } => return Ok(DocumentNode::Mapping(mapping)),
                        Token::Start { name: "key", self_closing } => {
                            self.read_scalar(key_offset, "key", self_closing)?
                        }
                        _ => return Err(self.error(key_offset, "expected <key> in dict")),
                    };
                    let (value_offset, value_token) = self.expect_significant()?;
                    match value_token {
                        Token::End { name: "dict" } => {
                            return Err(self.error(value_offset, format!("key {key:?} has no value")))
                        }
                        Token::Start { name: "key", .. } => {
                            return Err(self.error(value_offset, format!("key {key:?} has no value")))
                        }
                        _ => {}
                    }
                    let value = self.parse_value(value_offset, value_token)?;
                    if mapping.insert(key.clone(), value).is_err() {
                        return Err(self.error(key_offset, format!("duplicate key {key:?}")));
                    }
                }
            }
            "key" => Err(self.error(offset, "unexpected <key> outside of a dict")),
            other => {
                trace!("keeping unknown value tag <{}> as a placeholder", other);
                if !self_closing {
                    self.skip_element(offset, other)?;
                }
                Ok(DocumentNode::String(other.to_string()))
            }
        }
    }

    /// Reads the text content of a scalar element up to its closing tag.
    fn read_scalar(
        &mut self,
        offset: usize,
        name: &str,
        self_closing: bool,
    ) -> Result<String, MalformedDocument> {
        let mut content = String::new();
        if self_closing {
            return Ok(content);
        }
        loop {
            match self.next_token()? {
                Some((_, Token::Text(text))) => content.push_str(&text),
                Some((_, Token::End { name: end })) if end == name => return Ok(content),
                Some((at, _)) => {
                    return Err(self.error(at, format!("unexpected markup inside <{name}>")))
                }
                None => return Err(self.error(offset, format!("<{name}> is never closed"))),
            }
        }
    }

    /// Skips the content of an element we don't interpret, nested elements included.
    fn skip_element(&mut self, offset: usize, name: &str) -> Result<(), MalformedDocument> {
        let mut depth = 0usize;
        loop {
            match self.next_token()? {
                Some((_, Token::Start { self_closing: false, .. })) => depth += 1,
                Some((at, Token::End { name: end })) => {
                    if depth == 0 {
                        if end == name {
                            return Ok(());
                        }
                        return Err(self.error(at, format!("mismatched </{end}> in <{name}>")));
                    }
                    depth -= 1;
                }
                Some(_) => {}
                None => return Err(self.error(offset, format!("<{name}> is never closed"))),
            }
        }
    }
}

fn parse_integer(text: &str) -> Result<i64, ScalarParseError> {
    Ok(text.trim().parse::<i64>()?)
}

fn parse_real(text: &str) -> Result<f64, ScalarParseError> {
    Ok(text.trim().parse::<f64>()?)
}

/// Decodes XML character references. On error, returns the byte offset
/// of the faulty reference within `raw`.
fn decode_entities(raw: &str) -> Result<String, (usize, String)> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut consumed = 0;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| (consumed + amp, String::from("unterminated entity")))?;
        let entity = &after[..semi];
        let decoded = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| (consumed + amp, format!("unknown entity &{entity};")))?
            }
        };
        out.push(decoded);
        let skip = amp + 1 + semi + 1;
        consumed += skip;
        rest = &rest[skip..];
    }
    out.push_str(rest);
    Ok(out)
}
