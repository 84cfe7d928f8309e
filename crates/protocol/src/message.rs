//! Bracket-delimited chat message format.
//!
//! A message on the wire is a run of plain text and tagged segments, e.g.
//! `hello[CQ:image,file=a.png]world`. Plain text must have `&`, `[`, `]` and
//! `,` escaped as HTML-style entities; the decoder keeps text verbatim and
//! leaves un-escaping to whoever renders it ([`unescape`]).
//!
//! The format is only reversible while field values avoid `[`, `]` and `,`.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Segment kind that carries plain text in its `text` field.
pub const TEXT_KIND: &str = "text";
const TEXT_FIELD: &str = "text";
const HEADER_TAG: &str = "CQ";

/// Malformed wire text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyntaxError {
    #[error("unterminated segment starting at byte {offset}")]
    Unterminated { offset: usize },

    #[error("malformed segment header: {header:?}")]
    MalformedHeader { header: String },

    #[error("malformed field: {field:?}")]
    MalformedField { field: String },
}

/// Escape plain text for use inside a text segment.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('[', "&#91;")
        .replace(']', "&#93;")
        .replace(',', "&#44;")
}

/// Reverse [`escape`].
pub fn unescape(text: &str) -> String {
    text.replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

// ── Segment ─────────────────────────────────────────────────────────────────

/// One atomic unit of a message.
///
/// Serializes as `{"type": kind, "data": fields}`, the array form the backend
/// also accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "data", default)]
    fields: BTreeMap<String, String>,
}

impl Segment {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Text segment from plain text. The text is escaped.
    pub fn text(plain: &str) -> Self {
        Self::raw_text(escape(plain))
    }

    /// Text segment holding already-escaped wire text.
    pub fn raw_text(wire: impl Into<String>) -> Self {
        Self::new(TEXT_KIND).with_field(TEXT_FIELD, wire)
    }

    /// Mention a user (`all` mentions everybody).
    pub fn at(user_id: i64) -> Self {
        Self::new("at").with_field("qq", user_id.to_string())
    }

    pub fn at_all() -> Self {
        Self::new("at").with_field("qq", "all")
    }

    pub fn face(id: i64) -> Self {
        Self::new("face").with_field("id", id.to_string())
    }

    pub fn image(file: impl Into<String>) -> Self {
        Self::new("image").with_field("file", file)
    }

    pub fn record(file: impl Into<String>) -> Self {
        Self::new("record").with_field("file", file)
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn is_text(&self) -> bool {
        self.kind == TEXT_KIND
    }

    /// Escaped wire text of a text segment, `None` for any other kind.
    pub fn text_content(&self) -> Option<&str> {
        if self.is_text() {
            Some(self.field(TEXT_FIELD).unwrap_or_default())
        } else {
            None
        }
    }

    fn encode_into(&self, out: &mut String) {
        if let Some(text) = self.text_content() {
            out.push_str(text);
            return;
        }
        out.push('[');
        out.push_str(HEADER_TAG);
        out.push(':');
        out.push_str(&self.kind);
        for (key, value) in &self.fields {
            out.push(',');
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out.push(']');
    }

    fn parse(body: &str) -> Result<Self, SyntaxError> {
        let mut parts = body.split(',');
        let header = parts.next().unwrap_or_default();
        let kind = match header.split_once(':') {
            Some((HEADER_TAG, kind)) if !kind.is_empty() && !kind.contains(':') => kind,
            _ => {
                return Err(SyntaxError::MalformedHeader {
                    header: header.to_string(),
                });
            },
        };

        let mut segment = Self::new(kind);
        for field in parts {
            let (key, value) =
                field
                    .split_once('=')
                    .ok_or_else(|| SyntaxError::MalformedField {
                        field: field.to_string(),
                    })?;
            segment.fields.insert(key.to_string(), value.to_string());
        }
        Ok(segment)
    }
}

// ── Message ─────────────────────────────────────────────────────────────────

/// Ordered list of segments.
///
/// Adjacent text segments are merged and empty text is dropped while
/// building, so a message has exactly one representation per wire string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    segments: Vec<Segment>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, segment: Segment) -> Self {
        self.append(segment);
        self
    }

    /// Append plain text (escaped).
    #[must_use]
    pub fn with_text(self, plain: &str) -> Self {
        self.with(Segment::text(plain))
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render to wire text.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            segment.encode_into(&mut out);
        }
        out
    }

    /// Parse wire text.
    pub fn decode(input: &str) -> Result<Self, SyntaxError> {
        let mut message = Self::new();
        let mut rest = input;
        let mut offset = 0;

        while !rest.is_empty() {
            let consumed = if let Some(body) = rest.strip_prefix('[') {
                let end = body
                    .find(']')
                    .ok_or(SyntaxError::Unterminated { offset })?;
                message.append(Segment::parse(&body[..end])?);
                end + 2
            } else {
                let end = rest.find('[').unwrap_or(rest.len());
                message.append(Segment::raw_text(&rest[..end]));
                end
            };
            rest = &rest[consumed..];
            offset += consumed;
        }

        Ok(message)
    }

    /// Concatenated, un-escaped text of all text segments.
    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(Segment::text_content)
            .map(unescape)
            .collect()
    }

    fn append(&mut self, segment: Segment) {
        if let Some(text) = segment.text_content() {
            if text.is_empty() {
                return;
            }
            if let Some(last) = self.segments.last_mut()
                && last.is_text()
            {
                let merged = format!("{}{text}", last.text_content().unwrap_or_default());
                last.fields.insert(TEXT_FIELD.to_string(), merged);
                return;
            }
        }
        self.segments.push(segment);
    }
}

impl FromIterator<Segment> for Message {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        let mut message = Self::new();
        for segment in iter {
            message.append(segment);
        }
        message
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Message {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn decodes_text_around_segment() {
        let msg = Message::decode("hello[CQ:image,file=a.png]world").unwrap();
        let segs = msg.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].text_content(), Some("hello"));
        assert_eq!(segs[1].kind(), "image");
        assert_eq!(segs[1].field("file"), Some("a.png"));
        assert_eq!(segs[1].fields().len(), 1);
        assert_eq!(segs[2].text_content(), Some("world"));
    }

    #[rstest]
    #[case::unterminated("[CQ:text", SyntaxError::Unterminated { offset: 0 })]
    #[case::unterminated_after_text("ab[CQ:at,qq=1", SyntaxError::Unterminated { offset: 2 })]
    #[case::field_without_value("[CQ:image,file]", SyntaxError::MalformedField { field: "file".into() })]
    #[case::empty_field("[CQ:image,]", SyntaxError::MalformedField { field: "".into() })]
    #[case::wrong_tag("[XX:image,file=a]", SyntaxError::MalformedHeader { header: "XX:image".into() })]
    #[case::no_colon("[image,file=a]", SyntaxError::MalformedHeader { header: "image".into() })]
    #[case::two_colons("[CQ:a:b]", SyntaxError::MalformedHeader { header: "CQ:a:b".into() })]
    #[case::empty_kind("[CQ:]", SyntaxError::MalformedHeader { header: "CQ:".into() })]
    #[case::empty_brackets("[]", SyntaxError::MalformedHeader { header: "".into() })]
    #[case::lone_bracket("[", SyntaxError::Unterminated { offset: 0 })]
    fn rejects_malformed_input(#[case] input: &str, #[case] expected: SyntaxError) {
        assert_eq!(Message::decode(input), Err(expected));
    }

    #[test]
    fn value_keeps_embedded_equals() {
        let msg = Message::decode("[CQ:share,url=https://x.io/?a=1&b=2]").unwrap();
        assert_eq!(
            msg.segments()[0].field("url"),
            Some("https://x.io/?a=1&b=2")
        );
    }

    #[test]
    fn segments_without_separator() {
        let msg = Message::decode("[CQ:face,id=1][CQ:face,id=2]").unwrap();
        assert_eq!(msg.segments().len(), 2);
        assert_eq!(msg.segments()[1].field("id"), Some("2"));
    }

    #[test]
    fn decoder_does_not_unescape() {
        let msg = Message::decode("a&#91;b&#93;&amp;").unwrap();
        assert_eq!(msg.segments()[0].text_content(), Some("a&#91;b&#93;&amp;"));
        assert_eq!(msg.plain_text(), "a[b]&");
    }

    #[test]
    fn closing_bracket_in_text_is_plain() {
        let msg = Message::decode("a]b").unwrap();
        assert_eq!(msg.segments().len(), 1);
        assert_eq!(msg.encode(), "a]b");
    }

    #[test]
    fn empty_input_is_empty_message() {
        assert!(Message::decode("").unwrap().is_empty());
    }

    #[test]
    fn encodes_segment_header() {
        let msg = Message::new()
            .with(Segment::at(10001))
            .with_text(" hi");
        assert_eq!(msg.encode(), "[CQ:at,qq=10001] hi");
        assert_eq!(msg.to_string(), msg.encode());
    }

    #[test]
    fn text_constructor_escapes() {
        let seg = Segment::text("[a], b & c");
        assert_eq!(seg.text_content(), Some("&#91;a&#93;&#44; b &amp; c"));
    }

    #[test]
    fn escape_is_reversible() {
        let raw = "x&#91;[&],";
        assert_eq!(unescape(&escape(raw)), raw);
    }

    #[test]
    fn adjacent_text_is_merged() {
        let msg = Message::new().with_text("a").with_text("").with_text("b");
        assert_eq!(msg.segments().len(), 1);
        assert_eq!(msg.plain_text(), "ab");
    }

    #[test]
    fn roundtrip_mixed_message() {
        let msg = Message::new()
            .with_text("look, [here]: ")
            .with(Segment::image("cat.png").with_field("cache", "0"))
            .with(Segment::face(14))
            .with_text("done")
            .with(Segment::new("share").with_field("url", "https://a.b/?q=1"));
        let decoded: Message = msg.encode().parse().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn segment_json_matches_array_format() {
        let json = serde_json::to_value(Segment::image("a.png")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "image", "data": {"file": "a.png"}}));
    }

    #[test]
    fn truncated_inputs_never_panic() {
        let full = "hi[CQ:image,file=a.png,cache=0]yo[CQ:at,qq=1]";
        for end in 0..=full.len() {
            let _ = Message::decode(&full[..end]);
        }
    }
}
