//! Incremental extraction of structured tag segments from agent output.
//!
//! Agents emit self-delimited segments of the form
//! `<<<TYPE>>>payload<<<END_TYPE>>>` interleaved with free-form text. The
//! parser consumes the raw stream in arbitrary chunks and yields the same
//! segment sequence no matter where chunk boundaries fall, including splits
//! in the middle of a delimiter.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

/// Known tag types, in scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagKind {
    ExecutorToolCall,
    ExecutorToolResult,
    Agent,
    UserInput,
    System,
    Error,
    Planner,
    Executor,
    Validator,
    Summary,
}

impl TagKind {
    pub const ALL: [TagKind; 10] = [
        TagKind::ExecutorToolCall,
        TagKind::ExecutorToolResult,
        TagKind::Agent,
        TagKind::UserInput,
        TagKind::System,
        TagKind::Error,
        TagKind::Planner,
        TagKind::Executor,
        TagKind::Validator,
        TagKind::Summary,
    ];

    /// The name as it appears inside delimiters.
    pub fn name(&self) -> &'static str {
        match self {
            TagKind::ExecutorToolCall => "EXECUTOR_TOOL_CALL",
            TagKind::ExecutorToolResult => "EXECUTOR_TOOL_RESULT",
            TagKind::Agent => "AGENT",
            TagKind::UserInput => "USER_INPUT",
            TagKind::System => "SYSTEM",
            TagKind::Error => "ERROR",
            TagKind::Planner => "PLANNER",
            TagKind::Executor => "EXECUTOR",
            TagKind::Validator => "VALIDATOR",
            TagKind::Summary => "SUMMARY",
        }
    }

    /// Kebab-case event type string used on the wire.
    pub fn wire_type(&self) -> String {
        self.name().to_lowercase().replace('_', "-")
    }
}

struct DelimiterTable {
    /// (kind, opening delimiter) pairs.
    open: Vec<(TagKind, String)>,
    /// Closing delimiter per kind, indexed in `TagKind::ALL` order.
    close: Vec<String>,
    /// Longest opening delimiter length, bounds the held-back tail.
    max_open_len: usize,
}

static DELIMITERS: LazyLock<DelimiterTable> = LazyLock::new(|| {
    let open: Vec<(TagKind, String)> = TagKind::ALL
        .iter()
        .map(|k| (*k, format!("<<<{}>>>", k.name())))
        .collect();
    let close = TagKind::ALL
        .iter()
        .map(|k| format!("<<<END_{}>>>", k.name()))
        .collect();
    let max_open_len = open.iter().map(|(_, d)| d.len()).max().unwrap_or(0);
    DelimiterTable {
        open,
        close,
        max_open_len,
    }
});

/// Delimiter-shaped substrings scrubbed out of completed payloads.
static DELIMITER_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<<<[A-Z_]+>>>").unwrap());

fn close_delim(kind: TagKind) -> &'static str {
    let idx = TagKind::ALL.iter().position(|k| *k == kind).unwrap_or(0);
    &DELIMITERS.close[idx]
}

/// A completed tag segment with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSegment {
    pub kind: TagKind,
    pub data: Value,
}

/// Output units produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Free text outside any tag.
    Text(String),
    /// An opening delimiter was consumed; content follows.
    Opened(TagKind),
    /// A tag closed; payload decoded.
    Closed(TagSegment),
    /// A tag was still open at flush time.
    Incomplete { kind: TagKind, partial: String },
}

/// Streaming tag extractor. One tag may be open at a time; delimiters inside
/// an open tag's content never start a nested tag.
#[derive(Debug, Default)]
pub struct TagStreamParser {
    buf: String,
    current: Option<TagKind>,
    content: String,
}

impl TagStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect everything that completed.
    ///
    /// Text that could still turn out to be the start of a delimiter is held
    /// back until more input (or `flush`) disambiguates it.
    pub fn push(&mut self, chunk: &str) -> Vec<Parsed> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            if let Some(kind) = self.current {
                let close = close_delim(kind);
                if let Some(pos) = self.buf.find(close) {
                    self.content.push_str(&self.buf[..pos]);
                    self.buf.drain(..pos + close.len());
                    let data = decode_payload(std::mem::take(&mut self.content));
                    out.push(Parsed::Closed(TagSegment { kind, data }));
                    self.current = None;
                } else {
                    let keep = partial_prefix_len(&self.buf, std::slice::from_ref(&close));
                    let cut = self.buf.len() - keep;
                    self.content.push_str(&self.buf[..cut]);
                    self.buf.drain(..cut);
                    break;
                }
            } else if let Some((pos, kind, open_len)) = earliest_open(&self.buf) {
                if pos > 0 {
                    out.push(Parsed::Text(self.buf[..pos].to_string()));
                }
                self.buf.drain(..pos + open_len);
                self.current = Some(kind);
                self.content.clear();
                out.push(Parsed::Opened(kind));
            } else {
                let opens: Vec<&str> = DELIMITERS.open.iter().map(|(_, d)| d.as_str()).collect();
                let keep = partial_prefix_len(&self.buf, &opens);
                let cut = self.buf.len() - keep;
                if cut > 0 {
                    let text: String = self.buf.drain(..cut).collect();
                    out.push(Parsed::Text(text));
                }
                break;
            }
        }

        out
    }

    /// Drain remaining state at end of stream. An open tag surfaces as
    /// `Incomplete`; held-back text surfaces as `Text`.
    pub fn flush(&mut self) -> Vec<Parsed> {
        let mut out = Vec::new();
        if let Some(kind) = self.current.take() {
            let mut partial = std::mem::take(&mut self.content);
            partial.push_str(&self.buf);
            self.buf.clear();
            out.push(Parsed::Incomplete { kind, partial });
        } else if !self.buf.is_empty() {
            out.push(Parsed::Text(std::mem::take(&mut self.buf)));
        }
        out
    }

    /// Discard any open tag and buffered input.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.content.clear();
        self.current = None;
    }

    /// True while an opening delimiter has been consumed but not yet closed.
    pub fn in_tag(&self) -> bool {
        self.current.is_some()
    }
}

/// Locate the opening delimiter with the lowest byte position.
fn earliest_open(buf: &str) -> Option<(usize, TagKind, usize)> {
    let mut best: Option<(usize, TagKind, usize)> = None;
    for (kind, delim) in &DELIMITERS.open {
        if let Some(pos) = buf.find(delim.as_str()) {
            if best.map_or(true, |(b, _, _)| pos < b) {
                best = Some((pos, *kind, delim.len()));
            }
        }
    }
    best
}

/// Length of the longest suffix of `buf` that is a proper prefix of any of
/// `delims`. That suffix must stay buffered: the next chunk may complete it.
fn partial_prefix_len(buf: &str, delims: &[&str]) -> usize {
    let window = buf.len().saturating_sub(DELIMITERS.max_open_len.max(
        delims.iter().map(|d| d.len()).max().unwrap_or(0),
    ));
    for (i, _) in buf.char_indices() {
        if i < window {
            continue;
        }
        let suffix = &buf[i..];
        if delims.iter().any(|d| d.len() > suffix.len() && d.starts_with(suffix)) {
            return buf.len() - i;
        }
    }
    0
}

/// Decode a completed payload: scrub delimiter look-alikes, then parse a
/// braced JSON object, falling back to opaque content. Never fails.
fn decode_payload(raw: String) -> Value {
    let scrubbed = DELIMITER_SHAPE.replace_all(&raw, "");
    let trimmed = scrubbed.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => value,
            Err(_) => json!({ "content": trimmed }),
        }
    } else {
        json!({ "content": trimmed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn closed_segments(parsed: &[Parsed]) -> Vec<TagSegment> {
        parsed
            .iter()
            .filter_map(|p| match p {
                Parsed::Closed(seg) => Some(seg.clone()),
                _ => None,
            })
            .collect()
    }

    fn text_of(parsed: &[Parsed]) -> String {
        parsed
            .iter()
            .filter_map(|p| match p {
                Parsed::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_tag_single_chunk() {
        let mut parser = TagStreamParser::new();
        let out = parser.push("<<<AGENT>>>{\"msg\": \"hi\"}<<<END_AGENT>>>");
        assert_eq!(out[0], Parsed::Opened(TagKind::Agent));
        match &out[1] {
            Parsed::Closed(seg) => {
                assert_eq!(seg.kind, TagKind::Agent);
                assert_eq!(seg.data, json!({"msg": "hi"}));
            }
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn text_before_tag_flushes_first() {
        let mut parser = TagStreamParser::new();
        let out = parser.push("booting up\n<<<SYSTEM>>>ready<<<END_SYSTEM>>>");
        assert_eq!(out[0], Parsed::Text("booting up\n".to_string()));
        assert_eq!(out[1], Parsed::Opened(TagKind::System));
        match &out[2] {
            Parsed::Closed(seg) => assert_eq!(seg.data, json!({"content": "ready"})),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn delimiter_split_across_chunks() {
        let mut parser = TagStreamParser::new();
        let mut out = parser.push("<<<AG");
        out.extend(parser.push("ENT>>>hello<<<END_AG"));
        out.extend(parser.push("ENT>>>"));
        let segs = closed_segments(&out);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].kind, TagKind::Agent);
        assert_eq!(segs[0].data, json!({"content": "hello"}));
        assert_eq!(text_of(&out), "");
    }

    #[test]
    fn byte_at_a_time_matches_single_push() {
        let input = "before <<<PLANNER>>>{\"step\": 1}<<<END_PLANNER>>> between \
                     <<<ERROR>>>boom<<<END_ERROR>>> after";

        let mut whole = TagStreamParser::new();
        let mut expected = whole.push(input);
        expected.extend(whole.flush());

        let mut bytewise = TagStreamParser::new();
        let mut got = Vec::new();
        for ch in input.chars() {
            got.extend(bytewise.push(&ch.to_string()));
        }
        got.extend(bytewise.flush());

        assert_eq!(closed_segments(&got), closed_segments(&expected));
        assert_eq!(text_of(&got), text_of(&expected));
    }

    #[test]
    fn unknown_tag_shape_is_text() {
        let mut parser = TagStreamParser::new();
        let mut out = parser.push("<<<UNKNOWN>>>nope<<<END_UNKNOWN>>>");
        out.extend(parser.flush());
        assert!(closed_segments(&out).is_empty());
        assert_eq!(text_of(&out), "<<<UNKNOWN>>>nope<<<END_UNKNOWN>>>");
    }

    #[test]
    fn lookalike_inside_payload_is_scrubbed() {
        let mut parser = TagStreamParser::new();
        let out = parser.push("<<<AGENT>>>see <<<SYSTEM>>> marker<<<END_AGENT>>>");
        let segs = closed_segments(&out);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].kind, TagKind::Agent);
        // The look-alike never opens a nested tag and is removed from the payload.
        assert_eq!(segs[0].data, json!({"content": "see  marker"}));
        assert!(!parser.in_tag());
    }

    #[test]
    fn invalid_json_payload_degrades_to_content() {
        let mut parser = TagStreamParser::new();
        let out = parser.push("<<<SUMMARY>>>{not json}<<<END_SUMMARY>>>");
        let segs = closed_segments(&out);
        assert_eq!(segs[0].data, json!({"content": "{not json}"}));
    }

    #[test]
    fn empty_payload_decodes_to_empty_content() {
        let mut parser = TagStreamParser::new();
        let out = parser.push("<<<VALIDATOR>>><<<END_VALIDATOR>>>");
        let segs = closed_segments(&out);
        assert_eq!(segs[0].data, json!({"content": ""}));
    }

    #[test]
    fn earliest_opening_delimiter_wins() {
        let mut parser = TagStreamParser::new();
        let out = parser.push(
            "<<<EXECUTOR>>>first<<<END_EXECUTOR>>><<<PLANNER>>>second<<<END_PLANNER>>>",
        );
        let segs = closed_segments(&out);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].kind, TagKind::Executor);
        assert_eq!(segs[1].kind, TagKind::Planner);
    }

    #[test]
    fn flush_surfaces_incomplete_tag() {
        let mut parser = TagStreamParser::new();
        let out = parser.push("<<<EXECUTOR_TOOL_CALL>>>{\"tool\": \"grep\"");
        assert_eq!(out, vec![Parsed::Opened(TagKind::ExecutorToolCall)]);
        let flushed = parser.flush();
        match &flushed[0] {
            Parsed::Incomplete { kind, partial } => {
                assert_eq!(*kind, TagKind::ExecutorToolCall);
                assert_eq!(partial, "{\"tool\": \"grep\"");
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn flush_releases_held_back_text() {
        let mut parser = TagStreamParser::new();
        // "<<<AG" could still become an opening delimiter, so it is held.
        let out = parser.push("plain <<<AG");
        assert_eq!(text_of(&out), "plain ");
        let flushed = parser.flush();
        assert_eq!(text_of(&flushed), "<<<AG");
    }

    #[test]
    fn wire_type_is_kebab_case() {
        assert_eq!(TagKind::ExecutorToolCall.wire_type(), "executor-tool-call");
        assert_eq!(TagKind::Agent.wire_type(), "agent");
    }

    #[test]
    fn reset_discards_open_tag() {
        let mut parser = TagStreamParser::new();
        parser.push("<<<AGENT>>>partial");
        assert!(parser.in_tag());
        parser.reset();
        assert!(!parser.in_tag());
        assert!(parser.flush().is_empty());
    }

    proptest! {
        /// The completed-segment sequence and total free text are identical
        /// for every chunking of the same input.
        #[test]
        fn chunking_invariance(
            pieces in proptest::collection::vec(
                prop_oneof![
                    Just("<<<AGENT>>>".to_string()),
                    Just("<<<END_AGENT>>>".to_string()),
                    Just("<<<SYSTEM>>>{\"k\":2}<<<END_SYSTEM>>>".to_string()),
                    Just("<<<".to_string()),
                    Just(">>>".to_string()),
                    "[a-z <>]{0,12}",
                ],
                0..8,
            ),
            splits in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            let input: String = pieces.concat();

            let mut reference = TagStreamParser::new();
            let mut expected = reference.push(&input);
            expected.extend(reference.flush());

            // Derive chunk boundaries from the split seeds.
            let mut chunked = TagStreamParser::new();
            let mut got = Vec::new();
            let chars: Vec<char> = input.chars().collect();
            let mut start = 0usize;
            let mut cuts: Vec<usize> = splits
                .iter()
                .map(|s| *s as usize % (chars.len() + 1))
                .collect();
            cuts.sort_unstable();
            cuts.push(chars.len());
            for cut in cuts {
                if cut > start {
                    let chunk: String = chars[start..cut].iter().collect();
                    got.extend(chunked.push(&chunk));
                    start = cut;
                }
            }
            got.extend(chunked.flush());

            prop_assert_eq!(closed_segments(&got), closed_segments(&expected));
            prop_assert_eq!(text_of(&got), text_of(&expected));
        }
    }
}
