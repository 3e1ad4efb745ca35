//! Routes parsed child output into publishable events.
//!
//! Three fates per unit: forward now (tag content, completed text lines),
//! hold (the trailing unterminated line, which may turn out to be a prompt),
//! or drop (lines that look like leaked credentials). Tag content is framed
//! by `stream_start` / `stream_end` events carrying a per-run monotonic
//! stream id so subscribers can detect truncated streams.

use std::sync::LazyLock;

use regex::Regex;

use crate::events::BridgeEvent;
use crate::tags::{Parsed, TagKind, TagStreamParser};

static SENSITIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)API_KEY:\s*[A-Za-z0-9\-_]{20,}").unwrap());

/// One ingest step: events ready to publish plus the text lines that
/// completed, for classifier context.
#[derive(Debug, Default)]
pub struct Routed {
    pub events: Vec<BridgeEvent>,
    pub lines: Vec<String>,
}

pub struct OutputRouter {
    parser: TagStreamParser,
    held: String,
    stream_seq: u64,
    open_stream: Option<(String, TagKind)>,
    sentinels: Vec<String>,
    passthrough: bool,
}

impl OutputRouter {
    pub fn new(sentinels: Vec<String>) -> Self {
        Self {
            parser: TagStreamParser::new(),
            held: String::new(),
            stream_seq: 0,
            open_stream: None,
            sentinels,
            passthrough: false,
        }
    }

    /// True once a failure sentinel was observed; from then on output is
    /// relayed verbatim and never held.
    pub fn passthrough(&self) -> bool {
        self.passthrough
    }

    /// The trailing unterminated line, the current prompt candidate.
    pub fn held_line(&self) -> &str {
        &self.held
    }

    /// Feed a chunk of child output.
    pub fn ingest(&mut self, chunk: &str) -> Routed {
        let mut out = Routed::default();
        if self.passthrough {
            self.emit_output(chunk, &mut out.events);
            return out;
        }
        let parsed = self.parser.push(chunk);
        self.route(parsed, &mut out);
        out
    }

    /// Force-flush on termination, surfacing unterminated tag content and
    /// releasing any held text.
    pub fn finish(&mut self) -> Routed {
        let mut out = Routed::default();
        let parsed = self.parser.flush();
        self.route(parsed, &mut out);
        if let Some(event) = self.release_held() {
            out.events.push(event);
        }
        out
    }

    /// The held line was published as a prompt; drop it without emitting.
    pub fn consume_held(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    /// The child is starting a fresh analysis cycle; clear parser state and
    /// resume tag interpretation even after a failure sentinel.
    pub fn reset_cycle(&mut self) {
        self.parser.reset();
        self.open_stream = None;
        self.passthrough = false;
    }

    /// The held line was judged ordinary output; release it.
    pub fn release_held(&mut self) -> Option<BridgeEvent> {
        if self.held.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.held);
        scrub_sensitive(&text).map(|text| BridgeEvent::Output { text })
    }

    fn route(&mut self, parsed: Vec<Parsed>, out: &mut Routed) {
        for unit in parsed {
            match unit {
                Parsed::Text(text) => self.route_text(&text, out),
                Parsed::Opened(kind) => {
                    // More output arrived, so the held line was not a prompt.
                    if let Some(event) = self.release_held() {
                        out.events.push(event);
                    }
                    let stream_id = self.next_stream_id();
                    out.events.push(BridgeEvent::StreamStart {
                        stream_id: stream_id.clone(),
                        kind,
                    });
                    self.open_stream = Some((stream_id, kind));
                }
                Parsed::Closed(segment) => {
                    let (stream_id, _) = match self.open_stream.take() {
                        Some(open) => open,
                        None => (self.next_stream_id(), segment.kind),
                    };
                    out.events.push(BridgeEvent::Tag {
                        kind: segment.kind,
                        data: segment.data,
                        stream_id: stream_id.clone(),
                    });
                    out.events.push(BridgeEvent::StreamEnd {
                        stream_id,
                        kind: segment.kind,
                    });
                }
                Parsed::Incomplete { kind, partial } => {
                    let (stream_id, _) = match self.open_stream.take() {
                        Some(open) => open,
                        None => (self.next_stream_id(), kind),
                    };
                    out.events.push(BridgeEvent::IncompleteTag {
                        stream_id,
                        kind,
                        partial_content: partial,
                    });
                }
            }
        }
    }

    fn route_text(&mut self, text: &str, out: &mut Routed) {
        self.held.push_str(text);
        while let Some(pos) = self.held.find('\n') {
            let line: String = self.held.drain(..=pos).collect();
            let trimmed = line.trim_end_matches(['\n', '\r']);
            out.lines.push(trimmed.to_string());
            if !self.passthrough && self.sentinels.iter().any(|s| trimmed.contains(s.as_str())) {
                self.passthrough = true;
            }
            self.emit_output(&line, &mut out.events);
        }
    }

    fn emit_output(&self, text: &str, events: &mut Vec<BridgeEvent>) {
        if let Some(text) = scrub_sensitive(text) {
            events.push(BridgeEvent::Output { text });
        }
    }

    fn next_stream_id(&mut self) -> String {
        self.stream_seq += 1;
        format!("stream_{}", self.stream_seq)
    }
}

/// Drop key-shaped lines; `None` when nothing survives.
fn scrub_sensitive(text: &str) -> Option<String> {
    if !SENSITIVE_RE.is_match(text) {
        return Some(text.to_string());
    }
    let kept: String = text
        .split_inclusive('\n')
        .filter(|line| !SENSITIVE_RE.is_match(line))
        .collect();
    if kept.is_empty() { None } else { Some(kept) }
}
