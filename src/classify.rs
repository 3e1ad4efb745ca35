//! Heuristic classification of held output lines into input prompts.
//!
//! The agent never announces that it is blocked on stdin; the bridge infers it
//! from the shape of the last unterminated line plus how long the stream has
//! been silent. Classification is layered: progress noise is rejected first,
//! then known application phrasings and general interrogative shapes are
//! accepted, gated by an idle threshold. A separate silent mode covers
//! free-text entry where the agent prints an instruction line and then waits
//! without any prompt-shaped output.

use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::ClassifierSettings;

/// Sentinel recorded in the seen set so the silent multiline prompt is
/// published at most once per cycle.
const MULTILINE_SENTINEL: &str = "\u{0}multiline_silent_wait";

/// How many trailing history lines are scanned for banner context.
const BANNER_WINDOW: usize = 5;

/// Verdict for the currently held line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Not a prompt; the line may be released as ordinary output.
    Release,
    /// Prompt-shaped, but the stream has not been idle long enough yet.
    Candidate,
    /// The child is waiting for input.
    Prompt { text: String, multiline: bool },
}

/// Strategy seam for prompt detection. The session drives it with completed
/// lines (`observe`) and consults it about the held line whenever the stream
/// goes quiet (`classify`).
pub trait PromptClassifier: Send {
    /// Record a completed output line for context.
    fn observe(&mut self, line: &str);
    /// Judge the held line given the time since the last output byte.
    fn classify(&mut self, held: &str, idle: Duration) -> Decision;
    /// True if this prompt starts a fresh interaction cycle when answered
    /// affirmatively.
    fn is_restart_prompt(&self, prompt: &str) -> bool;
    /// Forget reprint-suppression state for the next cycle.
    fn reset_cycle(&mut self);
}

static PROGRESS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d+%",
        r"\[\d+/\d+\]",
        r"\(\d+/\d+\)",
        r"\.{3,}",
        r"\s{2,}\d+\s{2,}",
        r"[│├└─═║╔╗╚╝]",
        r"^\s*\*+\s*$",
        r"^\s*-+\s*$",
        r"^\s*=+\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const PROGRESS_KEYWORDS: &[&str] = &[
    "remote:",
    "counting",
    "compressing",
    "receiving",
    "resolving",
    "unpacking",
    "checking",
    "updating",
    "downloading",
    "uploading",
    "processing",
    "installing",
    "building",
    "compiled",
    "linking",
    "bytes",
    "objects",
    "deltas",
    "done",
    "complete",
    "finished",
    "progress",
    "status",
    "info:",
    "debug:",
    "trace:",
    "warn:",
    "writing",
    "reading",
    "loading",
    "saving",
    "fetching",
];

static QUESTION_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\?\s*$",
        r":\s*$",
        r"^>\s",
        r"^>>>\s*",
        r"^\$\s",
        r"(?i)^Enter\s+",
        r"(?i)^Please\s+",
        r"(?i)^Provide\s+",
        r"(?i)^Select\s+",
        r"(?i)^Choose\s+",
        r"(?i)^Type\s+",
        r"(?i)^Input\s+",
        r"(?i)^What\s+",
        r"(?i)^Which\s+",
        r"(?i)^Do you\s+",
        r"(?i)^Would you\s+",
        r"(?i)^Specify\s+",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// "Step 3:" and "100%:" end with a colon but are narration, not prompts.
static STEP_COUNTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(Step\s+)?\d+$").unwrap());
static PERCENT_ONLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+%$").unwrap());

/// True if this looks like progress or status output at any idle time.
pub fn is_progress_line(line: &str) -> bool {
    if PROGRESS_PATTERNS.iter().any(|re| re.is_match(line)) {
        return true;
    }
    let lower = line.to_lowercase();
    PROGRESS_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Default classifier: the regex pipeline described in the module docs.
pub struct HeuristicClassifier {
    idle_threshold: Duration,
    multiline_idle_threshold: Duration,
    max_prompt_len: usize,
    history: usize,
    app_prompts: Vec<Regex>,
    restart_prompt: Regex,
    multiline_markers: Vec<String>,
    multiline_prompt: String,
    banner_markers: Vec<String>,
    recent_lines: VecDeque<String>,
    seen_prompts: HashSet<String>,
}

impl HeuristicClassifier {
    pub fn from_settings(settings: &ClassifierSettings) -> Result<Self> {
        let app_prompts = settings
            .prompt_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid prompt pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        let restart_prompt = Regex::new(&settings.restart_pattern)
            .with_context(|| format!("invalid restart pattern: {}", settings.restart_pattern))?;
        Ok(Self {
            idle_threshold: Duration::from_millis(settings.idle_threshold_ms),
            multiline_idle_threshold: Duration::from_millis(settings.multiline_idle_threshold_ms),
            max_prompt_len: settings.max_prompt_len,
            history: settings.history,
            app_prompts,
            restart_prompt,
            multiline_markers: settings.multiline_markers.clone(),
            multiline_prompt: settings.multiline_prompt.clone(),
            banner_markers: settings.banner_markers.clone(),
            recent_lines: VecDeque::new(),
            seen_prompts: HashSet::new(),
        })
    }

    fn is_likely_prompt(&self, line: &str) -> bool {
        if line.is_empty() || line.len() > self.max_prompt_len {
            return false;
        }
        if self.seen_prompts.contains(line) {
            return false;
        }
        let lower = line.to_lowercase();
        // The multiline instruction echo is handled by the silent mode, never
        // published as a prompt of its own.
        if lower.contains("press enter twice") {
            return false;
        }
        // Cycle prompts outrank progress rejection: the line that asks for
        // another round usually sits next to completion vocabulary.
        if self.restart_prompt.is_match(line) {
            return true;
        }
        if is_progress_line(line) {
            return false;
        }
        if self.app_prompts.iter().any(|re| re.is_match(line)) {
            return true;
        }
        for shape in QUESTION_SHAPES.iter() {
            if shape.is_match(line) {
                if let Some(body) = line.strip_suffix(':') {
                    let body = body.trim();
                    if STEP_COUNTER.is_match(body) || PERCENT_ONLY.is_match(body) {
                        return false;
                    }
                }
                return true;
            }
        }
        false
    }

    fn multiline_instruction_seen(&self) -> bool {
        self.recent_lines
            .iter()
            .any(|line| self.multiline_markers.iter().any(|m| line.contains(m.as_str())))
    }

    fn has_banner_context(&self) -> bool {
        self.recent_lines
            .iter()
            .rev()
            .take(BANNER_WINDOW)
            .any(|line| self.banner_markers.iter().any(|m| line.contains(m.as_str())))
    }

    fn recent_progress_count(&self) -> usize {
        self.recent_lines
            .iter()
            .rev()
            .take(3)
            .filter(|line| is_progress_line(line))
            .count()
    }
}

impl PromptClassifier for HeuristicClassifier {
    fn observe(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        self.recent_lines.push_back(trimmed.to_string());
        while self.recent_lines.len() > self.history {
            self.recent_lines.pop_front();
        }
    }

    fn classify(&mut self, held: &str, idle: Duration) -> Decision {
        // Silent multiline mode: an instruction line announced free-text
        // entry, so the wait manifests as silence rather than a shaped line.
        // The instruction itself may still sit in the held line, unterminated.
        let instruction_near = self.multiline_instruction_seen()
            || self
                .multiline_markers
                .iter()
                .any(|m| held.contains(m.as_str()));
        if instruction_near && !self.seen_prompts.contains(MULTILINE_SENTINEL) {
            if idle < self.multiline_idle_threshold {
                return Decision::Candidate;
            }
            self.seen_prompts.insert(MULTILINE_SENTINEL.to_string());
            return Decision::Prompt {
                text: self.multiline_prompt.clone(),
                multiline: true,
            };
        }

        let line = held.trim();
        if line.is_empty() {
            return Decision::Release;
        }
        if !self.is_likely_prompt(line) {
            return Decision::Release;
        }
        if idle < self.idle_threshold {
            return Decision::Candidate;
        }
        // A burst of progress right before a shaped line usually means more
        // noise is coming. Parameter-collection banners override the damping.
        if self.recent_progress_count() >= 2 && !self.has_banner_context() {
            return Decision::Release;
        }

        self.seen_prompts.insert(line.to_string());
        Decision::Prompt {
            text: line.to_string(),
            multiline: false,
        }
    }

    fn is_restart_prompt(&self, prompt: &str) -> bool {
        self.restart_prompt.is_match(prompt)
    }

    fn reset_cycle(&mut self) {
        self.seen_prompts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> HeuristicClassifier {
        HeuristicClassifier::from_settings(&ClassifierSettings::default()).unwrap()
    }

    const PATIENT: Duration = Duration::from_millis(400);
    const IMPATIENT: Duration = Duration::from_millis(100);

    #[test]
    fn progress_line_never_prompts() {
        let mut c = classifier();
        assert_eq!(
            c.classify("remote: Counting objects: 42% (10/24)", PATIENT),
            Decision::Release
        );
        assert_eq!(
            c.classify(
                "remote: Counting objects: 42% (10/24)",
                Duration::from_secs(10)
            ),
            Decision::Release
        );
    }

    #[test]
    fn shaped_line_prompts_after_idle_gate() {
        let mut c = classifier();
        let line = "Enter the contract name (e.g., Vault):";
        assert_eq!(c.classify(line, IMPATIENT), Decision::Candidate);
        assert_eq!(
            c.classify(line, PATIENT),
            Decision::Prompt {
                text: line.to_string(),
                multiline: false
            }
        );
    }

    #[test]
    fn reprinted_prompt_is_suppressed() {
        let mut c = classifier();
        let line = "Enter the contract name (e.g., Vault):";
        assert!(matches!(c.classify(line, PATIENT), Decision::Prompt { .. }));
        assert_eq!(c.classify(line, PATIENT), Decision::Release);
    }

    #[test]
    fn reset_cycle_allows_prompt_again() {
        let mut c = classifier();
        let line = "Enter the contract name (e.g., Vault):";
        assert!(matches!(c.classify(line, PATIENT), Decision::Prompt { .. }));
        c.reset_cycle();
        assert!(matches!(c.classify(line, PATIENT), Decision::Prompt { .. }));
    }

    #[test]
    fn step_counter_and_percent_colons_are_narration() {
        let mut c = classifier();
        assert_eq!(c.classify("Step 3:", PATIENT), Decision::Release);
        assert_eq!(c.classify("100%:", PATIENT), Decision::Release);
    }

    #[test]
    fn general_question_shapes_prompt() {
        let mut c = classifier();
        assert!(matches!(
            c.classify("Choose option:", PATIENT),
            Decision::Prompt { .. }
        ));
        assert!(matches!(
            c.classify("Do you want to continue?", PATIENT),
            Decision::Prompt { .. }
        ));
        assert!(matches!(
            c.classify("Would you like to proceed with the scan?", PATIENT),
            Decision::Prompt { .. }
        ));
    }

    #[test]
    fn bracketed_and_dotted_progress_released() {
        let mut c = classifier();
        assert_eq!(c.classify("[2/5] Compiling detectors", PATIENT), Decision::Release);
        assert_eq!(c.classify("Fetching dependencies...", PATIENT), Decision::Release);
        assert_eq!(c.classify("│ step output │", PATIENT), Decision::Release);
    }

    #[test]
    fn overlong_line_released() {
        let mut c = classifier();
        let line = format!("{}?", "x".repeat(400));
        assert_eq!(c.classify(&line, PATIENT), Decision::Release);
    }

    #[test]
    fn empty_held_line_released() {
        let mut c = classifier();
        assert_eq!(c.classify("", PATIENT), Decision::Release);
        assert_eq!(c.classify("   ", PATIENT), Decision::Release);
    }

    #[test]
    fn restart_prompt_beats_progress_vocabulary() {
        let mut c = classifier();
        // "done" is a progress keyword, but the cycle prompt must get through.
        let line = "Analysis done. Run another analysis? (y/N):";
        assert!(matches!(c.classify(line, PATIENT), Decision::Prompt { .. }));
        assert!(c.is_restart_prompt(line));
    }

    #[test]
    fn progress_burst_damps_shaped_line() {
        let mut c = classifier();
        c.observe("Downloading model weights (1/3)");
        c.observe("Downloading model weights (2/3)");
        c.observe("Downloading model weights (3/3)");
        assert_eq!(c.classify("Summary:", PATIENT), Decision::Release);
    }

    #[test]
    fn banner_context_overrides_damping() {
        let mut c = classifier();
        c.observe("Downloading model weights (1/3)");
        c.observe("Downloading model weights (2/3)");
        c.observe("==== ANALYSIS SETUP ====");
        assert!(matches!(
            c.classify("Target network:", PATIENT),
            Decision::Prompt { .. }
        ));
    }

    #[test]
    fn multiline_instruction_enters_silent_mode() {
        let mut c = classifier();
        c.observe("Enter hypothesis (press Enter twice when done):");
        // Below the silent-mode idle gate: keep waiting.
        assert_eq!(
            c.classify("", Duration::from_millis(200)),
            Decision::Candidate
        );
        match c.classify("", Duration::from_millis(600)) {
            Decision::Prompt { multiline, .. } => assert!(multiline),
            other => panic!("expected multiline prompt, got {other:?}"),
        }
        // Published once per cycle.
        assert_eq!(
            c.classify("", Duration::from_millis(600)),
            Decision::Release
        );
    }

    #[test]
    fn unterminated_instruction_triggers_silent_mode_not_text_prompt() {
        let mut c = classifier();
        let echo = "Enter hypothesis (press Enter twice when done):";
        assert_eq!(c.classify(echo, PATIENT), Decision::Candidate);
        match c.classify(echo, Duration::from_millis(600)) {
            Decision::Prompt { text, multiline } => {
                assert!(multiline);
                assert_ne!(text, echo);
            }
            other => panic!("expected multiline prompt, got {other:?}"),
        }
    }

    #[test]
    fn history_window_is_bounded() {
        let mut c = classifier();
        for i in 0..50 {
            c.observe(&format!("line {i}"));
        }
        assert_eq!(c.recent_lines.len(), ClassifierSettings::default().history);
    }

    #[test]
    fn deterministic_for_identical_sequences() {
        let run = || {
            let mut c = classifier();
            c.observe("Starting up");
            let first = c.classify("Pick a target:", PATIENT);
            let second = c.classify("Pick a target:", PATIENT);
            (first, second)
        };
        assert_eq!(run(), run());
    }
}
