//! Pattern-based prompt detection over the tail of the output stream.
//!
//! Only the last few lines are examined, and only explicit shapes are
//! accepted: a line ending in a `(y/n)` style marker, or a header followed by
//! a consecutively numbered menu that is waiting for input. Anything else is
//! treated as plain output.

use std::sync::LazyLock;

use regex::Regex;

use super::{PromptKind, PromptOption};

/// Bytes of recent output retained for matching.
const WINDOW_BYTES: usize = 4096;

/// Lines from the end of the window that may form a prompt.
const MAX_PROMPT_LINES: usize = 16;

/// Menus larger than this are not treated as prompts.
const MAX_OPTIONS: usize = 25;

static CONFIRM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.*?)\s*[(\[]\s*(y|yes)\s*/\s*(n|no)\s*[)\]]\s*[:?]?\s*$")
        .expect("confirm pattern is valid")
});

static OPTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[>❯›*]\s*)?([0-9]{1,2}|[a-zA-Z])[.)]\s+(\S.*?)\s*$")
        .expect("option pattern is valid")
});

static INPUT_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[>❯›?]|(?:enter|type|select|choose|pick)?\s*(?:your\s+)?(?:choice|selection|option|number)(?:\s*\[[^\]]*\])?\s*[:>?]?)\s*$",
    )
    .expect("input cue pattern is valid")
});

/// A prompt recognised in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPrompt {
    pub kind: PromptKind,
    pub message: String,
    pub options: Vec<PromptOption>,
}

/// Streaming prompt detector for one session.
#[derive(Debug, Default)]
pub struct PromptDetector {
    window: String,
}

impl PromptDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append stripped output and check whether it now ends in a prompt.
    ///
    /// A match consumes the window, so the same text never raises twice.
    pub fn feed(&mut self, text: &str) -> Option<DetectedPrompt> {
        if text.is_empty() {
            return None;
        }
        self.window.push_str(text);
        self.trim_window();

        let detected = detect(&self.window);
        if detected.is_some() {
            self.window.clear();
        }
        detected
    }

    /// Forget buffered output.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    fn trim_window(&mut self) {
        if self.window.len() <= WINDOW_BYTES {
            return;
        }
        let mut cut = self.window.len() - WINDOW_BYTES;
        while !self.window.is_char_boundary(cut) {
            cut += 1;
        }
        self.window.drain(..cut);
    }
}

/// Classify the tail of `text`.
pub fn detect(text: &str) -> Option<DetectedPrompt> {
    let ends_open = !text.ends_with('\n');
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let start = lines.len().saturating_sub(MAX_PROMPT_LINES);
    let lines = &lines[start..];

    // A prompt either parks the cursor on its last line or is followed by an
    // input cue. Anything that scrolled past is output.
    let body = match lines.split_last() {
        Some((last, rest)) if INPUT_CUE.is_match(last) => rest,
        _ if ends_open => lines,
        _ => return None,
    };

    detect_confirmation(body).or_else(|| detect_selection(body))
}

fn detect_confirmation(lines: &[&str]) -> Option<DetectedPrompt> {
    let last = lines.last()?;
    let caps = CONFIRM_LINE.captures(last)?;

    let mut message = caps.get(1).map_or("", |m| m.as_str()).trim().to_string();
    if message.is_empty() && lines.len() >= 2 {
        message = lines[lines.len() - 2].trim().to_string();
    }
    if message.is_empty() {
        return None;
    }

    let long_form = caps[2].len() > 1;
    let (yes, no) = if long_form { ("yes", "no") } else { ("y", "n") };

    Some(DetectedPrompt {
        kind: PromptKind::Confirmation,
        message,
        options: vec![PromptOption::new(yes, "Yes"), PromptOption::new(no, "No")],
    })
}

fn detect_selection(lines: &[&str]) -> Option<DetectedPrompt> {
    let mut options = Vec::new();
    let mut begin = lines.len();
    while begin > 0 {
        let Some(caps) = OPTION_LINE.captures(lines[begin - 1]) else {
            break;
        };
        options.push(PromptOption::new(&caps[1], &caps[2]));
        begin -= 1;
    }
    options.reverse();

    if options.len() < 2 || options.len() > MAX_OPTIONS || !is_consecutive(&options) {
        return None;
    }

    let header = begin.checked_sub(1).map(|i| lines[i].trim())?;
    if !(header.ends_with(':') || header.ends_with('?')) {
        return None;
    }

    Some(DetectedPrompt {
        kind: PromptKind::Selection,
        message: header.to_string(),
        options,
    })
}

/// Keys must run 1, 2, 3... or a, b, c... (case-insensitive).
fn is_consecutive(options: &[PromptOption]) -> bool {
    let first = &options[0].key;
    if first == "1" {
        return options
            .iter()
            .enumerate()
            .all(|(i, o)| o.key.parse::<usize>().ok() == Some(i + 1));
    }
    if first.eq_ignore_ascii_case("a") {
        return options.iter().enumerate().all(|(i, o)| {
            let expected = char::from(b'a' + i as u8);
            o.key.len() == 1 && o.key.to_ascii_lowercase().starts_with(expected)
        });
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(prompt: &DetectedPrompt) -> Vec<&str> {
        prompt.options.iter().map(|o| o.key.as_str()).collect()
    }

    #[test]
    fn detects_short_confirmation() {
        let prompt = detect("Writing 3 files\nOverwrite existing config? (y/n) ").unwrap();
        assert_eq!(prompt.kind, PromptKind::Confirmation);
        assert_eq!(prompt.message, "Overwrite existing config?");
        assert_eq!(keys(&prompt), ["y", "n"]);
    }

    #[test]
    fn detects_bracketed_and_long_form_confirmation() {
        let prompt = detect("Proceed with install [Y/n]: ").unwrap();
        assert_eq!(prompt.message, "Proceed with install");
        assert_eq!(keys(&prompt), ["y", "n"]);

        let prompt = detect("Delete branch feature/x? (yes/no)").unwrap();
        assert_eq!(keys(&prompt), ["yes", "no"]);
    }

    #[test]
    fn bare_marker_uses_previous_line_as_message() {
        let prompt = detect("Apply 4 edits to src/main.rs?\n(y/n)").unwrap();
        assert_eq!(prompt.message, "Apply 4 edits to src/main.rs?");
    }

    #[test]
    fn confirmation_marker_mid_line_is_plain_output() {
        assert!(detect("press (y/n) to answer questions later\n$ ").is_none());
        assert!(detect("The flag (y/n) is documented below\nmore text\n").is_none());
    }

    #[test]
    fn finished_confirmation_line_is_plain_output() {
        assert!(detect("Reply format documented as (y/n)\n").is_none());
        assert!(detect("Overwrite existing config? (y/n)\r\n\n").is_none());
    }

    #[test]
    fn confirmation_followed_by_cue_is_a_prompt() {
        let prompt = detect("Discard local changes? (y/n)\n> ").unwrap();
        assert_eq!(prompt.kind, PromptKind::Confirmation);
        assert_eq!(prompt.message, "Discard local changes?");
    }

    #[test]
    fn detects_numbered_menu_with_cursor() {
        let text = "Do you want to make this edit to lib.rs?\n❯ 1. Yes\n  2. Yes, and don't ask again\n  3. No, and tell me what to do differently";
        let prompt = detect(text).unwrap();
        assert_eq!(prompt.kind, PromptKind::Selection);
        assert_eq!(prompt.message, "Do you want to make this edit to lib.rs?");
        assert_eq!(keys(&prompt), ["1", "2", "3"]);
        assert_eq!(prompt.options[1].label, "Yes, and don't ask again");
    }

    #[test]
    fn detects_lettered_menu_followed_by_cue() {
        let text = "Choose from:\na) Debug build\nb) Release build\nEnter choice:\n";
        let prompt = detect(text).unwrap();
        assert_eq!(prompt.message, "Choose from:");
        assert_eq!(keys(&prompt), ["a", "b"]);
    }

    #[test]
    fn numbered_list_in_prose_is_not_a_prompt() {
        // No header ending in ':' or '?'
        assert!(detect("Summary\n1. fixed parser\n2. added tests").is_none());
        // Not consecutive
        assert!(detect("Steps:\n1. build\n3. ship").is_none());
        // Single item
        assert!(detect("Next:\n1. done").is_none());
        // Finished with a newline and no cue: output that scrolled past
        assert!(detect("Changes made:\n1. parser\n2. tests\n").is_none());
    }

    #[test]
    fn feed_accumulates_across_reads_and_consumes_match() {
        let mut detector = PromptDetector::new();
        assert!(detector.feed("Continue with upgr").is_none());
        let prompt = detector.feed("ade? [y/N] ").unwrap();
        assert_eq!(prompt.message, "Continue with upgrade?");

        // Same window content must not raise again.
        assert!(detector.feed("").is_none());
        assert!(detector.feed("\n").is_none());
    }

    #[test]
    fn reset_forgets_partial_prompt() {
        let mut detector = PromptDetector::new();
        assert!(detector.feed("Select target:\n1. debug\n").is_none());
        detector.reset();
        assert!(detector.feed("2. release\n> ").is_none());
    }

    #[test]
    fn window_stays_bounded() {
        let mut detector = PromptDetector::new();
        for _ in 0..100 {
            detector.feed(&"é".repeat(500));
        }
        assert!(detector.window.len() <= WINDOW_BYTES);
        assert!(detector.window.is_char_boundary(0));
    }
}
