//! Interactive prompt recognition and translation.
//!
//! The detector turns a confirmation or a numbered menu printed by the
//! subprocess into a [`PromptRequest`] that any interface can answer. The
//! answer is validated here and written back as if it had been typed.

pub mod detector;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use detector::{DetectedPrompt, PromptDetector};

/// Option labels that are safe to pick when nobody answers.
static CANCEL_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(cancel|abort|no|skip|quit|exit)\b").expect("cancel pattern is valid")
});

/// Escape: dismisses a menu that offers no cancel-like option.
pub const DISMISS_SEQUENCE: &[u8] = b"\x1b";

/// Kind of interactive question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptKind {
    /// yes/no question
    Confirmation,
    /// numbered or lettered menu
    Selection,
}

/// One answer a prompt accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOption {
    /// What gets typed to pick this option.
    pub key: String,
    /// Human-readable label.
    pub label: String,
}

impl PromptOption {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
        }
    }
}

/// A structured prompt awaiting exactly one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Unique within its session, increasing.
    pub prompt_id: u64,
    pub kind: PromptKind,
    pub message: String,
    pub options: Vec<PromptOption>,
}

impl PromptRequest {
    pub fn from_detection(prompt_id: u64, detected: DetectedPrompt) -> Self {
        Self {
            prompt_id,
            kind: detected.kind,
            message: detected.message,
            options: detected.options,
        }
    }

    /// Map a responder's answer to the key that should be typed.
    ///
    /// Accepts an option key, an option label, or for confirmations any
    /// spelling of yes/no. Returns `None` for anything else.
    pub fn resolve_choice(&self, answer: &str) -> Option<String> {
        let answer = answer.trim();
        if answer.is_empty() {
            return None;
        }

        if let Some(option) = self
            .options
            .iter()
            .find(|o| o.key.eq_ignore_ascii_case(answer) || o.label.eq_ignore_ascii_case(answer))
        {
            return Some(option.key.clone());
        }

        if self.kind == PromptKind::Confirmation {
            let wants_yes = match answer.to_ascii_lowercase().as_str() {
                "y" | "yes" | "true" | "ok" => true,
                "n" | "no" | "false" => false,
                _ => return None,
            };
            let index = if wants_yes { 0 } else { 1 };
            return self.options.get(index).map(|o| o.key.clone());
        }

        None
    }

    /// Key sent when the prompt times out: decline a confirmation, pick a
    /// cancel-like option of a menu. `None` means the menu offers no such
    /// option and should be dismissed with [`DISMISS_SEQUENCE`].
    pub fn default_choice(&self) -> Option<String> {
        match self.kind {
            PromptKind::Confirmation => self.options.get(1).map(|o| o.key.clone()),
            PromptKind::Selection => self
                .options
                .iter()
                .find(|o| CANCEL_LABEL.is_match(&o.label))
                .map(|o| o.key.clone()),
        }
    }
}

/// What happened to a prompt response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptOutcome {
    /// First valid answer; it was written to the subprocess.
    Accepted,
    /// The prompt was already resolved or superseded; nothing was written.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation() -> PromptRequest {
        PromptRequest {
            prompt_id: 1,
            kind: PromptKind::Confirmation,
            message: "Overwrite file?".into(),
            options: vec![PromptOption::new("y", "Yes"), PromptOption::new("n", "No")],
        }
    }

    fn selection(labels: &[&str]) -> PromptRequest {
        PromptRequest {
            prompt_id: 2,
            kind: PromptKind::Selection,
            message: "Select an option:".into(),
            options: labels
                .iter()
                .enumerate()
                .map(|(i, label)| PromptOption::new((i + 1).to_string(), *label))
                .collect(),
        }
    }

    #[test]
    fn confirmation_accepts_yes_no_spellings() {
        let prompt = confirmation();
        assert_eq!(prompt.resolve_choice("Y"), Some("y".into()));
        assert_eq!(prompt.resolve_choice(" yes "), Some("y".into()));
        assert_eq!(prompt.resolve_choice("No"), Some("n".into()));
        assert_eq!(prompt.resolve_choice("maybe"), None);
        assert_eq!(prompt.resolve_choice(""), None);
    }

    #[test]
    fn long_form_confirmation_types_full_word() {
        let mut prompt = confirmation();
        prompt.options = vec![PromptOption::new("yes", "Yes"), PromptOption::new("no", "No")];
        assert_eq!(prompt.resolve_choice("y"), Some("yes".into()));
        assert_eq!(prompt.default_choice(), Some("no".into()));
    }

    #[test]
    fn selection_accepts_key_or_label() {
        let prompt = selection(&["Build", "Test", "Deploy"]);
        assert_eq!(prompt.resolve_choice("2"), Some("2".into()));
        assert_eq!(prompt.resolve_choice("deploy"), Some("3".into()));
        assert_eq!(prompt.resolve_choice("4"), None);
        assert_eq!(prompt.resolve_choice("yes"), None);
    }

    #[test]
    fn defaults_are_safe() {
        assert_eq!(confirmation().default_choice(), Some("n".into()));
        assert_eq!(
            selection(&["Yes", "Yes, always", "No, and tell me what to change"]).default_choice(),
            Some("3".into())
        );
        assert_eq!(selection(&["Red", "Green"]).default_choice(), None);
    }
}
