//! Pure text formatting for subprocess output.
//!
//! Terminal control sequences are stripped before anything reaches a
//! subscriber, and text longer than a transport's message limit is cut into
//! bounded segments.

use std::sync::LazyLock;

use regex::Regex;

/// Matches OSC, DCS/APC/PM/SOS strings, CSI sequences and short escapes.
static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[P_^X][^\x1b]*\x1b\\",
        r"|\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b[ -/]*[0-OQ-WYZ\\`-~]",
    ))
    .expect("escape sequence pattern is valid")
});

/// Longest tail we are willing to hold back as an unfinished escape sequence.
const MAX_PENDING_ESCAPE: usize = 256;

/// Remove terminal control and escape sequences.
///
/// Printable text, tabs and newlines survive. `\r\n` becomes `\n`, and a
/// line redrawn with bare carriage returns keeps only its final rendering.
pub fn strip_control_sequences(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let without_escapes = ESCAPE_SEQUENCE.replace_all(text, "");
    let normalized = without_escapes.replace("\r\n", "\n");

    let mut out = String::with_capacity(normalized.len());
    for (i, line) in normalized.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let visible = last_redraw(line);
        out.extend(visible.chars().filter(|c| *c == '\t' || !c.is_control()));
    }
    out
}

/// The text a terminal would show after `\r` overwrites.
fn last_redraw(line: &str) -> &str {
    line.rsplit('\r')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

/// Split off an escape sequence left unfinished at the end of `text`.
///
/// Returns `(complete, pending)`; `pending` should be prepended to the next
/// read so sequences split across reads are still recognised.
pub fn split_trailing_escape(text: &str) -> (&str, &str) {
    let Some(pos) = text.rfind('\x1b') else {
        return (text, "");
    };
    let tail = &text[pos..];
    if tail.len() > MAX_PENDING_ESCAPE {
        return (text, "");
    }
    match ESCAPE_SEQUENCE.find(tail) {
        Some(m) if m.start() == 0 => (text, ""),
        _ => text.split_at(pos),
    }
}

/// Trim trailing spaces and collapse runs of more than two blank lines.
pub fn clean_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    let mut first = true;

    for line in text.split('\n') {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !first {
            out.push('\n');
        }
        out.push_str(trimmed);
        first = false;
    }
    out
}

/// Split `text` into segments of at most `limit` characters.
///
/// Lines are packed greedily and kept whole. A single line longer than
/// `limit` is replaced by [`summarize`], so joining the segments gives back
/// the input exactly whenever no line exceeds the limit.
pub fn chunk(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() || limit == 0 {
        return Vec::new();
    }
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = char_len(line);

        if line_len > limit {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
                current_len = 0;
            }
            segments.push(summarize(line, limit));
            continue;
        }

        if current_len + line_len > limit {
            segments.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Keep the head and tail of `text` within `limit` characters.
///
/// The omitted middle is replaced by [`omission_marker`] carrying the exact
/// number of characters dropped. When `limit` is too small to hold the marker
/// the text is simply cut at `limit`.
pub fn summarize(text: &str, limit: usize) -> String {
    let total = char_len(text);
    if total <= limit {
        return text.to_string();
    }

    let Some((kept, marker)) = marker_fit(total, limit) else {
        return text.chars().take(limit).collect();
    };

    let tail_len = kept / 2;
    let head_len = kept - tail_len;

    let mut out = String::with_capacity(limit * 4);
    out.extend(text.chars().take(head_len));
    out.push_str(&marker);
    out.extend(text.chars().skip(total - tail_len));
    out
}

/// The marker inserted in place of `omitted` characters.
pub fn omission_marker(omitted: usize) -> String {
    format!("\n... [{omitted} characters omitted] ...\n")
}

/// Find how many characters to keep so that kept + marker == limit.
///
/// The marker's width depends on the omitted count, which depends on the
/// marker's width; iterate until the digit count settles.
fn marker_fit(total: usize, limit: usize) -> Option<(usize, String)> {
    let mut omitted = total - limit;
    for _ in 0..4 {
        let marker = omission_marker(omitted);
        let kept = limit.checked_sub(char_len(&marker))?;
        if kept < 2 {
            return None;
        }
        let actual = total - kept;
        if actual == omitted {
            return Some((kept, marker));
        }
        omitted = actual;
    }
    None
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn omitted_count(segment: &str) -> usize {
        let start = segment.find("... [").unwrap() + 5;
        let end = segment[start..].find(' ').unwrap() + start;
        segment[start..end].parse().unwrap()
    }

    #[test]
    fn strips_color_and_cursor_sequences() {
        let input = "\x1b[1;32mok\x1b[0m \x1b[2K\x1b[?25ldone\x1b[?25h";
        assert_eq!(strip_control_sequences(input), "ok done");
    }

    #[test]
    fn strips_osc_title_and_charset_escapes() {
        let input = "\x1b]0;my title\x07hello\x1b(B world\x1b]8;;http://x\x1b\\link";
        assert_eq!(strip_control_sequences(input), "hello worldlink");
    }

    #[test]
    fn keeps_newlines_and_tabs() {
        let input = "a\tb\r\nc\n\nd\x07";
        assert_eq!(strip_control_sequences(input), "a\tb\nc\n\nd");
    }

    #[test]
    fn carriage_return_redraw_keeps_final_state() {
        let input = "progress 10%\rprogress 50%\rprogress 100%\r\nnext";
        assert_eq!(strip_control_sequences(input), "progress 100%\nnext");
    }

    #[test]
    fn split_trailing_escape_holds_unfinished_csi() {
        let (done, pending) = split_trailing_escape("text\x1b[3");
        assert_eq!(done, "text");
        assert_eq!(pending, "\x1b[3");

        let (done, pending) = split_trailing_escape("text\x1b[31m");
        assert_eq!(done, "text\x1b[31m");
        assert_eq!(pending, "");
    }

    #[test]
    fn clean_whitespace_collapses_blank_runs() {
        let input = "a   \n\n\n\n\nb  ";
        assert_eq!(clean_whitespace(input), "a\n\n\nb");
    }

    #[test]
    fn chunk_under_limit_is_identity() {
        let text = "line one\nline two\n";
        assert_eq!(chunk(text, 100), vec![text.to_string()]);
        assert!(chunk("", 100).is_empty());
    }

    #[test]
    fn chunk_packs_lines_and_reassembles() {
        let text: String = (0..50).map(|i| format!("line number {i:03}\n")).collect();
        let segments = chunk(&text, 100);

        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.chars().count() <= 100));
        assert!(segments.iter().all(|s| !s.contains("omitted")));
        assert_eq!(segments.concat(), text);
    }

    #[test]
    fn chunk_summarizes_single_oversized_line() {
        let text = "A".repeat(3000);
        let segments = chunk(&text, 1900);

        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert!(segment.chars().count() <= 1900);
        assert!(segment.starts_with('A'));
        assert!(segment.ends_with('A'));

        let kept = segment.chars().filter(|c| *c == 'A').count();
        assert_eq!(omitted_count(segment), 3000 - kept);
    }

    #[test]
    fn summarize_is_deterministic_and_exact() {
        for (len, limit) in [(3000, 1900), (10_000, 200), (101, 100), (1_000_000, 1900)] {
            let text: String = (0..len).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
            let first = summarize(&text, limit);
            let second = summarize(&text, limit);
            assert_eq!(first, second);
            assert_eq!(first.chars().count(), limit);

            let marker_len = omission_marker(omitted_count(&first)).chars().count();
            assert_eq!(omitted_count(&first), len - (limit - marker_len));
        }
    }

    #[test]
    fn summarize_keeps_start_and_end() {
        let text = format!("BEGIN{}END", "x".repeat(5000));
        let summary = summarize(&text, 300);
        assert!(summary.starts_with("BEGIN"));
        assert!(summary.ends_with("END"));
    }

    #[test]
    fn summarize_tiny_limit_falls_back_to_truncation() {
        let summary = summarize(&"z".repeat(500), 10);
        assert_eq!(summary, "z".repeat(10));
    }

    #[test]
    fn summarize_counts_characters_not_bytes() {
        let text = "é".repeat(400);
        let summary = summarize(&text, 100);
        assert_eq!(summary.chars().count(), 100);
    }
}
