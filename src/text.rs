//! Text segmentation.
//!
//! Splits raw chapter text into bounded-length chunks along sentence
//! boundaries. Each chunk becomes one inference unit; its index records the
//! original position so chapter audio can be reassembled in order no matter
//! how batches complete.

/// A bounded-length slice of chapter text submitted as one inference unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the original chunk sequence, used for reassembly ordering.
    pub index: usize,
    pub text: String,
}

/// Split `text` into chunks no longer than `limit` characters.
///
/// Sentence-like units are detected at `.?!` followed by whitespace and
/// greedily packed while the running buffer stays under `limit`. A single
/// unit longer than `limit` is hard-split on whitespace into word-packed
/// sub-chunks. A single word at or over `limit` is truncated to fit, with a
/// warning; oversized chunks are never emitted.
pub fn segment(text: &str, limit: usize) -> Vec<Chunk> {
    let mut out: Vec<String> = Vec::new();
    let mut buffer = String::new();

    for unit in split_sentences(text) {
        if unit.len() > limit {
            // Oversized unit: flush the buffer, then word-pack the unit.
            if !buffer.trim().is_empty() {
                out.push(buffer.trim().to_string());
            }
            buffer.clear();
            hard_split(unit, limit, &mut out);
            continue;
        }

        if buffer.len() + unit.len() < limit {
            buffer.push_str(unit);
            buffer.push(' ');
        } else {
            if !buffer.trim().is_empty() {
                out.push(buffer.trim().to_string());
            }
            buffer.clear();
            buffer.push_str(unit);
            buffer.push(' ');
        }
    }

    if !buffer.trim().is_empty() {
        out.push(buffer.trim().to_string());
    }

    out.into_iter()
        .filter(|c| !c.is_empty())
        .enumerate()
        .map(|(index, text)| Chunk { index, text })
        .collect()
}

/// Split text into sentence-like units at `.?!` followed by whitespace.
///
/// The terminator stays with its sentence; the separating whitespace is
/// consumed.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut units = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if (b == b'.' || b == b'?' || b == b'!')
            && bytes.get(i + 1).is_some_and(|n| n.is_ascii_whitespace())
        {
            let unit = text[start..=i].trim();
            if !unit.is_empty() {
                units.push(unit);
            }
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            start = i;
        } else {
            i += 1;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        units.push(tail);
    }
    units
}

/// Word-pack an oversized unit into sub-chunks each under `limit`.
fn hard_split(unit: &str, limit: usize, out: &mut Vec<String>) {
    let mut buffer = String::new();
    for word in unit.split_whitespace() {
        let word = if word.len() >= limit {
            // Pathological single token; truncate at a char boundary rather
            // than emit an oversized chunk.
            log::warn!(
                "Truncating a {}-char word to fit the {limit}-char chunk limit",
                word.len()
            );
            truncate_to_boundary(word, limit.saturating_sub(1))
        } else {
            word
        };

        if buffer.len() + word.len() + 1 < limit {
            buffer.push_str(word);
            buffer.push(' ');
        } else {
            if !buffer.trim().is_empty() {
                out.push(buffer.trim().to_string());
            }
            buffer.clear();
            buffer.push_str(word);
            buffer.push(' ');
        }
    }
    if !buffer.trim().is_empty() {
        out.push(buffer.trim().to_string());
    }
}

/// Truncate to at most `max_bytes`, backing up to a UTF-8 char boundary.
fn truncate_to_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Clean text of characters known to destabilise TTS generation.
///
/// Strips zero-width and control characters, normalises smart quotes,
/// dashes and ellipses to ASCII, and collapses runs of spaces and blank
/// lines while preserving paragraph breaks.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for ch in text.chars() {
        match ch {
            '\u{200b}'..='\u{200f}' | '\u{feff}' => {}
            '\u{201c}' | '\u{201d}' => out.push('"'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{2014}' => out.push_str("--"),
            '\u{2013}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    // Collapse horizontal whitespace runs.
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_space = false;
    for ch in out.chars() {
        if ch == ' ' || ch == '\t' {
            if !prev_space {
                collapsed.push(' ');
            }
            prev_space = true;
        } else {
            collapsed.push(ch);
            prev_space = false;
        }
    }

    // Cap consecutive newlines at two (one blank line).
    let mut result = String::with_capacity(collapsed.len());
    let mut newlines = 0;
    for ch in collapsed.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                result.push(ch);
            }
        } else {
            newlines = 0;
            result.push(ch);
        }
    }

    result.trim().to_string()
}
