//! Overlap-preserving text chunker.
//!
//! Splits document text into windows of at most `max_chunk_size` characters
//! that advance by `max_chunk_size - chunk_overlap`, so consecutive chunks
//! share exactly `chunk_overlap` characters. Window ends are realigned
//! backwards to the nearest paragraph break, then sentence end, then
//! whitespace, within `boundary_lookback` characters; when no boundary
//! exists the window is cut at the hard limit.
//!
//! All positions are character offsets into the original text, monotonically
//! non-decreasing, so chunks can be stitched back into the source.

use crate::config::ChunkingConfig;

/// A chunk boundary plus its text, before identity is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    /// 0-based, contiguous.
    pub index: i64,
    /// Character offset of the first character.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    pub content: String,
}

/// Split `text` into overlapping chunk spans.
///
/// Empty input produces no spans; callers treat that as non-indexable
/// upstream. Text shorter than the window becomes a single span. The final
/// span may fall below `min_chunk_size`; stretching it would break the
/// exact-overlap contract between consecutive windows.
pub fn chunk_text(text: &str, params: &ChunkingConfig) -> Vec<ChunkSpan> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Vec::new();
    }

    // Byte offset of each character, plus the end sentinel, for slicing.
    let mut byte_at: Vec<usize> = Vec::with_capacity(total + 1);
    let mut pos = 0;
    for c in &chars {
        byte_at.push(pos);
        pos += c.len_utf8();
    }
    byte_at.push(pos);

    let max = params.max_chunk_size;
    let overlap = params.chunk_overlap;

    let slice = |start: usize, end: usize| text[byte_at[start]..byte_at[end]].to_string();

    if total <= max {
        return vec![ChunkSpan {
            index: 0,
            start: 0,
            end: total,
            content: slice(0, total),
        }];
    }

    let mut spans: Vec<ChunkSpan> = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let hard_end = (start + max).min(total);
        let end = if hard_end < total {
            realign_end(&chars, start, hard_end, overlap, params.boundary_lookback)
        } else {
            hard_end
        };

        spans.push(ChunkSpan {
            index,
            start,
            end,
            content: slice(start, end),
        });

        if end >= total {
            break;
        }

        // realign_end guarantees end > start + overlap, so this advances.
        start = end - overlap;
        index += 1;
    }

    spans
}

/// Search backwards from `hard_end` for a natural boundary.
///
/// Preference order: paragraph break, sentence end, whitespace. The search
/// never goes further back than `lookback` characters, and never at or below
/// `start + overlap` so the next window always advances.
fn realign_end(
    chars: &[char],
    start: usize,
    hard_end: usize,
    overlap: usize,
    lookback: usize,
) -> usize {
    let floor = (start + overlap + 1).max(hard_end.saturating_sub(lookback));
    if floor >= hard_end {
        return hard_end;
    }

    // Paragraph: cut just after the blank line.
    for i in (floor..hard_end).rev() {
        if i >= 1 && chars[i - 1] == '\n' && chars[i] == '\n' {
            return i + 1;
        }
    }

    // Sentence: terminator followed by whitespace.
    for i in (floor..hard_end.saturating_sub(1)).rev() {
        if matches!(chars[i], '.' | '!' | '?') && chars[i + 1].is_whitespace() {
            return i + 1;
        }
    }

    // Any whitespace.
    for i in (floor..hard_end).rev() {
        if chars[i].is_whitespace() {
            return i + 1;
        }
    }

    hard_end
}
