//! Byte spans and LSP line/character positions.
//!
//! Internally everything is byte offsets into the document text; the wire
//! speaks zero-based lines and UTF-16 code units. [`LineIndex`] converts
//! between the two.

use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)` into a document's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Zero-based line and UTF-16 character, as on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// Precomputed line-start table for one version of a document's text.
///
/// Rebuilt on every text change; conversions take the text as a parameter so
/// the index never holds a stale copy.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offset of the first character of each line. `line_starts[0] == 0`.
    line_starts: Vec<usize>,
}

impl LineIndex {
    #[must_use]
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    /// Convert a byte offset into a wire position. Offsets past the end of
    /// the text clamp to the last position.
    #[must_use]
    pub fn position(&self, text: &str, offset: usize) -> Position {
        let offset = clamp_to_char_boundary(text, offset);
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let line_start = self.line_starts[line];
        let character = text[line_start..offset]
            .chars()
            .map(char::len_utf16)
            .sum::<usize>();
        Position::new(line as u32, character as u32)
    }

    /// Convert a wire position back to a byte offset. Out-of-range lines or
    /// characters clamp to the end of the text or line respectively.
    #[must_use]
    pub fn offset(&self, text: &str, pos: Position) -> usize {
        let line = pos.line as usize;
        let Some(&line_start) = self.line_starts.get(line) else {
            return text.len();
        };
        let line_end = self
            .line_starts
            .get(line + 1)
            .map_or(text.len(), |&next| next);
        let mut units = 0usize;
        for (i, c) in text[line_start..line_end].char_indices() {
            if c == '\n' || units >= pos.character as usize {
                return line_start + i;
            }
            units += c.len_utf16();
        }
        line_end
    }

    #[must_use]
    pub fn range(&self, text: &str, span: Span) -> Range {
        Range::new(
            self.position(text, span.start),
            self.position(text, span.end),
        )
    }
}

fn clamp_to_char_boundary(text: &str, mut offset: usize) -> usize {
    if offset >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_contains() {
        let span = Span::new(3, 7);
        assert!(!span.contains(2));
        assert!(span.contains(3));
        assert!(span.contains(6));
        assert!(!span.contains(7));
    }

    #[test]
    fn test_position_first_line() {
        let text = "Lemma l: True.";
        let index = LineIndex::new(text);
        assert_eq!(index.position(text, 0), Position::new(0, 0));
        assert_eq!(index.position(text, 6), Position::new(0, 6));
    }

    #[test]
    fn test_position_across_lines() {
        let text = "Lemma l: True.\nProof.\nQed.\n";
        let index = LineIndex::new(text);
        assert_eq!(index.position(text, 15), Position::new(1, 0));
        assert_eq!(index.position(text, 21), Position::new(1, 6));
        assert_eq!(index.position(text, 22), Position::new(2, 0));
    }

    #[test]
    fn test_position_clamps_past_end() {
        let text = "Qed.";
        let index = LineIndex::new(text);
        assert_eq!(index.position(text, 100), Position::new(0, 4));
    }

    #[test]
    fn test_offset_roundtrip() {
        let text = "Definition x := 1.\nLemma l: True.\n";
        let index = LineIndex::new(text);
        for offset in [0, 5, 18, 19, 25, text.len()] {
            let pos = index.position(text, offset);
            assert_eq!(index.offset(text, pos), offset);
        }
    }

    #[test]
    fn test_offset_clamps_bad_line() {
        let text = "Qed.";
        let index = LineIndex::new(text);
        assert_eq!(index.offset(text, Position::new(9, 0)), 4);
    }

    #[test]
    fn test_offset_clamps_bad_character() {
        let text = "ab\ncd\n";
        let index = LineIndex::new(text);
        // Character past line end stops at the newline.
        assert_eq!(index.offset(text, Position::new(0, 40)), 2);
    }

    #[test]
    fn test_utf16_characters() {
        // 'é' is 1 UTF-16 unit but 2 UTF-8 bytes; '𝔾' is 2 units, 4 bytes.
        let text = "é𝔾x";
        let index = LineIndex::new(text);
        assert_eq!(index.position(text, 2), Position::new(0, 1));
        assert_eq!(index.position(text, 6), Position::new(0, 3));
        assert_eq!(index.offset(text, Position::new(0, 3)), 6);
    }

    #[test]
    fn test_range_of_span() {
        let text = "Lemma l: True.\nQed.\n";
        let index = LineIndex::new(text);
        let range = index.range(text, Span::new(0, 14));
        assert_eq!(range.start, Position::new(0, 0));
        assert_eq!(range.end, Position::new(0, 14));
    }
}
