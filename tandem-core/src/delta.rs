//! Minimal text deltas and line/column position mapping.
//!
//! A [`TextDelta`] is a single replace: bytes `start..end` of the old text
//! are substituted with `text`. It is what the editor binding applies to
//! the visible buffer after a remote merge, and what marker anchors are
//! remapped across.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Zero-based line/column coordinate.
///
/// `column` counts bytes within the line (UTF-8), matching the byte
/// offsets used for document indexing throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A single replace edit against a known document state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
    /// Byte offset where the replaced range starts.
    pub start: usize,
    /// Byte offset one past the end of the replaced range.
    pub end: usize,
    /// Replacement text (empty for a pure deletion).
    pub text: String,
}

impl TextDelta {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self { start: at, end: at, text: text.into() }
    }

    pub fn delete(range: Range<usize>) -> Self {
        Self { start: range.start, end: range.end, text: String::new() }
    }

    pub fn replace(range: Range<usize>, text: impl Into<String>) -> Self {
        Self { start: range.start, end: range.end, text: text.into() }
    }

    /// Length of the removed range in bytes.
    pub fn removed_len(&self) -> usize {
        self.end - self.start
    }

    /// Length of the inserted text in bytes.
    pub fn inserted_len(&self) -> usize {
        self.text.len()
    }

    /// Minimal single-range difference between two texts.
    ///
    /// Trims the longest common prefix and suffix (on char boundaries)
    /// and returns the replace covering what remains. `None` when the
    /// texts are identical — which is exactly what a duplicate, already
    /// merged update produces.
    pub fn diff(before: &str, after: &str) -> Option<TextDelta> {
        if before == after {
            return None;
        }

        let b = before.as_bytes();
        let a = after.as_bytes();

        let mut prefix = 0;
        let max_prefix = b.len().min(a.len());
        while prefix < max_prefix && b[prefix] == a[prefix] {
            prefix += 1;
        }
        // The shared prefix is byte-identical in both strings, so backing
        // off to a char boundary in `before` lands on one in `after` too.
        while prefix > 0 && !before.is_char_boundary(prefix) {
            prefix -= 1;
        }

        let mut suffix = 0;
        let max_suffix = b.len().min(a.len()) - prefix;
        while suffix < max_suffix && b[b.len() - 1 - suffix] == a[a.len() - 1 - suffix] {
            suffix += 1;
        }
        while suffix > 0 && !before.is_char_boundary(before.len() - suffix) {
            suffix -= 1;
        }

        Some(TextDelta {
            start: prefix,
            end: before.len() - suffix,
            text: after[prefix..after.len() - suffix].to_string(),
        })
    }

    /// Apply this delta to a string, returning the edited text.
    pub fn apply_to(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + self.text.len());
        out.push_str(&text[..self.start]);
        out.push_str(&self.text);
        out.push_str(&text[self.end..]);
        out
    }

    /// Remap a byte offset across this edit.
    ///
    /// Offsets before the edit are untouched, offsets after it shift by
    /// the size difference, and an offset inside the replaced range clamps
    /// to the end of the insertion.
    pub fn map_offset(&self, offset: usize) -> usize {
        if offset <= self.start {
            offset
        } else if offset >= self.end {
            offset - self.removed_len() + self.inserted_len()
        } else {
            self.start + self.inserted_len()
        }
    }
}

/// Convert a byte offset into a line/column position.
///
/// Offsets past the end of the text clamp to the final position.
pub fn offset_to_position(text: &str, offset: usize) -> Position {
    let offset = offset.min(text.len());
    let mut line = 0u32;
    let mut line_start = 0usize;
    for (i, b) in text.as_bytes()[..offset].iter().enumerate() {
        if *b == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    Position::new(line, (offset - line_start) as u32)
}

/// Convert a line/column position into a byte offset.
///
/// `None` when the line does not exist or the column runs past the end of
/// that line.
pub fn position_to_offset(text: &str, pos: Position) -> Option<usize> {
    let mut line_start = 0usize;
    let mut line = 0u32;
    while line < pos.line {
        match text[line_start..].find('\n') {
            Some(i) => {
                line_start += i + 1;
                line += 1;
            }
            None => return None,
        }
    }
    let line_end = text[line_start..]
        .find('\n')
        .map(|i| line_start + i)
        .unwrap_or(text.len());
    let offset = line_start + pos.column as usize;
    if offset > line_end {
        return None;
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_identical_is_none() {
        assert_eq!(TextDelta::diff("hello", "hello"), None);
        assert_eq!(TextDelta::diff("", ""), None);
    }

    #[test]
    fn test_diff_insert() {
        let d = TextDelta::diff("hello", "hello world").unwrap();
        assert_eq!(d, TextDelta::insert(5, " world"));
    }

    #[test]
    fn test_diff_delete() {
        let d = TextDelta::diff("hello world", "hello").unwrap();
        assert_eq!(d, TextDelta::delete(5..11));
    }

    #[test]
    fn test_diff_replace_middle() {
        let d = TextDelta::diff("abcdef", "abXYef").unwrap();
        assert_eq!(d, TextDelta::replace(2..4, "XY"));
    }

    #[test]
    fn test_diff_applies_back() {
        let cases = [
            ("hello", "hxello"),
            ("hello", "hell"),
            ("", "abc"),
            ("abc", ""),
            ("aaaa", "aa"),
            ("line1\nline2", "line1\ninserted\nline2"),
        ];
        for (before, after) in cases {
            let d = TextDelta::diff(before, after).unwrap();
            assert_eq!(d.apply_to(before), after, "{before:?} -> {after:?}");
        }
    }

    #[test]
    fn test_diff_multibyte_boundary() {
        // é = c3 a9, è = c3 a8: common byte prefix splits the char.
        let d = TextDelta::diff("é", "è").unwrap();
        assert_eq!(d.apply_to("é"), "è");
        assert!("é".is_char_boundary(d.start));
    }

    #[test]
    fn test_map_offset_before_and_after() {
        let d = TextDelta::replace(5..8, "0123456");
        assert_eq!(d.map_offset(3), 3);
        assert_eq!(d.map_offset(5), 5);
        // After the edit: shift by inserted - removed = +4.
        assert_eq!(d.map_offset(8), 12);
        assert_eq!(d.map_offset(20), 24);
    }

    #[test]
    fn test_map_offset_inside_clamps() {
        let d = TextDelta::replace(5..10, "ab");
        assert_eq!(d.map_offset(7), 7); // start + inserted_len
    }

    #[test]
    fn test_offset_to_position() {
        let text = "foo\nbar\nbaz";
        assert_eq!(offset_to_position(text, 0), Position::new(0, 0));
        assert_eq!(offset_to_position(text, 3), Position::new(0, 3));
        assert_eq!(offset_to_position(text, 4), Position::new(1, 0));
        assert_eq!(offset_to_position(text, 9), Position::new(2, 1));
        // Past the end clamps.
        assert_eq!(offset_to_position(text, 99), Position::new(2, 3));
    }

    #[test]
    fn test_position_to_offset() {
        let text = "foo\nbar\nbaz";
        assert_eq!(position_to_offset(text, Position::new(0, 0)), Some(0));
        assert_eq!(position_to_offset(text, Position::new(1, 2)), Some(6));
        assert_eq!(position_to_offset(text, Position::new(2, 3)), Some(11));
        assert_eq!(position_to_offset(text, Position::new(3, 0)), None);
        assert_eq!(position_to_offset(text, Position::new(0, 7)), None);
    }

    #[test]
    fn test_position_roundtrip() {
        let text = "alpha\n\nbeta gamma\ndelta";
        for offset in 0..=text.len() {
            if !text.is_char_boundary(offset) {
                continue;
            }
            let pos = offset_to_position(text, offset);
            assert_eq!(position_to_offset(text, pos), Some(offset));
        }
    }
}
