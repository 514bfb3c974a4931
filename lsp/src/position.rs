//! Offset ↔ position conversion.
//!
//! Offsets and characters are UTF-16 code units, the LSP default position
//! encoding. Line ends exclude the line terminator: `\n`, `\r\n` or a
//! lone `\r`.

use std::ops::Range as OffsetRange;

use lsp_types::{Position, Range};

/// Line table for one snapshot of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineIndex {
    /// `(start, end)` of every line; `end` excludes the terminator.
    lines: Vec<(usize, usize)>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut start = 0;
        let mut offset = 0;
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '\n' => {
                    lines.push((start, offset));
                    start = offset + 1;
                }
                '\r' if chars.peek() == Some(&'\n') => {
                    chars.next();
                    lines.push((start, offset));
                    start = offset + 2;
                    offset += 1;
                }
                '\r' => {
                    lines.push((start, offset));
                    start = offset + 1;
                }
                _ => {}
            }
            offset += ch.len_utf16();
        }
        lines.push((start, offset));

        Self { lines, len: offset }
    }

    /// Document length in UTF-16 code units.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Always at least 1; an empty document has one empty line.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line_start(&self, line: usize) -> Option<usize> {
        self.lines.get(line).map(|&(start, _)| start)
    }

    pub fn line_end(&self, line: usize) -> Option<usize> {
        self.lines.get(line).map(|&(_, end)| end)
    }

    /// Line containing `offset`; offsets past the end map to the last line.
    pub fn line_of(&self, offset: usize) -> usize {
        self.lines
            .partition_point(|&(start, _)| start <= offset)
            .saturating_sub(1)
    }

    /// Whether `offset` splits a `\r\n` pair.
    pub fn is_inside_terminator(&self, offset: usize) -> bool {
        let line = self.line_of(offset);
        let (_, end) = self.lines[line];
        let next = self.line_start(line + 1).unwrap_or(self.len);
        end < offset && offset < next
    }
}

/// Position → offset.
///
/// Negative lines clamp to 0, lines past the end clamp to the document
/// length, and a character past the line's end clamps to that end.
pub fn to_offset(index: &LineIndex, line: i64, character: i64) -> usize {
    if line < 0 {
        return 0;
    }
    let Some((start, end)) = usize::try_from(line)
        .ok()
        .and_then(|line| index.lines.get(line).copied())
    else {
        return index.len();
    };
    let wanted = (start as i64).saturating_add(character);
    wanted.clamp(start as i64, end as i64) as usize
}

pub fn position_to_offset(index: &LineIndex, position: Position) -> usize {
    to_offset(index, i64::from(position.line), i64::from(position.character))
}

/// Offset → position. The offset is clamped into `[0, len]` first, and an
/// offset inside a `\r\n` maps to the end of its line.
pub fn to_position(index: &LineIndex, offset: i64) -> Position {
    let offset = offset.clamp(0, index.len() as i64) as usize;
    let line = index.line_of(offset);
    let (start, end) = index.lines[line];
    Position::new(line as u32, (offset.min(end) - start) as u32)
}

/// Offsets for a server-provided range, or `None` when the server sent
/// something unusable (`start > end`, or `end` past the document).
pub fn range_to_offsets(index: &LineIndex, range: &Range) -> Option<OffsetRange<usize>> {
    let start = position_to_offset(index, range.start);
    let end = position_to_offset(index, range.end);
    (start <= end && end <= index.len()).then_some(start..end)
}

/// Translate a UTF-16 offset into a byte index of `text`, clamped to its
/// length.
pub fn byte_index(text: &str, offset: usize) -> usize {
    let mut units = 0;
    for (idx, ch) in text.char_indices() {
        if units >= offset {
            return idx;
        }
        units += ch.len_utf16();
    }
    text.len()
}
