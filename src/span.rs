use serde::{Deserialize, Serialize};

/// A source region in 1-based line/column coordinates.
///
/// Columns count Unicode code points, not bytes. The start is inclusive and
/// the end is exclusive, so a span covering the single character at column 3
/// has `start_col == 3` and `end_col == 4`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Span {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl Span {
    pub fn new(start_line: u32, start_col: u32, end_line: u32, end_col: u32) -> Self {
        Self {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }

    /// Span covering `start_col..end_col` on a single line.
    pub fn on_line(line: u32, start_col: u32, end_col: u32) -> Self {
        Self::new(line, start_col, line, end_col)
    }

    /// Merge two spans into one covering both.
    pub fn merge(self, other: Span) -> Span {
        let (start_line, start_col) =
            if (self.start_line, self.start_col) <= (other.start_line, other.start_col) {
                (self.start_line, self.start_col)
            } else {
                (other.start_line, other.start_col)
            };
        let (end_line, end_col) = if (self.end_line, self.end_col) >= (other.end_line, other.end_col)
        {
            (self.end_line, self.end_col)
        } else {
            (other.end_line, other.end_col)
        };
        Span {
            start_line,
            start_col,
            end_line,
            end_col,
        }
    }
}

/// Column of the first non-whitespace character (1-based, code points).
pub fn first_non_space_col(raw: &str) -> u32 {
    let mut col = 1u32;
    for ch in raw.chars() {
        if !ch.is_whitespace() {
            return col;
        }
        col += 1;
    }
    1
}

/// Exclusive end column of a line (code-point count + 1).
pub fn line_end_col(raw: &str) -> u32 {
    raw.chars().count() as u32 + 1
}
