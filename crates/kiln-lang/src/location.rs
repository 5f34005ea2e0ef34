//! Source coordinates.
//!
//! Every token, AST node, and IR term carries a [`Location`] so that any
//! stage of the pipeline can report a diagnostic against the original text.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A point in a source file: 1-based row/column plus the byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Coord {
    pub row: u32,
    pub col: u32,
    pub byte: u32,
}

impl Coord {
    pub fn new(row: u32, col: u32, byte: u32) -> Self {
        Self { row, col, byte }
    }

    /// The first byte of a file.
    pub fn start() -> Self {
        Self {
            row: 1,
            col: 1,
            byte: 0,
        }
    }
}

/// A half-open span `[start, end)` within a named file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub file: Arc<str>,
    pub start: Coord,
    pub end: Coord,
}

impl Location {
    pub fn new(file: Arc<str>, start: Coord, end: Coord) -> Self {
        Self { file, start, end }
    }

    /// A zero-width location at the start of a file, for synthesized nodes.
    pub fn synthetic(file: &str) -> Self {
        Self {
            file: Arc::from(file),
            start: Coord::start(),
            end: Coord::start(),
        }
    }

    /// Span covering both `self` and `other` (assumed same file).
    pub fn through(&self, other: &Location) -> Location {
        Location {
            file: self.file.clone(),
            start: self.start,
            end: other.end,
        }
    }

    pub fn contains(&self, byte: u32) -> bool {
        self.start.byte <= byte && byte < self.end.byte
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.row == self.end.row {
            if self.end.col <= self.start.col + 1 {
                write!(f, "{}:{}:{}", self.file, self.start.row, self.start.col)
            } else {
                write!(
                    f,
                    "{}:{}:[{}-{}]",
                    self.file,
                    self.start.row,
                    self.start.col,
                    self.end.col.saturating_sub(1)
                )
            }
        } else {
            write!(
                f,
                "{}:[{}:{}-{}:{}]",
                self.file,
                self.start.row,
                self.start.col,
                self.end.row,
                self.end.col.saturating_sub(1)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(r1: u32, c1: u32, r2: u32, c2: u32) -> Location {
        Location::new(
            Arc::from("build.kiln"),
            Coord::new(r1, c1, 0),
            Coord::new(r2, c2, 0),
        )
    }

    #[test]
    fn display_point() {
        assert_eq!(loc(3, 7, 3, 8).to_string(), "build.kiln:3:7");
    }

    #[test]
    fn display_single_row_span() {
        assert_eq!(loc(3, 7, 3, 12).to_string(), "build.kiln:3:[7-11]");
    }

    #[test]
    fn display_multi_row_span() {
        assert_eq!(loc(3, 7, 5, 2).to_string(), "build.kiln:[3:7-5:1]");
    }

    #[test]
    fn through_unions_spans() {
        let a = loc(1, 1, 1, 4);
        let b = loc(2, 1, 2, 9);
        let j = a.through(&b);
        assert_eq!(j.start, a.start);
        assert_eq!(j.end, b.end);
    }
}
