//! Source location tracking for TLC.
//!
//! Tensor IR programs are produced by a frontend (a kernel DSL) and carry
//! MLIR-style locations: a file name with a line and column, a named
//! location, or nothing at all for compiler-generated operations. Every
//! diagnostic emitted by the pipeline points at one of these.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Line and column information for a source location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineCol {
    /// 1-indexed line number.
    pub line: u32,
    /// 1-indexed column number.
    pub col: u32,
}

impl LineCol {
    /// Create a new line/column pair.
    #[must_use]
    pub const fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// The location of an operation in the kernel source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Loc {
    /// No location is known (compiler-generated operation).
    #[default]
    Unknown,
    /// A position in a source file.
    File {
        /// The file name or path.
        file: String,
        /// Line and column within the file.
        pos: LineCol,
    },
    /// A named location, e.g. the name of the kernel argument it came from.
    Name(String),
}

impl Loc {
    /// Create a file location.
    #[must_use]
    pub fn file(file: impl Into<String>, line: u32, col: u32) -> Self {
        Self::File {
            file: file.into(),
            pos: LineCol::new(line, col),
        }
    }

    /// Create a named location.
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Check if the location is unknown.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Get the file name, if this is a file location.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::File { file, .. } => Some(file),
            _ => None,
        }
    }

    /// Get the line/column, if this is a file location.
    #[must_use]
    pub const fn line_col(&self) -> Option<LineCol> {
        match self {
            Self::File { pos, .. } => Some(*pos),
            _ => None,
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "loc(unknown)"),
            Self::File { file, pos } => write!(f, "loc(\"{file}\":{}:{})", pos.line, pos.col),
            Self::Name(name) => write!(f, "loc(\"{name}\")"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loc_display() {
        assert_eq!(
            Loc::file("attn.py", 192, 16).to_string(),
            "loc(\"attn.py\":192:16)"
        );
        assert_eq!(Loc::name("q_ptr").to_string(), "loc(\"q_ptr\")");
        assert_eq!(Loc::Unknown.to_string(), "loc(unknown)");
    }

    #[test]
    fn test_loc_accessors() {
        let loc = Loc::file("kernel.py", 3, 9);
        assert_eq!(loc.file_name(), Some("kernel.py"));
        assert_eq!(loc.line_col(), Some(LineCol::new(3, 9)));
        assert!(!loc.is_unknown());
        assert!(Loc::default().is_unknown());
    }
}
