//! Cell-level error values.
//!
//! These are *values a formula may legitimately evaluate to*, not exceptions:
//! a `#REF!` produced by a structural edit lives in a cell like any number
//! does. Structurally impossible edits are reported through the engine's
//! `EditError` instead and never reach a cell.

use core::fmt;

/// The canonical set of cell error codes this engine produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CellErrorKind {
    /// A reference stopped existing after a structural edit.
    Ref,
    /// Member of a dependency cycle.
    Cycle,
    /// Shape or type mismatch (e.g. array dimensions).
    Value,
    /// Division by zero.
    Div,
    /// Unknown function or name.
    Name,
    /// Numeric domain error.
    Num,
    /// Value not available.
    Na,
}

impl fmt::Display for CellErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ref => "#REF!",
            Self::Cycle => "#CYCLE!",
            Self::Value => "#VALUE!",
            Self::Div => "#DIV/0!",
            Self::Name => "#NAME?",
            Self::Num => "#NUM!",
            Self::Na => "#N/A",
        })
    }
}

impl CellErrorKind {
    /// Parse a canonical error code, e.g. `#REF!`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "#REF!" => Some(Self::Ref),
            "#CYCLE!" => Some(Self::Cycle),
            "#VALUE!" => Some(Self::Value),
            "#DIV/0!" => Some(Self::Div),
            "#NAME?" => Some(Self::Name),
            "#NUM!" => Some(Self::Num),
            "#N/A" => Some(Self::Na),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellError {
    pub kind: CellErrorKind,
    pub message: Option<String>,
}

impl CellError {
    pub fn new(kind: CellErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl From<CellErrorKind> for CellError {
    fn from(kind: CellErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CellError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_parse() {
        for kind in [
            CellErrorKind::Ref,
            CellErrorKind::Cycle,
            CellErrorKind::Value,
            CellErrorKind::Div,
            CellErrorKind::Name,
            CellErrorKind::Num,
            CellErrorKind::Na,
        ] {
            assert_eq!(CellErrorKind::parse(&kind.to_string()), Some(kind));
        }
        assert_eq!(CellErrorKind::parse("#BOGUS!"), None);
    }
}
