//! Cell values as seen by the evaluator and by callers reading cells.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

use crate::CellError;

/* ───────────────────── date-serial utilities ─────────────────────
Spreadsheet serial dates, 1900 system:
  serial 1 = 1900-01-01; time is stored as fractional days.
Base date = 1899-12-31 so that serial 1 = base + 1 day.
------------------------------------------------------------------ */

const SERIAL_EPOCH: NaiveDate = NaiveDate::from_ymd_opt(1899, 12, 31).unwrap();

/// Convert a date-time into its fractional serial number.
pub fn datetime_to_serial(dt: &NaiveDateTime) -> f64 {
    let days = (dt.date() - SERIAL_EPOCH).num_days();
    let secs_in_day = dt.time().num_seconds_from_midnight() as f64;
    days as f64 + secs_in_day / 86_400.0
}

/// Convert a date into its whole-day serial number.
pub fn date_to_serial(date: &NaiveDate) -> f64 {
    (*date - SERIAL_EPOCH).num_days() as f64
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Boolean(bool),
    /// Rectangular block result of an array formula.
    Array(Vec<Vec<CellValue>>),
    Empty,
    Error(CellError),
}

impl CellValue {
    pub fn error(kind: crate::CellErrorKind) -> Self {
        CellValue::Error(CellError::new(kind))
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// Numeric view for aggregation: numbers only, everything else `None`.
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl Hash for CellValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            CellValue::Number(n) => n.to_bits().hash(state),
            CellValue::Text(s) => s.hash(state),
            CellValue::Boolean(b) => b.hash(state),
            CellValue::Array(a) => a.hash(state),
            CellValue::Empty => state.write_u8(0),
            CellValue::Error(e) => e.hash(state),
        }
    }
}

impl Eq for CellValue {}

impl Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(n) => write!(f, "{n}"),
            CellValue::Text(s) => write!(f, "{s}"),
            CellValue::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            CellValue::Array(rows) => {
                write!(f, "{{")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    for (j, v) in row.iter().enumerate() {
                        if j > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{v}")?;
                    }
                }
                write!(f, "}}")
            }
            CellValue::Empty => Ok(()),
            CellValue::Error(e) => write!(f, "{}", e.kind),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Boolean(b)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<CellError> for CellValue {
    fn from(e: CellError) -> Self {
        CellValue::Error(e)
    }
}
