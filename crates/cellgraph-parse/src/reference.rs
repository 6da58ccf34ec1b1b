//! Anchored references as written inside formulas.

use cellgraph_common::{CellAddress, CellRange, Coord, SheetId};

/// One anchored 2-D coordinate. Each axis is either absolute (stores the
/// 0-based grid index) or relative (stores the signed offset from the
/// formula's own address). `flags` is a 2-bit field: `bit0 = row_abs`,
/// `bit1 = col_abs`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RefCoord {
    row: i64,
    col: i64,
    flags: u8,
}

impl RefCoord {
    #[inline]
    pub const fn new(row: i64, col: i64, row_abs: bool, col_abs: bool) -> Self {
        let flags = (row_abs as u8) | ((col_abs as u8) << 1);
        Self { row, col, flags }
    }

    #[inline]
    pub const fn row_abs(self) -> bool {
        self.flags & 0b01 != 0
    }

    #[inline]
    pub const fn col_abs(self) -> bool {
        self.flags & 0b10 != 0
    }

    /// Raw stored row component: index if absolute, offset if relative.
    #[inline]
    pub const fn row_value(self) -> i64 {
        self.row
    }

    #[inline]
    pub const fn col_value(self) -> i64 {
        self.col
    }

    /// Encode an absolute target against a base address, preserving anchors.
    pub fn from_resolved(target: Coord, base: Coord, row_abs: bool, col_abs: bool) -> Self {
        let row = if row_abs {
            target.row as i64
        } else {
            target.row as i64 - base.row as i64
        };
        let col = if col_abs {
            target.col as i64
        } else {
            target.col as i64 - base.col as i64
        };
        Self::new(row, col, row_abs, col_abs)
    }

    /// Resolve against a base address. `None` when the target falls off the
    /// grid, which the evaluator surfaces as `#REF!`.
    pub fn resolve(self, base: Coord) -> Option<Coord> {
        let row = if self.row_abs() {
            self.row
        } else {
            base.row as i64 + self.row
        };
        let col = if self.col_abs() {
            self.col
        } else {
            base.col as i64 + self.col
        };
        if row < 0 || col < 0 || row > u32::MAX as i64 || col > u32::MAX as i64 {
            return None;
        }
        Some(Coord::new(row as u32, col as u32))
    }
}

/// A reference to something outside the formula's own cell. `sheet: None`
/// means the formula's own sheet.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ReferenceType {
    Cell {
        sheet: Option<SheetId>,
        coord: RefCoord,
    },
    Range {
        sheet: Option<SheetId>,
        start: RefCoord,
        end: RefCoord,
    },
}

impl ReferenceType {
    #[inline]
    pub fn sheet_or(&self, own: SheetId) -> SheetId {
        match self {
            ReferenceType::Cell { sheet, .. } | ReferenceType::Range { sheet, .. } => {
                sheet.unwrap_or(own)
            }
        }
    }

    /// Resolve a cell reference to an absolute address.
    pub fn resolve_cell(&self, base: CellAddress) -> Option<CellAddress> {
        match self {
            ReferenceType::Cell { sheet, coord } => Some(CellAddress::from_coord(
                sheet.unwrap_or(base.sheet),
                coord.resolve(base.coord)?,
            )),
            ReferenceType::Range { .. } => None,
        }
    }

    /// Resolve a range reference to an absolute rectangle.
    pub fn resolve_range(&self, base: CellAddress) -> Option<CellRange> {
        match self {
            ReferenceType::Range { sheet, start, end } => {
                let s = start.resolve(base.coord)?;
                let e = end.resolve(base.coord)?;
                CellRange::new(sheet.unwrap_or(base.sheet), s, e).ok()
            }
            ReferenceType::Cell { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_axes_store_offsets() {
        // Formula at C3 referencing A1 relatively.
        let base = Coord::new(2, 2);
        let r = RefCoord::from_resolved(Coord::new(0, 0), base, false, false);
        assert_eq!(r.row_value(), -2);
        assert_eq!(r.col_value(), -2);
        assert_eq!(r.resolve(base), Some(Coord::new(0, 0)));
        // The same stored reference denotes B2 when resolved from D4.
        assert_eq!(r.resolve(Coord::new(3, 3)), Some(Coord::new(1, 1)));
    }

    #[test]
    fn absolute_axes_ignore_base() {
        let r = RefCoord::new(4, 1, true, true);
        assert_eq!(r.resolve(Coord::new(100, 100)), Some(Coord::new(4, 1)));
    }

    #[test]
    fn off_grid_resolution_fails() {
        let r = RefCoord::new(-3, 0, false, false);
        assert_eq!(r.resolve(Coord::new(1, 0)), None);
        assert_eq!(r.resolve(Coord::new(3, 0)), Some(Coord::new(0, 0)));
    }

    #[test]
    fn range_resolution() {
        let base = CellAddress::new(0, 5, 5);
        let r = ReferenceType::Range {
            sheet: Some(2),
            start: RefCoord::new(0, 0, true, true),
            end: RefCoord::new(2, 1, true, true),
        };
        let resolved = r.resolve_range(base).unwrap();
        assert_eq!(resolved.sheet, 2);
        assert_eq!(resolved.height(), 3);
        assert_eq!(resolved.width(), 2);
    }
}
