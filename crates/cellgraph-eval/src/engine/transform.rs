//! Structural-edit transformations and the lazily-replayed log.
//!
//! Every structural edit appends one [`Transformation`] to the log. Formula
//! vertices carry the log length they were last reconciled against; reading
//! a formula replays only the suffix it has not seen, rewriting both its AST
//! and its own address. Array-block vertices are instead transformed eagerly
//! at edit time, because their rectangle locates them in the mapping tables.
//!
//! Reference rewriting is a pure function of (edit, reference, formula
//! address): the decision table works on *resolved* targets and re-encodes
//! relative axes against the formula's post-edit address, which produces the
//! opposite stored-offset shift when the formula moves and its target does
//! not.

use cellgraph_common::{CellAddress, CellRange, SheetId};
use cellgraph_parse::{AstNode, AstNodeType, RefCoord, ReferenceType};

use super::vertex::FormulaVertex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    RowsInserted {
        sheet: SheetId,
        row: u32,
        count: u32,
    },
    RowsRemoved {
        sheet: SheetId,
        row: u32,
        count: u32,
    },
    ColumnsInserted {
        sheet: SheetId,
        col: u32,
        count: u32,
    },
    ColumnsRemoved {
        sheet: SheetId,
        col: u32,
        count: u32,
    },
    CellsMoved {
        source: CellRange,
        to_sheet: SheetId,
        row_offset: i64,
        col_offset: i64,
    },
    SheetRemoved {
        sheet: SheetId,
    },
}

/// Ordered log of structural transformations. The version exchanged with
/// formula vertices is the log length at stamping time; any lesser value is
/// stale by definition.
#[derive(Debug, Default)]
pub struct TransformationLog {
    entries: Vec<Transformation>,
}

impl TransformationLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn push(&mut self, t: Transformation) -> u64 {
        self.entries.push(t);
        self.version()
    }

    pub fn entries_since(&self, version: u64) -> &[Transformation] {
        &self.entries[version as usize..]
    }

    /// Replay pending transformations onto a formula vertex and restamp it.
    /// A vertex never replays the same transformation twice.
    pub fn reconcile(&self, vertex: &mut FormulaVertex) {
        if vertex.version == self.version() {
            return;
        }
        for t in self.entries_since(vertex.version) {
            let new_address = match transform_address(t, vertex.address) {
                AddressShift::Moved(a) => a,
                AddressShift::Unchanged => vertex.address,
                // Vertices in removed spans are destroyed before replay.
                AddressShift::Removed => vertex.address,
            };
            vertex.ast = transform_ast(t, &vertex.ast, vertex.address, new_address);
            vertex.address = new_address;
        }
        vertex.version = self.version();
    }
}

/// How a structural edit displaces one absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressShift {
    Unchanged,
    Moved(CellAddress),
    /// The address lies inside the removed span.
    Removed,
}

pub fn transform_address(t: &Transformation, addr: CellAddress) -> AddressShift {
    match *t {
        Transformation::RowsInserted { sheet, row, count } => {
            if addr.sheet == sheet && addr.row() >= row {
                AddressShift::Moved(CellAddress::new(sheet, addr.row() + count, addr.col()))
            } else {
                AddressShift::Unchanged
            }
        }
        Transformation::RowsRemoved { sheet, row, count } => {
            if addr.sheet != sheet {
                AddressShift::Unchanged
            } else if addr.row() >= row && addr.row() < row + count {
                AddressShift::Removed
            } else if addr.row() >= row + count {
                AddressShift::Moved(CellAddress::new(sheet, addr.row() - count, addr.col()))
            } else {
                AddressShift::Unchanged
            }
        }
        Transformation::ColumnsInserted { sheet, col, count } => {
            if addr.sheet == sheet && addr.col() >= col {
                AddressShift::Moved(CellAddress::new(sheet, addr.row(), addr.col() + count))
            } else {
                AddressShift::Unchanged
            }
        }
        Transformation::ColumnsRemoved { sheet, col, count } => {
            if addr.sheet != sheet {
                AddressShift::Unchanged
            } else if addr.col() >= col && addr.col() < col + count {
                AddressShift::Removed
            } else if addr.col() >= col + count {
                AddressShift::Moved(CellAddress::new(sheet, addr.row(), addr.col() - count))
            } else {
                AddressShift::Unchanged
            }
        }
        Transformation::CellsMoved {
            source,
            to_sheet,
            row_offset,
            col_offset,
        } => {
            if source.contains(addr) {
                match addr.coord.checked_offset(row_offset, col_offset) {
                    Some(coord) => {
                        AddressShift::Moved(CellAddress::from_coord(to_sheet, coord))
                    }
                    None => AddressShift::Removed,
                }
            } else {
                AddressShift::Unchanged
            }
        }
        Transformation::SheetRemoved { sheet } => {
            if addr.sheet == sheet {
                AddressShift::Removed
            } else {
                AddressShift::Unchanged
            }
        }
    }
}

/// How a structural edit displaces one rectangle (used for array blocks;
/// partial overlaps are rejected by the edit guards before this runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectShift {
    Unchanged,
    Moved(CellRange),
    Removed,
}

pub fn transform_range_rect(t: &Transformation, range: CellRange) -> RectShift {
    let start = CellAddress::from_coord(range.sheet, range.start);
    let end = CellAddress::from_coord(range.sheet, range.end);
    match (transform_address(t, start), transform_address(t, end)) {
        (AddressShift::Removed, AddressShift::Removed) => RectShift::Removed,
        (AddressShift::Unchanged, AddressShift::Unchanged) => RectShift::Unchanged,
        (s, e) => {
            let s = match s {
                AddressShift::Moved(a) => a,
                _ => start,
            };
            let e = match e {
                AddressShift::Moved(a) => a,
                _ => end,
            };
            match CellRange::new(s.sheet, s.coord, e.coord) {
                Ok(r) => RectShift::Moved(r),
                Err(_) => RectShift::Removed,
            }
        }
    }
}

/// Rewrite every reference node of an AST for one transformation. Failed
/// rewrites degrade that node to a `#REF!` AST node; the rest of the tree is
/// untouched.
pub fn transform_ast(
    t: &Transformation,
    ast: &AstNode,
    old_addr: CellAddress,
    new_addr: CellAddress,
) -> AstNode {
    match &ast.node_type {
        AstNodeType::Reference(reference) => {
            match transform_reference(t, reference, old_addr, new_addr) {
                RefShift::Unchanged => ast.clone(),
                RefShift::Changed(r) => AstNode::new(AstNodeType::Reference(r)),
                RefShift::RefError => AstNode::new(AstNodeType::RefError),
            }
        }
        AstNodeType::UnaryOp { op, expr } => AstNode::new(AstNodeType::UnaryOp {
            op: op.clone(),
            expr: Box::new(transform_ast(t, expr, old_addr, new_addr)),
        }),
        AstNodeType::BinaryOp { op, left, right } => AstNode::new(AstNodeType::BinaryOp {
            op: op.clone(),
            left: Box::new(transform_ast(t, left, old_addr, new_addr)),
            right: Box::new(transform_ast(t, right, old_addr, new_addr)),
        }),
        AstNodeType::Function { name, args } => AstNode::new(AstNodeType::Function {
            name: name.clone(),
            args: args
                .iter()
                .map(|a| transform_ast(t, a, old_addr, new_addr))
                .collect(),
        }),
        AstNodeType::Array(rows) => AstNode::new(AstNodeType::Array(
            rows.iter()
                .map(|row| {
                    row.iter()
                        .map(|item| transform_ast(t, item, old_addr, new_addr))
                        .collect()
                })
                .collect(),
        )),
        AstNodeType::Literal(_) | AstNodeType::RefError => ast.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefShift {
    Unchanged,
    Changed(ReferenceType),
    RefError,
}

/// Rewrite one dependency reference of the formula at `old_addr` (moving to
/// `new_addr`) for one structural edit.
pub fn transform_reference(
    t: &Transformation,
    reference: &ReferenceType,
    old_addr: CellAddress,
    new_addr: CellAddress,
) -> RefShift {
    match reference {
        ReferenceType::Cell { sheet, coord } => {
            let dep_sheet = sheet.unwrap_or(old_addr.sheet);
            let Some(target) = coord.resolve(old_addr.coord) else {
                return RefShift::RefError;
            };
            let target = CellAddress::from_coord(dep_sheet, target);
            let new_target = match transform_address(t, target) {
                AddressShift::Removed => return RefShift::RefError,
                AddressShift::Moved(a) => a,
                AddressShift::Unchanged => target,
            };
            encode_cell(*coord, new_target, new_addr, reference)
        }
        ReferenceType::Range { sheet, start, end } => {
            let dep_sheet = sheet.unwrap_or(old_addr.sheet);
            let (Some(s), Some(e)) = (start.resolve(old_addr.coord), end.resolve(old_addr.coord))
            else {
                return RefShift::RefError;
            };
            let Some((new_s, new_e)) = transform_range_endpoints(
                t,
                CellAddress::from_coord(dep_sheet, s),
                CellAddress::from_coord(dep_sheet, e),
            ) else {
                return RefShift::RefError;
            };
            encode_range(*start, *end, new_s, new_e, new_addr, reference)
        }
    }
}

/// Transform both endpoints of a range, clamping a single engulfed endpoint
/// to the surviving boundary. `None` means the whole range is gone.
fn transform_range_endpoints(
    t: &Transformation,
    start: CellAddress,
    end: CellAddress,
) -> Option<(CellAddress, CellAddress)> {
    match *t {
        Transformation::RowsRemoved { sheet, row, count } if start.sheet == sheet => {
            let (s_row, e_row) = clamp_span(start.row(), end.row(), row, count)?;
            Some((
                CellAddress::new(sheet, s_row, start.col()),
                CellAddress::new(sheet, e_row, end.col()),
            ))
        }
        Transformation::ColumnsRemoved { sheet, col, count } if start.sheet == sheet => {
            let (s_col, e_col) = clamp_span(start.col(), end.col(), col, count)?;
            Some((
                CellAddress::new(sheet, start.row(), s_col),
                CellAddress::new(sheet, end.row(), e_col),
            ))
        }
        Transformation::CellsMoved { source, .. } => {
            // Only a fully engulfed range follows the move; partial overlaps
            // keep pointing at the (now partly emptied) source area.
            if source.contains(start) && source.contains(end) {
                let s = match transform_address(t, start) {
                    AddressShift::Moved(a) => a,
                    _ => return None,
                };
                let e = match transform_address(t, end) {
                    AddressShift::Moved(a) => a,
                    _ => return None,
                };
                Some((s, e))
            } else {
                Some((start, end))
            }
        }
        _ => {
            let s = match transform_address(t, start) {
                AddressShift::Removed => return None,
                AddressShift::Moved(a) => a,
                AddressShift::Unchanged => start,
            };
            let e = match transform_address(t, end) {
                AddressShift::Removed => return None,
                AddressShift::Moved(a) => a,
                AddressShift::Unchanged => end,
            };
            Some((s, e))
        }
    }
}

/// Shift-or-clamp one axis interval `[lo, hi]` for a removed span
/// `[from, from + count)`. `None` when the interval is fully engulfed.
pub(crate) fn clamp_span(lo: u32, hi: u32, from: u32, count: u32) -> Option<(u32, u32)> {
    let inside = |x: u32| x >= from && x < from + count;
    if inside(lo) && inside(hi) {
        return None;
    }
    let new_lo = if lo >= from + count {
        lo - count
    } else if inside(lo) {
        from
    } else {
        lo
    };
    let new_hi = if hi >= from + count {
        hi - count
    } else if inside(hi) {
        // hi inside but lo before the span, so from > 0 here.
        from - 1
    } else {
        hi
    };
    if new_lo > new_hi {
        return None;
    }
    Some((new_lo, new_hi))
}

fn encode_cell(
    coord: RefCoord,
    new_target: CellAddress,
    new_addr: CellAddress,
    original: &ReferenceType,
) -> RefShift {
    let new_coord = RefCoord::from_resolved(
        new_target.coord,
        new_addr.coord,
        coord.row_abs(),
        coord.col_abs(),
    );
    let new_sheet = if new_target.sheet == new_addr.sheet {
        original_sheet_tag(original, new_target.sheet)
    } else {
        Some(new_target.sheet)
    };
    let rewritten = ReferenceType::Cell {
        sheet: new_sheet,
        coord: new_coord,
    };
    if &rewritten == original {
        RefShift::Unchanged
    } else {
        RefShift::Changed(rewritten)
    }
}

fn encode_range(
    start: RefCoord,
    end: RefCoord,
    new_s: CellAddress,
    new_e: CellAddress,
    new_addr: CellAddress,
    original: &ReferenceType,
) -> RefShift {
    let rewritten = ReferenceType::Range {
        sheet: if new_s.sheet == new_addr.sheet {
            original_sheet_tag(original, new_s.sheet)
        } else {
            Some(new_s.sheet)
        },
        start: RefCoord::from_resolved(
            new_s.coord,
            new_addr.coord,
            start.row_abs(),
            start.col_abs(),
        ),
        end: RefCoord::from_resolved(new_e.coord, new_addr.coord, end.row_abs(), end.col_abs()),
    };
    if &rewritten == original {
        RefShift::Unchanged
    } else {
        RefShift::Changed(rewritten)
    }
}

/// Preserve the explicit-vs-implicit sheet spelling when the target stays on
/// the formula's sheet.
fn original_sheet_tag(original: &ReferenceType, sheet: SheetId) -> Option<SheetId> {
    match original {
        ReferenceType::Cell { sheet: s, .. } | ReferenceType::Range { sheet: s, .. } => {
            s.map(|_| sheet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgraph_common::{Coord, SheetRegistry};
    use cellgraph_parse::{parse, unparse};

    fn sheets() -> SheetRegistry {
        let mut reg = SheetRegistry::new();
        reg.id_for("Sheet1");
        reg.id_for("Other");
        reg
    }

    /// Parse at `addr`, apply one transformation, unparse at the formula's
    /// post-edit address.
    fn rewrite(formula: &str, addr: CellAddress, t: Transformation) -> String {
        let reg = sheets();
        let parsed = parse(formula, addr, &reg).unwrap();
        let new_addr = match transform_address(&t, addr) {
            AddressShift::Moved(a) => a,
            _ => addr,
        };
        let ast = transform_ast(&t, &parsed.ast, addr, new_addr);
        unparse(&ast, new_addr, &reg)
    }

    #[test]
    fn rows_removed_shifts_later_targets() {
        // Formula at A10 referencing A6 and A2; remove rows 3..5 (0-based 2..4).
        let out = rewrite(
            "=A6+A2",
            CellAddress::new(0, 9, 0),
            Transformation::RowsRemoved {
                sheet: 0,
                row: 2,
                count: 3,
            },
        );
        // Formula lands on A7; A6 -> A3, A2 unchanged.
        assert_eq!(out, "=A3+A2");
    }

    #[test]
    fn rows_removed_inside_span_becomes_ref() {
        let out = rewrite(
            "=A3",
            CellAddress::new(0, 9, 0),
            Transformation::RowsRemoved {
                sheet: 0,
                row: 2,
                count: 1,
            },
        );
        assert_eq!(out, "=#REF!");
    }

    #[test]
    fn unrelated_sheet_is_untouched() {
        let addr = CellAddress::new(1, 0, 0); // on "Other"
        let reg = sheets();
        let parsed = parse("=B2*2", addr, &reg).unwrap();
        let t = Transformation::RowsRemoved {
            sheet: 0,
            row: 0,
            count: 5,
        };
        let shift = transform_reference(&t, &parsed.dependencies[0], addr, addr);
        assert_eq!(shift, RefShift::Unchanged);
    }

    #[test]
    fn opposite_shift_when_formula_moves_but_target_does_not() {
        // Formula on Sheet1!A10 referencing Other!B2. Removing Sheet1 rows
        // above the formula moves the formula; the stored offset must change
        // so the resolved target stays Other!B2.
        let out = rewrite(
            "=Other!B2",
            CellAddress::new(0, 9, 0),
            Transformation::RowsRemoved {
                sheet: 0,
                row: 0,
                count: 4,
            },
        );
        assert_eq!(out, "=Other!B2");
    }

    #[test]
    fn rows_inserted_grows_straddling_range() {
        let out = rewrite(
            "=SUM(A1:A10)",
            CellAddress::new(0, 20, 1),
            Transformation::RowsInserted {
                sheet: 0,
                row: 4,
                count: 3,
            },
        );
        assert_eq!(out, "=SUM(A1:A13)");
    }

    #[test]
    fn rows_removed_clamps_partially_engulfed_range() {
        // A5:A20, remove rows 10..15 (0-based 9..14): end clamps to old row 9
        // then the surviving tail shifts up.
        let out = rewrite(
            "=SUM(A5:A20)",
            CellAddress::new(0, 25, 1),
            Transformation::RowsRemoved {
                sheet: 0,
                row: 9,
                count: 5,
            },
        );
        assert_eq!(out, "=SUM(A5:A15)");
    }

    #[test]
    fn rows_removed_engulfing_range_is_ref() {
        let out = rewrite(
            "=SUM(A3:A5)",
            CellAddress::new(0, 10, 1),
            Transformation::RowsRemoved {
                sheet: 0,
                row: 1,
                count: 8,
            },
        );
        assert_eq!(out, "=SUM(#REF!)");
    }

    #[test]
    fn columns_inserted_matches_scenario() {
        // [[1,2,3],[SUM(A1:C1)]]: insert one column at index 1.
        let out = rewrite(
            "=SUM(A1:C1)",
            CellAddress::new(0, 1, 0),
            Transformation::ColumnsInserted {
                sheet: 0,
                col: 1,
                count: 1,
            },
        );
        assert_eq!(out, "=SUM(A1:D1)");
    }

    #[test]
    fn absolute_anchors_shift_with_the_grid() {
        let out = rewrite(
            "=$A$6",
            CellAddress::new(0, 20, 3),
            Transformation::RowsInserted {
                sheet: 0,
                row: 2,
                count: 2,
            },
        );
        assert_eq!(out, "=$A$8");
    }

    #[test]
    fn moved_formula_keeps_denoting_the_same_cells() {
        // Formula at D1 = A1 + $B$1. Move D1:D1 to D5.
        let source = CellRange::new(0, Coord::new(0, 3), Coord::new(0, 3)).unwrap();
        let out = rewrite(
            "=A1+$B$1",
            CellAddress::new(0, 0, 3),
            Transformation::CellsMoved {
                source,
                to_sheet: 0,
                row_offset: 4,
                col_offset: 0,
            },
        );
        assert_eq!(out, "=A1+$B$1");
    }

    #[test]
    fn references_into_moved_block_are_redirected() {
        // C1 = A1; move A1:A1 to Other!B5.
        let source = CellRange::new(0, Coord::new(0, 0), Coord::new(0, 0)).unwrap();
        let out = rewrite(
            "=A1",
            CellAddress::new(0, 0, 2),
            Transformation::CellsMoved {
                source,
                to_sheet: 1,
                row_offset: 4,
                col_offset: 1,
            },
        );
        assert_eq!(out, "=Other!B5");
    }

    #[test]
    fn removed_sheet_refs_degrade_to_ref() {
        let addr = CellAddress::new(0, 0, 0);
        let reg = sheets();
        let parsed = parse("=Other!A1+1", addr, &reg).unwrap();
        let t = Transformation::SheetRemoved { sheet: 1 };
        let ast = transform_ast(&t, &parsed.ast, addr, addr);
        assert_eq!(unparse(&ast, addr, &reg), "=#REF!+1");
    }

    #[test]
    fn insert_then_remove_round_trips_relative_text() {
        let reg = sheets();
        let addr = CellAddress::new(0, 30, 2);
        let parsed = parse("=SUM(A1:A10)*C29", addr, &reg).unwrap();

        let ins = Transformation::RowsInserted {
            sheet: 0,
            row: 5,
            count: 4,
        };
        let mid_addr = match transform_address(&ins, addr) {
            AddressShift::Moved(a) => a,
            _ => addr,
        };
        let mid = transform_ast(&ins, &parsed.ast, addr, mid_addr);

        let rem = Transformation::RowsRemoved {
            sheet: 0,
            row: 5,
            count: 4,
        };
        let back_addr = match transform_address(&rem, mid_addr) {
            AddressShift::Moved(a) => a,
            _ => mid_addr,
        };
        let back = transform_ast(&rem, &mid, mid_addr, back_addr);

        assert_eq!(back_addr, addr);
        assert_eq!(unparse(&back, back_addr, &reg), "=SUM(A1:A10)*C29");
    }
}
