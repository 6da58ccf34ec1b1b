//! Shared test helpers.

use cellgraph_common::{CellAddress, CellRange, CellValue, Coord, SheetId};

use crate::engine::eval::Engine;

pub fn engine() -> Engine {
    Engine::new()
}

pub fn addr(sheet: SheetId, row: u32, col: u32) -> CellAddress {
    CellAddress::new(sheet, row, col)
}

pub fn range(sheet: SheetId, r1: u32, c1: u32, r2: u32, c2: u32) -> CellRange {
    CellRange::new(sheet, Coord::new(r1, c1), Coord::new(r2, c2)).unwrap()
}

pub fn num(x: f64) -> CellValue {
    CellValue::Number(x)
}

pub fn err(kind: cellgraph_common::CellErrorKind) -> CellValue {
    CellValue::error(kind)
}

/// Set raw content, panicking on structurally impossible edits.
pub fn set(engine: &mut Engine, a: CellAddress, raw: &str) {
    engine.set_cell_content(a, raw).unwrap();
}
