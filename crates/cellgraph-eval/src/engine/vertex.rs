//! Graph vertices: one per cell, array block, or range-as-used.

use bitflags::bitflags;
use cellgraph_common::{CellAddress, CellRange, CellValue};
use cellgraph_parse::AstNode;
use rustc_hash::FxHashMap;

/// Engine-internal vertex identity. Stable until the vertex is removed; the
/// slot may be reused afterwards, so nothing may cache an id across removal.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VertexId(pub(crate) u32);

impl VertexId {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub(crate) fn as_index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Per-slot scheduling state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VertexFlags: u8 {
        const DIRTY = 0x01;
        const VOLATILE = 0x02;
    }
}

/// A formula occupying a single cell.
#[derive(Debug, Clone)]
pub struct FormulaVertex {
    pub ast: AstNode,
    /// The cell holding the formula. Correct only up to `version`: pending
    /// structural transformations are replayed on read.
    pub address: CellAddress,
    /// Transformation-log length at the last reconciliation.
    pub version: u64,
    pub cached: Option<CellValue>,
}

/// An array formula spanning a rectangular block. Its rectangle is
/// load-bearing (it locates and sizes the block in the address mapping), so
/// it is kept current eagerly on every structural edit.
#[derive(Debug, Clone)]
pub struct MatrixVertex {
    pub ast: AstNode,
    pub range: CellRange,
    pub version: u64,
    pub cached: Option<Vec<Vec<CellValue>>>,
}

impl MatrixVertex {
    /// Cached value of the cell at `addr`, if the block has been computed.
    pub fn value_at(&self, addr: CellAddress) -> CellValue {
        let Some((row, col)) = self.range.offset_of(addr) else {
            return CellValue::Empty;
        };
        match &self.cached {
            Some(block) => block
                .get(row as usize)
                .and_then(|r| r.get(col as usize))
                .cloned()
                .unwrap_or(CellValue::Empty),
            None => CellValue::Empty,
        }
    }
}

/// A range as used inside a formula. Caches aggregate and criterion results;
/// both caches are cleared whenever the vertex is visited by an evaluation
/// pass or resized by a structural edit.
#[derive(Debug, Clone)]
pub struct RangeVertex {
    pub range: CellRange,
    /// End row of the registered sub-range this vertex is linked through,
    /// when it was built from one (same start corner and column span).
    pub sub_end_row: Option<u32>,
    pub aggregates: FxHashMap<&'static str, CellValue>,
    pub criteria: FxHashMap<(String, String), CellValue>,
}

impl RangeVertex {
    pub fn new(range: CellRange) -> Self {
        Self {
            range,
            sub_end_row: None,
            aggregates: FxHashMap::default(),
            criteria: FxHashMap::default(),
        }
    }

    pub fn clear_caches(&mut self) {
        self.aggregates.clear();
        self.criteria.clear();
    }
}

#[derive(Debug, Clone)]
pub enum VertexKind {
    /// Placeholder for a contentless cell that still needs graph edges.
    Empty,
    /// Literal cell content.
    Value(CellValue),
    Formula(Box<FormulaVertex>),
    Matrix(Box<MatrixVertex>),
    Range(Box<RangeVertex>),
}

impl VertexKind {
    #[inline]
    pub fn is_matrix(&self) -> bool {
        matches!(self, VertexKind::Matrix(_))
    }

    /// The value a reader of this vertex's cell observes right now.
    pub fn current_value(&self) -> CellValue {
        match self {
            VertexKind::Empty => CellValue::Empty,
            VertexKind::Value(v) => v.clone(),
            VertexKind::Formula(f) => f.cached.clone().unwrap_or(CellValue::Empty),
            // Matrix values are per-cell; callers go through `value_at`.
            VertexKind::Matrix(_) | VertexKind::Range(_) => CellValue::Empty,
        }
    }
}
