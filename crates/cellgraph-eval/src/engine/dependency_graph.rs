//! Dependency-graph facade.
//!
//! Owns the arena graph plus every mapping table (address -> vertex per
//! sheet, range-key -> range vertex, matrix rectangles, sheet registry) and
//! translates cell edits and structural edits into graph mutations. Edges
//! always equal the current dependency set exactly: before a formula's
//! dependencies change, its old incoming edges are removed.
//!
//! Vertex identity survives content edits: switching a cell between value,
//! formula, and empty rewrites the kind inside the same slot, so edges held
//! by dependents stay valid. Structural shifts likewise only re-key mapping
//! entries and resize range vertices; the vertices themselves stay put.

use cellgraph_common::{CellAddress, CellRange, CellValue, Coord, SheetId, SheetRegistry};
use cellgraph_parse::{ParsedFormula, ReferenceType};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::debug;

use super::change_log::CellSnapshot;
use super::graph::{Graph, GraphError};
use super::transform::{
    RectShift, Transformation, TransformationLog, transform_ast, transform_range_rect,
};
use super::vertex::{FormulaVertex, MatrixVertex, RangeVertex, VertexId, VertexKind};

/// Thrown edit failures: structurally impossible edits that abort before any
/// mutation. Everything else degrades to a cell-level error value instead.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("edit would split or overwrite an array block")]
    MatrixEdit,
    #[error("unknown sheet id {0}")]
    UnknownSheet(SheetId),
    #[error("invalid span: {0}")]
    InvalidSpan(String),
    #[error("target lies outside the grid")]
    OutOfGrid,
    #[error("{0}")]
    Parse(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Result of one structural edit: seeds for the next incremental recompute
/// and snapshots of displaced cells for the undo ledger.
#[derive(Debug, Default)]
pub struct StructuralSummary {
    pub seeds: Vec<VertexId>,
    pub displaced: Vec<(CellAddress, CellSnapshot)>,
}

/// Aggregate kinds cached on range vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Sum,
    Count,
    Min,
    Max,
}

impl AggKind {
    pub fn name(self) -> &'static str {
        match self {
            AggKind::Sum => "SUM",
            AggKind::Count => "COUNT",
            AggKind::Min => "MIN",
            AggKind::Max => "MAX",
        }
    }
}

type RangeKey = (SheetId, u32, u32, u32, u32);

fn range_key(r: &CellRange) -> RangeKey {
    (r.sheet, r.start.row, r.start.col, r.end.row, r.end.col)
}

fn key_contains(key: &RangeKey, sheet: SheetId, c: Coord) -> bool {
    key.0 == sheet && c.row >= key.1 && c.col >= key.2 && c.row <= key.3 && c.col <= key.4
}

#[derive(Debug)]
pub struct DependencyGraph {
    graph: Graph,
    addresses: FxHashMap<SheetId, FxHashMap<Coord, VertexId>>,
    ranges: FxHashMap<RangeKey, VertexId>,
    matrices: FxHashMap<RangeKey, VertexId>,
    sheets: SheetRegistry,
    /// Exact current dependency set of every formula/matrix vertex.
    formula_deps: FxHashMap<VertexId, Vec<VertexId>>,
    default_sheet: SheetId,
}

impl DependencyGraph {
    pub fn new() -> Self {
        let mut sheets = SheetRegistry::new();
        let default_sheet = sheets.id_for("Sheet1");
        Self {
            graph: Graph::new(),
            addresses: FxHashMap::default(),
            ranges: FxHashMap::default(),
            matrices: FxHashMap::default(),
            sheets,
            formula_deps: FxHashMap::default(),
            default_sheet,
        }
    }

    // ---- sheets ----------------------------------------------------------

    pub fn add_sheet(&mut self, name: &str) -> SheetId {
        self.sheets.id_for(name)
    }

    pub fn sheet_id(&self, name: &str) -> Option<SheetId> {
        self.sheets.get_id(name)
    }

    pub fn sheet_name(&self, id: SheetId) -> &str {
        self.sheets.name(id)
    }

    pub fn sheets(&self) -> &SheetRegistry {
        &self.sheets
    }

    pub fn default_sheet_id(&self) -> SheetId {
        self.default_sheet
    }

    // ---- basic access ----------------------------------------------------

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn vertex_id_at(&self, addr: CellAddress) -> Option<VertexId> {
        self.addresses.get(&addr.sheet)?.get(&addr.coord).copied()
    }

    /// The value a reader observes at `addr` right now.
    pub fn get_cell_value(&self, addr: CellAddress) -> CellValue {
        match self.vertex_id_at(addr).and_then(|id| self.graph.node(id)) {
            Some(VertexKind::Matrix(m)) => m.value_at(addr),
            Some(kind) => kind.current_value(),
            None => CellValue::Empty,
        }
    }

    // ---- content edits ---------------------------------------------------

    pub fn set_value_to_cell(
        &mut self,
        addr: CellAddress,
        value: CellValue,
    ) -> Result<VertexId, EditError> {
        if let Some(id) = self.vertex_id_at(addr) {
            if self.graph.node(id).is_some_and(VertexKind::is_matrix) {
                return Err(EditError::MatrixEdit);
            }
            let old = self.get_cell_value(addr);
            self.detach_dependency_edges(id);
            self.graph.unmark_volatile(id);
            if let Some(kind) = self.graph.node_mut(id) {
                *kind = VertexKind::Value(value.clone());
            }
            if old != value {
                self.graph.mark_dirty(id);
            }
            return Ok(id);
        }
        let id = self.graph.add_node(VertexKind::Value(value.clone()));
        self.insert_address(addr, id);
        self.link_to_covering_ranges(id, addr);
        if value != CellValue::Empty {
            self.graph.mark_dirty(id);
        }
        Ok(id)
    }

    /// Attach a formula. An existing Formula vertex is updated in place
    /// (identity preserved); any other non-matrix vertex has its kind spliced
    /// inside the same slot so downstream edges transfer.
    pub fn set_formula_to_cell(
        &mut self,
        addr: CellAddress,
        parsed: &ParsedFormula,
        version: u64,
    ) -> Result<VertexId, EditError> {
        let id = match self.vertex_id_at(addr) {
            Some(id) => {
                if self.graph.node(id).is_some_and(VertexKind::is_matrix) {
                    return Err(EditError::MatrixEdit);
                }
                self.detach_dependency_edges(id);
                match self.graph.node_mut(id) {
                    Some(VertexKind::Formula(f)) => {
                        f.ast = parsed.ast.clone();
                        f.address = addr;
                        f.version = version;
                    }
                    Some(kind) => {
                        *kind = VertexKind::Formula(Box::new(FormulaVertex {
                            ast: parsed.ast.clone(),
                            address: addr,
                            version,
                            cached: None,
                        }));
                    }
                    None => unreachable!("mapped vertex must be live"),
                }
                id
            }
            None => {
                let id = self.graph.add_node(VertexKind::Formula(Box::new(FormulaVertex {
                    ast: parsed.ast.clone(),
                    address: addr,
                    version,
                    cached: None,
                })));
                self.insert_address(addr, id);
                self.link_to_covering_ranges(id, addr);
                id
            }
        };
        if parsed.ast.volatile {
            self.graph.mark_volatile(id);
        } else {
            self.graph.unmark_volatile(id);
        }
        self.process_cell_dependencies(id, addr, &parsed.dependencies);
        self.graph.mark_dirty(id);
        Ok(id)
    }

    /// Empty a cell. Degrades to a payload-free Empty vertex while dependents
    /// remain; otherwise the vertex is destroyed.
    pub fn set_cell_empty(&mut self, addr: CellAddress) -> Result<(), EditError> {
        let Some(id) = self.vertex_id_at(addr) else {
            return Ok(());
        };
        if self.graph.node(id).is_some_and(VertexKind::is_matrix) {
            return Err(EditError::MatrixEdit);
        }
        let old = self.get_cell_value(addr);
        self.detach_dependency_edges(id);
        self.graph.unmark_volatile(id);
        if self.graph.adjacent_nodes(id).is_empty() {
            self.graph.remove_node(id)?;
            self.remove_address(addr);
        } else {
            if let Some(kind) = self.graph.node_mut(id) {
                *kind = VertexKind::Empty;
            }
            if old != CellValue::Empty {
                self.graph.mark_dirty(id);
            }
        }
        Ok(())
    }

    /// Attach an array formula spanning `range`. Existing plain cells in the
    /// block are replaced (their dependents re-pointed at the block vertex);
    /// touching an existing array block is structurally impossible.
    pub fn set_matrix_to_range(
        &mut self,
        range: CellRange,
        parsed: &ParsedFormula,
        version: u64,
    ) -> Result<VertexId, EditError> {
        if !self.sheets.contains(range.sheet) {
            return Err(EditError::UnknownSheet(range.sheet));
        }
        if self
            .matrices
            .keys()
            .any(|k| self.key_rect(k).intersects(&range))
        {
            return Err(EditError::MatrixEdit);
        }

        // Replace displaced plain cells, carrying their dependents over.
        let mut carried: FxHashSet<VertexId> = FxHashSet::default();
        for addr in range.cells() {
            if let Some(old) = self.vertex_id_at(addr) {
                carried.extend(self.graph.adjacent_nodes(old));
                self.detach_dependency_edges(old);
                self.graph.unmark_volatile(old);
                self.graph.remove_node(old)?;
                self.remove_address(addr);
            }
        }

        let base = CellAddress::from_coord(range.sheet, range.start);
        let id = self.graph.add_node(VertexKind::Matrix(Box::new(MatrixVertex {
            ast: parsed.ast.clone(),
            range,
            version,
            cached: None,
        })));
        self.matrices.insert(range_key(&range), id);
        for addr in range.cells() {
            self.insert_address(addr, id);
            self.link_to_covering_ranges(id, addr);
        }
        for dep in carried {
            if self.graph.contains(dep) && dep != id {
                self.graph.add_edge(id, dep);
            }
        }
        if parsed.ast.volatile {
            self.graph.mark_volatile(id);
        }
        self.process_cell_dependencies(id, base, &parsed.dependencies);
        self.graph.mark_dirty(id);
        Ok(id)
    }

    // ---- dependency wiring ----------------------------------------------

    /// Wire a formula/matrix vertex to its dependencies. Single-cell deps
    /// lazily create Empty vertices; range deps go through the range-vertex
    /// dedup and sub-range compression.
    pub fn process_cell_dependencies(
        &mut self,
        id: VertexId,
        base: CellAddress,
        refs: &[ReferenceType],
    ) {
        let mut dep_ids = Vec::with_capacity(refs.len());
        for r in refs {
            match r {
                ReferenceType::Cell { .. } => {
                    // Off-grid references evaluate to #REF!; no edge to add.
                    if let Some(target) = r.resolve_cell(base) {
                        let dep = self.fetch_or_create(target);
                        self.graph.add_edge(dep, id);
                        dep_ids.push(dep);
                    }
                }
                ReferenceType::Range { .. } => {
                    if let Some(range) = r.resolve_range(base) {
                        let rid = self.range_vertex_for(range);
                        self.graph.add_edge(rid, id);
                        dep_ids.push(rid);
                    }
                }
            }
        }
        self.formula_deps.insert(id, dep_ids);
    }

    /// Remove the edges representing a vertex's *old* dependency set.
    fn detach_dependency_edges(&mut self, id: VertexId) {
        if let Some(deps) = self.formula_deps.remove(&id) {
            for dep in deps {
                self.graph.remove_edge_if_exists(dep, id);
            }
        }
    }

    /// Fetch the vertex at `addr`, creating an Empty placeholder (linked into
    /// every covering range) when absent.
    pub fn fetch_or_create(&mut self, addr: CellAddress) -> VertexId {
        if let Some(id) = self.vertex_id_at(addr) {
            return id;
        }
        let id = self.graph.add_node(VertexKind::Empty);
        self.insert_address(addr, id);
        self.link_to_covering_ranges(id, addr);
        id
    }

    /// Find-or-create the vertex for `range`. A new vertex searches for the
    /// largest already-registered sub-range sharing its start corner and
    /// column span; when found, only that vertex plus the leftover strip of
    /// cells is linked, keeping edge count near O(#ranges) instead of
    /// O(area).
    pub fn range_vertex_for(&mut self, range: CellRange) -> VertexId {
        let key = range_key(&range);
        if let Some(&id) = self.ranges.get(&key) {
            return id;
        }
        let id = self
            .graph
            .add_node(VertexKind::Range(Box::new(RangeVertex::new(range))));
        self.ranges.insert(key, id);

        let mut strip_start = range.start.row;
        if range.end.row > range.start.row {
            for end_row in (range.start.row..range.end.row).rev() {
                let sub_key = (
                    range.sheet,
                    range.start.row,
                    range.start.col,
                    end_row,
                    range.end.col,
                );
                if let Some(&sub) = self.ranges.get(&sub_key) {
                    self.graph.add_edge(sub, id);
                    if let Some(VertexKind::Range(rv)) = self.graph.node_mut(id) {
                        rv.sub_end_row = Some(end_row);
                    }
                    strip_start = end_row + 1;
                    break;
                }
            }
        }
        for row in strip_start..=range.end.row {
            for col in range.start.col..=range.end.col {
                let cell = self.fetch_or_create(CellAddress::new(range.sheet, row, col));
                self.graph.add_edge(cell, id);
            }
        }
        id
    }

    /// Link a newly created vertex into every registered range covering its
    /// address, except ranges already covering it transitively through their
    /// sub-range link.
    fn link_to_covering_ranges(&mut self, id: VertexId, addr: CellAddress) {
        let covering: Vec<VertexId> = self
            .ranges
            .iter()
            .filter(|(k, _)| key_contains(k, addr.sheet, addr.coord))
            .map(|(_, &rid)| rid)
            .collect();
        for rid in covering {
            if rid == id {
                continue;
            }
            let via_sub = match self.graph.node(rid) {
                Some(VertexKind::Range(rv)) => {
                    rv.sub_end_row.is_some_and(|se| addr.row() <= se)
                }
                _ => false,
            };
            if !via_sub {
                self.graph.add_edge(id, rid);
            }
        }
    }

    // ---- evaluation support ---------------------------------------------

    pub fn reconcile_formula(&mut self, id: VertexId, log: &TransformationLog) {
        if let Some(VertexKind::Formula(f)) = self.graph.node_mut(id) {
            log.reconcile(f);
        }
    }

    /// True when one of the vertex's recorded dependencies has been
    /// destroyed. Its reference may still denote a live address (a moved
    /// block landed there, or content will be written later), so the edge
    /// set must be rebuilt from the reconciled AST.
    pub fn needs_rewire(&self, id: VertexId) -> bool {
        match self.formula_deps.get(&id) {
            Some(deps) => deps.iter().any(|d| !self.graph.contains(*d)),
            None => false,
        }
    }

    /// Rebuild a formula's edges from its current AST.
    pub fn rewire_dependencies(&mut self, id: VertexId) {
        let (ast, base) = match self.graph.node(id) {
            Some(VertexKind::Formula(f)) => (f.ast.clone(), f.address),
            Some(VertexKind::Matrix(m)) => (
                m.ast.clone(),
                CellAddress::from_coord(m.range.sheet, m.range.start),
            ),
            _ => return,
        };
        let refs = cellgraph_parse::collect_dependencies(&ast);
        self.detach_dependency_edges(id);
        self.process_cell_dependencies(id, base, &refs);
    }

    /// Assign `#CYCLE!` to a cycle member. Returns whether its observable
    /// value changed.
    pub fn assign_cycle_error(&mut self, id: VertexId) -> bool {
        let cycle = CellValue::error(cellgraph_common::CellErrorKind::Cycle);
        match self.graph.node_mut(id) {
            Some(VertexKind::Formula(f)) => {
                let changed = f.cached.as_ref() != Some(&cycle);
                f.cached = Some(cycle);
                changed
            }
            Some(VertexKind::Matrix(m)) => {
                let rows = m.range.height() as usize;
                let cols = m.range.width() as usize;
                let block = vec![vec![cycle; cols]; rows];
                let changed = m.cached.as_ref() != Some(&block);
                m.cached = Some(block);
                changed
            }
            _ => false,
        }
    }

    pub fn clear_range_caches(&mut self, id: VertexId) {
        if let Some(VertexKind::Range(rv)) = self.graph.node_mut(id) {
            rv.clear_caches();
        }
    }

    /// Cached aggregate over a registered range; uncached fold otherwise.
    /// SUM and COUNT reuse the sub-range chain (identity under emptiness);
    /// MIN/MAX always fold directly.
    pub fn range_aggregate(&mut self, range: CellRange, kind: AggKind) -> CellValue {
        let Some(&rid) = self.ranges.get(&range_key(&range)) else {
            return self.fold_aggregate(range, kind);
        };
        if let Some(VertexKind::Range(rv)) = self.graph.node(rid) {
            if let Some(v) = rv.aggregates.get(kind.name()) {
                return v.clone();
            }
        }
        let sub_end = match (kind, self.graph.node(rid)) {
            (AggKind::Sum | AggKind::Count, Some(VertexKind::Range(rv))) => rv.sub_end_row,
            _ => None,
        };
        let value = match sub_end {
            Some(se) if se >= range.start.row && se < range.end.row => {
                let sub = CellRange::new(range.sheet, range.start, Coord::new(se, range.end.col))
                    .expect("sub-range shares the start corner");
                let sub_val = self.range_aggregate(sub, kind);
                let strip = CellRange::new(
                    range.sheet,
                    Coord::new(se + 1, range.start.col),
                    range.end,
                )
                .expect("strip is the range tail");
                let strip_val = self.fold_aggregate(strip, kind);
                combine_aggregates(kind, sub_val, strip_val)
            }
            _ => self.fold_aggregate(range, kind),
        };
        if let Some(VertexKind::Range(rv)) = self.graph.node_mut(rid) {
            rv.aggregates.insert(kind.name(), value.clone());
        }
        value
    }

    fn fold_aggregate(&self, range: CellRange, kind: AggKind) -> CellValue {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        let mut min: Option<f64> = None;
        let mut max: Option<f64> = None;
        for addr in range.cells() {
            match self.get_cell_value(addr) {
                CellValue::Number(n) => {
                    sum += n;
                    count += 1;
                    min = Some(min.map_or(n, |m| m.min(n)));
                    max = Some(max.map_or(n, |m| m.max(n)));
                }
                CellValue::Error(e) => return CellValue::Error(e),
                _ => {}
            }
        }
        match kind {
            AggKind::Sum => CellValue::Number(sum),
            AggKind::Count => CellValue::Number(count as f64),
            // Empty means "no numbers": callers decide the neutral element.
            AggKind::Min => min.map(CellValue::Number).unwrap_or(CellValue::Empty),
            AggKind::Max => max.map(CellValue::Number).unwrap_or(CellValue::Empty),
        }
    }

    pub fn criterion_cache_get(
        &self,
        range: CellRange,
        func: &str,
        key: &str,
    ) -> Option<CellValue> {
        let rid = self.ranges.get(&range_key(&range))?;
        match self.graph.node(*rid) {
            Some(VertexKind::Range(rv)) => rv
                .criteria
                .get(&(func.to_string(), key.to_string()))
                .cloned(),
            _ => None,
        }
    }

    pub fn criterion_cache_put(
        &mut self,
        range: CellRange,
        func: &str,
        key: &str,
        value: CellValue,
    ) {
        let Some(&rid) = self.ranges.get(&range_key(&range)) else {
            return;
        };
        if let Some(VertexKind::Range(rv)) = self.graph.node_mut(rid) {
            rv.criteria
                .insert((func.to_string(), key.to_string()), value);
        }
    }

    // ---- structural edits ------------------------------------------------

    /// Reject structurally impossible edits before anything mutates.
    pub fn validate_structural(&self, t: &Transformation) -> Result<(), EditError> {
        match *t {
            Transformation::RowsInserted { sheet, row, count } => {
                self.validate_sheet_span(sheet, count)?;
                // Inserting inside an array block would split it.
                if self.matrices.keys().any(|k| {
                    k.0 == sheet && k.1 < row && row <= k.3
                }) {
                    return Err(EditError::MatrixEdit);
                }
                Ok(())
            }
            Transformation::RowsRemoved { sheet, row, count } => {
                self.validate_sheet_span(sheet, count)?;
                if self.matrices.keys().any(|k| {
                    let rect = self.key_rect(k);
                    rect.intersects_row_span(sheet, row, count)
                        && !rect.inside_row_span(sheet, row, count)
                }) {
                    return Err(EditError::MatrixEdit);
                }
                Ok(())
            }
            Transformation::ColumnsInserted { sheet, col, count } => {
                self.validate_sheet_span(sheet, count)?;
                if self.matrices.keys().any(|k| {
                    k.0 == sheet && k.2 < col && col <= k.4
                }) {
                    return Err(EditError::MatrixEdit);
                }
                Ok(())
            }
            Transformation::ColumnsRemoved { sheet, col, count } => {
                self.validate_sheet_span(sheet, count)?;
                if self.matrices.keys().any(|k| {
                    let rect = self.key_rect(k);
                    rect.intersects_col_span(sheet, col, count)
                        && !rect.inside_col_span(sheet, col, count)
                }) {
                    return Err(EditError::MatrixEdit);
                }
                Ok(())
            }
            Transformation::CellsMoved {
                source,
                to_sheet,
                row_offset,
                col_offset,
            } => {
                if !self.sheets.contains(source.sheet) {
                    return Err(EditError::UnknownSheet(source.sheet));
                }
                if !self.sheets.contains(to_sheet) {
                    return Err(EditError::UnknownSheet(to_sheet));
                }
                let (Some(s), Some(e)) = (
                    source.start.checked_offset(row_offset, col_offset),
                    source.end.checked_offset(row_offset, col_offset),
                ) else {
                    return Err(EditError::OutOfGrid);
                };
                let target = CellRange::new(to_sheet, s, e).map_err(|_| EditError::OutOfGrid)?;
                for k in self.matrices.keys() {
                    let rect = self.key_rect(k);
                    let inside_source = source.contains_range(&rect);
                    if rect.intersects(&source) && !inside_source {
                        return Err(EditError::MatrixEdit);
                    }
                    // Pasting onto an array block is impossible.
                    if rect.intersects(&target) && !inside_source {
                        return Err(EditError::MatrixEdit);
                    }
                }
                Ok(())
            }
            Transformation::SheetRemoved { sheet } => {
                if !self.sheets.contains(sheet) {
                    return Err(EditError::UnknownSheet(sheet));
                }
                Ok(())
            }
        }
    }

    fn validate_sheet_span(&self, sheet: SheetId, count: u32) -> Result<(), EditError> {
        if !self.sheets.contains(sheet) {
            return Err(EditError::UnknownSheet(sheet));
        }
        if count == 0 {
            return Err(EditError::InvalidSpan("span must be non-empty".into()));
        }
        Ok(())
    }

    /// Apply one validated structural edit. Mapping storage shifts, vertices
    /// in removed spans are destroyed, straddling ranges grow or shrink, and
    /// array blocks are transformed eagerly and restamped to `version`.
    /// Formula ASTs are *not* rewritten here; they reconcile lazily on read.
    pub fn apply_structural(
        &mut self,
        t: &Transformation,
        version: u64,
    ) -> StructuralSummary {
        let mut summary = StructuralSummary::default();
        match *t {
            Transformation::RowsInserted { sheet, row, count } => {
                debug!(sheet, row, count, "insert rows");
                self.rebuild_addresses(sheet, |c| {
                    Some(if c.row >= row {
                        Coord::new(c.row + count, c.col)
                    } else {
                        c
                    })
                });
                self.resize_ranges(sheet, &mut summary, |rect| {
                    rows_inserted_rect(rect, row, count)
                });
            }
            Transformation::RowsRemoved { sheet, row, count } => {
                debug!(sheet, row, count, "remove rows");
                self.remove_span_vertices(sheet, &mut summary, |c| {
                    c.row >= row && c.row < row + count
                });
                self.rebuild_addresses(sheet, |c| {
                    if c.row >= row && c.row < row + count {
                        None
                    } else if c.row >= row + count {
                        Some(Coord::new(c.row - count, c.col))
                    } else {
                        Some(c)
                    }
                });
                self.resize_ranges(sheet, &mut summary, |rect| {
                    rows_removed_rect(rect, row, count)
                });
            }
            Transformation::ColumnsInserted { sheet, col, count } => {
                debug!(sheet, col, count, "insert columns");
                self.rebuild_addresses(sheet, |c| {
                    Some(if c.col >= col {
                        Coord::new(c.row, c.col + count)
                    } else {
                        c
                    })
                });
                self.resize_ranges(sheet, &mut summary, |rect| {
                    cols_inserted_rect(rect, col, count)
                });
            }
            Transformation::ColumnsRemoved { sheet, col, count } => {
                debug!(sheet, col, count, "remove columns");
                self.remove_span_vertices(sheet, &mut summary, |c| {
                    c.col >= col && c.col < col + count
                });
                self.rebuild_addresses(sheet, |c| {
                    if c.col >= col && c.col < col + count {
                        None
                    } else if c.col >= col + count {
                        Some(Coord::new(c.row, c.col - count))
                    } else {
                        Some(c)
                    }
                });
                self.resize_ranges(sheet, &mut summary, |rect| {
                    cols_removed_rect(rect, col, count)
                });
            }
            Transformation::CellsMoved {
                source,
                to_sheet,
                row_offset,
                col_offset,
            } => {
                self.apply_cells_moved(source, to_sheet, row_offset, col_offset, &mut summary);
            }
            Transformation::SheetRemoved { sheet } => {
                self.apply_sheet_removed(sheet, &mut summary);
            }
        }

        self.transform_matrices(t, version);

        let seeds = summary.seeds.clone();
        for id in seeds {
            if self.graph.contains(id) {
                self.graph.mark_dirty(id);
            }
        }
        summary
    }

    /// Destroy every vertex whose coordinate satisfies `in_span`, collecting
    /// snapshots and seeding the dependents left behind.
    fn remove_span_vertices(
        &mut self,
        sheet: SheetId,
        summary: &mut StructuralSummary,
        in_span: impl Fn(Coord) -> bool,
    ) {
        let doomed: Vec<(Coord, VertexId)> = self
            .addresses
            .get(&sheet)
            .map(|m| {
                m.iter()
                    .filter(|(c, _)| in_span(**c))
                    .map(|(c, id)| (*c, *id))
                    .collect()
            })
            .unwrap_or_default();

        let mut removed: FxHashSet<VertexId> = FxHashSet::default();
        for (coord, id) in doomed {
            let addr = CellAddress::from_coord(sheet, coord);
            if removed.contains(&id) {
                continue; // matrix vertex already handled via another cell
            }
            summary.seeds.extend(self.graph.adjacent_nodes(id));
            let snapshot = self.snapshot_vertex(id);
            summary.displaced.push((addr, snapshot));
            self.detach_dependency_edges(id);
            self.graph.unmark_volatile(id);
            let matrix_key = match self.graph.node(id) {
                Some(VertexKind::Matrix(m)) => Some(range_key(&m.range)),
                _ => None,
            };
            if let Some(key) = matrix_key {
                self.matrices.remove(&key);
            }
            let _ = self.graph.remove_node(id);
            removed.insert(id);
        }
        // Removed ids are seeds no more.
        summary.seeds.retain(|id| self.graph.contains(*id));
    }

    /// Snapshot of whatever occupies `addr`, for the undo ledger.
    pub fn snapshot_at(&self, addr: CellAddress) -> CellSnapshot {
        match self.vertex_id_at(addr) {
            Some(id) => self.snapshot_vertex(id),
            None => CellSnapshot::empty(),
        }
    }

    fn snapshot_vertex(&self, id: VertexId) -> CellSnapshot {
        match self.graph.node(id) {
            Some(VertexKind::Value(v)) => CellSnapshot {
                value: Some(v.clone()),
                formula: None,
            },
            Some(VertexKind::Formula(f)) => CellSnapshot {
                value: f.cached.clone(),
                formula: Some(f.ast.clone()),
            },
            Some(VertexKind::Matrix(m)) => CellSnapshot {
                value: None,
                formula: Some(m.ast.clone()),
            },
            _ => CellSnapshot::empty(),
        }
    }

    fn rebuild_addresses(&mut self, sheet: SheetId, f: impl Fn(Coord) -> Option<Coord>) {
        let Some(map) = self.addresses.get_mut(&sheet) else {
            return;
        };
        let entries: Vec<(Coord, VertexId)> = map.drain().collect();
        for (coord, id) in entries {
            if let Some(new_coord) = f(coord) {
                map.insert(new_coord, id);
            }
        }
    }

    /// Grow, shrink, shift, or destroy every range vertex on `sheet` whose
    /// rectangle the edit touches, re-keying the mapping and clearing caches.
    fn resize_ranges(
        &mut self,
        sheet: SheetId,
        summary: &mut StructuralSummary,
        shift: impl Fn(CellRange) -> RectShift,
    ) {
        let affected: Vec<(RangeKey, VertexId)> = self
            .ranges
            .iter()
            .filter(|(k, _)| k.0 == sheet)
            .map(|(k, &id)| (*k, id))
            .collect();
        for (key, id) in affected {
            let rect = self.key_rect(&key);
            match shift(rect) {
                RectShift::Unchanged => {}
                RectShift::Removed => {
                    summary.seeds.extend(self.graph.adjacent_nodes(id));
                    self.ranges.remove(&key);
                    let _ = self.graph.remove_node(id);
                    summary.seeds.retain(|s| self.graph.contains(*s));
                }
                RectShift::Moved(new_rect) => {
                    if let Some(VertexKind::Range(rv)) = self.graph.node_mut(id) {
                        rv.range = new_rect;
                        rv.sub_end_row = shift_sub_end(rv.sub_end_row, rect, new_rect);
                        rv.clear_caches();
                    }
                    self.ranges.remove(&key);
                    self.ranges.insert(range_key(&new_rect), id);
                    summary.seeds.push(id);
                }
            }
        }
    }

    fn apply_cells_moved(
        &mut self,
        source: CellRange,
        to_sheet: SheetId,
        row_offset: i64,
        col_offset: i64,
        summary: &mut StructuralSummary,
    ) {
        debug!(%source, to_sheet, row_offset, col_offset, "move cells");
        let target_start = source
            .start
            .checked_offset(row_offset, col_offset)
            .expect("validated");
        let target_end = source
            .end
            .checked_offset(row_offset, col_offset)
            .expect("validated");
        let target = CellRange::new(to_sheet, target_start, target_end).expect("validated");

        // Displace whatever occupies the target area and is not itself moving.
        let displaced: Vec<(Coord, VertexId)> = self
            .addresses
            .get(&to_sheet)
            .map(|m| {
                m.iter()
                    .filter(|(c, _)| {
                        target.contains_coord(**c)
                            && !(to_sheet == source.sheet && source.contains_coord(**c))
                    })
                    .map(|(c, id)| (*c, *id))
                    .collect()
            })
            .unwrap_or_default();
        for (coord, id) in displaced {
            let addr = CellAddress::from_coord(to_sheet, coord);
            summary.seeds.extend(self.graph.adjacent_nodes(id));
            summary.displaced.push((addr, self.snapshot_vertex(id)));
            self.detach_dependency_edges(id);
            self.graph.unmark_volatile(id);
            let _ = self.graph.remove_node(id);
            self.remove_address(addr);
        }
        summary.seeds.retain(|s| self.graph.contains(*s));

        // Relocate the block's vertices in the mapping.
        let moving: Vec<(Coord, VertexId)> = self
            .addresses
            .get(&source.sheet)
            .map(|m| {
                m.iter()
                    .filter(|(c, _)| source.contains_coord(**c))
                    .map(|(c, id)| (*c, *id))
                    .collect()
            })
            .unwrap_or_default();
        let mut moves: Vec<(Coord, Coord, VertexId)> = Vec::with_capacity(moving.len());
        for (coord, id) in moving {
            let new_coord = coord
                .checked_offset(row_offset, col_offset)
                .expect("validated");
            self.remove_address(CellAddress::from_coord(source.sheet, coord));
            moves.push((coord, new_coord, id));
        }
        for (_, new_coord, id) in &moves {
            self.insert_address(CellAddress::from_coord(to_sheet, *new_coord), *id);
            // Moved formulas recompute once at their new home.
            if matches!(
                self.graph.node(*id),
                Some(VertexKind::Formula(_)) | Some(VertexKind::Matrix(_))
            ) {
                summary.seeds.push(*id);
            }
        }

        // Re-link range membership for cells that crossed a rectangle edge.
        let range_ids: Vec<(RangeKey, VertexId)> = self
            .ranges
            .iter()
            .filter(|(k, _)| k.0 == source.sheet || k.0 == to_sheet)
            .map(|(k, &rid)| (*k, rid))
            .collect();
        for (key, rid) in range_ids {
            let mut touched = false;
            for (old_coord, new_coord, id) in &moves {
                let was_in = key_contains(&key, source.sheet, *old_coord);
                let is_in = key_contains(&key, to_sheet, *new_coord);
                if was_in && !is_in {
                    self.graph.remove_edge_if_exists(*id, rid);
                    touched = true;
                } else if !was_in && is_in {
                    self.graph.add_edge(*id, rid);
                    touched = true;
                } else if was_in && is_in {
                    touched = true; // contents rearranged inside the rectangle
                }
            }
            if touched {
                self.clear_range_caches(rid);
                summary.seeds.push(rid);
            }
        }
    }

    fn apply_sheet_removed(&mut self, sheet: SheetId, summary: &mut StructuralSummary) {
        debug!(sheet, "remove sheet");
        let cells: Vec<(Coord, VertexId)> = self
            .addresses
            .remove(&sheet)
            .map(|m| m.into_iter().collect())
            .unwrap_or_default();
        let mut removed: FxHashSet<VertexId> = FxHashSet::default();
        for (coord, id) in cells {
            if removed.contains(&id) {
                continue;
            }
            summary.seeds.extend(self.graph.adjacent_nodes(id));
            summary
                .displaced
                .push((CellAddress::from_coord(sheet, coord), self.snapshot_vertex(id)));
            self.detach_dependency_edges(id);
            self.graph.unmark_volatile(id);
            let _ = self.graph.remove_node(id);
            removed.insert(id);
        }
        let dead_ranges: Vec<(RangeKey, VertexId)> = self
            .ranges
            .iter()
            .filter(|(k, _)| k.0 == sheet)
            .map(|(k, &id)| (*k, id))
            .collect();
        for (key, id) in dead_ranges {
            summary.seeds.extend(self.graph.adjacent_nodes(id));
            self.ranges.remove(&key);
            let _ = self.graph.remove_node(id);
        }
        self.matrices.retain(|k, _| k.0 != sheet);
        self.sheets.remove(sheet);
        summary.seeds.retain(|s| self.graph.contains(*s));
    }

    /// Array blocks cannot drift from the mapping tables, so they take every
    /// transformation eagerly and are restamped to the current log version.
    fn transform_matrices(&mut self, t: &Transformation, version: u64) {
        let entries: Vec<(RangeKey, VertexId)> = self
            .matrices
            .iter()
            .map(|(k, &id)| (*k, id))
            .collect();
        for (key, id) in entries {
            if !self.graph.contains(id) {
                self.matrices.remove(&key);
                continue;
            }
            let (old_range, new_range, new_ast) = {
                let Some(VertexKind::Matrix(m)) = self.graph.node(id) else {
                    continue;
                };
                let old_base = CellAddress::from_coord(m.range.sheet, m.range.start);
                let new_range = match transform_range_rect(t, m.range) {
                    RectShift::Moved(r) => r,
                    _ => m.range,
                };
                let new_base = CellAddress::from_coord(new_range.sheet, new_range.start);
                let new_ast = transform_ast(t, &m.ast, old_base, new_base);
                (m.range, new_range, new_ast)
            };
            if let Some(VertexKind::Matrix(m)) = self.graph.node_mut(id) {
                m.ast = new_ast;
                m.range = new_range;
                m.version = version;
            }
            if new_range != old_range {
                self.matrices.remove(&key);
                self.matrices.insert(range_key(&new_range), id);
            }
        }
    }

    // ---- small helpers ---------------------------------------------------

    fn key_rect(&self, key: &RangeKey) -> CellRange {
        CellRange::new(key.0, Coord::new(key.1, key.2), Coord::new(key.3, key.4))
            .expect("keys are built from normalized ranges")
    }

    fn insert_address(&mut self, addr: CellAddress, id: VertexId) {
        self.addresses
            .entry(addr.sheet)
            .or_default()
            .insert(addr.coord, id);
    }

    fn remove_address(&mut self, addr: CellAddress) {
        if let Some(map) = self.addresses.get_mut(&addr.sheet) {
            map.remove(&addr.coord);
        }
    }

    #[cfg(test)]
    pub(crate) fn range_count(&self) -> usize {
        self.ranges.len()
    }

    #[cfg(test)]
    pub(crate) fn range_vertex_id(&self, range: &CellRange) -> Option<VertexId> {
        self.ranges.get(&range_key(range)).copied()
    }

    #[cfg(test)]
    pub(crate) fn incoming_edge_count(&self, id: VertexId) -> usize {
        self.graph
            .node_ids()
            .into_iter()
            .filter(|&from| self.graph.successors(from).any(|to| to == id))
            .count()
    }
}

fn combine_aggregates(kind: AggKind, a: CellValue, b: CellValue) -> CellValue {
    match (a, b) {
        (CellValue::Error(e), _) | (_, CellValue::Error(e)) => CellValue::Error(e),
        (CellValue::Empty, v) | (v, CellValue::Empty) => v,
        (CellValue::Number(x), CellValue::Number(y)) => match kind {
            AggKind::Sum | AggKind::Count => CellValue::Number(x + y),
            AggKind::Min => CellValue::Number(x.min(y)),
            AggKind::Max => CellValue::Number(x.max(y)),
        },
        _ => CellValue::error(cellgraph_common::CellErrorKind::Value),
    }
}

fn shift_sub_end(sub_end: Option<u32>, old_rect: CellRange, new_rect: CellRange) -> Option<u32> {
    let se = sub_end?;
    // The sub-range link survives a uniform shift; any other resize drops it
    // (the edge itself stays for dirty propagation).
    let row_delta = new_rect.start.row as i64 - old_rect.start.row as i64;
    if new_rect.end.row as i64 - old_rect.end.row as i64 == row_delta
        && new_rect.start.col == old_rect.start.col
        && new_rect.end.col == old_rect.end.col
    {
        Some((se as i64 + row_delta) as u32)
    } else {
        None
    }
}

fn rows_inserted_rect(rect: CellRange, row: u32, count: u32) -> RectShift {
    if rect.start.row >= row {
        RectShift::Moved(
            CellRange::new(
                rect.sheet,
                Coord::new(rect.start.row + count, rect.start.col),
                Coord::new(rect.end.row + count, rect.end.col),
            )
            .unwrap(),
        )
    } else if rect.end.row >= row {
        RectShift::Moved(
            CellRange::new(
                rect.sheet,
                rect.start,
                Coord::new(rect.end.row + count, rect.end.col),
            )
            .unwrap(),
        )
    } else {
        RectShift::Unchanged
    }
}

fn rows_removed_rect(rect: CellRange, row: u32, count: u32) -> RectShift {
    match super::transform::clamp_span(rect.start.row, rect.end.row, row, count) {
        None => RectShift::Removed,
        Some((lo, hi)) if lo == rect.start.row && hi == rect.end.row => RectShift::Unchanged,
        Some((lo, hi)) => RectShift::Moved(
            CellRange::new(
                rect.sheet,
                Coord::new(lo, rect.start.col),
                Coord::new(hi, rect.end.col),
            )
            .unwrap(),
        ),
    }
}

fn cols_inserted_rect(rect: CellRange, col: u32, count: u32) -> RectShift {
    if rect.start.col >= col {
        RectShift::Moved(
            CellRange::new(
                rect.sheet,
                Coord::new(rect.start.row, rect.start.col + count),
                Coord::new(rect.end.row, rect.end.col + count),
            )
            .unwrap(),
        )
    } else if rect.end.col >= col {
        RectShift::Moved(
            CellRange::new(
                rect.sheet,
                rect.start,
                Coord::new(rect.end.row, rect.end.col + count),
            )
            .unwrap(),
        )
    } else {
        RectShift::Unchanged
    }
}

fn cols_removed_rect(rect: CellRange, col: u32, count: u32) -> RectShift {
    match super::transform::clamp_span(rect.start.col, rect.end.col, col, count) {
        None => RectShift::Removed,
        Some((lo, hi)) if lo == rect.start.col && hi == rect.end.col => RectShift::Unchanged,
        Some((lo, hi)) => RectShift::Moved(
            CellRange::new(
                rect.sheet,
                Coord::new(rect.start.row, lo),
                Coord::new(rect.end.row, hi),
            )
            .unwrap(),
        ),
    }
}
