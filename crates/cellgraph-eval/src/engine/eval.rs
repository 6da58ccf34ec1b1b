//! Evaluation passes and the public engine driver.

use std::time::{Duration, Instant};

use cellgraph_common::{CellAddress, CellErrorKind, CellRange, CellValue, SheetId};
use cellgraph_parse::{CellContent, classify, parse, unparse};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rustc_hash::FxHashSet;
use tracing::debug;

use super::EngineConfig;
use super::change_log::{ChangeEvent, ChangeLog};
use super::dependency_graph::{DependencyGraph, EditError, StructuralSummary};
use super::interp::{EvalContext, evaluate_array, evaluate_ast};
use super::scheduler::Scheduler;
use super::transform::{Transformation, TransformationLog};
use super::vertex::{VertexId, VertexKind};

#[derive(Debug, Default)]
pub struct EvalSummary {
    /// Formula and array vertices whose operating function ran.
    pub recomputed: usize,
    /// Vertices assigned `#CYCLE!` this pass.
    pub cycle_errors: usize,
    pub elapsed: Duration,
}

/// Drives topological evaluation over the dependency graph. Holds the
/// deterministic RNG used by volatile functions.
pub struct Evaluator {
    rng: SmallRng,
}

enum Plan {
    Skip,
    Seed,
    Range,
    Formula(cellgraph_parse::AstNode, CellAddress, Option<CellValue>),
    Matrix(
        cellgraph_parse::AstNode,
        CellRange,
        Option<Vec<Vec<CellValue>>>,
    ),
}

impl Evaluator {
    pub fn new(workbook_seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(workbook_seed),
        }
    }

    /// Full pass: seed with every vertex, evaluate everything reachable.
    pub fn run_full(
        &mut self,
        deps: &mut DependencyGraph,
        log: &TransformationLog,
    ) -> EvalSummary {
        let seeds = deps.graph().node_ids();
        self.run(deps, log, &seeds, true)
    }

    /// Incremental pass seeded with just-changed vertices; cost is bounded by
    /// the affected subgraph, not the sheet size.
    pub fn partial_run(
        &mut self,
        deps: &mut DependencyGraph,
        log: &TransformationLog,
        seeds: &[VertexId],
    ) -> EvalSummary {
        self.run(deps, log, seeds, false)
    }

    fn run(
        &mut self,
        deps: &mut DependencyGraph,
        log: &TransformationLog,
        seeds: &[VertexId],
        force_all: bool,
    ) -> EvalSummary {
        let started = Instant::now();
        let order = Scheduler::new(deps.graph()).order_from(seeds);
        debug!(
            seeds = seeds.len(),
            sorted = order.sorted.len(),
            cycled = order.cycled.len(),
            full = force_all,
            "evaluation pass"
        );

        let seed_set: FxHashSet<VertexId> = seeds.iter().copied().collect();
        let mut forced: FxHashSet<VertexId> = FxHashSet::default();
        let mut summary = EvalSummary::default();

        // Cycle members are visited once, never evaluated.
        for &v in &order.cycled {
            if deps.assign_cycle_error(v) {
                let successors: Vec<VertexId> = deps.graph().successors(v).collect();
                forced.extend(successors);
            }
            summary.cycle_errors += 1;
        }

        for &v in &order.sorted {
            if !force_all && !seed_set.contains(&v) && !forced.contains(&v) {
                continue;
            }
            let (changed, counted) = self.operate(deps, log, v);
            if counted {
                summary.recomputed += 1;
            }
            if changed {
                let successors: Vec<VertexId> = deps.graph().successors(v).collect();
                forced.extend(successors);
            }
        }

        summary.elapsed = started.elapsed();
        summary
    }

    /// Recompute one vertex, reporting whether its observable value changed
    /// (the signal that forces successors outside the original seed).
    fn operate(
        &mut self,
        deps: &mut DependencyGraph,
        log: &TransformationLog,
        id: VertexId,
    ) -> (bool, bool) {
        deps.reconcile_formula(id, log);
        if deps.needs_rewire(id) {
            deps.rewire_dependencies(id);
        }
        let plan = match deps.graph().node(id) {
            Some(VertexKind::Formula(f)) => Plan::Formula(f.ast.clone(), f.address, f.cached.clone()),
            Some(VertexKind::Matrix(m)) => Plan::Matrix(m.ast.clone(), m.range, m.cached.clone()),
            Some(VertexKind::Range(_)) => Plan::Range,
            Some(VertexKind::Value(_)) | Some(VertexKind::Empty) => Plan::Seed,
            None => Plan::Skip,
        };
        match plan {
            Plan::Skip => (false, false),
            // Value/Empty vertices only appear as seeds when their content
            // actually changed; propagate unconditionally.
            Plan::Seed => (true, false),
            Plan::Range => {
                // Caches are cleared, not recomputed, whenever visited.
                deps.clear_range_caches(id);
                (true, false)
            }
            Plan::Formula(ast, address, old) => {
                let value = {
                    let mut ctx = EvalContext {
                        deps: &mut *deps,
                        base: address,
                        rng: &mut self.rng,
                    };
                    evaluate_ast(&ast, &mut ctx)
                };
                let changed = old.as_ref() != Some(&value);
                if let Some(VertexKind::Formula(f)) = deps.graph_mut().node_mut(id) {
                    f.cached = Some(value);
                }
                (changed, true)
            }
            Plan::Matrix(ast, range, old) => {
                let rows = range.height() as usize;
                let cols = range.width() as usize;
                let computed = {
                    let mut ctx = EvalContext {
                        deps: &mut *deps,
                        base: CellAddress::from_coord(range.sheet, range.start),
                        rng: &mut self.rng,
                    };
                    evaluate_array(&ast, &mut ctx)
                };
                let block = match computed {
                    Ok(b) if b.len() == rows && b.first().map_or(0, Vec::len) == cols => b,
                    // Computed shape must match the declared block.
                    Ok(_) => error_block(rows, cols, CellErrorKind::Value),
                    Err(CellValue::Error(e)) => vec![vec![CellValue::Error(e); cols]; rows],
                    Err(_) => error_block(rows, cols, CellErrorKind::Value),
                };
                let changed = old.as_ref() != Some(&block);
                if let Some(VertexKind::Matrix(m)) = deps.graph_mut().node_mut(id) {
                    m.cached = Some(block);
                }
                (changed, true)
            }
        }
    }
}

fn error_block(rows: usize, cols: usize, kind: CellErrorKind) -> Vec<Vec<CellValue>> {
    vec![vec![CellValue::error(kind); cols]; rows]
}

/// The engine: dependency graph + transformation log + evaluator, with
/// content classification, batching, and an edit change log on top.
///
/// Every mutating call runs its full recomputation cascade before returning
/// (unless batching defers it); there is no concurrency and no re-entrancy.
pub struct Engine {
    pub config: EngineConfig,
    deps: DependencyGraph,
    transforms: TransformationLog,
    evaluator: Evaluator,
    changes: ChangeLog,
    batch_depth: u32,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            evaluator: Evaluator::new(config.workbook_seed),
            changes: ChangeLog::new(config.changelog_enabled),
            config,
            deps: DependencyGraph::new(),
            transforms: TransformationLog::new(),
            batch_depth: 0,
        }
    }

    // ---- sheets ----------------------------------------------------------

    pub fn add_sheet(&mut self, name: &str) -> SheetId {
        self.deps.add_sheet(name)
    }

    pub fn sheet_id(&self, name: &str) -> Option<SheetId> {
        self.deps.sheet_id(name)
    }

    pub fn sheet_name(&self, id: SheetId) -> &str {
        self.deps.sheet_name(id)
    }

    pub fn default_sheet(&self) -> SheetId {
        self.deps.default_sheet_id()
    }

    // ---- reads -----------------------------------------------------------

    pub fn cell_value(&self, addr: CellAddress) -> CellValue {
        self.deps.get_cell_value(addr)
    }

    /// Formula text at `addr`, reconciled against pending transformations.
    /// Array-block cells render as `{=...}`.
    pub fn cell_formula(&mut self, addr: CellAddress) -> Option<String> {
        let id = self.deps.vertex_id_at(addr)?;
        self.deps.reconcile_formula(id, &self.transforms);
        match self.deps.graph().node(id)? {
            VertexKind::Formula(f) => Some(unparse(&f.ast, f.address, self.deps.sheets())),
            VertexKind::Matrix(m) => {
                let base = CellAddress::from_coord(m.range.sheet, m.range.start);
                Some(format!("{{{}}}", unparse(&m.ast, base, self.deps.sheets())))
            }
            _ => None,
        }
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.deps
    }

    pub fn dependency_graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.deps
    }

    pub fn transformation_version(&self) -> u64 {
        self.transforms.version()
    }

    pub fn change_log(&self) -> &[ChangeEvent] {
        self.changes.events()
    }

    // ---- content edits ---------------------------------------------------

    /// Classify raw input and set the cell accordingly.
    pub fn set_cell_content(
        &mut self,
        addr: CellAddress,
        raw: &str,
    ) -> Result<EvalSummary, EditError> {
        match classify(raw) {
            CellContent::Empty => self.clear_cell(addr),
            CellContent::Number(n) => self.set_cell_value(addr, CellValue::Number(n)),
            CellContent::Text(s) => self.set_cell_value(addr, CellValue::Text(s)),
            CellContent::Formula(text) => self.set_cell_formula(addr, &text),
            // A matrix needs a declared block; a bare cell gets a 1x1 one.
            CellContent::MatrixFormula(text) => {
                let range = CellRange::new(addr.sheet, addr.coord, addr.coord)
                    .expect("single cell is normalized");
                self.set_matrix_formula(range, &text)
            }
        }
    }

    pub fn set_cell_value(
        &mut self,
        addr: CellAddress,
        value: CellValue,
    ) -> Result<EvalSummary, EditError> {
        let old = self.deps.snapshot_at(addr);
        self.deps.set_value_to_cell(addr, value)?;
        self.changes.push(ChangeEvent::SetContent { address: addr, old });
        self.after_edit()
    }

    pub fn set_cell_formula(
        &mut self,
        addr: CellAddress,
        text: &str,
    ) -> Result<EvalSummary, EditError> {
        let parsed = parse(text, addr, self.deps.sheets())
            .map_err(|e| EditError::Parse(e.to_string()))?;
        let old = self.deps.snapshot_at(addr);
        let version = self.transforms.version();
        self.deps.set_formula_to_cell(addr, &parsed, version)?;
        self.changes.push(ChangeEvent::SetContent { address: addr, old });
        self.after_edit()
    }

    pub fn set_matrix_formula(
        &mut self,
        range: CellRange,
        text: &str,
    ) -> Result<EvalSummary, EditError> {
        let base = CellAddress::from_coord(range.sheet, range.start);
        let parsed =
            parse(text, base, self.deps.sheets()).map_err(|e| EditError::Parse(e.to_string()))?;
        let version = self.transforms.version();
        self.deps.set_matrix_to_range(range, &parsed, version)?;
        self.after_edit()
    }

    pub fn clear_cell(&mut self, addr: CellAddress) -> Result<EvalSummary, EditError> {
        let old = self.deps.snapshot_at(addr);
        self.deps.set_cell_empty(addr)?;
        self.changes.push(ChangeEvent::SetContent { address: addr, old });
        self.after_edit()
    }

    // ---- structural edits ------------------------------------------------

    pub fn add_rows(
        &mut self,
        sheet: SheetId,
        row: u32,
        count: u32,
    ) -> Result<EvalSummary, EditError> {
        self.structural(Transformation::RowsInserted { sheet, row, count })
    }

    pub fn remove_rows(
        &mut self,
        sheet: SheetId,
        row: u32,
        count: u32,
    ) -> Result<EvalSummary, EditError> {
        self.structural(Transformation::RowsRemoved { sheet, row, count })
    }

    pub fn add_columns(
        &mut self,
        sheet: SheetId,
        col: u32,
        count: u32,
    ) -> Result<EvalSummary, EditError> {
        self.structural(Transformation::ColumnsInserted { sheet, col, count })
    }

    pub fn remove_columns(
        &mut self,
        sheet: SheetId,
        col: u32,
        count: u32,
    ) -> Result<EvalSummary, EditError> {
        self.structural(Transformation::ColumnsRemoved { sheet, col, count })
    }

    /// Relocate a block; `to` is the target top-left corner.
    pub fn move_cells(
        &mut self,
        source: CellRange,
        to: CellAddress,
    ) -> Result<EvalSummary, EditError> {
        self.structural(Transformation::CellsMoved {
            source,
            to_sheet: to.sheet,
            row_offset: to.row() as i64 - source.start.row as i64,
            col_offset: to.col() as i64 - source.start.col as i64,
        })
    }

    pub fn remove_sheet(&mut self, sheet: SheetId) -> Result<EvalSummary, EditError> {
        self.structural(Transformation::SheetRemoved { sheet })
    }

    fn structural(&mut self, t: Transformation) -> Result<EvalSummary, EditError> {
        // Structurally impossible edits abort here, before any mutation.
        self.deps.validate_structural(&t)?;
        let version = self.transforms.push(t.clone());
        let summary = self.deps.apply_structural(&t, version);
        self.changes.push(structural_event(&t, summary, version));
        self.after_edit()
    }

    // ---- batching & recomputation ---------------------------------------

    /// Defer recomputation until the matching `end_batch`. Nestable. This is
    /// an optimization for edit grouping, not a concurrency primitive.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    pub fn end_batch(&mut self) -> Result<EvalSummary, EditError> {
        if self.batch_depth > 0 {
            self.batch_depth -= 1;
        }
        self.after_edit()
    }

    /// Full recomputation of every vertex.
    pub fn recompute(&mut self) -> EvalSummary {
        let summary = self.evaluator.run_full(&mut self.deps, &self.transforms);
        self.deps.graph_mut().finish_run();
        summary
    }

    fn after_edit(&mut self) -> Result<EvalSummary, EditError> {
        if self.batch_depth > 0 {
            return Ok(EvalSummary::default());
        }
        let seeds = self.deps.graph_mut().dirty_and_volatile().to_vec();
        if seeds.is_empty() {
            return Ok(EvalSummary::default());
        }
        let summary = self
            .evaluator
            .partial_run(&mut self.deps, &self.transforms, &seeds);
        self.deps.graph_mut().finish_run();
        Ok(summary)
    }
}

fn structural_event(t: &Transformation, summary: StructuralSummary, version: u64) -> ChangeEvent {
    let displaced = summary.displaced;
    match *t {
        Transformation::RowsInserted { sheet, row, count } => ChangeEvent::RowsInserted {
            sheet,
            row,
            count,
            version,
        },
        Transformation::RowsRemoved { sheet, row, count } => ChangeEvent::RowsRemoved {
            sheet,
            row,
            count,
            displaced,
            version,
        },
        Transformation::ColumnsInserted { sheet, col, count } => ChangeEvent::ColumnsInserted {
            sheet,
            col,
            count,
            version,
        },
        Transformation::ColumnsRemoved { sheet, col, count } => ChangeEvent::ColumnsRemoved {
            sheet,
            col,
            count,
            displaced,
            version,
        },
        Transformation::CellsMoved {
            source,
            to_sheet,
            row_offset,
            col_offset,
        } => ChangeEvent::CellsMoved {
            source,
            to: CellAddress::from_coord(
                to_sheet,
                source
                    .start
                    .checked_offset(row_offset, col_offset)
                    .expect("validated before applying"),
            ),
            displaced,
            version,
        },
        Transformation::SheetRemoved { sheet } => ChangeEvent::SheetRemoved {
            sheet,
            displaced,
            version,
        },
    }
}
