//! cellgraph-eval: incremental spreadsheet recalculation.
//!
//! The engine keeps a dependency graph over cells, array blocks, and
//! ranges-as-used-in-formulas, recomputes only the affected subgraph after an
//! edit, reports circular references as `#CYCLE!` values, and rewrites
//! formula references lazily after structural edits (row/column insertion or
//! deletion, block moves, sheet removal).

pub mod engine;

pub use engine::{
    DependencyGraph, EditError, Engine, EngineConfig, EvalSummary, Evaluator, Scheduler,
    TopologicalOrder, Transformation, TransformationLog, VertexId, VertexKind,
};
