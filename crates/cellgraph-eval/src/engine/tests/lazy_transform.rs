use cellgraph_common::CellValue;

use crate::engine::vertex::VertexKind;

use super::common::{addr, engine, num, set};

/// Version stamp of the formula vertex at `addr`.
fn stamp(e: &crate::engine::eval::Engine, a: cellgraph_common::CellAddress) -> u64 {
    let deps = e.dependency_graph();
    let id = deps.vertex_id_at(a).unwrap();
    match deps.graph().node(id).unwrap() {
        VertexKind::Formula(f) => f.version,
        _ => panic!("expected formula vertex"),
    }
}

#[test]
fn untouched_formulas_are_not_rewritten_eagerly() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "=A2+1");
    assert_eq!(stamp(&e, addr(0, 0, 0)), 0);

    // A structural edit far below: nothing seeds the formula, so its AST
    // stays stale until somebody reads it.
    e.add_rows(0, 50, 5).unwrap();
    assert_eq!(e.transformation_version(), 1);
    assert_eq!(stamp(&e, addr(0, 0, 0)), 0);

    // Reading the formula reconciles and restamps it.
    assert_eq!(e.cell_formula(addr(0, 0, 0)).as_deref(), Some("=A2+1"));
    assert_eq!(stamp(&e, addr(0, 0, 0)), 1);
}

#[test]
fn pending_transformations_replay_in_order_exactly_once() {
    let mut e = engine();
    set(&mut e, addr(0, 20, 0), "=B10");

    e.add_rows(0, 0, 2).unwrap(); // B10 -> B12
    e.remove_rows(0, 0, 1).unwrap(); // B12 -> B11
    e.add_columns(0, 0, 3).unwrap(); // B11 -> E11

    assert_eq!(e.cell_formula(addr(0, 21, 3)).as_deref(), Some("=E11"));
    assert_eq!(stamp(&e, addr(0, 21, 3)), 3);

    // A second read replays nothing further.
    assert_eq!(e.cell_formula(addr(0, 21, 3)).as_deref(), Some("=E11"));
    assert_eq!(stamp(&e, addr(0, 21, 3)), 3);
}

#[test]
fn new_formulas_start_at_the_current_log_version() {
    let mut e = engine();
    e.add_rows(0, 0, 1).unwrap();
    e.add_rows(0, 0, 1).unwrap();
    set(&mut e, addr(0, 0, 0), "=A2");
    assert_eq!(stamp(&e, addr(0, 0, 0)), 2);
}

#[test]
fn values_survive_structural_edits_without_recomputation() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "2");
    set(&mut e, addr(0, 5, 0), "=A1*3");
    assert_eq!(e.cell_value(addr(0, 5, 0)), num(6.0));

    let summary = e.add_rows(0, 2, 4).unwrap();
    // The formula moved but nothing it reads changed.
    assert_eq!(summary.recomputed, 0);
    assert_eq!(e.cell_value(addr(0, 9, 0)), num(6.0));
    assert_eq!(e.cell_value(addr(0, 5, 0)), CellValue::Empty);
}
