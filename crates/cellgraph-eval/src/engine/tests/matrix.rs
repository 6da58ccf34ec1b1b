use cellgraph_common::CellErrorKind;

use crate::engine::dependency_graph::EditError;

use super::common::{addr, engine, err, num, range, set};

#[test]
fn transpose_block_fills_its_cells() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 0, 1), "2");
    set(&mut e, addr(0, 1, 0), "3");
    set(&mut e, addr(0, 1, 1), "4");

    e.set_matrix_formula(range(0, 4, 0, 5, 1), "=TRANSPOSE(A1:B2)")
        .unwrap();

    assert_eq!(e.cell_value(addr(0, 4, 0)), num(1.0));
    assert_eq!(e.cell_value(addr(0, 4, 1)), num(3.0));
    assert_eq!(e.cell_value(addr(0, 5, 0)), num(2.0));
    assert_eq!(e.cell_value(addr(0, 5, 1)), num(4.0));
    assert_eq!(
        e.cell_formula(addr(0, 4, 0)).as_deref(),
        Some("{=TRANSPOSE(A1:B2)}")
    );
}

#[test]
fn matrix_updates_when_inputs_change() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 1, 0), "2");
    e.set_matrix_formula(range(0, 0, 2, 1, 2), "=A1:A2*10").unwrap();
    assert_eq!(e.cell_value(addr(0, 1, 2)), num(20.0));

    set(&mut e, addr(0, 1, 0), "5");
    assert_eq!(e.cell_value(addr(0, 1, 2)), num(50.0));
}

#[test]
fn shape_mismatch_is_a_value_error() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 1, 0), "2");
    set(&mut e, addr(0, 2, 0), "3");
    // Declared 2x1 but the argument is 3 cells tall.
    e.set_matrix_formula(range(0, 0, 2, 1, 2), "=A1:A3*2").unwrap();
    assert_eq!(e.cell_value(addr(0, 0, 2)), err(CellErrorKind::Value));
    assert_eq!(e.cell_value(addr(0, 1, 2)), err(CellErrorKind::Value));
}

#[test]
fn editing_inside_a_matrix_is_rejected() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    e.set_matrix_formula(range(0, 3, 0, 4, 1), "=TRANSPOSE(A1:B2)")
        .unwrap();

    assert!(matches!(
        e.set_cell_content(addr(0, 3, 1), "9"),
        Err(EditError::MatrixEdit)
    ));
    assert!(matches!(
        e.clear_cell(addr(0, 4, 0)),
        Err(EditError::MatrixEdit)
    ));
}

#[test]
fn row_edits_splitting_a_matrix_are_rejected_before_mutating() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "7");
    e.set_matrix_formula(range(0, 2, 0, 4, 0), "=A1:A1*1+{1;2;3}")
        .unwrap();

    assert!(matches!(
        e.add_rows(0, 3, 1),
        Err(EditError::MatrixEdit)
    ));
    assert!(matches!(
        e.remove_rows(0, 3, 1),
        Err(EditError::MatrixEdit)
    ));
    // Nothing moved: the matrix still answers at its original block.
    assert_eq!(e.cell_value(addr(0, 2, 0)), num(8.0));
}

#[test]
fn whole_matrix_inside_removed_span_is_destroyed() {
    let mut e = engine();
    e.set_matrix_formula(range(0, 2, 0, 3, 0), "={1;2}").unwrap();
    set(&mut e, addr(0, 10, 1), "=A3");
    assert_eq!(e.cell_value(addr(0, 10, 1)), num(1.0));

    e.remove_rows(0, 2, 2).unwrap();
    assert_eq!(e.cell_value(addr(0, 8, 1)), err(CellErrorKind::Ref));
}

#[test]
fn matrix_shifts_below_an_insertion() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 1, 0), "2");
    e.set_matrix_formula(range(0, 5, 0, 6, 0), "=A1:A2*3").unwrap();

    e.add_rows(0, 3, 2).unwrap();

    assert_eq!(e.cell_value(addr(0, 7, 0)), num(3.0));
    assert_eq!(e.cell_value(addr(0, 8, 0)), num(6.0));
    assert_eq!(
        e.cell_formula(addr(0, 7, 0)).as_deref(),
        Some("{=A1:A2*3}")
    );
}

#[test]
fn pasting_onto_a_matrix_is_rejected() {
    let mut e = engine();
    e.set_matrix_formula(range(0, 0, 0, 1, 0), "={1;2}").unwrap();
    assert!(matches!(
        e.set_matrix_formula(range(0, 1, 0, 2, 0), "={5;6}"),
        Err(EditError::MatrixEdit)
    ));
    set(&mut e, addr(0, 5, 0), "1");
    assert!(matches!(
        e.move_cells(range(0, 5, 0, 5, 0), addr(0, 0, 0)),
        Err(EditError::MatrixEdit)
    ));
}
