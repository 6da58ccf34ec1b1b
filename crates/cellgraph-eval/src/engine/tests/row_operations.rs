use cellgraph_common::CellErrorKind;

use super::common::{addr, engine, err, num, set};

#[test]
fn insert_rows_shifts_cells_and_rewrites_formulas() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "10");
    set(&mut e, addr(0, 1, 0), "20");
    set(&mut e, addr(0, 2, 0), "30");
    set(&mut e, addr(0, 3, 0), "=SUM(A1:A3)");

    e.add_rows(0, 1, 2).unwrap();

    // Values moved down with their rows.
    assert_eq!(e.cell_value(addr(0, 0, 0)), num(10.0));
    assert_eq!(e.cell_value(addr(0, 3, 0)), num(20.0));
    assert_eq!(e.cell_value(addr(0, 4, 0)), num(30.0));
    // The formula followed its row and its range grew across the gap.
    assert_eq!(e.cell_formula(addr(0, 5, 0)).as_deref(), Some("=SUM(A1:A5)"));
    assert_eq!(e.cell_value(addr(0, 5, 0)), num(60.0));
}

#[test]
fn inserted_rows_are_empty_and_fillable() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 1, 0), "2");
    set(&mut e, addr(0, 5, 0), "=SUM(A1:A2)");
    e.add_rows(0, 1, 1).unwrap();

    // The grown range picks up content written into the gap.
    set(&mut e, addr(0, 1, 0), "40");
    assert_eq!(e.cell_value(addr(0, 6, 0)), num(43.0));
}

#[test]
fn remove_rows_shifts_references_down() {
    let mut e = engine();
    set(&mut e, addr(0, 5, 0), "99");
    set(&mut e, addr(0, 9, 1), "=A6");
    e.remove_rows(0, 0, 2).unwrap();

    assert_eq!(e.cell_formula(addr(0, 7, 1)).as_deref(), Some("=A4"));
    assert_eq!(e.cell_value(addr(0, 7, 1)), num(99.0));
}

#[test]
fn removing_a_referenced_row_yields_ref() {
    let mut e = engine();
    // A1 = 1, B2 = A1; removing row 1 shifts B2 to B1 and kills its target.
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 1, 1), "=A1");
    e.remove_rows(0, 0, 1).unwrap();

    assert_eq!(e.cell_value(addr(0, 0, 1)), err(CellErrorKind::Ref));
    assert_eq!(e.cell_formula(addr(0, 0, 1)).as_deref(), Some("=#REF!"));
}

#[test]
fn removing_rows_clamps_straddling_ranges() {
    let mut e = engine();
    for row in 0..6 {
        set(&mut e, addr(0, row, 0), "1");
    }
    set(&mut e, addr(0, 9, 1), "=SUM(A1:A6)");
    assert_eq!(e.cell_value(addr(0, 9, 1)), num(6.0));

    e.remove_rows(0, 3, 3).unwrap();
    assert_eq!(e.cell_formula(addr(0, 6, 1)).as_deref(), Some("=SUM(A1:A3)"));
    assert_eq!(e.cell_value(addr(0, 6, 1)), num(3.0));
}

#[test]
fn add_then_remove_rows_round_trips_formula_text() {
    let mut e = engine();
    set(&mut e, addr(0, 10, 3), "=SUM(A1:A5)+B9*2");
    let before = e.cell_formula(addr(0, 10, 3)).unwrap();

    e.add_rows(0, 2, 3).unwrap();
    e.remove_rows(0, 2, 3).unwrap();

    assert_eq!(e.cell_formula(addr(0, 10, 3)).unwrap(), before);
}

#[test]
fn remove_rows_seeds_only_affected_formulas() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 10, 1), "=A1");
    set(&mut e, addr(0, 11, 1), "=D12*2");

    // Removing row 5 displaces nothing either formula reads.
    let summary = e.remove_rows(0, 5, 1).unwrap();
    assert_eq!(summary.recomputed, 0);
}
