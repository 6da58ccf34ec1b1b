use cellgraph_common::CellValue;

use super::common::{addr, engine, num, range, set};

#[test]
fn moved_formula_still_denotes_the_same_cells() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "3");
    set(&mut e, addr(0, 0, 3), "=A1*2");

    e.move_cells(range(0, 0, 3, 0, 3), addr(0, 4, 3)).unwrap();

    assert_eq!(e.cell_value(addr(0, 0, 3)), CellValue::Empty);
    assert_eq!(e.cell_formula(addr(0, 4, 3)).as_deref(), Some("=A1*2"));
    assert_eq!(e.cell_value(addr(0, 4, 3)), num(6.0));
}

#[test]
fn references_into_a_moved_block_are_redirected() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "41");
    set(&mut e, addr(0, 0, 2), "=A1+1");

    e.move_cells(range(0, 0, 0, 0, 0), addr(0, 7, 1)).unwrap();

    assert_eq!(e.cell_formula(addr(0, 0, 2)).as_deref(), Some("=B8+1"));
    assert_eq!(e.cell_value(addr(0, 0, 2)), num(42.0));
    // Follow-up edits at the new home keep flowing.
    set(&mut e, addr(0, 7, 1), "10");
    assert_eq!(e.cell_value(addr(0, 0, 2)), num(11.0));
}

#[test]
fn moving_onto_cells_displaces_them() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 5, 0), "999");
    set(&mut e, addr(0, 6, 0), "=A6");

    e.move_cells(range(0, 0, 0, 0, 0), addr(0, 5, 0)).unwrap();

    // The displaced value is gone; its dependent now sees the moved content.
    assert_eq!(e.cell_value(addr(0, 6, 0)), num(1.0));
}

#[test]
fn move_updates_range_membership() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "5");
    set(&mut e, addr(0, 9, 3), "=SUM(A1:A3)");
    assert_eq!(e.cell_value(addr(0, 9, 3)), num(5.0));

    // Move A1 out of the summed rectangle.
    e.move_cells(range(0, 0, 0, 0, 0), addr(0, 8, 0)).unwrap();
    assert_eq!(e.cell_value(addr(0, 9, 3)), num(0.0));

    // And somebody else's move into the rectangle counts again.
    e.move_cells(range(0, 8, 0, 8, 0), addr(0, 1, 0)).unwrap();
    assert_eq!(e.cell_value(addr(0, 9, 3)), num(5.0));
}

#[test]
fn move_to_another_sheet_requalifies_references() {
    let mut e = engine();
    let data = e.add_sheet("Data");
    set(&mut e, addr(0, 0, 0), "8");
    set(&mut e, addr(0, 2, 2), "=A1");

    e.move_cells(range(0, 0, 0, 0, 0), addr(data, 0, 0)).unwrap();

    assert_eq!(e.cell_formula(addr(0, 2, 2)).as_deref(), Some("=Data!A1"));
    assert_eq!(e.cell_value(addr(0, 2, 2)), num(8.0));
}
