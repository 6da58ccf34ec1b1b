use super::common::{addr, engine, num, set};

#[test]
fn edit_recomputes_only_the_affected_subgraph() {
    let mut e = engine();
    // Dependent chain: A1 -> B1 -> C1, plus an unrelated formula.
    set(&mut e, addr(0, 0, 0), "1");
    set(&mut e, addr(0, 0, 1), "=A1+1");
    set(&mut e, addr(0, 0, 2), "=B1+1");
    set(&mut e, addr(0, 5, 5), "=SUM(D1:D3)");

    let summary = e.set_cell_content(addr(0, 0, 0), "10").unwrap();
    assert_eq!(e.cell_value(addr(0, 0, 2)), num(12.0));
    // Only B1 and C1 ran; the unrelated SUM was untouched.
    assert_eq!(summary.recomputed, 2);
}

#[test]
fn unchanged_value_stops_propagation() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "4");
    set(&mut e, addr(0, 0, 1), "=MIN(A1,3)");
    set(&mut e, addr(0, 0, 2), "=B1*2");

    // A1 changes but MIN(A1,3) does not; C1 must not recompute.
    let summary = e.set_cell_content(addr(0, 0, 0), "7").unwrap();
    assert_eq!(summary.recomputed, 1);
    assert_eq!(e.cell_value(addr(0, 0, 2)), num(6.0));
}

#[test]
fn setting_the_same_value_recomputes_nothing() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "4");
    set(&mut e, addr(0, 0, 1), "=A1+1");
    let summary = e.set_cell_content(addr(0, 0, 0), "4").unwrap();
    assert_eq!(summary.recomputed, 0);
}

#[test]
fn new_value_in_a_summed_range_updates_the_sum() {
    let mut e = engine();
    set(&mut e, addr(0, 5, 0), "=SUM(A1:A3)");
    assert_eq!(e.cell_value(addr(0, 5, 0)), num(0.0));

    // A2 had no vertex when the range was registered.
    set(&mut e, addr(0, 1, 0), "5");
    assert_eq!(e.cell_value(addr(0, 5, 0)), num(5.0));
}

#[test]
fn formula_replacing_a_value_keeps_dependents_wired() {
    let mut e = engine();
    set(&mut e, addr(0, 0, 0), "3");
    set(&mut e, addr(0, 0, 1), "=A1*10");
    assert_eq!(e.cell_value(addr(0, 0, 1)), num(30.0));

    // A1 switches kind from value to formula in the same slot.
    set(&mut e, addr(0, 1, 0), "4");
    set(&mut e, addr(0, 0, 0), "=A2+1");
    assert_eq!(e.cell_value(addr(0, 0, 1)), num(50.0));

    // And back to a value again.
    set(&mut e, addr(0, 0, 0), "2");
    assert_eq!(e.cell_value(addr(0, 0, 1)), num(20.0));
}
