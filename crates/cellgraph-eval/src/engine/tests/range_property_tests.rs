//! Property tests for the sub-range edge-compression optimization.
//!
//! The compression assumes ranges are usually registered growing out of
//! existing ones; these properties check the reachability invariant holds
//! for arbitrary registration orders too.

use proptest::prelude::*;
use rustc_hash::FxHashSet;

use crate::engine::graph::Graph;
use crate::engine::vertex::VertexId;

use super::common::{addr, engine, range};

/// Is `to` reachable from `from` along outgoing edges?
fn reaches(g: &Graph, from: VertexId, to: VertexId) -> bool {
    let mut seen: FxHashSet<VertexId> = FxHashSet::default();
    let mut queue = vec![from];
    while let Some(v) = queue.pop() {
        if v == to {
            return true;
        }
        if !seen.insert(v) {
            continue;
        }
        queue.extend(g.successors(v));
    }
    false
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_cell_reaches_every_covering_range_vertex(
        ends in proptest::collection::vec(1u32..9, 1..6),
    ) {
        let mut e = engine();
        for (i, end) in ends.iter().enumerate() {
            e.set_cell_formula(
                addr(0, 20 + i as u32, 3),
                &format!("=SUM(A1:A{end})"),
            )
            .unwrap();
        }

        let deps = e.dependency_graph();
        for end in &ends {
            let rid = deps
                .range_vertex_id(&range(0, 0, 0, end - 1, 0))
                .expect("registered range has a vertex");
            for row in 0..*end {
                let cell = deps
                    .vertex_id_at(addr(0, row, 0))
                    .expect("range registration creates placeholder cells");
                prop_assert!(
                    reaches(deps.graph(), cell, rid),
                    "A{} cannot reach range A1:A{}",
                    row + 1,
                    end
                );
            }
        }
    }

    #[test]
    fn late_written_cells_still_invalidate_all_covering_ranges(
        ends in proptest::collection::vec(2u32..9, 2..5),
        row in 0u32..8,
        value in 1.0f64..100.0,
    ) {
        let mut e = engine();
        for (i, end) in ends.iter().enumerate() {
            e.set_cell_formula(
                addr(0, 20 + i as u32, 3),
                &format!("=SUM(A1:A{end})"),
            )
            .unwrap();
        }
        e.set_cell_content(addr(0, row, 0), &value.to_string()).unwrap();

        for (i, end) in ends.iter().enumerate() {
            let expected = if row < *end { value } else { 0.0 };
            prop_assert_eq!(
                e.cell_value(addr(0, 20 + i as u32, 3)),
                cellgraph_common::CellValue::Number(expected)
            );
        }
    }

    #[test]
    fn insert_then_remove_rows_round_trips_relative_formulas(
        row in 0u32..15,
        count in 1u32..4,
    ) {
        let mut e = engine();
        e.set_cell_formula(addr(0, 20, 2), "=SUM(A1:A8)+B18").unwrap();
        let before = e.cell_formula(addr(0, 20, 2)).unwrap();

        e.add_rows(0, row, count).unwrap();
        e.remove_rows(0, row, count).unwrap();

        prop_assert_eq!(e.cell_formula(addr(0, 20, 2)).unwrap(), before);
    }
}
