//! Content hashing of parsed formulas.
//!
//! The hash is computed over the anchored (offset) form, so two copies of the
//! same formula pasted at different addresses hash identically as long as
//! their relative references are the same — which is what lets a clipboard or
//! an undo ledger re-attach formulas by content instead of identity.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::parser::AstNode;

pub fn compute_hash_from_ast(ast: &AstNode) -> u64 {
    let mut hasher = FxHasher::default();
    ast.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use cellgraph_common::{CellAddress, SheetRegistry};

    fn sheets() -> SheetRegistry {
        let mut reg = SheetRegistry::new();
        reg.id_for("Sheet1");
        reg
    }

    #[test]
    fn relative_formulas_hash_position_independently() {
        let reg = sheets();
        // =A1+1 at B2 and the equivalent =B4+1 at C5: same offsets.
        let a = parse("=A1+1", CellAddress::new(0, 1, 1), &reg).unwrap();
        let b = parse("=B4+1", CellAddress::new(0, 4, 2), &reg).unwrap();
        assert_eq!(
            compute_hash_from_ast(&a.ast),
            compute_hash_from_ast(&b.ast)
        );
    }

    #[test]
    fn absolute_formulas_hash_by_target() {
        let reg = sheets();
        let a = parse("=$A$1", CellAddress::new(0, 1, 1), &reg).unwrap();
        let b = parse("=$A$1", CellAddress::new(0, 7, 3), &reg).unwrap();
        let c = parse("=$A$2", CellAddress::new(0, 1, 1), &reg).unwrap();
        assert_eq!(compute_hash_from_ast(&a.ast), compute_hash_from_ast(&b.ast));
        assert_ne!(compute_hash_from_ast(&a.ast), compute_hash_from_ast(&c.ast));
    }
}
