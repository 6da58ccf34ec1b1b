//! AST interpreter.
//!
//! Evaluates one formula's AST against the dependency graph's cached cell
//! values. Errors are ordinary values: the first error encountered in an
//! operand propagates outward.

use cellgraph_common::{CellAddress, CellErrorKind, CellValue};
use cellgraph_parse::{AstNode, AstNodeType, ReferenceType};
use rand::rngs::SmallRng;

use super::builtins;
use super::dependency_graph::DependencyGraph;

pub struct EvalContext<'a> {
    pub deps: &'a mut DependencyGraph,
    /// Address of the formula being evaluated; relative references resolve
    /// against it.
    pub base: CellAddress,
    pub rng: &'a mut SmallRng,
}

pub fn evaluate_ast(ast: &AstNode, ctx: &mut EvalContext) -> CellValue {
    match &ast.node_type {
        AstNodeType::Literal(v) => v.clone(),
        AstNodeType::RefError => CellValue::error(CellErrorKind::Ref),
        AstNodeType::Reference(r) => match r {
            ReferenceType::Cell { .. } => match r.resolve_cell(ctx.base) {
                Some(addr) => ctx.deps.get_cell_value(addr),
                None => CellValue::error(CellErrorKind::Ref),
            },
            // A bare range in scalar position has no single value.
            ReferenceType::Range { .. } => CellValue::error(CellErrorKind::Value),
        },
        AstNodeType::UnaryOp { op, expr } => {
            let v = evaluate_ast(expr, ctx);
            unary_op(op, v)
        }
        AstNodeType::BinaryOp { op, left, right } => {
            let l = evaluate_ast(left, ctx);
            let r = evaluate_ast(right, ctx);
            binary_op(op, l, r)
        }
        AstNodeType::Function { name, args } => builtins::call(name, args, ctx),
        AstNodeType::Array(rows) => {
            // Scalar context takes the top-left element.
            evaluate_ast(&rows[0][0], ctx)
        }
    }
}

/// Evaluate in array context: the result is a rectangular block.
pub fn evaluate_array(ast: &AstNode, ctx: &mut EvalContext) -> Result<Vec<Vec<CellValue>>, CellValue> {
    match &ast.node_type {
        AstNodeType::Reference(r @ ReferenceType::Range { .. }) => {
            let Some(range) = r.resolve_range(ctx.base) else {
                return Err(CellValue::error(CellErrorKind::Ref));
            };
            let mut block = Vec::with_capacity(range.height() as usize);
            for row in range.start.row..=range.end.row {
                let mut cells = Vec::with_capacity(range.width() as usize);
                for col in range.start.col..=range.end.col {
                    cells.push(
                        ctx.deps
                            .get_cell_value(CellAddress::new(range.sheet, row, col)),
                    );
                }
                block.push(cells);
            }
            Ok(block)
        }
        AstNodeType::Array(rows) => Ok(rows
            .iter()
            .map(|row| row.iter().map(|item| evaluate_ast(item, ctx)).collect())
            .collect()),
        AstNodeType::UnaryOp { op, expr } => {
            let block = evaluate_array(expr, ctx)?;
            Ok(block
                .into_iter()
                .map(|row| row.into_iter().map(|v| unary_op(op, v)).collect())
                .collect())
        }
        AstNodeType::BinaryOp { op, left, right } => {
            let l = evaluate_array(left, ctx)?;
            let r = evaluate_array(right, ctx)?;
            broadcast(op, &l, &r)
        }
        AstNodeType::Function { name, args } if name == "TRANSPOSE" && args.len() == 1 => {
            let block = evaluate_array(&args[0], ctx)?;
            Ok(transpose(block))
        }
        _ => Ok(vec![vec![evaluate_ast(ast, ctx)]]),
    }
}

pub(crate) fn transpose(block: Vec<Vec<CellValue>>) -> Vec<Vec<CellValue>> {
    if block.is_empty() {
        return block;
    }
    let rows = block.len();
    let cols = block[0].len();
    (0..cols)
        .map(|c| (0..rows).map(|r| block[r][c].clone()).collect())
        .collect()
}

fn broadcast(
    op: &str,
    l: &[Vec<CellValue>],
    r: &[Vec<CellValue>],
) -> Result<Vec<Vec<CellValue>>, CellValue> {
    let (lr, lc) = (l.len(), l.first().map_or(0, Vec::len));
    let (rr, rc) = (r.len(), r.first().map_or(0, Vec::len));
    let rows = lr.max(rr);
    let cols = lc.max(rc);
    let dim_ok = |a: usize, out: usize| a == out || a == 1;
    if !(dim_ok(lr, rows) && dim_ok(rr, rows) && dim_ok(lc, cols) && dim_ok(rc, cols)) {
        return Err(CellValue::error(CellErrorKind::Value));
    }
    let pick = |m: &[Vec<CellValue>], mr: usize, mc: usize, i: usize, j: usize| {
        m[if mr == 1 { 0 } else { i }][if mc == 1 { 0 } else { j }].clone()
    };
    Ok((0..rows)
        .map(|i| {
            (0..cols)
                .map(|j| binary_op(op, pick(l, lr, lc, i, j), pick(r, rr, rc, i, j)))
                .collect()
        })
        .collect())
}

// ---- scalar operator semantics ------------------------------------------

/// Numeric coercion; `Err` carries the error value to propagate.
pub(crate) fn coerce_number(v: &CellValue) -> Result<f64, CellValue> {
    match v {
        CellValue::Number(n) => Ok(*n),
        CellValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        CellValue::Empty => Ok(0.0),
        CellValue::Error(_) => Err(v.clone()),
        CellValue::Text(_) | CellValue::Array(_) => {
            Err(CellValue::error(CellErrorKind::Value))
        }
    }
}

pub(crate) fn coerce_bool(v: &CellValue) -> Result<bool, CellValue> {
    match v {
        CellValue::Boolean(b) => Ok(*b),
        CellValue::Number(n) => Ok(*n != 0.0),
        CellValue::Empty => Ok(false),
        CellValue::Error(_) => Err(v.clone()),
        CellValue::Text(_) | CellValue::Array(_) => {
            Err(CellValue::error(CellErrorKind::Value))
        }
    }
}

fn to_text(v: &CellValue) -> Result<String, CellValue> {
    match v {
        CellValue::Error(_) | CellValue::Array(_) => Err(CellValue::error(CellErrorKind::Value)),
        other => Ok(other.to_string()),
    }
}

fn unary_op(op: &str, v: CellValue) -> CellValue {
    if let CellValue::Error(_) = v {
        return v;
    }
    match op {
        "-" => match coerce_number(&v) {
            Ok(n) => CellValue::Number(-n),
            Err(e) => e,
        },
        "+" => v,
        "%" => match coerce_number(&v) {
            Ok(n) => CellValue::Number(n / 100.0),
            Err(e) => e,
        },
        _ => CellValue::error(CellErrorKind::Value),
    }
}

fn binary_op(op: &str, l: CellValue, r: CellValue) -> CellValue {
    if let CellValue::Error(_) = l {
        return l;
    }
    if let CellValue::Error(_) = r {
        return r;
    }
    match op {
        "+" | "-" | "*" | "/" | "^" => {
            let (a, b) = match (coerce_number(&l), coerce_number(&r)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => return e,
            };
            let out = match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                "/" => {
                    if b == 0.0 {
                        return CellValue::error(CellErrorKind::Div);
                    }
                    a / b
                }
                _ => a.powf(b),
            };
            if out.is_finite() {
                CellValue::Number(out)
            } else {
                CellValue::error(CellErrorKind::Num)
            }
        }
        "&" => {
            let (a, b) = match (to_text(&l), to_text(&r)) {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => return e,
            };
            CellValue::Text(a + &b)
        }
        "=" | "<>" | "<" | ">" | "<=" | ">=" => compare(op, l, r),
        _ => CellValue::error(CellErrorKind::Value),
    }
}

fn compare(op: &str, l: CellValue, r: CellValue) -> CellValue {
    use std::cmp::Ordering;

    // Empty coerces to the neutral element of the other operand's type.
    let norm = |v: CellValue, other: &CellValue| -> CellValue {
        if v == CellValue::Empty {
            match other {
                CellValue::Text(_) => CellValue::Text(String::new()),
                CellValue::Boolean(_) => CellValue::Boolean(false),
                _ => CellValue::Number(0.0),
            }
        } else {
            v
        }
    };
    let a = norm(l.clone(), &r);
    let b = norm(r, &l);

    // Type rank: numbers < text < booleans.
    let rank = |v: &CellValue| match v {
        CellValue::Number(_) => 0u8,
        CellValue::Text(_) => 1,
        CellValue::Boolean(_) => 2,
        _ => 3,
    };
    let ord = match (&a, &b) {
        (CellValue::Number(x), CellValue::Number(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (CellValue::Text(x), CellValue::Text(y)) => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        (CellValue::Boolean(x), CellValue::Boolean(y)) => x.cmp(y),
        _ => rank(&a).cmp(&rank(&b)),
    };
    let result = match op {
        "=" => ord == Ordering::Equal,
        "<>" => ord != Ordering::Equal,
        "<" => ord == Ordering::Less,
        ">" => ord == Ordering::Greater,
        "<=" => ord != Ordering::Greater,
        _ => ord != Ordering::Less,
    };
    CellValue::Boolean(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_errors() {
        let n = |x: f64| CellValue::Number(x);
        assert_eq!(binary_op("+", n(2.0), n(3.0)), n(5.0));
        assert_eq!(
            binary_op("/", n(1.0), n(0.0)),
            CellValue::error(CellErrorKind::Div)
        );
        assert_eq!(
            binary_op("*", CellValue::error(CellErrorKind::Ref), n(3.0)),
            CellValue::error(CellErrorKind::Ref)
        );
        assert_eq!(binary_op("+", CellValue::Empty, n(3.0)), n(3.0));
        assert_eq!(
            binary_op("+", CellValue::Text("x".into()), n(3.0)),
            CellValue::error(CellErrorKind::Value)
        );
    }

    #[test]
    fn comparison_semantics() {
        let t = CellValue::Boolean(true);
        assert_eq!(
            compare("=", CellValue::Text("Abc".into()), CellValue::Text("abc".into())),
            t
        );
        assert_eq!(
            compare("<", CellValue::Number(9.0), CellValue::Text("1".into())),
            t
        );
        assert_eq!(
            compare("=", CellValue::Empty, CellValue::Number(0.0)),
            t
        );
    }

    #[test]
    fn concat_renders_operands() {
        assert_eq!(
            binary_op("&", CellValue::Number(1.0), CellValue::Text("x".into())),
            CellValue::Text("1x".into())
        );
    }

    #[test]
    fn transpose_block() {
        let n = |x: f64| CellValue::Number(x);
        let block = vec![vec![n(1.0), n(2.0)], vec![n(3.0), n(4.0)]];
        assert_eq!(
            transpose(block),
            vec![vec![n(1.0), n(3.0)], vec![n(2.0), n(4.0)]]
        );
    }
}
