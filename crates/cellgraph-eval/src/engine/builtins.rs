//! Builtin function registry.

use cellgraph_common::{CellErrorKind, CellValue, date_to_serial, datetime_to_serial};
use cellgraph_parse::{AstNode, AstNodeType, ReferenceType};
use once_cell::sync::Lazy;
use rand::Rng;
use rustc_hash::FxHashMap;

use super::dependency_graph::AggKind;
use super::interp::{EvalContext, coerce_bool, coerce_number, evaluate_array, evaluate_ast};

pub type BuiltinFn = fn(&[AstNode], &mut EvalContext) -> CellValue;

pub struct Builtin {
    pub volatile: bool,
    pub func: BuiltinFn,
}

static REGISTRY: Lazy<FxHashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut m = FxHashMap::default();
    let mut add = |name: &'static str, volatile: bool, func: BuiltinFn| {
        m.insert(name, Builtin { volatile, func });
    };
    add("SUM", false, fn_sum);
    add("COUNT", false, fn_count);
    add("MIN", false, fn_min);
    add("MAX", false, fn_max);
    add("AVERAGE", false, fn_average);
    add("SUMIF", false, fn_sumif);
    add("COUNTIF", false, fn_countif);
    add("IF", false, fn_if);
    add("AND", false, fn_and);
    add("OR", false, fn_or);
    add("NOT", false, fn_not);
    add("TRANSPOSE", false, fn_transpose);
    add("RAND", true, fn_rand);
    add("NOW", true, fn_now);
    add("TODAY", true, fn_today);
    m
});

pub fn call(name: &str, args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    match REGISTRY.get(name) {
        Some(builtin) => (builtin.func)(args, ctx),
        None => CellValue::error(CellErrorKind::Name),
    }
}

fn value_err() -> CellValue {
    CellValue::error(CellErrorKind::Value)
}

/// An argument is either a resolved range or a scalar value.
enum Arg {
    Range(cellgraph_common::CellRange),
    Scalar(CellValue),
}

fn classify_arg(node: &AstNode, ctx: &mut EvalContext) -> Arg {
    if let AstNodeType::Reference(r @ ReferenceType::Range { .. }) = &node.node_type {
        match r.resolve_range(ctx.base) {
            Some(range) => Arg::Range(range),
            None => Arg::Scalar(CellValue::error(CellErrorKind::Ref)),
        }
    } else {
        Arg::Scalar(evaluate_ast(node, ctx))
    }
}

fn fn_sum(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    let mut total = 0.0f64;
    for node in args {
        match classify_arg(node, ctx) {
            Arg::Range(range) => match ctx.deps.range_aggregate(range, AggKind::Sum) {
                CellValue::Number(n) => total += n,
                err @ CellValue::Error(_) => return err,
                _ => {}
            },
            Arg::Scalar(v) => match coerce_number(&v) {
                Ok(n) => total += n,
                Err(e) => return e,
            },
        }
    }
    CellValue::Number(total)
}

fn fn_count(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    let mut count = 0.0f64;
    for node in args {
        match classify_arg(node, ctx) {
            Arg::Range(range) => match ctx.deps.range_aggregate(range, AggKind::Count) {
                CellValue::Number(n) => count += n,
                err @ CellValue::Error(_) => return err,
                _ => {}
            },
            Arg::Scalar(CellValue::Number(_)) | Arg::Scalar(CellValue::Boolean(_)) => {
                count += 1.0
            }
            Arg::Scalar(CellValue::Error(e)) => return CellValue::Error(e),
            Arg::Scalar(_) => {}
        }
    }
    CellValue::Number(count)
}

fn extremum(args: &[AstNode], ctx: &mut EvalContext, kind: AggKind) -> CellValue {
    let mut acc: Option<f64> = None;
    let mut fold = |n: f64, acc: &mut Option<f64>| {
        *acc = Some(match (*acc, kind) {
            (None, _) => n,
            (Some(m), AggKind::Min) => m.min(n),
            (Some(m), _) => m.max(n),
        });
    };
    for node in args {
        match classify_arg(node, ctx) {
            Arg::Range(range) => match ctx.deps.range_aggregate(range, kind) {
                CellValue::Number(n) => fold(n, &mut acc),
                CellValue::Empty => {}
                err @ CellValue::Error(_) => return err,
                _ => {}
            },
            Arg::Scalar(v) => match coerce_number(&v) {
                Ok(n) => fold(n, &mut acc),
                Err(e) => return e,
            },
        }
    }
    CellValue::Number(acc.unwrap_or(0.0))
}

fn fn_min(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    extremum(args, ctx, AggKind::Min)
}

fn fn_max(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    extremum(args, ctx, AggKind::Max)
}

fn fn_average(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    let mut total = 0.0f64;
    let mut count = 0.0f64;
    for node in args {
        match classify_arg(node, ctx) {
            Arg::Range(range) => {
                match ctx.deps.range_aggregate(range, AggKind::Sum) {
                    CellValue::Number(n) => total += n,
                    err @ CellValue::Error(_) => return err,
                    _ => {}
                }
                match ctx.deps.range_aggregate(range, AggKind::Count) {
                    CellValue::Number(n) => count += n,
                    err @ CellValue::Error(_) => return err,
                    _ => {}
                }
            }
            Arg::Scalar(v) => match coerce_number(&v) {
                Ok(n) => {
                    total += n;
                    count += 1.0;
                }
                Err(e) => return e,
            },
        }
    }
    if count == 0.0 {
        return CellValue::error(CellErrorKind::Div);
    }
    CellValue::Number(total / count)
}

// ---- criteria ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed `">5"` / `"<>x"` / plain-value criterion.
pub struct Criterion {
    op: CmpOp,
    value: CellValue,
}

impl Criterion {
    fn from_value(v: &CellValue) -> Self {
        if let CellValue::Text(s) = v {
            let (op, rest) = if let Some(r) = s.strip_prefix(">=") {
                (CmpOp::Ge, r)
            } else if let Some(r) = s.strip_prefix("<=") {
                (CmpOp::Le, r)
            } else if let Some(r) = s.strip_prefix("<>") {
                (CmpOp::Ne, r)
            } else if let Some(r) = s.strip_prefix('>') {
                (CmpOp::Gt, r)
            } else if let Some(r) = s.strip_prefix('<') {
                (CmpOp::Lt, r)
            } else if let Some(r) = s.strip_prefix('=') {
                (CmpOp::Eq, r)
            } else {
                (CmpOp::Eq, s.as_str())
            };
            let value = match rest.parse::<f64>() {
                Ok(n) => CellValue::Number(n),
                Err(_) => CellValue::Text(rest.to_string()),
            };
            return Self { op, value };
        }
        Self {
            op: CmpOp::Eq,
            value: v.clone(),
        }
    }

    /// Canonical text used as the criterion-cache key.
    fn cache_key(&self) -> String {
        let op = match self.op {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        format!("{op}{}", self.value)
    }

    fn matches(&self, v: &CellValue) -> bool {
        match self.op {
            CmpOp::Eq => loose_eq(v, &self.value),
            CmpOp::Ne => !loose_eq(v, &self.value),
            _ => {
                let (CellValue::Number(a), CellValue::Number(b)) = (v, &self.value) else {
                    return false;
                };
                match self.op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                }
            }
        }
    }
}

fn loose_eq(a: &CellValue, b: &CellValue) -> bool {
    match (a, b) {
        (CellValue::Number(x), CellValue::Number(y)) => x == y,
        (CellValue::Text(x), CellValue::Text(y)) => x.eq_ignore_ascii_case(y),
        (CellValue::Boolean(x), CellValue::Boolean(y)) => x == y,
        _ => false,
    }
}

fn fn_sumif(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    criteria_fn("SUMIF", args, ctx)
}

fn fn_countif(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    criteria_fn("COUNTIF", args, ctx)
}

fn criteria_fn(name: &'static str, args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    let want_sum = name == "SUMIF";
    let expected = if want_sum { 2..=3 } else { 2..=2 };
    if !expected.contains(&args.len()) {
        return value_err();
    }
    let Arg::Range(range) = classify_arg(&args[0], ctx) else {
        return value_err();
    };
    let criterion_value = evaluate_ast(&args[1], ctx);
    if criterion_value.is_error() {
        return criterion_value;
    }
    let criterion = Criterion::from_value(&criterion_value);

    // Only the plain two-argument form is cacheable on the range vertex.
    let cacheable = args.len() == 2;
    let key = criterion.cache_key();
    if cacheable {
        if let Some(hit) = ctx.deps.criterion_cache_get(range, name, &key) {
            return hit;
        }
    }

    let sum_range = if args.len() == 3 {
        match classify_arg(&args[2], ctx) {
            Arg::Range(r) if r.width() == range.width() && r.height() == range.height() => Some(r),
            _ => return value_err(),
        }
    } else {
        None
    };

    let mut acc = 0.0f64;
    for (i, addr) in range.cells().enumerate() {
        let v = ctx.deps.get_cell_value(addr);
        if let CellValue::Error(e) = v {
            return CellValue::Error(e);
        }
        if !criterion.matches(&v) {
            continue;
        }
        if want_sum {
            let picked = match &sum_range {
                Some(sr) => {
                    let row = i as u32 / range.width();
                    let col = i as u32 % range.width();
                    ctx.deps.get_cell_value(cellgraph_common::CellAddress::new(
                        sr.sheet,
                        sr.start.row + row,
                        sr.start.col + col,
                    ))
                }
                None => v,
            };
            match picked {
                CellValue::Number(n) => acc += n,
                CellValue::Error(e) => return CellValue::Error(e),
                _ => {}
            }
        } else {
            acc += 1.0;
        }
    }
    let result = CellValue::Number(acc);
    if cacheable {
        ctx.deps
            .criterion_cache_put(range, name, &key, result.clone());
    }
    result
}

// ---- logic ---------------------------------------------------------------

fn fn_if(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    if !(2..=3).contains(&args.len()) {
        return value_err();
    }
    let cond = evaluate_ast(&args[0], ctx);
    let cond = match coerce_bool(&cond) {
        Ok(b) => b,
        Err(e) => return e,
    };
    if cond {
        evaluate_ast(&args[1], ctx)
    } else if args.len() == 3 {
        evaluate_ast(&args[2], ctx)
    } else {
        CellValue::Boolean(false)
    }
}

fn logical_fold(args: &[AstNode], ctx: &mut EvalContext, all: bool) -> CellValue {
    if args.is_empty() {
        return value_err();
    }
    let mut acc = all;
    for node in args {
        match classify_arg(node, ctx) {
            Arg::Range(range) => {
                for addr in range.cells() {
                    let v = ctx.deps.get_cell_value(addr);
                    if v == CellValue::Empty {
                        continue;
                    }
                    match coerce_bool(&v) {
                        Ok(b) => acc = if all { acc && b } else { acc || b },
                        Err(e) => return e,
                    }
                }
            }
            Arg::Scalar(v) => match coerce_bool(&v) {
                Ok(b) => acc = if all { acc && b } else { acc || b },
                Err(e) => return e,
            },
        }
    }
    CellValue::Boolean(acc)
}

fn fn_and(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    logical_fold(args, ctx, true)
}

fn fn_or(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    logical_fold(args, ctx, false)
}

fn fn_not(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    if args.len() != 1 {
        return value_err();
    }
    let v = evaluate_ast(&args[0], ctx);
    match coerce_bool(&v) {
        Ok(b) => CellValue::Boolean(!b),
        Err(e) => e,
    }
}

// ---- misc ----------------------------------------------------------------

fn fn_transpose(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    if args.len() != 1 {
        return value_err();
    }
    match evaluate_array(&args[0], ctx) {
        Ok(block) => {
            let t = super::interp::transpose(block);
            if t.len() == 1 && t[0].len() == 1 {
                t[0][0].clone()
            } else {
                CellValue::Array(t)
            }
        }
        Err(e) => e,
    }
}

fn fn_rand(args: &[AstNode], ctx: &mut EvalContext) -> CellValue {
    if !args.is_empty() {
        return value_err();
    }
    CellValue::Number(ctx.rng.gen_range(0.0..1.0))
}

fn fn_now(args: &[AstNode], _ctx: &mut EvalContext) -> CellValue {
    if !args.is_empty() {
        return value_err();
    }
    CellValue::Number(datetime_to_serial(&chrono::Utc::now().naive_utc()))
}

fn fn_today(args: &[AstNode], _ctx: &mut EvalContext) -> CellValue {
    if !args.is_empty() {
        return value_err();
    }
    CellValue::Number(date_to_serial(&chrono::Utc::now().date_naive()))
}
