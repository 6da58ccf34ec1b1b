//! Canonical unparser: AST -> formula text.
//!
//! Rendering resolves every reference against the formula's own address, so
//! the produced text is only meaningful for that address — exactly the
//! contract the engine needs when a caller asks for a cell's formula after
//! structural edits.

use cellgraph_common::{CellAddress, CellValue, Coord, SheetRegistry};

use crate::parser::{AstNode, AstNodeType, infix_bp};
use crate::reference::{RefCoord, ReferenceType};

/// Render an AST back to `=...` text for the cell at `base`.
pub fn unparse(ast: &AstNode, base: CellAddress, sheets: &SheetRegistry) -> String {
    let mut out = String::from("=");
    render(ast, base, sheets, 0, &mut out);
    out
}

fn render(node: &AstNode, base: CellAddress, sheets: &SheetRegistry, parent_bp: u8, out: &mut String) {
    match &node.node_type {
        AstNodeType::Literal(v) => render_literal(v, out),
        AstNodeType::RefError => out.push_str("#REF!"),
        AstNodeType::Reference(r) => render_reference(r, base, sheets, out),
        AstNodeType::UnaryOp { op, expr } => {
            if op == "%" {
                render(expr, base, sheets, u8::MAX, out);
                out.push('%');
            } else {
                out.push_str(op);
                render(expr, base, sheets, u8::MAX, out);
            }
        }
        AstNodeType::BinaryOp { op, left, right } => {
            let bp = infix_bp(op).unwrap_or(0);
            let wrap = bp < parent_bp;
            if wrap {
                out.push('(');
            }
            render(left, base, sheets, bp, out);
            out.push_str(op);
            // Right operand needs parens on equal precedence: a-(b-c).
            render(right, base, sheets, bp + 1, out);
            if wrap {
                out.push(')');
            }
        }
        AstNodeType::Function { name, args } => {
            out.push_str(name);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(arg, base, sheets, 0, out);
            }
            out.push(')');
        }
        AstNodeType::Array(rows) => {
            out.push('{');
            for (i, row) in rows.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                for (j, item) in row.iter().enumerate() {
                    if j > 0 {
                        out.push(',');
                    }
                    render(item, base, sheets, 0, out);
                }
            }
            out.push('}');
        }
    }
}

fn render_literal(v: &CellValue, out: &mut String) {
    match v {
        CellValue::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                out.push_str(&format!("{}", *n as i64));
            } else {
                out.push_str(&format!("{n}"));
            }
        }
        CellValue::Text(s) => {
            out.push('"');
            out.push_str(&s.replace('"', "\"\""));
            out.push('"');
        }
        CellValue::Boolean(b) => out.push_str(if *b { "TRUE" } else { "FALSE" }),
        CellValue::Error(e) => out.push_str(&e.kind.to_string()),
        CellValue::Empty => {}
        CellValue::Array(_) => out.push_str("#VALUE!"),
    }
}

fn render_reference(r: &ReferenceType, base: CellAddress, sheets: &SheetRegistry, out: &mut String) {
    let sheet = match r {
        ReferenceType::Cell { sheet, .. } | ReferenceType::Range { sheet, .. } => *sheet,
    };
    // A reference into a removed sheet is dead as a whole.
    if let Some(id) = sheet {
        if sheets.try_name(id).is_none() {
            out.push_str("#REF!");
            return;
        }
    }
    render_sheet_prefix(sheet, sheets, out);
    match r {
        ReferenceType::Cell { coord, .. } => render_coord(*coord, base, out),
        ReferenceType::Range { start, end, .. } => {
            render_coord(*start, base, out);
            out.push(':');
            render_coord(*end, base, out);
        }
    }
}

fn render_sheet_prefix(
    sheet: Option<cellgraph_common::SheetId>,
    sheets: &SheetRegistry,
    out: &mut String,
) {
    let Some(id) = sheet else { return };
    let name = sheets.name(id);
    let plain = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        out.push_str(name);
    } else {
        out.push('\'');
        out.push_str(&name.replace('\'', "''"));
        out.push('\'');
    }
    out.push('!');
}

fn render_coord(coord: RefCoord, base: CellAddress, out: &mut String) {
    let Some(resolved) = coord.resolve(base.coord) else {
        out.push_str("#REF!");
        return;
    };
    if coord.col_abs() {
        out.push('$');
    }
    out.push_str(&Coord::col_to_letters(resolved.col));
    if coord.row_abs() {
        out.push('$');
    }
    out.push_str(&(resolved.row + 1).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn sheets() -> SheetRegistry {
        let mut reg = SheetRegistry::new();
        reg.id_for("Sheet1");
        reg.id_for("My Data");
        reg
    }

    fn round_trip(text: &str) -> String {
        let base = CellAddress::new(0, 4, 2);
        let reg = sheets();
        let parsed = parse(text, base, &reg).unwrap();
        unparse(&parsed.ast, base, &reg)
    }

    #[test]
    fn canonical_round_trips() {
        for f in [
            "=A1+B2",
            "=SUM(A1:C10)",
            "=$A$1*3",
            "=-2^2",
            "=IF(A1>2,\"yes\",\"no\")",
            "=10%",
            "={1,2;3,4}",
            "=#REF!+1",
        ] {
            assert_eq!(round_trip(f), f);
        }
    }

    #[test]
    fn quoted_sheet_names_survive() {
        assert_eq!(round_trip("='My Data'!A1"), "='My Data'!A1");
    }

    #[test]
    fn parens_preserved_by_precedence() {
        assert_eq!(round_trip("=(A1+A2)*3"), "=(A1+A2)*3");
        assert_eq!(round_trip("=A1-(A2-A3)"), "=A1-(A2-A3)");
        assert_eq!(round_trip("=(A1*A2)+3"), "=A1*A2+3");
    }
}
