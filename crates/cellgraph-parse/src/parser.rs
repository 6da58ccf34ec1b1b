//! Formula parser: token stream -> AST + dependency list.

use std::error::Error;
use std::fmt::{self, Display};

use cellgraph_common::{CellAddress, CellErrorKind, CellValue, Coord, SheetRegistry};
use once_cell::sync::Lazy;
use rustc_hash::FxHashSet;

use crate::reference::{RefCoord, ReferenceType};
use crate::tokenizer::{Token, TokenSubType, TokenType, Tokenizer, TokenizerError};

/// Functions whose value can change between evaluations with no edit.
static VOLATILE_FUNCTIONS: Lazy<FxHashSet<&'static str>> =
    Lazy::new(|| ["RAND", "NOW", "TODAY"].into_iter().collect());

pub fn is_volatile_function(name: &str) -> bool {
    VOLATILE_FUNCTIONS.contains(name.to_ascii_uppercase().as_str())
}

#[derive(Debug)]
pub struct ParserError {
    pub message: String,
    pub position: Option<usize>,
}

impl ParserError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
        }
    }
}

impl Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(pos) = self.position {
            write!(f, "ParserError at position {}: {}", pos, self.message)
        } else {
            write!(f, "ParserError: {}", self.message)
        }
    }
}

impl Error for ParserError {}

impl From<TokenizerError> for ParserError {
    fn from(e: TokenizerError) -> Self {
        Self {
            message: e.message,
            position: Some(e.pos),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AstNodeType {
    Literal(CellValue),
    Reference(ReferenceType),
    UnaryOp {
        op: String,
        expr: Box<AstNode>,
    },
    BinaryOp {
        op: String,
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    Function {
        name: String,
        args: Vec<AstNode>,
    },
    /// Inline array literal, row-major and rectangular.
    Array(Vec<Vec<AstNode>>),
    /// A reference that stopped existing after a structural edit.
    RefError,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AstNode {
    pub node_type: AstNodeType,
    /// True when the subtree contains a volatile function call.
    pub volatile: bool,
}

impl AstNode {
    /// Build a node, deriving the volatile flag from its children.
    pub fn new(node_type: AstNodeType) -> Self {
        let volatile = match &node_type {
            AstNodeType::Literal(_) | AstNodeType::Reference(_) | AstNodeType::RefError => false,
            AstNodeType::UnaryOp { expr, .. } => expr.volatile,
            AstNodeType::BinaryOp { left, right, .. } => left.volatile || right.volatile,
            AstNodeType::Function { name, args } => {
                is_volatile_function(name) || args.iter().any(|a| a.volatile)
            }
            AstNodeType::Array(rows) => rows.iter().flatten().any(|a| a.volatile),
        };
        Self {
            node_type,
            volatile,
        }
    }
}

/// Result of parsing one formula against its own address.
#[derive(Debug, Clone)]
pub struct ParsedFormula {
    pub ast: AstNode,
    /// Every reference node in the AST, in source order.
    pub dependencies: Vec<ReferenceType>,
}

/// Binding power of an infix operator; `None` for unknown operators.
pub(crate) fn infix_bp(op: &str) -> Option<u8> {
    match op {
        "=" | "<>" | "<" | ">" | "<=" | ">=" => Some(1),
        "&" => Some(2),
        "+" | "-" => Some(3),
        "*" | "/" => Some(4),
        "^" => Some(5),
        _ => None,
    }
}

pub(crate) const PREFIX_BP: u8 = 6;
pub(crate) const POSTFIX_BP: u8 = 7;

/// Parse one formula (with or without its leading `=`) against the address
/// of the cell that holds it. Sheet names are resolved through `sheets`;
/// an unknown sheet is a hard parse error.
pub fn parse(
    text: &str,
    base: CellAddress,
    sheets: &SheetRegistry,
) -> Result<ParsedFormula, ParserError> {
    let tokens = Tokenizer::new(text)?.into_tokens();
    let mut parser = Parser {
        tokens,
        pos: 0,
        base,
        sheets,
    };
    let ast = parser.parse_expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(ParserError::new("unexpected trailing tokens"));
    }
    let mut dependencies = Vec::new();
    collect_references(&ast, &mut dependencies);
    Ok(ParsedFormula { ast, dependencies })
}

/// Every reference node in an AST, in source order. Used at parse time and
/// again whenever a transformed AST needs its dependencies re-extracted.
pub fn collect_dependencies(ast: &AstNode) -> Vec<ReferenceType> {
    let mut out = Vec::new();
    collect_references(ast, &mut out);
    out
}

fn collect_references(node: &AstNode, out: &mut Vec<ReferenceType>) {
    match &node.node_type {
        AstNodeType::Reference(r) => out.push(*r),
        AstNodeType::UnaryOp { expr, .. } => collect_references(expr, out),
        AstNodeType::BinaryOp { left, right, .. } => {
            collect_references(left, out);
            collect_references(right, out);
        }
        AstNodeType::Function { args, .. } => {
            for arg in args {
                collect_references(arg, out);
            }
        }
        AstNodeType::Array(rows) => {
            for item in rows.iter().flatten() {
                collect_references(item, out);
            }
        }
        AstNodeType::Literal(_) | AstNodeType::RefError => {}
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    base: CellAddress,
    sheets: &'a SheetRegistry,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<AstNode, ParserError> {
        let mut left = self.parse_primary()?;
        loop {
            let Some(t) = self.peek() else { break };
            match t.token_type {
                TokenType::OpPostfix if POSTFIX_BP >= min_bp => {
                    self.pos += 1;
                    left = AstNode::new(AstNodeType::UnaryOp {
                        op: "%".to_string(),
                        expr: Box::new(left),
                    });
                }
                TokenType::OpInfix => {
                    let op = t.value.clone();
                    let bp = infix_bp(&op)
                        .ok_or_else(|| ParserError::new(format!("unknown operator '{op}'")))?;
                    if bp < min_bp {
                        break;
                    }
                    self.pos += 1;
                    let right = self.parse_expr(bp + 1)?;
                    left = AstNode::new(AstNodeType::BinaryOp {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    });
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<AstNode, ParserError> {
        let token = self
            .next()
            .ok_or_else(|| ParserError::new("unexpected end of formula"))?;
        match (token.token_type, token.subtype) {
            (TokenType::OpPrefix, _) => {
                let expr = self.parse_expr(PREFIX_BP)?;
                Ok(AstNode::new(AstNodeType::UnaryOp {
                    op: token.value,
                    expr: Box::new(expr),
                }))
            }
            (TokenType::Operand, TokenSubType::Number) => {
                let n: f64 = token
                    .value
                    .parse()
                    .map_err(|_| ParserError::new(format!("bad number '{}'", token.value)))?;
                Ok(AstNode::new(AstNodeType::Literal(CellValue::Number(n))))
            }
            (TokenType::Operand, TokenSubType::Text) => Ok(AstNode::new(AstNodeType::Literal(
                CellValue::Text(token.value),
            ))),
            (TokenType::Operand, TokenSubType::Logical) => Ok(AstNode::new(
                AstNodeType::Literal(CellValue::Boolean(token.value == "TRUE")),
            )),
            (TokenType::Operand, TokenSubType::Error) => {
                let kind = CellErrorKind::parse(&token.value)
                    .ok_or_else(|| ParserError::new(format!("bad error '{}'", token.value)))?;
                if kind == CellErrorKind::Ref {
                    Ok(AstNode::new(AstNodeType::RefError))
                } else {
                    Ok(AstNode::new(AstNodeType::Literal(CellValue::error(kind))))
                }
            }
            (TokenType::Operand, TokenSubType::Range) => {
                match self.try_parse_reference(&token.value)? {
                    Some(reference) => Ok(AstNode::new(AstNodeType::Reference(reference))),
                    // Bare identifiers evaluate to #NAME? like any unknown name.
                    None => Ok(AstNode::new(AstNodeType::Literal(CellValue::error(
                        CellErrorKind::Name,
                    )))),
                }
            }
            (TokenType::Paren, TokenSubType::Open) => {
                let expr = self.parse_expr(0)?;
                match self.next() {
                    Some(t)
                        if t.token_type == TokenType::Paren
                            && t.subtype == TokenSubType::Close =>
                    {
                        Ok(expr)
                    }
                    _ => Err(ParserError::new("expected ')'")),
                }
            }
            (TokenType::Func, TokenSubType::Open) => {
                let name = token.value.to_ascii_uppercase();
                let mut args = Vec::new();
                if matches!(
                    self.peek(),
                    Some(t) if t.token_type == TokenType::Func && t.subtype == TokenSubType::Close
                ) {
                    self.pos += 1;
                } else {
                    loop {
                        args.push(self.parse_expr(0)?);
                        match self.next() {
                            Some(t)
                                if t.token_type == TokenType::Sep
                                    && t.subtype == TokenSubType::Arg => {}
                            Some(t)
                                if t.token_type == TokenType::Func
                                    && t.subtype == TokenSubType::Close =>
                            {
                                break;
                            }
                            _ => return Err(ParserError::new("expected ',' or ')'")),
                        }
                    }
                }
                Ok(AstNode::new(AstNodeType::Function { name, args }))
            }
            (TokenType::Brace, TokenSubType::Open) => self.parse_array(),
            _ => Err(ParserError::new(format!(
                "unexpected token '{}'",
                token.value
            ))),
        }
    }

    fn parse_array(&mut self) -> Result<AstNode, ParserError> {
        let mut rows: Vec<Vec<AstNode>> = Vec::new();
        let mut row: Vec<AstNode> = Vec::new();
        loop {
            row.push(self.parse_expr(0)?);
            match self.next() {
                Some(t) if t.token_type == TokenType::Sep && t.subtype == TokenSubType::Arg => {}
                Some(t) if t.token_type == TokenType::Sep && t.subtype == TokenSubType::Row => {
                    rows.push(std::mem::take(&mut row));
                }
                Some(t) if t.token_type == TokenType::Brace && t.subtype == TokenSubType::Close => {
                    rows.push(row);
                    break;
                }
                _ => return Err(ParserError::new("expected ',', ';' or '}'")),
            }
        }
        let width = rows[0].len();
        if rows.iter().any(|r| r.len() != width) {
            return Err(ParserError::new("array rows must have equal width"));
        }
        Ok(AstNode::new(AstNodeType::Array(rows)))
    }

    /// `Ok(None)` when the text is not reference-shaped (it becomes `#NAME?`);
    /// `Err` when it is reference-shaped but names an unknown sheet.
    fn try_parse_reference(&self, text: &str) -> Result<Option<ReferenceType>, ParserError> {
        let (sheet, rest) = self.split_sheet_prefix(text)?;
        if let Some((a, b)) = rest.split_once(':') {
            let (Some(start), Some(end)) = (parse_cell_part(a), parse_cell_part(b)) else {
                if sheet.is_some() {
                    return Err(ParserError::new(format!("invalid reference '{text}'")));
                }
                return Ok(None);
            };
            return Ok(Some(self.encode_range(sheet, start, end)));
        }
        let Some(part) = parse_cell_part(rest) else {
            if sheet.is_some() {
                return Err(ParserError::new(format!("invalid reference '{text}'")));
            }
            return Ok(None);
        };
        let coord = RefCoord::from_resolved(
            Coord::new(part.row, part.col),
            self.base.coord,
            part.row_abs,
            part.col_abs,
        );
        Ok(Some(ReferenceType::Cell { sheet, coord }))
    }

    /// Normalize range corners so start <= end componentwise; anchors travel
    /// with the coordinate they annotate.
    fn encode_range(
        &self,
        sheet: Option<cellgraph_common::SheetId>,
        a: CellPart,
        b: CellPart,
    ) -> ReferenceType {
        let (top, bottom) = if a.row <= b.row { (&a, &b) } else { (&b, &a) };
        let (left, right) = if a.col <= b.col { (&a, &b) } else { (&b, &a) };
        let start = RefCoord::from_resolved(
            Coord::new(top.row, left.col),
            self.base.coord,
            top.row_abs,
            left.col_abs,
        );
        let end = RefCoord::from_resolved(
            Coord::new(bottom.row, right.col),
            self.base.coord,
            bottom.row_abs,
            right.col_abs,
        );
        ReferenceType::Range { sheet, start, end }
    }

    fn split_sheet_prefix<'t>(
        &self,
        text: &'t str,
    ) -> Result<(Option<cellgraph_common::SheetId>, &'t str), ParserError> {
        if let Some(rest) = text.strip_prefix('\'') {
            let Some(close) = find_closing_quote(rest) else {
                return Err(ParserError::new(format!("invalid reference '{text}'")));
            };
            let name = rest[..close].replace("''", "'");
            let after = &rest[close + 1..];
            let Some(after) = after.strip_prefix('!') else {
                return Err(ParserError::new(format!("invalid reference '{text}'")));
            };
            let id = self
                .sheets
                .get_id(&name)
                .ok_or_else(|| ParserError::new(format!("unknown sheet '{name}'")))?;
            return Ok((Some(id), after));
        }
        if let Some(idx) = text.find('!') {
            let name = &text[..idx];
            let id = self
                .sheets
                .get_id(name)
                .ok_or_else(|| ParserError::new(format!("unknown sheet '{name}'")))?;
            return Ok((Some(id), &text[idx + 1..]));
        }
        Ok((None, text))
    }
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

struct CellPart {
    row: u32,
    col: u32,
    row_abs: bool,
    col_abs: bool,
}

/// Parse one `$A$1`-style cell, 0-based output. `None` when the text is not
/// cell-shaped.
fn parse_cell_part(s: &str) -> Option<CellPart> {
    let bytes = s.as_bytes();
    let mut i = 0;

    let col_abs = bytes.first() == Some(&b'$');
    if col_abs {
        i += 1;
    }
    let col_start = i;
    while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
        i += 1;
    }
    if i == col_start || i - col_start > 3 {
        return None;
    }
    let col = Coord::letters_to_col(&s[col_start..i].to_ascii_uppercase())?;

    let row_abs = bytes.get(i) == Some(&b'$');
    if row_abs {
        i += 1;
    }
    let row_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == row_start || i != bytes.len() {
        return None;
    }
    let row_1based: u32 = s[row_start..].parse().ok()?;
    if row_1based == 0 {
        return None;
    }

    Some(CellPart {
        row: row_1based - 1,
        col,
        row_abs,
        col_abs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheets() -> SheetRegistry {
        let mut reg = SheetRegistry::new();
        reg.id_for("Sheet1");
        reg.id_for("Data");
        reg
    }

    fn base() -> CellAddress {
        CellAddress::new(0, 4, 2) // C5 on Sheet1
    }

    fn parse_one(text: &str) -> ParsedFormula {
        parse(text, base(), &sheets()).unwrap()
    }

    #[test]
    fn relative_reference_is_offset_encoded() {
        let parsed = parse_one("=A1");
        let ReferenceType::Cell { sheet, coord } = parsed.dependencies[0] else {
            panic!("expected cell dependency");
        };
        assert_eq!(sheet, None);
        assert_eq!(coord.row_value(), -4);
        assert_eq!(coord.col_value(), -2);
    }

    #[test]
    fn absolute_reference_keeps_indices() {
        let parsed = parse_one("=$B$2");
        let ReferenceType::Cell { coord, .. } = parsed.dependencies[0] else {
            panic!("expected cell dependency");
        };
        assert!(coord.row_abs() && coord.col_abs());
        assert_eq!(coord.row_value(), 1);
        assert_eq!(coord.col_value(), 1);
    }

    #[test]
    fn cross_sheet_range() {
        let parsed = parse_one("=SUM(Data!A1:B3)");
        assert_eq!(parsed.dependencies.len(), 1);
        let ReferenceType::Range { sheet, .. } = parsed.dependencies[0] else {
            panic!("expected range dependency");
        };
        assert_eq!(sheet, Some(1));
    }

    #[test]
    fn unknown_sheet_is_a_parse_error() {
        assert!(parse("=Nope!A1", base(), &sheets()).is_err());
    }

    #[test]
    fn bare_name_degrades_to_name_error() {
        let parsed = parse_one("=frobnicate");
        assert_eq!(
            parsed.ast.node_type,
            AstNodeType::Literal(CellValue::error(CellErrorKind::Name))
        );
    }

    #[test]
    fn precedence_unary_minus_binds_tighter_than_power() {
        let parsed = parse_one("=-2^2");
        let AstNodeType::BinaryOp { op, left, .. } = &parsed.ast.node_type else {
            panic!("expected binary op at root");
        };
        assert_eq!(op, "^");
        assert!(matches!(left.node_type, AstNodeType::UnaryOp { .. }));
    }

    #[test]
    fn precedence_concat_below_arithmetic() {
        let parsed = parse_one(r#"="v"&1+2"#);
        let AstNodeType::BinaryOp { op, .. } = &parsed.ast.node_type else {
            panic!("expected binary op at root");
        };
        assert_eq!(op, "&");
    }

    #[test]
    fn volatile_flag_propagates() {
        assert!(parse_one("=RAND()+1").ast.volatile);
        assert!(!parse_one("=SUM(A1:A3)").ast.volatile);
    }

    #[test]
    fn denormalized_range_corners_are_reordered() {
        let parsed = parse_one("=SUM(B2:A1)");
        let r = parsed.dependencies[0];
        let range = r.resolve_range(base()).unwrap();
        assert_eq!(range.start, Coord::new(0, 0));
        assert_eq!(range.end, Coord::new(1, 1));
    }

    #[test]
    fn ref_error_literal_parses() {
        let parsed = parse_one("=#REF!+1");
        let AstNodeType::BinaryOp { left, .. } = &parsed.ast.node_type else {
            panic!("expected binary op");
        };
        assert_eq!(left.node_type, AstNodeType::RefError);
    }

    #[test]
    fn array_literal_must_be_rectangular() {
        assert!(parse("={1,2;3}", base(), &sheets()).is_err());
        let parsed = parse_one("={1,2;3,4}");
        assert!(matches!(parsed.ast.node_type, AstNodeType::Array(_)));
    }
}
