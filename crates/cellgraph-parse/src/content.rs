//! Raw cell-content classification.

/// What a raw string typed into a cell turns out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum CellContent {
    Number(f64),
    Text(String),
    Empty,
    /// `=...` — the text keeps its leading `=`.
    Formula(String),
    /// `{=...}` — the text is the inner formula, braces stripped.
    MatrixFormula(String),
}

/// Classify raw input the way a grid would on keystroke commit.
pub fn classify(raw: &str) -> CellContent {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CellContent::Empty;
    }
    if let Some(inner) = trimmed
        .strip_prefix("{=")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        return CellContent::MatrixFormula(format!("={inner}"));
    }
    if trimmed.starts_with('=') {
        return CellContent::Formula(trimmed.to_string());
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return CellContent::Number(n);
        }
    }
    CellContent::Text(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify("  "), CellContent::Empty);
        assert_eq!(classify("42"), CellContent::Number(42.0));
        assert_eq!(classify("-3.5e2"), CellContent::Number(-350.0));
        assert_eq!(
            classify("=SUM(A1:A3)"),
            CellContent::Formula("=SUM(A1:A3)".to_string())
        );
        assert_eq!(
            classify("{=TRANSPOSE(A1:B2)}"),
            CellContent::MatrixFormula("=TRANSPOSE(A1:B2)".to_string())
        );
        assert_eq!(classify("hello"), CellContent::Text("hello".to_string()));
        // NaN/inf spellings stay text
        assert_eq!(classify("NaN"), CellContent::Text("NaN".to_string()));
    }
}
