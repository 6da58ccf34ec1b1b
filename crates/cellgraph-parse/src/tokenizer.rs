//! Byte-walking formula tokenizer.

use std::error::Error;
use std::fmt::{self, Display};

use smallvec::SmallVec;

const TOKEN_ENDERS: &str = ",;}) +-*/^&=><%";

const fn build_token_enders() -> [bool; 256] {
    let mut tbl = [false; 256];
    let bytes = TOKEN_ENDERS.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        tbl[bytes[i] as usize] = true;
        i += 1;
    }
    tbl
}
static TOKEN_ENDERS_TABLE: [bool; 256] = build_token_enders();

#[inline(always)]
fn is_token_ender(c: u8) -> bool {
    TOKEN_ENDERS_TABLE[c as usize]
}

static ERROR_CODES: &[&str] = &[
    "#REF!", "#CYCLE!", "#VALUE!", "#DIV/0!", "#NAME?", "#NUM!", "#N/A",
];

#[derive(Debug)]
pub struct TokenizerError {
    pub message: String,
    pub pos: usize,
}

impl Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenizerError at {}: {}", self.pos, self.message)
    }
}

impl Error for TokenizerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Operand,
    Func,
    Paren,
    Brace,
    Sep,
    OpPrefix,
    OpInfix,
    OpPostfix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSubType {
    None,
    Number,
    Text,
    Logical,
    Error,
    Range,
    Open,
    Close,
    Arg,
    Row,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub value: String,
    pub token_type: TokenType,
    pub subtype: TokenSubType,
}

impl Token {
    pub fn new(value: impl Into<String>, token_type: TokenType, subtype: TokenSubType) -> Self {
        Self {
            value: value.into(),
            token_type,
            subtype,
        }
    }
}

/// Tokenizes one formula. A leading `=` is accepted and skipped.
pub struct Tokenizer {
    tokens: Vec<Token>,
}

impl Tokenizer {
    pub fn new(formula: &str) -> Result<Self, TokenizerError> {
        let mut t = Tokenizer { tokens: Vec::new() };
        t.tokenize(formula)?;
        Ok(t)
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    fn err(message: impl Into<String>, pos: usize) -> TokenizerError {
        TokenizerError {
            message: message.into(),
            pos,
        }
    }

    fn tokenize(&mut self, formula: &str) -> Result<(), TokenizerError> {
        let bytes = formula.as_bytes();
        let mut i = 0;
        if bytes.first() == Some(&b'=') {
            i = 1;
        }
        // Open-group stack: tracks whether a `)` closes a function or a paren.
        let mut groups: SmallVec<[TokenType; 8]> = SmallVec::new();

        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    i += 1;
                }
                b'"' => {
                    let (text, next) = self.scan_string(formula, i)?;
                    self.push(Token::new(text, TokenType::Operand, TokenSubType::Text));
                    i = next;
                }
                b'#' => {
                    let rest = &formula[i..];
                    let code = ERROR_CODES
                        .iter()
                        .find(|code| {
                            rest.len() >= code.len()
                                && rest[..code.len()].eq_ignore_ascii_case(code)
                        })
                        .ok_or_else(|| Self::err("unknown error literal", i))?;
                    self.push(Token::new(*code, TokenType::Operand, TokenSubType::Error));
                    i += code.len();
                }
                b'0'..=b'9' => {
                    let (num, next) = self.scan_number(formula, i);
                    self.push(Token::new(num, TokenType::Operand, TokenSubType::Number));
                    i = next;
                }
                b'.' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                    let (num, next) = self.scan_number(formula, i);
                    self.push(Token::new(num, TokenType::Operand, TokenSubType::Number));
                    i = next;
                }
                b'{' => {
                    self.push(Token::new("{", TokenType::Brace, TokenSubType::Open));
                    groups.push(TokenType::Brace);
                    i += 1;
                }
                b'}' => {
                    if groups.pop() != Some(TokenType::Brace) {
                        return Err(Self::err("unmatched '}'", i));
                    }
                    self.push(Token::new("}", TokenType::Brace, TokenSubType::Close));
                    i += 1;
                }
                b'(' => {
                    self.push(Token::new("(", TokenType::Paren, TokenSubType::Open));
                    groups.push(TokenType::Paren);
                    i += 1;
                }
                b')' => {
                    let opener = groups
                        .pop()
                        .ok_or_else(|| Self::err("unmatched ')'", i))?;
                    match opener {
                        TokenType::Paren => {
                            self.push(Token::new(")", TokenType::Paren, TokenSubType::Close))
                        }
                        TokenType::Func => {
                            self.push(Token::new(")", TokenType::Func, TokenSubType::Close))
                        }
                        _ => return Err(Self::err("unmatched ')'", i)),
                    }
                    i += 1;
                }
                b',' => {
                    self.push(Token::new(",", TokenType::Sep, TokenSubType::Arg));
                    i += 1;
                }
                b';' => {
                    self.push(Token::new(";", TokenType::Sep, TokenSubType::Row));
                    i += 1;
                }
                b'<' if i + 1 < bytes.len() && (bytes[i + 1] == b'=' || bytes[i + 1] == b'>') => {
                    self.push(Token::new(
                        &formula[i..i + 2],
                        TokenType::OpInfix,
                        TokenSubType::None,
                    ));
                    i += 2;
                }
                b'>' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                    self.push(Token::new(">=", TokenType::OpInfix, TokenSubType::None));
                    i += 2;
                }
                b'=' | b'<' | b'>' | b'*' | b'/' | b'^' | b'&' => {
                    self.push(Token::new(
                        &formula[i..i + 1],
                        TokenType::OpInfix,
                        TokenSubType::None,
                    ));
                    i += 1;
                }
                b'+' | b'-' => {
                    let token_type = if self.prefix_position() {
                        TokenType::OpPrefix
                    } else {
                        TokenType::OpInfix
                    };
                    self.push(Token::new(
                        &formula[i..i + 1],
                        token_type,
                        TokenSubType::None,
                    ));
                    i += 1;
                }
                b'%' => {
                    if self.prefix_position() {
                        return Err(Self::err("misplaced '%'", i));
                    }
                    self.push(Token::new("%", TokenType::OpPostfix, TokenSubType::None));
                    i += 1;
                }
                b'\'' => {
                    let (raw, next) = self.scan_quoted_reference(formula, i)?;
                    self.push(Token::new(raw, TokenType::Operand, TokenSubType::Range));
                    i = next;
                }
                _ => {
                    let (word, next) = self.scan_word(formula, i)?;
                    // A word directly followed by `(` is a function call.
                    if next < bytes.len() && bytes[next] == b'(' {
                        self.push(Token::new(word, TokenType::Func, TokenSubType::Open));
                        groups.push(TokenType::Func);
                        i = next + 1;
                    } else if word.eq_ignore_ascii_case("TRUE")
                        || word.eq_ignore_ascii_case("FALSE")
                    {
                        self.push(Token::new(
                            word.to_ascii_uppercase(),
                            TokenType::Operand,
                            TokenSubType::Logical,
                        ));
                        i = next;
                    } else {
                        self.push(Token::new(word, TokenType::Operand, TokenSubType::Range));
                        i = next;
                    }
                }
            }
        }

        if !groups.is_empty() {
            return Err(Self::err("unclosed group", formula.len()));
        }
        Ok(())
    }

    /// True when the next `+`/`-` must be a sign, not an infix operator.
    fn prefix_position(&self) -> bool {
        match self.tokens.last() {
            None => true,
            Some(t) => matches!(
                (t.token_type, t.subtype),
                (TokenType::OpInfix, _)
                    | (TokenType::OpPrefix, _)
                    | (TokenType::Sep, _)
                    | (TokenType::Paren, TokenSubType::Open)
                    | (TokenType::Func, TokenSubType::Open)
                    | (TokenType::Brace, TokenSubType::Open)
            ),
        }
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }

    fn scan_string(&self, formula: &str, start: usize) -> Result<(String, usize), TokenizerError> {
        let bytes = formula.as_bytes();
        let mut out = String::new();
        let mut i = start + 1;
        while i < bytes.len() {
            if bytes[i] == b'"' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'"' {
                    out.push('"');
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            } else {
                let ch = formula[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
        Err(Self::err("unterminated string literal", start))
    }

    fn scan_number(&self, formula: &str, start: usize) -> (String, usize) {
        let bytes = formula.as_bytes();
        let mut i = start;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                j += 1;
            }
            if j < bytes.len() && bytes[j].is_ascii_digit() {
                i = j;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        (formula[start..i].to_string(), i)
    }

    /// `'Sheet name'!A1`-style reference with a quoted sheet part. Returns the
    /// raw token text, quotes included.
    fn scan_quoted_reference(
        &self,
        formula: &str,
        start: usize,
    ) -> Result<(String, usize), TokenizerError> {
        let bytes = formula.as_bytes();
        let mut i = start + 1;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                    continue;
                }
                i += 1;
                // Continue through the `!` and the A1 part.
                while i < bytes.len() && !is_token_ender(bytes[i]) && bytes[i] != b'(' {
                    i += 1;
                }
                return Ok((formula[start..i].to_string(), i));
            }
            i += 1;
        }
        Err(Self::err("unterminated quoted sheet name", start))
    }

    fn scan_word(&self, formula: &str, start: usize) -> Result<(String, usize), TokenizerError> {
        let bytes = formula.as_bytes();
        let mut i = start;
        while i < bytes.len() && !is_token_ender(bytes[i]) && bytes[i] != b'(' {
            i += 1;
        }
        if i == start {
            return Err(Self::err(
                format!("unexpected character '{}'", &formula[start..start + 1]),
                start,
            ));
        }
        Ok((formula[start..i].to_string(), i))
    }
}
