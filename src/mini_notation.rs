//! Mini-notation tokenizer and parser
//!
//! The pattern language is a small expression grammar compiled to ordered
//! value sequences. Precedence from loosest to tightest binding:
//!
//! - `|`   random choice between operands
//! - `+ -` addition and subtraction
//! - `* /` multiplication and division
//! - `:`   random range draw
//! - `!`   repetition
//! - unary `+`/`-`, then atoms
//!
//! Atoms are number literals, the random token `r`, note names (`c#4`,
//! `eb3`), bare names (`bd`), column vectors `[a,b,c]`, integer ramps
//! `0_7`, and parenthesized sub-expressions. Whitespace separates the
//! elements of the top-level sequence.

use crate::error::ParseError;

/// Token types in mini-notation.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Name(String),
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Colon,        // :
    Exclamation,  // !
    Pipe,         // |
    Underscore,   // _
    Comma,        // ,
    OpenBracket,  // [
    CloseBracket, // ]
    OpenParen,    // (
    CloseParen,   // )
}

impl Token {
    /// Source-ish rendering used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Name(s) => s.clone(),
            Token::Plus => "+".to_string(),
            Token::Minus => "-".to_string(),
            Token::Star => "*".to_string(),
            Token::Slash => "/".to_string(),
            Token::Colon => ":".to_string(),
            Token::Exclamation => "!".to_string(),
            Token::Pipe => "|".to_string(),
            Token::Underscore => "_".to_string(),
            Token::Comma => ",".to_string(),
            Token::OpenBracket => "[".to_string(),
            Token::CloseBracket => "]".to_string(),
            Token::OpenParen => "(".to_string(),
            Token::CloseParen => ")".to_string(),
        }
    }
}

/// A note-name literal before resolution: letter, accidental shift, octave.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteLiteral {
    pub letter: char,
    pub accidental: i32,
    pub octave: Option<i32>,
}

/// AST node types.
#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    Number(f64),
    Note(NoteLiteral),
    Name(String),
    /// The `r` token: one uniform draw in [0, 1) per evaluation.
    Random,
    /// `a_b`: inclusive integer range, materialized as a flat vector.
    Ramp(i64, i64),
    /// `[a,b,...]`: a column vector. Stays nested in the output.
    Vector(Vec<AstNode>),
    Neg(Box<AstNode>),
    Binary {
        op: BinOp,
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Range,
    Repeat,
    Choice,
}

/// Tokenizer for mini-notation.
struct Tokenizer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> Result<f64, ParseError> {
        let start = self.position;
        let mut has_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.input[start..self.position];
        text.parse()
            .map_err(|_| ParseError::new(text, "malformed number"))
    }

    fn read_name(&mut self) -> String {
        let start = self.position;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '#' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.position].to_string()
    }

    fn tokenize(&mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let Some(ch) = self.peek() else { break };

            let token = match ch {
                '+' => {
                    self.advance();
                    Token::Plus
                }
                '-' => {
                    self.advance();
                    Token::Minus
                }
                '*' => {
                    self.advance();
                    Token::Star
                }
                '/' => {
                    self.advance();
                    Token::Slash
                }
                ':' => {
                    self.advance();
                    Token::Colon
                }
                '!' => {
                    self.advance();
                    Token::Exclamation
                }
                '|' => {
                    self.advance();
                    Token::Pipe
                }
                '_' => {
                    self.advance();
                    Token::Underscore
                }
                ',' => {
                    self.advance();
                    Token::Comma
                }
                '[' => {
                    self.advance();
                    Token::OpenBracket
                }
                ']' => {
                    self.advance();
                    Token::CloseBracket
                }
                '(' => {
                    self.advance();
                    Token::OpenParen
                }
                ')' => {
                    self.advance();
                    Token::CloseParen
                }
                '0'..='9' | '.' => Token::Number(self.read_number()?),
                _ if ch.is_alphabetic() => Token::Name(self.read_name()),
                _ => {
                    return Err(ParseError::new(
                        ch.to_string(),
                        "unrecognized character in pattern",
                    ));
                }
            };
            tokens.push(token);
        }

        Ok(tokens)
    }
}

/// Try to read a name token as a note literal. `None` means the name is a
/// plain word like a sample name.
fn parse_note_literal(name: &str) -> Option<NoteLiteral> {
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_lowercase();
    if !('a'..='g').contains(&letter) {
        return None;
    }

    let mut accidental = 0i32;
    let mut octave_text = String::new();
    for ch in chars {
        match ch {
            '#' if octave_text.is_empty() => accidental += 1,
            'b' if octave_text.is_empty() => accidental -= 1,
            d if d.is_ascii_digit() => octave_text.push(d),
            _ => return None,
        }
    }

    let octave = if octave_text.is_empty() {
        None
    } else {
        octave_text.parse().ok()
    };

    Some(NoteLiteral {
        letter,
        accidental,
        octave,
    })
}

/// Recursive-descent parser for mini-notation.
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        let tokens = Tokenizer::new(input).tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
        })
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn here(&self) -> String {
        self.current()
            .map(|t| t.describe())
            .unwrap_or_else(|| "end of pattern".to_string())
    }

    /// Parse the whole source as a sequence of expressions. Whitespace
    /// between expressions separates elements of the output sequence.
    pub fn parse_sequence(&mut self) -> Result<Vec<AstNode>, ParseError> {
        let mut elements = Vec::new();
        while self.current().is_some() {
            elements.push(self.parse_expr()?);
        }
        if elements.is_empty() {
            return Err(ParseError::new("", "empty pattern"));
        }
        Ok(elements)
    }

    /// Parse one expression (used for vector elements and parentheses).
    pub fn parse_expr(&mut self) -> Result<AstNode, ParseError> {
        self.parse_choice()
    }

    fn parse_choice(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_additive()?;
        while matches!(self.current(), Some(Token::Pipe)) {
            self.advance();
            let rhs = self.parse_additive()?;
            node = AstNode::Binary {
                op: BinOp::Choice,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_additive(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_multitive()?;
        loop {
            let op = match self.current() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multitive()?;
            node = AstNode::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_multitive(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_range()?;
        loop {
            let op = match self.current() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_range()?;
            node = AstNode::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_range(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_repeat()?;
        while matches!(self.current(), Some(Token::Colon)) {
            self.advance();
            let rhs = self.parse_repeat()?;
            node = AstNode::Binary {
                op: BinOp::Range,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_repeat(&mut self) -> Result<AstNode, ParseError> {
        let mut node = self.parse_unary()?;
        while matches!(self.current(), Some(Token::Exclamation)) {
            self.advance();
            let rhs = self.parse_unary()?;
            node = AstNode::Binary {
                op: BinOp::Repeat,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<AstNode, ParseError> {
        match self.current() {
            Some(Token::Minus) => {
                self.advance();
                let inner = self.parse_unary()?;
                Ok(AstNode::Neg(Box::new(inner)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<AstNode, ParseError> {
        match self.advance() {
            Some(Token::Number(n)) => {
                // A number followed by `_` is a ramp: a_b inclusive.
                if matches!(self.current(), Some(Token::Underscore)) {
                    self.advance();
                    let end = match self.advance() {
                        Some(Token::Number(m)) => m,
                        other => {
                            let text = other
                                .map(|t| format!("{}_{}", n, t.describe()))
                                .unwrap_or_else(|| format!("{}_", n));
                            return Err(ParseError::new(text, "ramp needs a number after '_'"));
                        }
                    };
                    if n.fract() != 0.0 || end.fract() != 0.0 {
                        return Err(ParseError::new(
                            format!("{}_{}", n, end),
                            "ramp bounds must be integers",
                        ));
                    }
                    return Ok(AstNode::Ramp(n as i64, end as i64));
                }
                Ok(AstNode::Number(n))
            }
            Some(Token::Name(name)) => {
                if name == "r" {
                    return Ok(AstNode::Random);
                }
                if let Some(note) = parse_note_literal(&name) {
                    return Ok(AstNode::Note(note));
                }
                Ok(AstNode::Name(name))
            }
            Some(Token::OpenBracket) => self.parse_vector(),
            Some(Token::OpenParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::CloseParen) => Ok(inner),
                    _ => Err(ParseError::new("(", "unclosed parenthesis")),
                }
            }
            Some(other) => Err(ParseError::new(other.describe(), "expected a value here")),
            None => Err(ParseError::new("end of pattern", "expected a value here")),
        }
    }

    fn parse_vector(&mut self) -> Result<AstNode, ParseError> {
        let mut elements = Vec::new();
        loop {
            if matches!(self.current(), Some(Token::CloseBracket)) {
                self.advance();
                break;
            }
            elements.push(self.parse_expr()?);
            match self.current() {
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(Token::CloseBracket) => {
                    self.advance();
                    break;
                }
                _ => {
                    return Err(ParseError::new(self.here(), "expected ',' or ']' in vector"));
                }
            }
        }
        if elements.is_empty() {
            return Err(ParseError::new("[]", "empty vector"));
        }
        Ok(AstNode::Vector(elements))
    }
}

/// Parse a full pattern source into its top-level AST sequence.
pub fn parse_pattern(input: &str) -> Result<Vec<AstNode>, ParseError> {
    Parser::new(input)?.parse_sequence()
}
