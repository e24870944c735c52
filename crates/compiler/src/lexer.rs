//! Tokenizer for Ember source text
//!
//! Produces tokens with 0-indexed line/column positions. Lexing never
//! aborts: malformed input yields diagnostics and the lexer resynchronizes
//! at the next character so the parser can still run.

use crate::diagnostics::{codes, Diagnostic, SourceLocation};
use alloy_primitives::U256;

/// What a token is. Identifiers and literals carry their payload; keywords
/// are recognized here so the parser matches on variants, not strings.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(U256),
    Str(String),
    /// `hex"00ff"` byte-string literal.
    HexBytes(Vec<u8>),

    // Keywords
    Name,
    Struct,
    Storage,
    Create,
    Code,
    Let,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Return,
    True,
    False,
    Mapping,

    // Punctuation and operators
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Semi,
    Colon,
    Comma,
    Dot,
    Arrow, // ->
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Amp,
    Pipe,
    Caret,
    Bang,
    Tilde,
    Shl,
    Shr,
}

/// A token with its source position.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
    /// Lexeme length in characters, for caret rendering.
    pub length: usize,
}

impl Token {
    pub fn location(&self) -> SourceLocation {
        SourceLocation::with_length(self.line, self.column, self.length)
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    Some(match word {
        "name" => TokenKind::Name,
        "struct" => TokenKind::Struct,
        "storage" => TokenKind::Storage,
        "create" => TokenKind::Create,
        "code" => TokenKind::Code,
        "let" => TokenKind::Let,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "mapping" => TokenKind::Mapping,
        _ => return None,
    })
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 0,
            column: 0,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }
}

/// Tokenize `source`. Diagnostics are accumulated, never fatal.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lx = Lexer::new(source);
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();

    while let Some(c) = lx.peek() {
        let line = lx.line;
        let column = lx.column;

        // Whitespace
        if c.is_whitespace() {
            lx.bump();
            continue;
        }

        // Line comments
        if c == '/' {
            lx.bump();
            if lx.eat('/') {
                while let Some(c) = lx.peek() {
                    if c == '\n' {
                        break;
                    }
                    lx.bump();
                }
                continue;
            }
            tokens.push(Token {
                kind: TokenKind::Slash,
                line,
                column,
                length: 1,
            });
            continue;
        }

        // Identifiers, keywords, hex-bytes prefix
        if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(c) = lx.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    word.push(c);
                    lx.bump();
                } else {
                    break;
                }
            }
            // hex"..." byte-string literal
            if word == "hex" && lx.peek() == Some('"') {
                lx.bump();
                let mut digits = String::new();
                let mut closed = false;
                while let Some(c) = lx.peek() {
                    lx.bump();
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    digits.push(c);
                }
                if !closed {
                    diagnostics.push(
                        Diagnostic::error(codes::UNCLOSED_STRING, "unclosed hex literal")
                            .at(SourceLocation::new(line, column)),
                    );
                    continue;
                }
                match hex::decode(&digits) {
                    Ok(bytes) => tokens.push(Token {
                        kind: TokenKind::HexBytes(bytes),
                        line,
                        column,
                        length: digits.len() + 5,
                    }),
                    Err(_) => diagnostics.push(
                        Diagnostic::error(
                            codes::BAD_LITERAL,
                            format!("invalid hex literal hex\"{}\"", digits),
                        )
                        .at(SourceLocation::new(line, column)),
                    ),
                }
                continue;
            }
            let length = word.len();
            let kind = keyword(&word).unwrap_or(TokenKind::Ident(word));
            tokens.push(Token {
                kind,
                line,
                column,
                length,
            });
            continue;
        }

        // Numbers: decimal or 0x hex, up to 256 bits
        if c.is_ascii_digit() {
            let mut text = String::new();
            text.push(c);
            lx.bump();
            let hex_literal = c == '0' && matches!(lx.peek(), Some('x') | Some('X'));
            if hex_literal {
                text.push(lx.bump().unwrap());
            }
            while let Some(c) = lx.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    text.push(c);
                    lx.bump();
                } else {
                    break;
                }
            }
            let cleaned: String = text.chars().filter(|c| *c != '_').collect();
            let parsed = if hex_literal {
                U256::from_str_radix(cleaned.trim_start_matches("0x").trim_start_matches("0X"), 16)
            } else {
                U256::from_str_radix(&cleaned, 10)
            };
            match parsed {
                Ok(value) => tokens.push(Token {
                    kind: TokenKind::Number(value),
                    line,
                    column,
                    length: text.len(),
                }),
                Err(_) => diagnostics.push(
                    Diagnostic::error(
                        codes::BAD_LITERAL,
                        format!("invalid numeric literal `{}`", text),
                    )
                    .at(SourceLocation::with_length(line, column, text.len())),
                ),
            }
            continue;
        }

        // String literals with the usual escapes
        if c == '"' {
            lx.bump();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = lx.peek() {
                lx.bump();
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match lx.bump() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some('0') => value.push('\0'),
                        Some(other) => value.push(other),
                        None => break,
                    },
                    other => value.push(other),
                }
            }
            if !closed {
                diagnostics.push(
                    Diagnostic::error(
                        codes::UNCLOSED_STRING,
                        "unclosed string literal - missing closing quote",
                    )
                    .at(SourceLocation::new(line, column)),
                );
                continue;
            }
            let length = value.len() + 2;
            tokens.push(Token {
                kind: TokenKind::Str(value),
                line,
                column,
                length,
            });
            continue;
        }

        // Operators and punctuation
        lx.bump();
        let kind = match c {
            '{' => Some(TokenKind::LBrace),
            '}' => Some(TokenKind::RBrace),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            ';' => Some(TokenKind::Semi),
            ':' => Some(TokenKind::Colon),
            ',' => Some(TokenKind::Comma),
            '.' => Some(TokenKind::Dot),
            '+' => Some(TokenKind::Plus),
            '*' => Some(TokenKind::Star),
            '%' => Some(TokenKind::Percent),
            '^' => Some(TokenKind::Caret),
            '~' => Some(TokenKind::Tilde),
            '-' => Some(if lx.eat('>') {
                TokenKind::Arrow
            } else {
                TokenKind::Minus
            }),
            '=' => Some(if lx.eat('=') {
                TokenKind::EqEq
            } else {
                TokenKind::Assign
            }),
            '!' => Some(if lx.eat('=') {
                TokenKind::NotEq
            } else {
                TokenKind::Bang
            }),
            '<' => Some(if lx.eat('=') {
                TokenKind::Le
            } else if lx.eat('<') {
                TokenKind::Shl
            } else {
                TokenKind::Lt
            }),
            '>' => Some(if lx.eat('=') {
                TokenKind::Ge
            } else if lx.eat('>') {
                TokenKind::Shr
            } else {
                TokenKind::Gt
            }),
            '&' => Some(if lx.eat('&') {
                TokenKind::AndAnd
            } else {
                TokenKind::Amp
            }),
            '|' => Some(if lx.eat('|') {
                TokenKind::OrOr
            } else {
                TokenKind::Pipe
            }),
            other => {
                diagnostics.push(
                    Diagnostic::error(
                        codes::UNEXPECTED_TOKEN,
                        format!("unexpected character `{}`", other),
                    )
                    .at(SourceLocation::new(line, column)),
                );
                None
            }
        };
        if let Some(kind) = kind {
            let length = match kind {
                TokenKind::Arrow
                | TokenKind::EqEq
                | TokenKind::NotEq
                | TokenKind::Le
                | TokenKind::Ge
                | TokenKind::Shl
                | TokenKind::Shr
                | TokenKind::AndAnd
                | TokenKind::OrOr => 2,
                _ => 1,
            };
            tokens.push(Token {
                kind,
                line,
                column,
                length,
            });
        }
    }

    (tokens, diagnostics)
}
