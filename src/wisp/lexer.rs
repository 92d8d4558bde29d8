// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/lexer.rs

// Byte-level scanner over the source buffer. Produces the flat token
// stream consumed by the annotator; tokens reference the source text
// rather than owning it, so the buffer must outlive them.

// <>

use super::vec::DenseVec;

/// Token kinds on the lexer / annotator wire
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum TokenKind {
    LParen,
    RParen,
    Integer,
    Float,
    String,
    Identifier,
    Quote,
    Quasiquote,
    Unquote,
    Uninterned,
    Ignored,
    Error,
}

/// One token: kind, byte slice into the source, and the s-expression
/// id filled in by the annotator (zero until then)
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub value: *const u8,
    pub len: usize,
    pub sexpr_id: usize,
}

impl Token {
    fn new(kind: TokenKind, value: *const u8, len: usize) -> Self {
        Token {
            kind,
            value,
            len,
            sexpr_id: 0,
        }
    }

    /// The token's bytes; valid while the source buffer lives
    #[inline(always)]
    pub fn text(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.value, self.len) }
    }
}

const ID_SYMBOLS: &[u8] = b"!@#$%^&*-+=<>/?:._\\~";

#[inline(always)]
fn id_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || ID_SYMBOLS.contains(&c)
}

#[inline(always)]
fn id_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || ID_SYMBOLS.contains(&c)
}

/// Scans the source buffer into a flat token vector
///
/// Unrecognized bytes and unterminated strings become error tokens;
/// the stream itself always comes back.
pub fn lex_tokens(source: &[u8]) -> DenseVec<Token> {
    let mut tokens: DenseVec<Token> = DenseVec::new(64);

    let base = source.as_ptr();
    let end = source.len();
    let mut pos = 0usize;

    while pos < end {
        let c = source[pos];

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c == b'(' {
            tokens.push(Token::new(TokenKind::LParen, unsafe { base.add(pos) }, 1));
            pos += 1;
            continue;
        }

        if c == b')' {
            tokens.push(Token::new(TokenKind::RParen, unsafe { base.add(pos) }, 1));
            pos += 1;
            continue;
        }

        // line comment, discarded
        if c == b';' {
            while pos < end && source[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }

        if c == b'\'' {
            tokens.push(Token::new(TokenKind::Quote, unsafe { base.add(pos) }, 1));
            pos += 1;
            continue;
        }

        if c == b'`' {
            tokens.push(Token::new(
                TokenKind::Quasiquote,
                unsafe { base.add(pos) },
                1,
            ));
            pos += 1;
            continue;
        }

        if c == b',' {
            tokens.push(Token::new(TokenKind::Unquote, unsafe { base.add(pos) }, 1));
            pos += 1;
            continue;
        }

        if c == b'"' {
            let start = pos;
            pos += 1;
            while pos < end && source[pos] != b'"' {
                if source[pos] == b'\\' && pos + 1 < end {
                    pos += 1;
                }
                pos += 1;
            }

            if pos < end {
                // closing quote included in the slice
                pos += 1;
                tokens.push(Token::new(
                    TokenKind::String,
                    unsafe { base.add(start) },
                    pos - start,
                ));
            } else {
                tokens.push(Token::new(
                    TokenKind::Error,
                    unsafe { base.add(start) },
                    pos - start,
                ));
            }
            continue;
        }

        // uninterned symbol: #:name
        if c == b'#' && pos + 1 < end && source[pos + 1] == b':' {
            let start = pos;
            pos += 2;
            while pos < end && id_continue(source[pos]) {
                pos += 1;
            }
            tokens.push(Token::new(
                TokenKind::Uninterned,
                unsafe { base.add(start) },
                pos - start,
            ));
            continue;
        }

        // numeric literal; a sign must be followed by a digit or dot
        if c.is_ascii_digit()
            || ((c == b'-' || c == b'+')
                && pos + 1 < end
                && (source[pos + 1].is_ascii_digit() || source[pos + 1] == b'.'))
        {
            let start = pos;
            let mut is_float = false;
            let mut bad_exponent = false;

            if c == b'-' || c == b'+' {
                pos += 1;
            }

            while pos < end && source[pos].is_ascii_digit() {
                pos += 1;
            }

            if pos < end && source[pos] == b'.' {
                is_float = true;
                pos += 1;
                while pos < end && source[pos].is_ascii_digit() {
                    pos += 1;
                }
            }

            if pos < end && (source[pos] == b'e' || source[pos] == b'E') {
                is_float = true;
                pos += 1;
                if pos < end && (source[pos] == b'+' || source[pos] == b'-') {
                    pos += 1;
                }
                if pos < end && source[pos].is_ascii_digit() {
                    while pos < end && source[pos].is_ascii_digit() {
                        pos += 1;
                    }
                } else {
                    // "1e" and friends re-scan as an identifier
                    pos = start;
                    bad_exponent = true;
                }
            }

            if !bad_exponent {
                tokens.push(Token::new(
                    if is_float {
                        TokenKind::Float
                    } else {
                        TokenKind::Integer
                    },
                    unsafe { base.add(start) },
                    pos - start,
                ));
                continue;
            }
        }

        let c = source[pos];
        if id_start(c) {
            let start = pos;
            while pos < end && id_continue(source[pos]) {
                pos += 1;
            }
            tokens.push(Token::new(
                TokenKind::Identifier,
                unsafe { base.add(start) },
                pos - start,
            ));
            continue;
        }

        tokens.push(Token::new(TokenKind::Error, unsafe { base.add(pos) }, 1));
        pos += 1;
    }

    tokens
}
