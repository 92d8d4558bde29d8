// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/annotate.rs

// Parenthesis-balancing pass over the flat token stream. Assigns a
// stable s-expression id to every token and rewrites parentheses to
// ignored tokens, leaving their ids intact for span computation.

// <>

use super::lexer::{Token, TokenKind};
use super::vec::DenseVec;

/// Annotation failures, numbered as on the wire
///
/// The null-input code is kept for numbering compatibility but
/// cannot be produced behind a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(i32)]
pub enum AnnotateError {
    #[error("no token stream")]
    NullInput = -1,
    #[error("empty token stream")]
    EmptyInput = -2,
    #[error("scratch stack allocation failed")]
    ScratchAlloc = -3,
    #[error("unmatched closing parenthesis")]
    UnmatchedClose = -4,
    #[error("unclosed expression at end of input")]
    Unclosed = -5,
}

/// Assigns s-expression ids in a single pass and rewrites parens
///
/// Ids are dense and monotone: id 0 is the top level; each opening
/// paren takes the next counter value. Returns the maximum id
/// assigned.
pub fn annotate(tokens: &mut DenseVec<Token>) -> Result<usize, AnnotateError> {
    if tokens.is_empty() {
        return Err(AnnotateError::EmptyInput);
    }

    let mut active: DenseVec<usize> = match DenseVec::try_new(32) {
        Some(v) => v,
        None => return Err(AnnotateError::ScratchAlloc),
    };

    let mut counter = 0usize;

    for tok in tokens.as_mut_slice() {
        match tok.kind {
            TokenKind::LParen => {
                counter += 1;
                tok.sexpr_id = counter;
                tok.kind = TokenKind::Ignored;
                active.push(counter);
            }
            TokenKind::RParen => match active.pop_copy() {
                Some(id) => {
                    tok.sexpr_id = id;
                    tok.kind = TokenKind::Ignored;
                }
                None => {
                    eprintln!("Error: unmatched ')'");
                    return Err(AnnotateError::UnmatchedClose);
                }
            },
            _ => {
                tok.sexpr_id = active.peek_copy().unwrap_or(0);
            }
        }
    }

    if !active.is_empty() {
        eprintln!("Error: {} expression(s) unclosed at end of input", active.len());
        return Err(AnnotateError::Unclosed);
    }

    Ok(counter)
}
