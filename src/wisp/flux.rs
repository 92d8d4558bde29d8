// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/flux.rs

// Indexed view over the annotated token stream: one span record per
// s-expression id, produced in descending id order so children come
// before parents, plus the maximum id used to size the result cache.

// <>

use super::lexer::{Token, TokenKind};
use super::vec::DenseVec;

const UNSET: usize = usize::MAX;

/// One s-expression span
///
/// The closed interval `[start_idx, end_idx]` runs from just inside
/// the opening paren to just inside the closing paren, so every
/// nested child token falls within it. `start_idx > end_idx` marks
/// an empty form. Top-level atoms are width-one id-0 spans.
#[derive(Debug, Clone, Copy)]
pub struct SExpr {
    pub id: usize,
    pub start_idx: usize,
    pub end_idx: usize,
    pub tokens: *const DenseVec<Token>,
}

impl SExpr {
    #[inline(always)]
    pub fn is_empty_form(&self) -> bool {
        self.start_idx > self.end_idx
    }

    #[inline(always)]
    pub fn token(&self, idx: usize) -> Token {
        let mut out = Token {
            kind: TokenKind::Error,
            value: std::ptr::null(),
            len: 0,
            sexpr_id: 0,
        };
        assert!(unsafe { (*self.tokens).get(idx, &mut out) });
        out
    }
}

/// A top-level form: a parenthesized span or a bare atom token
#[derive(Debug, Clone, Copy)]
pub enum TopForm {
    Span(usize),
    Atom(usize),
}

/// Flux build failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FluxError {
    #[error("allocation failed while building spans")]
    Alloc,
    #[error("inconsistent s-expression ids")]
    InconsistentIds,
}

/// The indexed program: spans by descending id, the token stream
/// they reference, the maximum id observed (sizes the evaluator's
/// result cache) and the maximum paren nesting depth
pub struct ProgramFlux {
    pub sexprs: DenseVec<SExpr>,
    pub tokens: *const DenseVec<Token>,
    pub max_id: usize,
    pub max_depth: usize,
}

impl ProgramFlux {
    /// The span bearing `id`; ids are dense, so this is an index
    #[inline(always)]
    pub fn span(&self, id: usize) -> Option<&SExpr> {
        if id > self.max_id {
            return None;
        }
        let idx = self.max_id - id;
        if idx >= self.sexprs.len() {
            return None;
        }
        Some(unsafe { &*self.sexprs.at(idx) })
    }

    /// Walks the token stream left to right, yielding each top-level
    /// form once and jumping over nested content
    pub fn top_forms(&self) -> DenseVec<TopForm> {
        let mut out: DenseVec<TopForm> = DenseVec::new(8);
        let tokens = unsafe { &*self.tokens };

        let mut i = 0;
        while i < tokens.len() {
            let tok = tokens.as_slice()[i];
            if tok.sexpr_id > 0 {
                // first token of a parenthesized top form is its '('
                out.push(TopForm::Span(tok.sexpr_id));
                let span = self.span(tok.sexpr_id).unwrap();
                i = span.end_idx + 2;
            } else {
                out.push(TopForm::Atom(i));
                i += 1;
            }
        }

        out
    }
}

/// Builds the flux from an annotated token vector
///
/// An input with no tokens yields an empty flux. Every id from 1 to
/// the maximum must appear on exactly one pair of ignored parens, or
/// the annotator invariant has been broken upstream.
pub fn build(tokens: &DenseVec<Token>) -> Result<ProgramFlux, FluxError> {
    let toks = tokens.as_slice();

    let max_id = toks.iter().map(|t| t.sexpr_id).max().unwrap_or(0);

    if toks.is_empty() {
        return Ok(ProgramFlux {
            sexprs: DenseVec::try_new(1).ok_or(FluxError::Alloc)?,
            tokens,
            max_id: 0,
            max_depth: 0,
        });
    }

    // opening and closing paren indices per id; parens are the only
    // ignored tokens bearing an id after annotation, and the first
    // occurrence of an id is its opening paren
    let mut first = vec![UNSET; max_id + 1];
    let mut last = vec![UNSET; max_id + 1];

    // id 0 has no parens; track its outermost non-ignored tokens
    let mut zero_first = UNSET;
    let mut zero_last = UNSET;

    let mut depth = 0usize;
    let mut max_depth = 0usize;

    for (i, tok) in toks.iter().enumerate() {
        let id = tok.sexpr_id;
        if id > 0 {
            if tok.kind == TokenKind::Ignored {
                if first[id] == UNSET {
                    first[id] = i;
                    depth += 1;
                    max_depth = max_depth.max(depth);
                } else {
                    depth = depth.saturating_sub(1);
                }
                last[id] = i;
            }
        } else if tok.kind != TokenKind::Ignored {
            if zero_first == UNSET {
                zero_first = i;
            }
            zero_last = i;
        }
    }

    let mut sexprs: DenseVec<SExpr> = DenseVec::try_new(max_id + 1).ok_or(FluxError::Alloc)?;

    // children before parents: descending id order
    for id in (1..=max_id).rev() {
        if first[id] == UNSET || last[id] == UNSET || first[id] == last[id] {
            return Err(FluxError::InconsistentIds);
        }
        sexprs.push(SExpr {
            id,
            start_idx: first[id] + 1,
            end_idx: last[id] - 1,
            tokens,
        });
    }

    // the id-0 record covers bare top-level atoms, when any exist
    sexprs.push(if zero_first == UNSET {
        SExpr {
            id: 0,
            start_idx: 1,
            end_idx: 0,
            tokens,
        }
    } else {
        SExpr {
            id: 0,
            start_idx: zero_first,
            end_idx: zero_last,
            tokens,
        }
    });

    Ok(ProgramFlux {
        sexprs,
        tokens,
        max_id,
        max_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::super::annotate::annotate;
    use super::super::lexer::lex_tokens;
    use super::*;

    fn flux_of(src: &[u8]) -> ProgramFlux {
        let mut toks = lex_tokens(src);
        annotate(&mut toks).unwrap();
        // the token vector must outlive the flux that references it
        let toks = Box::leak(Box::new(toks));
        build(toks).unwrap()
    }

    #[test]
    fn descending_id_order() {
        let flux = flux_of(b"(* 2 (+ 3 4))");
        assert_eq!(flux.max_id, 2);
        let ids: Vec<usize> = flux.sexprs.as_slice().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 1, 0]);
    }

    #[test]
    fn nesting_depth() {
        assert_eq!(flux_of(b"(a (b (c)))").max_depth, 3);
        assert_eq!(flux_of(b"(a) (b)").max_depth, 1);
        assert_eq!(flux_of(b"42").max_depth, 0);
    }

    #[test]
    fn span_intervals_cover_children() {
        let flux = flux_of(b"(* 2 (+ 3 4))");

        let outer = *flux.span(1).unwrap();
        let inner = *flux.span(2).unwrap();

        // tokens: ( * 2 ( + 3 4 ) )
        assert_eq!(outer.start_idx, 1);
        assert_eq!(outer.end_idx, 7);
        assert_eq!(inner.start_idx, 4);
        assert_eq!(inner.end_idx, 6);

        // containment, siblings disjoint by construction
        assert!(inner.start_idx >= outer.start_idx);
        assert!(inner.end_idx <= outer.end_idx);
    }

    #[test]
    fn sibling_spans_do_not_overlap() {
        let flux = flux_of(b"((a) (b))");
        let fst = *flux.span(2).unwrap();
        let snd = *flux.span(3).unwrap();
        assert!(fst.end_idx < snd.start_idx);
    }

    #[test]
    fn empty_form_is_marked() {
        let flux = flux_of(b"()");
        let s = *flux.span(1).unwrap();
        assert!(s.is_empty_form());
    }

    #[test]
    fn empty_program_empty_flux() {
        let toks: DenseVec<Token> = DenseVec::new(1);
        let flux = build(&toks).unwrap();
        assert_eq!(flux.max_id, 0);
        assert!(flux.sexprs.is_empty());
    }

    #[test]
    fn top_forms_walk() {
        let flux = flux_of(b"42 (+ 1 2) foo (g (h))");
        let forms = flux.top_forms();
        assert_eq!(forms.len(), 4);

        match forms.as_slice()[0] {
            TopForm::Atom(i) => assert_eq!(i, 0),
            _ => panic!("expected atom"),
        }
        match forms.as_slice()[1] {
            TopForm::Span(id) => assert_eq!(id, 1),
            _ => panic!("expected span"),
        }
        match forms.as_slice()[2] {
            TopForm::Atom(_) => {}
            _ => panic!("expected atom"),
        }
        match forms.as_slice()[3] {
            TopForm::Span(id) => assert_eq!(id, 2),
            _ => panic!("expected span"),
        }
    }
}
