//! Consumes `#pragma pack` directives out of a token stream and maintains
//! the active pack-value stack used by the layout engine.
//!
//! Modelled directly on the original's `PackState`
//! (alignment_rules.h): a stack of labelled pack entries plus the
//! currently active value, defaulting to 8.

use thiserror::Error;

use crate::lexer::{Lexer, Token, TokenKind};

/// Default pack value in effect with no active `#pragma pack`.
pub const DEFAULT_PACK: u8 = 8;

const VALID_PACK_VALUES: [u8; 5] = [1, 2, 4, 8, 16];

/// One entry pushed onto the pack stack by `#pragma pack(push, ...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PackEntry {
    value: u8,
    label: Option<String>,
}

/// Tracks the active `#pragma pack` value and its push/pop history.
#[derive(Debug, Clone)]
pub struct PackStack {
    stack: Vec<PackEntry>,
    current: u8,
}

impl Default for PackStack {
    fn default() -> Self {
        Self::new()
    }
}

impl PackStack {

    pub fn new() -> Self {
        Self { stack: Vec::new(), current: DEFAULT_PACK }
    }

    /// The pack value new fields should use right now.
    #[inline]
    pub fn current_pack(&self) -> u8 {
        self.current
    }

    /// `#pragma pack(push[, identifier], n)`.
    pub fn push(&mut self, label: Option<String>, value: u8) -> Result<(), PreprocessorError> {
        if !VALID_PACK_VALUES.contains(&value) {
            return Err(PreprocessorError::InvalidPackValue { value });
        }
        self.stack.push(PackEntry { value: self.current, label });
        self.current = value;
        Ok(())
    }

    /// `#pragma pack(pop[, identifier])`. With an identifier, pops entries
    /// until (and including) the named one; without, pops exactly one.
    /// Popping an empty stack restores the default.
    pub fn pop(&mut self, label: Option<&str>) {
        match label {
            None => {
                if let Some(entry) = self.stack.pop() {
                    self.current = entry.value;
                } else {
                    self.current = DEFAULT_PACK;
                }
            }
            Some(name) => {
                if let Some(pos) = self.stack.iter().rposition(|e| e.label.as_deref() == Some(name)) {
                    let restored = self.stack[pos].value;
                    self.stack.truncate(pos);
                    self.current = restored;
                } else if self.stack.pop().is_some() {
                    // Unknown label: fall back to popping one level, matching
                    // the original's tolerant behavior on a bad identifier.
                    self.current = self.stack.last().map(|e| e.value).unwrap_or(DEFAULT_PACK);
                } else {
                    self.current = DEFAULT_PACK;
                }
            }
        }
    }

    /// `#pragma pack(n)` — replace current value without touching the stack.
    pub fn set(&mut self, value: u8) -> Result<(), PreprocessorError> {
        if !VALID_PACK_VALUES.contains(&value) {
            return Err(PreprocessorError::InvalidPackValue { value });
        }
        self.current = value;
        Ok(())
    }

    /// `#pragma pack()` — reset to default, stack untouched.
    pub fn reset(&mut self) {
        self.current = DEFAULT_PACK;
    }
}

#[derive(Debug, Error)]
pub enum PreprocessorError {
    #[error("invalid pack value {value}, expected one of 1, 2, 4, 8, 16")]
    InvalidPackValue { value: u8 },
    #[error("malformed #pragma pack directive: {reason}")]
    MalformedDirective { reason: String },
}

/// One pragma directive recognized while walking the token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PragmaDirective {
    Push { label: Option<String>, value: u8 },
    Pop { label: Option<String> },
    Set { value: u8 },
    Reset,
    /// Any other pragma, passed through unchanged.
    Other(String),
}

/// Walks a lexed token stream, applying `#pragma pack` directives to an
/// internal [`PackStack`] and yielding the non-pragma tokens for parsing.
pub struct Preprocessor<'src> {
    lexer: std::iter::Peekable<Lexer<'src>>,
    pack: PackStack,
    errors: Vec<PreprocessorError>,
}

impl<'src> Preprocessor<'src> {

    pub fn new(src: &'src str) -> Self {
        Self { lexer: Lexer::new(src).peekable(), pack: PackStack::new(), errors: Vec::new() }
    }

    pub fn current_pack(&self) -> u8 {
        self.pack.current_pack()
    }

    pub fn errors(&self) -> &[PreprocessorError] {
        &self.errors
    }

    fn skip_trivia(&mut self) {
        while matches!(self.lexer.peek().map(|t| &t.kind), Some(TokenKind::Newline) | Some(TokenKind::Comment)) {
            self.lexer.next();
        }
    }

    fn next_significant(&mut self) -> Option<Token<'src>> {
        self.skip_trivia();
        self.lexer.next()
    }

    fn handle_pragma(&mut self) {
        self.skip_trivia();
        let Some(keyword) = self.next_significant() else { return };
        if keyword.value_text != "pack" {
            // Drain the rest of the line for any other pragma; passed through.
            while !matches!(self.lexer.peek().map(|t| &t.kind), Some(TokenKind::Newline) | Some(TokenKind::Eof) | None) {
                self.lexer.next();
            }
            return;
        }

        let Some(open) = self.next_significant() else {
            self.errors.push(PreprocessorError::MalformedDirective { reason: "missing '(' after pack".into() });
            return;
        };
        if open.kind != TokenKind::Delimiter || open.value_text != "(" {
            self.errors.push(PreprocessorError::MalformedDirective { reason: "expected '(' after pack".into() });
            return;
        }

        let mut args: Vec<Token<'src>> = Vec::new();
        loop {
            let Some(token) = self.next_significant() else {
                self.errors.push(PreprocessorError::MalformedDirective { reason: "unterminated pack directive".into() });
                return;
            };
            if token.kind == TokenKind::Delimiter && token.value_text == ")" {
                break;
            }
            if token.kind == TokenKind::Delimiter && token.value_text == "," {
                continue;
            }
            args.push(token);
        }

        if args.is_empty() {
            self.pack.reset();
            return;
        }

        if args[0].value_text == "push" {
            let (label, value_tok) = match args.len() {
                2 => (None, &args[1]),
                3 => (Some(args[1].value_text.to_string()), &args[2]),
                _ => {
                    self.errors.push(PreprocessorError::MalformedDirective { reason: "push expects 1 or 2 arguments".into() });
                    return;
                }
            };
            let Ok(value) = value_tok.value_text.parse::<u8>() else {
                self.errors.push(PreprocessorError::MalformedDirective { reason: "push value is not an integer".into() });
                return;
            };
            if let Err(e) = self.pack.push(label, value) {
                self.errors.push(e);
            }
            return;
        }

        if args[0].value_text == "pop" {
            let label = args.get(1).map(|t| t.value_text.to_string());
            self.pack.pop(label.as_deref());
            return;
        }

        if args.len() == 1 {
            if let Ok(value) = args[0].value_text.parse::<u8>() {
                if let Err(e) = self.pack.set(value) {
                    self.errors.push(e);
                }
                return;
            }
        }

        self.errors.push(PreprocessorError::MalformedDirective { reason: format!("unrecognized pack directive form: {:?}", args.iter().map(|t| t.value_text).collect::<Vec<_>>()) });
    }
}

impl<'src> Iterator for Preprocessor<'src> {
    type Item = Token<'src>;

    fn next(&mut self) -> Option<Token<'src>> {
        loop {
            let token = self.lexer.next()?;
            match token.kind {
                TokenKind::PragmaHash => self.handle_pragma(),
                TokenKind::Newline | TokenKind::Comment => continue,
                TokenKind::Eof => return Some(token),
                _ => return Some(token),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pack_is_eight() {
        assert_eq!(PackStack::new().current_pack(), 8);
    }

    #[test]
    fn push_pop_restores_previous_value() {
        let mut stack = PackStack::new();
        stack.push(None, 1).unwrap();
        assert_eq!(stack.current_pack(), 1);
        stack.pop(None);
        assert_eq!(stack.current_pack(), 8);
    }

    #[test]
    fn labelled_pop_unwinds_to_named_entry() {
        let mut stack = PackStack::new();
        stack.push(Some("a".into()), 2).unwrap();
        stack.push(None, 4).unwrap();
        stack.push(None, 1).unwrap();
        stack.pop(Some("a"));
        assert_eq!(stack.current_pack(), 8);
    }

    #[test]
    fn invalid_value_is_rejected() {
        let mut stack = PackStack::new();
        assert!(stack.push(None, 3).is_err());
        assert_eq!(stack.current_pack(), 8);
    }

    #[test]
    fn reset_restores_default_without_touching_stack() {
        let mut stack = PackStack::new();
        stack.push(None, 2).unwrap();
        stack.reset();
        assert_eq!(stack.current_pack(), 8);
    }

    #[test]
    fn preprocessor_applies_pack_and_filters_pragma_tokens() {
        let mut pp = Preprocessor::new("#pragma pack(1)\nstruct P { int a; };");
        let first = pp.next().unwrap();
        assert_eq!(first.value_text, "struct");
        assert_eq!(pp.current_pack(), 1);
    }

    #[test]
    fn preprocessor_reports_invalid_pack_value() {
        let mut pp = Preprocessor::new("#pragma pack(3)\nstruct P {};");
        pp.next();
        assert!(!pp.errors().is_empty());
    }

    #[test]
    fn preprocessor_push_then_pop_sequence() {
        let mut pp = Preprocessor::new("#pragma pack(push, 1)\nstruct A {};\n#pragma pack(pop)\nstruct B {};");
        let tokens: Vec<_> = pp.by_ref().map(|t| t.value_text.to_string()).collect();
        assert!(tokens.contains(&"A".to_string()));
        assert!(tokens.contains(&"B".to_string()));
        assert_eq!(pp.current_pack(), 8);
    }
}
