//! Single-pass, position-tracking tokenizer over C-style struct source text.
//!
//! Never fails the whole input: unknown bytes become [`TokenKind::Invalid`]
//! tokens and the caller (the preprocessor / parser) decides what to do
//! with them, matching the "no whole-input failure" contract.

use std::str::CharIndices;


/// A lexical category. Kept as a flat tagged enum rather than a class
/// hierarchy (see the crate-level design note on tagged variants).
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier,
    Keyword,
    IntegerLiteral,
    FloatLiteral,
    StringLiteral,
    CharLiteral,
    Operator,
    Delimiter,
    PragmaHash,
    IncludeHash,
    DefineHash,
    Newline,
    Comment,
    Eof,
    Invalid,
}

const KEYWORDS: &[&str] = &[
    "struct", "union", "typedef", "const", "volatile", "static", "extern",
    "inline", "signed", "unsigned", "void", "char", "short", "int", "long",
    "float", "double", "bool", "class", "enum",
];

/// One lexed token. `value_text` borrows directly from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub value_text: &'src str,
    pub line: u32,
    pub column: u32,
    pub byte_offset: usize,
}

/// Tokenizes `src` lazily via [`Iterator`].
pub struct Lexer<'src> {
    src: &'src str,
    chars: CharIndices<'src>,
    peeked: Option<(usize, char)>,
    line: u32,
    column: u32,
    done: bool,
}

impl<'src> Lexer<'src> {

    pub fn new(src: &'src str) -> Self {
        let mut chars = src.char_indices();
        let peeked = chars.next();
        Self { src, chars, peeked, line: 1, column: 1, done: false }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let current = self.peeked;
        self.peeked = self.chars.next();
        if let Some((_, c)) = current {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        current
    }

    fn peek(&self) -> Option<char> {
        self.peeked.map(|(_, c)| c)
    }

    fn peek_at(&self, byte_offset: usize) -> Option<char> {
        self.src[byte_offset..].chars().next()
    }

    fn make(&self, kind: TokenKind, start: usize, line: u32, column: u32) -> Token<'src> {
        let end = self.peeked.map(|(i, _)| i).unwrap_or(self.src.len());
        Token { kind, value_text: &self.src[start..end], line, column, byte_offset: start }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' { break; }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) {
        let mut prev = '\0';
        while let Some(c) = self.peek() {
            self.bump();
            if prev == '*' && c == '/' { break; }
            prev = c;
        }
    }
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Token<'src>;

    fn next(&mut self) -> Option<Token<'src>> {
        if self.done {
            return None;
        }

        // Skip non-newline whitespace, which carries no token of its own.
        while matches!(self.peek(), Some(c) if c.is_whitespace() && c != '\n') {
            self.bump();
        }

        let (start, c) = match self.peeked {
            Some(pair) => pair,
            None => {
                self.done = true;
                return Some(Token { kind: TokenKind::Eof, value_text: "", line: self.line, column: self.column, byte_offset: self.src.len() });
            }
        };
        let (line, column) = (self.line, self.column);

        if c == '\n' {
            self.bump();
            return Some(self.make(TokenKind::Newline, start, line, column));
        }

        if c == '/' && self.peek_at(start + 1) == Some('/') {
            self.skip_line_comment();
            return Some(self.make(TokenKind::Comment, start, line, column));
        }
        if c == '/' && self.peek_at(start + 1) == Some('*') {
            self.bump();
            self.bump();
            self.skip_block_comment();
            return Some(self.make(TokenKind::Comment, start, line, column));
        }

        if c == '#' {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_whitespace() && c != '\n') {
                self.bump();
            }
            let word_start = self.peeked.map(|(i, _)| i).unwrap_or(self.src.len());
            while matches!(self.peek(), Some(c) if c.is_alphanumeric()) {
                self.bump();
            }
            let word_end = self.peeked.map(|(i, _)| i).unwrap_or(self.src.len());
            let word = &self.src[word_start..word_end];
            let kind = match word {
                "pragma" => TokenKind::PragmaHash,
                "include" => TokenKind::IncludeHash,
                "define" => TokenKind::DefineHash,
                _ => TokenKind::Invalid,
            };
            return Some(self.make(kind, start, line, column));
        }

        if c.is_ascii_digit() {
            return Some(self.lex_number(start, line, column));
        }

        if c == '_' || c.is_alphabetic() {
            self.bump();
            while matches!(self.peek(), Some(c) if c == '_' || c.is_alphanumeric()) {
                self.bump();
            }
            let token = self.make(TokenKind::Identifier, start, line, column);
            if KEYWORDS.contains(&token.value_text) {
                return Some(Token { kind: TokenKind::Keyword, ..token });
            }
            return Some(token);
        }

        if c == '"' {
            return Some(self.lex_quoted(start, line, column, '"', TokenKind::StringLiteral));
        }
        if c == '\'' {
            return Some(self.lex_quoted(start, line, column, '\'', TokenKind::CharLiteral));
        }

        if ";,:.()[]{}".contains(c) {
            self.bump();
            return Some(self.make(TokenKind::Delimiter, start, line, column));
        }

        if is_operator_char(c) {
            self.bump();
            // Greedily match the handful of two-character C operators, plus `::`/`->`.
            if let Some(next) = self.peek() {
                let two: String = [c, next].iter().collect();
                if is_two_char_operator(&two) {
                    self.bump();
                }
            }
            return Some(self.make(TokenKind::Operator, start, line, column));
        }

        self.bump();
        Some(self.make(TokenKind::Invalid, start, line, column))
    }
}

impl<'src> Lexer<'src> {

    fn lex_number(&mut self, start: usize, line: u32, column: u32) -> Token<'src> {
        let mut is_float = false;
        if self.peek() == Some('0') && matches!(self.peek_at(start + 1), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.bump();
            }
            return self.make(TokenKind::IntegerLiteral, start, line, column);
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        while matches!(self.peek(), Some(c) if "fFlLuU".contains(c)) {
            if matches!(self.peek(), Some('f') | Some('F')) {
                is_float = true;
            }
            self.bump();
        }
        self.make(if is_float { TokenKind::FloatLiteral } else { TokenKind::IntegerLiteral }, start, line, column)
    }

    fn lex_quoted(&mut self, start: usize, line: u32, column: u32, quote: char, kind: TokenKind) -> Token<'src> {
        self.bump();
        let mut escaped = false;
        let mut closed = false;
        while let Some(c) = self.peek() {
            self.bump();
            if escaped {
                escaped = false;
                continue;
            }
            if c == '\\' {
                escaped = true;
                continue;
            }
            if c == quote {
                closed = true;
                break;
            }
            if c == '\n' {
                break;
            }
        }
        if closed {
            self.make(kind, start, line, column)
        } else {
            self.make(TokenKind::Invalid, start, line, column)
        }
    }
}

fn is_operator_char(c: char) -> bool {
    "+-*/%=<>!&|^~?".contains(c)
}

fn is_two_char_operator(s: &str) -> bool {
    matches!(s, "==" | "!=" | "<=" | ">=" | "&&" | "||" | "<<" | ">>"
        | "+=" | "-=" | "*=" | "/=" | "%=" | "&=" | "|=" | "^="
        | "++" | "--" | "::" | "->")
}


#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_struct_keyword_and_identifier() {
        let mut lexer = Lexer::new("struct Foo");
        let first = lexer.next().unwrap();
        assert_eq!(first.kind, TokenKind::Keyword);
        assert_eq!(first.value_text, "struct");
        let second = lexer.next().unwrap();
        assert_eq!(second.kind, TokenKind::Identifier);
        assert_eq!(second.value_text, "Foo");
    }

    #[test]
    fn tracks_line_and_column() {
        let mut lexer = Lexer::new("a\nb");
        let a = lexer.next().unwrap();
        assert_eq!((a.line, a.column), (1, 1));
        let _newline = lexer.next().unwrap();
        let b = lexer.next().unwrap();
        assert_eq!((b.line, b.column), (2, 1));
    }

    #[test]
    fn lexes_hex_and_float_literals() {
        let mut lexer = Lexer::new("0x1F 3.14f");
        let hex = lexer.next().unwrap();
        assert_eq!(hex.kind, TokenKind::IntegerLiteral);
        assert_eq!(hex.value_text, "0x1F");
        lexer.next(); // whitespace is skipped silently, not tokenized
        let flt = lexer.next().unwrap();
        assert_eq!(flt.kind, TokenKind::FloatLiteral);
        assert_eq!(flt.value_text, "3.14f");
    }

    #[test]
    fn never_fails_on_unknown_byte() {
        let kinds = kinds("@");
        assert_eq!(kinds, vec![TokenKind::Invalid, TokenKind::Eof]);
    }

    #[test]
    fn recognizes_pragma_hash() {
        let mut lexer = Lexer::new("#pragma pack(1)");
        let token = lexer.next().unwrap();
        assert_eq!(token.kind, TokenKind::PragmaHash);
    }

    #[test]
    fn skips_comments_as_their_own_token() {
        let kinds = kinds("// c\nint");
        assert_eq!(kinds, vec![TokenKind::Comment, TokenKind::Newline, TokenKind::Keyword, TokenKind::Eof]);
    }

    #[test]
    fn lexes_two_character_operators() {
        let mut lexer = Lexer::new("->");
        let token = lexer.next().unwrap();
        assert_eq!(token.kind, TokenKind::Operator);
        assert_eq!(token.value_text, "->");
    }

    #[test]
    fn terminates_with_eof() {
        let mut lexer = Lexer::new("");
        let token = lexer.next().unwrap();
        assert_eq!(token.kind, TokenKind::Eof);
        assert!(lexer.next().is_none());
    }
}
