//! Recursive-descent parser turning a preprocessed token stream into
//! [`Decl`]s. Errors never abort the whole parse: on failure inside a
//! struct body the parser skips to the next `;` or matching `}` and
//! continues, recording diagnostics rather than unwinding.

use thiserror::Error;

use crate::ast::{Decl, Field, PrimitiveKind, SourceSpan, StructDecl, Type, TypedefDecl, UnionDecl};
use crate::lexer::{Token, TokenKind};
use crate::preprocessor::Preprocessor;

/// Maximum nesting depth (currently only struct/union bodies nest) before
/// the parser reports an error and stops descending.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum number of fields accepted in a single struct or union body.
pub const MAX_FIELDS_PER_STRUCT: usize = 1000;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("{context}: unexpected token '{found}' at line {}, column {}", span.line, span.column)]
    UnexpectedToken { span: SourceSpan, found: String, context: String },
    #[error("{context}: expected identifier at line {}, column {}", span.line, span.column)]
    MissingIdentifier { span: SourceSpan, context: String },
    #[error("{context}: duplicate field '{name}' at line {}, column {}", span.line, span.column)]
    DuplicateField { span: SourceSpan, name: String, context: String },
    #[error("{context}: nesting depth exceeds {MAX_NESTING_DEPTH} at line {}, column {}", span.line, span.column)]
    NestingOverflow { span: SourceSpan, context: String },
    #[error("{context}: field count exceeds {MAX_FIELDS_PER_STRUCT} at line {}, column {}", span.line, span.column)]
    TooManyFields { span: SourceSpan, context: String },
    #[error("{context}: invalid bitfield width '{width}' at line {}, column {}", span.line, span.column)]
    InvalidBitfieldWidth { span: SourceSpan, width: String, context: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseWarning {
    pub span: SourceSpan,
    pub message: String,
}

/// Result of parsing a full source unit: the declarations recovered and
/// any diagnostics accumulated along the way. Declarations are returned
/// even when errors occurred elsewhere in the source (partial-result
/// contract).
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub decls: Vec<Decl>,
    pub errors: Vec<ParseError>,
    pub warnings: Vec<ParseWarning>,
}

fn is_reserved_keyword(s: &str) -> bool {
    matches!(s, "struct" | "union" | "typedef" | "const" | "volatile" | "static"
        | "extern" | "inline" | "signed" | "unsigned" | "void" | "char" | "short"
        | "int" | "long" | "float" | "double" | "bool" | "class" | "enum")
}

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Recursive-descent parser over a preprocessed token stream.
pub struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    /// The `#pragma pack` value in effect at the moment each `tokens[i]` was
    /// yielded by the [`Preprocessor`], parallel to `tokens`. Snapshotted
    /// while draining the preprocessor since a struct's pack value must
    /// reflect the directive active when its declaration was reached, not
    /// whatever is active by the time the whole source has been consumed.
    packs: Vec<u8>,
    pos: usize,
    depth: usize,
    errors: Vec<ParseError>,
    warnings: Vec<ParseWarning>,
}

impl<'src> Parser<'src> {

    /// Build a parser by draining a [`Preprocessor`] (which has already
    /// applied `#pragma pack` and filtered comments/newlines), keeping its
    /// accumulated pack-directive errors. The active pack value is recorded
    /// per token as it is drained, since the preprocessor itself only
    /// exposes its current, final pack value once exhausted.
    pub fn from_preprocessor(mut pp: Preprocessor<'src>) -> (Self, Vec<crate::preprocessor::PreprocessorError>) {
        let mut tokens = Vec::new();
        let mut packs = Vec::new();
        while let Some(token) = pp.next() {
            packs.push(pp.current_pack());
            tokens.push(token);
        }
        let pp_errors = pp.errors().to_vec();
        (Self { tokens, packs, pos: 0, depth: 0, errors: Vec::new(), warnings: Vec::new() }, pp_errors)
    }

    /// The pack value in effect when `tokens[pos]` was yielded.
    fn pack_at(&self, pos: usize) -> u8 {
        self.packs.get(pos).copied().unwrap_or(crate::preprocessor::DEFAULT_PACK)
    }

    pub fn parse(mut self) -> ParseResult {
        let mut decls = Vec::new();
        while !self.at_eof() {
            let before = self.pos;
            match self.parse_top_level() {
                Some(decl) => decls.push(decl),
                None => {}
            }
            if self.pos == before {
                // Guard against an unconsumed token causing an infinite loop.
                self.advance();
            }
        }
        ParseResult { decls, errors: self.errors, warnings: self.warnings }
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Eof) | None)
    }

    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos)
    }

    fn peek_text(&self) -> &str {
        self.peek().map(|t| t.value_text).unwrap_or("")
    }

    fn advance(&mut self) -> Option<Token<'src>> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn span_here(&self) -> SourceSpan {
        self.peek().map(|t| SourceSpan { line: t.line, column: t.column }).unwrap_or_default()
    }

    fn eat_delimiter(&mut self, text: &str) -> bool {
        if self.peek().map(|t| t.kind == TokenKind::Delimiter && t.value_text == text).unwrap_or(false) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skip to the next `;` or a balanced `}` at the current nesting level,
    /// used for error recovery inside a struct body.
    fn recover_in_body(&mut self) {
        let mut depth = 0i32;
        loop {
            match self.peek().map(|t| (t.kind.clone(), t.value_text)) {
                None => return,
                Some((TokenKind::Delimiter, ";")) if depth == 0 => { self.advance(); return; }
                Some((TokenKind::Delimiter, "{")) => { depth += 1; self.advance(); }
                Some((TokenKind::Delimiter, "}")) => {
                    if depth == 0 { return; }
                    depth -= 1;
                    self.advance();
                }
                Some((TokenKind::Eof, _)) => return,
                _ => { self.advance(); }
            }
        }
    }

    fn parse_top_level(&mut self) -> Option<Decl> {
        match self.peek_text() {
            "struct" => self.parse_struct(),
            "union" => self.parse_union(),
            "typedef" => self.parse_typedef(),
            _ if self.at_eof() => None,
            other => {
                let span = self.span_here();
                self.errors.push(ParseError::UnexpectedToken { span, found: other.to_string(), context: "top level".into() });
                self.advance();
                None
            }
        }
    }

    fn expect_identifier(&mut self, context: &str) -> Option<String> {
        let span = self.span_here();
        match self.peek() {
            Some(t) if t.kind == TokenKind::Identifier => {
                let name = t.value_text.to_string();
                self.advance();
                if is_reserved_keyword(&name) || !is_valid_identifier(&name) {
                    self.errors.push(ParseError::MissingIdentifier { span, context: context.to_string() });
                    return None;
                }
                Some(name)
            }
            _ => {
                self.errors.push(ParseError::MissingIdentifier { span, context: context.to_string() });
                None
            }
        }
    }

    fn parse_struct(&mut self) -> Option<Decl> {
        let pack_value = self.pack_at(self.pos);
        self.advance(); // 'struct'
        let name = self.expect_identifier("struct")?;
        let mut decl = StructDecl::new(name.clone(), pack_value, self.span_here());

        if !self.eat_delimiter("{") {
            self.errors.push(ParseError::UnexpectedToken { span: self.span_here(), found: self.peek_text().to_string(), context: format!("in struct {name}") });
            return Some(Decl::Struct(decl));
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.errors.push(ParseError::NestingOverflow { span: self.span_here(), context: format!("in struct {name}") });
            self.depth -= 1;
            return Some(Decl::Struct(decl));
        }

        while !self.eat_delimiter("}") {
            if self.at_eof() {
                break;
            }
            if decl.fields.len() >= MAX_FIELDS_PER_STRUCT {
                self.errors.push(ParseError::TooManyFields { span: self.span_here(), context: format!("in struct {name}") });
                self.recover_in_body();
                continue;
            }
            match self.parse_field(&format!("in struct {name}")) {
                Some(field) => {
                    if decl.fields.iter().any(|f| f.name == field.name) {
                        self.errors.push(ParseError::DuplicateField { span: self.span_here(), name: field.name.clone(), context: format!("in struct {name}") });
                    } else {
                        decl.fields.push(field);
                    }
                }
                None => self.recover_in_body(),
            }
        }
        self.depth -= 1;
        self.eat_delimiter(";");
        Some(Decl::Struct(decl))
    }

    fn parse_union(&mut self) -> Option<Decl> {
        self.advance(); // 'union'
        let name = self.expect_identifier("union")?;
        let mut decl = UnionDecl::new(name.clone(), self.span_here());

        if !self.eat_delimiter("{") {
            self.errors.push(ParseError::UnexpectedToken { span: self.span_here(), found: self.peek_text().to_string(), context: format!("in union {name}") });
            return Some(Decl::Union(decl));
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.errors.push(ParseError::NestingOverflow { span: self.span_here(), context: format!("in union {name}") });
            self.depth -= 1;
            return Some(Decl::Union(decl));
        }

        while !self.eat_delimiter("}") {
            if self.at_eof() {
                break;
            }
            if decl.members.len() >= MAX_FIELDS_PER_STRUCT {
                self.errors.push(ParseError::TooManyFields { span: self.span_here(), context: format!("in union {name}") });
                self.recover_in_body();
                continue;
            }
            match self.parse_field(&format!("in union {name}")) {
                Some(field) => {
                    if decl.members.iter().any(|f| f.name == field.name) {
                        self.errors.push(ParseError::DuplicateField { span: self.span_here(), name: field.name.clone(), context: format!("in union {name}") });
                    } else {
                        decl.members.push(field);
                    }
                }
                None => self.recover_in_body(),
            }
        }
        self.depth -= 1;
        self.eat_delimiter(";");
        Some(Decl::Union(decl))
    }

    fn parse_typedef(&mut self) -> Option<Decl> {
        self.advance(); // 'typedef'
        let span = self.span_here();
        let ty = self.parse_type("in typedef")?;
        let name = self.expect_identifier("typedef")?;
        self.eat_delimiter(";");
        Some(Decl::Typedef(TypedefDecl { name, underlying: ty, span }))
    }

    fn parse_field(&mut self, context: &str) -> Option<Field> {
        let ty = self.parse_type(context)?;
        let name = self.expect_identifier(context)?;

        let mut bit_width = None;
        if self.eat_delimiter(":") {
            let span = self.span_here();
            match self.peek() {
                Some(t) if t.kind == TokenKind::IntegerLiteral => {
                    let text = t.value_text.to_string();
                    self.advance();
                    match text.parse::<u32>() {
                        Ok(w) => bit_width = Some(w),
                        Err(_) => {
                            self.errors.push(ParseError::InvalidBitfieldWidth { span, width: text, context: context.to_string() });
                            return None;
                        }
                    }
                }
                _ => {
                    self.errors.push(ParseError::InvalidBitfieldWidth { span, width: self.peek_text().to_string(), context: context.to_string() });
                    return None;
                }
            }
        }

        let ty = if self.eat_delimiter("[") {
            let length = match self.peek() {
                Some(t) if t.kind == TokenKind::IntegerLiteral => {
                    let n = t.value_text.parse::<u32>().unwrap_or(0);
                    self.advance();
                    n
                }
                _ => 0,
            };
            if !self.eat_delimiter("]") {
                self.errors.push(ParseError::UnexpectedToken { span: self.span_here(), found: self.peek_text().to_string(), context: context.to_string() });
                return None;
            }
            Type::Array(Box::new(ty), length)
        } else {
            ty
        };

        if !self.eat_delimiter(";") {
            self.errors.push(ParseError::UnexpectedToken { span: self.span_here(), found: self.peek_text().to_string(), context: context.to_string() });
            return None;
        }

        Some(Field::unlaidout(name, ty, bit_width))
    }

    /// `type := qualifier* ('struct'|'union')? (primitive | IDENT) pointer_suffix*`
    ///
    /// The `struct`/`union` tag is optional and, when present, only ever
    /// precedes a named-type reference (C's elaborated-type-specifier);
    /// it carries no extra information here since struct and union names
    /// share one namespace in the registry.
    fn parse_type(&mut self, context: &str) -> Option<Type> {
        while matches!(self.peek_text(), "const" | "volatile" | "static" | "extern" | "inline") {
            self.advance();
        }

        let mut ty = if let Some(primitive) = self.try_parse_primitive() {
            Type::Primitive(primitive)
        } else {
            if matches!(self.peek_text(), "struct" | "union") {
                self.advance();
            }
            match self.peek() {
                Some(t) if t.kind == TokenKind::Identifier => {
                    let name = t.value_text.to_string();
                    self.advance();
                    Type::Named(name)
                }
                _ => {
                    self.errors.push(ParseError::UnexpectedToken { span: self.span_here(), found: self.peek_text().to_string(), context: context.to_string() });
                    return None;
                }
            }
        };

        while self.peek().map(|t| t.kind == TokenKind::Operator && t.value_text == "*").unwrap_or(false) {
            self.advance();
            ty = Type::Pointer(Box::new(ty));
        }

        Some(ty)
    }

    fn try_parse_primitive(&mut self) -> Option<PrimitiveKind> {
        let mut signedness: Option<bool> = None;
        let start = self.pos;

        while matches!(self.peek_text(), "signed" | "unsigned") {
            signedness = Some(self.peek_text() == "unsigned");
            self.advance();
        }

        let base = self.peek_text().to_string();
        let kind = match base.as_str() {
            "void" => { self.advance(); PrimitiveKind::Void }
            "bool" => { self.advance(); PrimitiveKind::Bool }
            "char" => {
                self.advance();
                match signedness {
                    Some(true) => PrimitiveKind::UnsignedChar,
                    Some(false) => PrimitiveKind::SignedChar,
                    None => PrimitiveKind::Char,
                }
            }
            "short" => {
                self.advance();
                if self.peek_text() == "int" { self.advance(); }
                if signedness == Some(true) { PrimitiveKind::UnsignedShort } else { PrimitiveKind::Short }
            }
            "int" => {
                self.advance();
                if signedness == Some(true) { PrimitiveKind::UnsignedInt } else { PrimitiveKind::Int }
            }
            "long" => {
                self.advance();
                if self.peek_text() == "long" {
                    self.advance();
                    if self.peek_text() == "int" { self.advance(); }
                    if signedness == Some(true) { PrimitiveKind::UnsignedLongLong } else { PrimitiveKind::LongLong }
                } else {
                    if self.peek_text() == "int" { self.advance(); }
                    if self.peek_text() == "double" {
                        self.advance();
                        return Some(PrimitiveKind::LongDouble);
                    }
                    if signedness == Some(true) { PrimitiveKind::UnsignedLong } else { PrimitiveKind::Long }
                }
            }
            "float" => { self.advance(); PrimitiveKind::Float }
            "double" => { self.advance(); PrimitiveKind::Double }
            _ => {
                if signedness.is_some() {
                    // `signed`/`unsigned` alone means `int`.
                    PrimitiveKind::Int
                } else {
                    self.pos = start;
                    return None;
                }
            }
        };
        Some(kind)
    }
}
