//! Round-trips a [`StructureRegistry`] to a small structured text document:
//! not JSON, a bespoke line-oriented format in the spirit of the source's
//! packed-text layer but kept human-diffable, reusing the struct-source
//! lexer's token model for its reader.

use std::fmt::Write as _;

use thiserror::Error;

use crate::ast::{BitView, Decl, Field, PrimitiveKind, SourceSpan, StructDecl, Type, TypedefDecl, UnionDecl};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::registry::StructureRegistry;

/// `(major, minor)` of the document format. Loaders reject documents whose
/// major component they don't recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

/// Highest major version this crate writes and the only one it reads.
pub const CURRENT_VERSION: Version = Version { major: 1, minor: 0 };

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SerializeError {
    #[error("unsupported document major version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("malformed document: {reason}")]
    Malformed { reason: String },
    #[error("missing required field '{field}' in '{context}'")]
    MissingField { field: String, context: String },
}

fn primitive_name(kind: PrimitiveKind) -> &'static str {
    use PrimitiveKind::*;
    match kind {
        Void => "void", Bool => "bool", Char => "char",
        SignedChar => "signed_char", UnsignedChar => "unsigned_char",
        Short => "short", UnsignedShort => "unsigned_short",
        Int => "int", UnsignedInt => "unsigned_int",
        Long => "long", UnsignedLong => "unsigned_long",
        LongLong => "long_long", UnsignedLongLong => "unsigned_long_long",
        Float => "float", Double => "double", LongDouble => "long_double",
    }
}

fn parse_primitive_name(name: &str) -> Option<PrimitiveKind> {
    use PrimitiveKind::*;
    Some(match name {
        "void" => Void, "bool" => Bool, "char" => Char,
        "signed_char" => SignedChar, "unsigned_char" => UnsignedChar,
        "short" => Short, "unsigned_short" => UnsignedShort,
        "int" => Int, "unsigned_int" => UnsignedInt,
        "long" => Long, "unsigned_long" => UnsignedLong,
        "long_long" => LongLong, "unsigned_long_long" => UnsignedLongLong,
        "float" => Float, "double" => Double, "long_double" => LongDouble,
        _ => return None,
    })
}

fn write_type(out: &mut String, ty: &Type) {
    match ty {
        Type::Primitive(kind) => { let _ = write!(out, "primitive {}", primitive_name(*kind)); }
        Type::Named(name) => { let _ = write!(out, "named {name}"); }
        Type::Array(elem, len) => {
            let _ = write!(out, "array ( ");
            write_type(out, elem);
            let _ = write!(out, " ) {len}");
        }
        Type::Pointer(inner) => {
            let _ = write!(out, "pointer ( ");
            write_type(out, inner);
            let _ = write!(out, " )");
        }
    }
}

fn write_field(out: &mut String, field: &Field) {
    let _ = write!(out, "  field {} type ", field.name);
    write_type(out, &field.ty);
    let _ = write!(out, " offset {} size {} align {}", field.offset, field.size, field.alignment);
    if let Some(bv) = field.bit_view {
        let _ = write!(out, " bitfield {} {} 0x{:x}", bv.bit_offset, bv.bit_width, bv.mask);
    }
    out.push_str(" ;\n");
}

/// Serialize every declaration currently in `registry` to the structured
/// text document format. Field offsets/sizes/alignments come from the
/// registry's computed [`crate::layout::Layout`] under `abi`, not the raw
/// AST (which carries zeroed layout results until a layout is requested).
pub fn serialize_registry(registry: &StructureRegistry, abi: &crate::abi::Abi) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "version {} {}", CURRENT_VERSION.major, CURRENT_VERSION.minor);

    let mut names = registry.names();
    names.sort();

    for name in names {
        match registry.get_decl(&name) {
            Some(Decl::Struct(s)) => {
                let layout = registry.get_layout(&name, abi);
                let (total_size, alignment, fields) = match &layout {
                    Ok(l) => (l.total_size, l.alignment, &l.fields),
                    Err(_) => (s.total_size, s.alignment, &s.fields),
                };
                let _ = writeln!(out, "struct {} pack {} size {} align {} {{", s.name, s.pack_value, total_size, alignment);
                for field in fields {
                    write_field(&mut out, field);
                }
                out.push_str("}\n");
            }
            Some(Decl::Union(u)) => {
                let layout = registry.get_layout(&name, abi);
                let (total_size, alignment, fields) = match &layout {
                    Ok(l) => (l.total_size, l.alignment, &l.fields),
                    Err(_) => (u.total_size, u.alignment, &u.members),
                };
                let _ = writeln!(out, "union {} size {} align {} {{", u.name, total_size, alignment);
                for member in fields {
                    write_field(&mut out, member);
                }
                out.push_str("}\n");
            }
            Some(Decl::Typedef(t)) => {
                out.push_str(&format!("typedef {} type ", t.name));
                write_type(&mut out, &t.underlying);
                out.push_str(" ;\n");
            }
            None => {}
        }
    }

    out
}

/// Parse a structured text document previously produced by
/// [`serialize_registry`] back into a fresh [`StructureRegistry`].
pub fn deserialize_registry(text: &str) -> Result<StructureRegistry, SerializeError> {
    let mut reader = Reader::new(text);
    let version = reader.read_version()?;
    if version.major != CURRENT_VERSION.major {
        return Err(SerializeError::UnsupportedVersion { found: version.major, expected: CURRENT_VERSION.major });
    }

    let registry = StructureRegistry::new();
    while !reader.at_eof() {
        let decl = reader.read_decl()?;
        registry.load_decl(decl).map_err(|e| SerializeError::Malformed { reason: e.to_string() })?;
    }
    Ok(registry)
}

struct Reader<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Reader<'src> {

    fn new(src: &'src str) -> Self {
        let tokens: Vec<_> = Lexer::new(src)
            .filter(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Comment))
            .collect();
        Self { tokens, pos: 0 }
    }

    fn at_eof(&self) -> bool {
        matches!(self.tokens.get(self.pos).map(|t| &t.kind), Some(TokenKind::Eof) | None)
    }

    fn peek_text(&self) -> &str {
        self.tokens.get(self.pos).map(|t| t.value_text).unwrap_or("")
    }

    fn next(&mut self) -> Result<&'src str, SerializeError> {
        let token = self.tokens.get(self.pos).ok_or_else(|| SerializeError::Malformed { reason: "unexpected end of document".into() })?;
        self.pos += 1;
        Ok(token.value_text)
    }

    fn expect(&mut self, text: &str) -> Result<(), SerializeError> {
        let found = self.next()?;
        if found != text {
            return Err(SerializeError::Malformed { reason: format!("expected '{text}', found '{found}'") });
        }
        Ok(())
    }

    fn next_u64(&mut self) -> Result<u64, SerializeError> {
        let text = self.next()?;
        parse_int(text).ok_or_else(|| SerializeError::Malformed { reason: format!("expected integer, found '{text}'") })
    }

    fn read_version(&mut self) -> Result<Version, SerializeError> {
        self.expect("version")?;
        let major = self.next_u64()? as u16;
        let minor = self.next_u64()? as u16;
        Ok(Version { major, minor })
    }

    fn read_type(&mut self) -> Result<Type, SerializeError> {
        let tag = self.next()?.to_string();
        match tag.as_str() {
            "primitive" => {
                let name = self.next()?;
                parse_primitive_name(name)
                    .map(Type::Primitive)
                    .ok_or_else(|| SerializeError::Malformed { reason: format!("unknown primitive '{name}'") })
            }
            "named" => Ok(Type::Named(self.next()?.to_string())),
            "array" => {
                self.expect("(")?;
                let elem = self.read_type()?;
                self.expect(")")?;
                let len = self.next_u64()? as u32;
                Ok(Type::Array(Box::new(elem), len))
            }
            "pointer" => {
                self.expect("(")?;
                let elem = self.read_type()?;
                self.expect(")")?;
                Ok(Type::Pointer(Box::new(elem)))
            }
            other => Err(SerializeError::Malformed { reason: format!("unknown type tag '{other}'") }),
        }
    }

    fn read_field(&mut self) -> Result<Field, SerializeError> {
        self.expect("field")?;
        let name = self.next()?.to_string();
        self.expect("type")?;
        let ty = self.read_type()?;
        self.expect("offset")?;
        let offset = self.next_u64()? as usize;
        self.expect("size")?;
        let size = self.next_u64()? as usize;
        self.expect("align")?;
        let alignment = self.next_u64()? as usize;

        let bit_view = if self.peek_text() == "bitfield" {
            self.next()?;
            let bit_offset = self.next_u64()? as u32;
            let bit_width = self.next_u64()? as u32;
            let mask = self.next_u64()?;
            Some(BitView { bit_offset, bit_width, mask })
        } else {
            None
        };

        self.expect(";")?;

        Ok(Field {
            name, ty, bit_width: bit_view.map(|b| b.bit_width),
            offset, size, alignment, bit_view,
            padding_before: 0, padding_after: 0,
        })
    }

    fn read_decl(&mut self) -> Result<Decl, SerializeError> {
        match self.peek_text() {
            "struct" => {
                self.next()?;
                let name = self.next()?.to_string();
                self.expect("pack")?;
                let pack_value = self.next_u64()? as u8;
                self.expect("size")?;
                let total_size = self.next_u64()? as usize;
                self.expect("align")?;
                let alignment = self.next_u64()? as usize;
                self.expect("{")?;
                let mut decl = StructDecl::new(name, pack_value, SourceSpan::default());
                decl.total_size = total_size;
                decl.alignment = alignment;
                while self.peek_text() != "}" {
                    decl.fields.push(self.read_field()?);
                }
                self.expect("}")?;
                Ok(Decl::Struct(decl))
            }
            "union" => {
                self.next()?;
                let name = self.next()?.to_string();
                self.expect("size")?;
                let total_size = self.next_u64()? as usize;
                self.expect("align")?;
                let alignment = self.next_u64()? as usize;
                self.expect("{")?;
                let mut decl = UnionDecl::new(name, SourceSpan::default());
                decl.total_size = total_size;
                decl.alignment = alignment;
                while self.peek_text() != "}" {
                    decl.members.push(self.read_field()?);
                }
                self.expect("}")?;
                Ok(Decl::Union(decl))
            }
            "typedef" => {
                self.next()?;
                let name = self.next()?.to_string();
                self.expect("type")?;
                let underlying = self.read_type()?;
                self.expect(";")?;
                Ok(Decl::Typedef(TypedefDecl { name, underlying, span: SourceSpan::default() }))
            }
            other => Err(SerializeError::Malformed { reason: format!("expected a declaration, found '{other}'") }),
        }
    }
}

fn parse_int(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Abi, Architecture, CompilerType};

    #[test]
    fn round_trip_preserves_layout_for_every_name() {
        let registry = StructureRegistry::new();
        registry.parse("struct P { unsigned a:3; unsigned b:5; int c; };\nunion U { int i; double d; };\ntypedef int MyInt;");

        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let before_p = registry.get_layout("P", &abi).unwrap();
        let before_u = registry.get_layout("U", &abi).unwrap();

        let text = serialize_registry(&registry, &abi);
        let restored = deserialize_registry(&text).unwrap();

        assert_eq!(restored.get_struct("P").unwrap().fields.len(), before_p.fields.len());
        assert_eq!(restored.get_union("U").unwrap().total_size, before_u.total_size);
        assert!(restored.get_decl("MyInt").is_some());
    }

    #[test]
    fn rejects_unrecognized_major_version() {
        let text = "version 99 0\n";
        let err = deserialize_registry(text).unwrap_err();
        assert!(matches!(err, SerializeError::UnsupportedVersion { found: 99, .. }));
    }

    #[test]
    fn writes_version_header_first() {
        let registry = StructureRegistry::new();
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let text = serialize_registry(&registry, &abi);
        assert!(text.starts_with("version 1 0"));
    }
}
