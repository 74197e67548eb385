//! Abstract syntax produced by the parser: the `Type` sum type and the
//! struct/union/typedef declarations that reference it.
//!
//! `Type` is a tagged variant rather than a class hierarchy per field —
//! see the crate-level design note on replacing the source's visitor
//! pattern with a single function switching on the variant.

use smallvec::SmallVec;

/// The primitive kinds the layout engine knows the ABI-dependent size of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Void,
    Bool,
    Char,
    SignedChar,
    UnsignedChar,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    LongLong,
    UnsignedLongLong,
    Float,
    Double,
    LongDouble,
}

/// A type reference as written in source: primitive, a name resolved later
/// against the registry, an array, or a pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Primitive(PrimitiveKind),
    /// Reference to a user-defined struct, union or typedef by name.
    Named(String),
    /// `length == 0` denotes a flexible (incomplete) array member.
    Array(Box<Type>, u32),
    Pointer(Box<Type>),
}

impl Type {
    /// Names of user-defined types this type directly mentions, used to
    /// build the registry's dependency graph. Pointer targets are included
    /// too: the graph records the edge even though pointer cycles are
    /// allowed (see the registry's cycle check).
    pub fn referenced_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Type::Primitive(_) => {}
            Type::Named(name) => out.push(name),
            Type::Array(elem, _) => elem.referenced_names(out),
            Type::Pointer(inner) => inner.referenced_names(out),
        }
    }

    /// True if this type (directly, not through a pointer) is a reference
    /// to another declaration — used to detect by-value cycles.
    pub fn is_by_value_reference(&self) -> bool {
        matches!(self, Type::Named(_) | Type::Array(_, _))
    }

    /// Like [`Self::referenced_names`] but never descends into a
    /// [`Type::Pointer`]: a pointer member's size comes from `abi.pointer_size()`
    /// regardless of what it points to, so the pointee is never a by-value
    /// dependency and must not participate in cycle detection or eager
    /// layout resolution (a self-referential `struct Node { Node *next; };`
    /// is legal, spec.md §4.5).
    pub fn by_value_referenced_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Type::Primitive(_) => {}
            Type::Named(name) => out.push(name),
            Type::Array(elem, _) => elem.by_value_referenced_names(out),
            Type::Pointer(_) => {}
        }
    }
}

/// A bitfield's bit-level placement within its storage unit, filled in by
/// the layout engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitView {
    pub bit_offset: u32,
    pub bit_width: u32,
    pub mask: u64,
}

/// One field of a struct or union, before and after layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    /// `Some(width)` if declared as `name : width`.
    pub bit_width: Option<u32>,

    // Layout results, absent until the layout engine has run.
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub bit_view: Option<BitView>,
    pub padding_before: usize,
    pub padding_after: usize,
}

impl Field {
    /// A field as produced by the parser, with layout results zeroed until
    /// the layout engine fills them in.
    pub fn unlaidout(name: String, ty: Type, bit_width: Option<u32>) -> Self {
        Self {
            name, ty, bit_width,
            offset: 0, size: 0, alignment: 1, bit_view: None,
            padding_before: 0, padding_after: 0,
        }
    }
}

/// Source location of a declaration or diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub line: u32,
    pub column: u32,
}

/// A parsed `struct`, with fields in declaration order and any computed
/// layout filled in once the layout engine has processed it.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<Field>,
    pub is_packed: bool,
    pub pack_value: u8,
    pub total_size: usize,
    pub alignment: usize,
    pub span: SourceSpan,
}

impl StructDecl {
    pub fn new(name: String, pack_value: u8, span: SourceSpan) -> Self {
        Self {
            name, fields: Vec::new(), is_packed: pack_value < 8, pack_value,
            total_size: 0, alignment: 1, span,
        }
    }

    /// User-defined type names referenced by any field, used to build the
    /// dependency graph entry for this declaration.
    pub fn dependencies(&self) -> SmallVec<[String; 4]> {
        let mut names = Vec::new();
        for field in &self.fields {
            field.ty.referenced_names(&mut names);
        }
        names.into_iter().map(str::to_string).collect()
    }

    /// Subset of [`Self::dependencies`] that must be laid out before this
    /// declaration and whose absence is a cyclic-reference error.
    pub fn by_value_dependencies(&self) -> SmallVec<[String; 4]> {
        let mut names = Vec::new();
        for field in &self.fields {
            field.ty.by_value_referenced_names(&mut names);
        }
        names.into_iter().map(str::to_string).collect()
    }
}

/// A parsed `union`: members all share offset 0.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionDecl {
    pub name: String,
    pub members: Vec<Field>,
    pub total_size: usize,
    pub alignment: usize,
    pub span: SourceSpan,
}

impl UnionDecl {
    pub fn new(name: String, span: SourceSpan) -> Self {
        Self { name, members: Vec::new(), total_size: 0, alignment: 1, span }
    }

    pub fn dependencies(&self) -> SmallVec<[String; 4]> {
        let mut names = Vec::new();
        for member in &self.members {
            member.ty.referenced_names(&mut names);
        }
        names.into_iter().map(str::to_string).collect()
    }

    pub fn by_value_dependencies(&self) -> SmallVec<[String; 4]> {
        let mut names = Vec::new();
        for member in &self.members {
            member.ty.by_value_referenced_names(&mut names);
        }
        names.into_iter().map(str::to_string).collect()
    }
}

/// A parsed `typedef name` -> underlying type alias.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedefDecl {
    pub name: String,
    pub underlying: Type,
    pub span: SourceSpan,
}

impl TypedefDecl {
    pub fn dependencies(&self) -> SmallVec<[String; 4]> {
        let mut names = Vec::new();
        self.underlying.referenced_names(&mut names);
        names.into_iter().map(str::to_string).collect()
    }

    pub fn by_value_dependencies(&self) -> SmallVec<[String; 4]> {
        let mut names = Vec::new();
        self.underlying.by_value_referenced_names(&mut names);
        names.into_iter().map(str::to_string).collect()
    }
}

/// A top-level declaration, as produced by the parser before layout.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Struct(StructDecl),
    Union(UnionDecl),
    Typedef(TypedefDecl),
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Decl::Struct(s) => &s.name,
            Decl::Union(u) => &u.name,
            Decl::Typedef(t) => &t.name,
        }
    }

    pub fn dependencies(&self) -> SmallVec<[String; 4]> {
        match self {
            Decl::Struct(s) => s.dependencies(),
            Decl::Union(u) => u.dependencies(),
            Decl::Typedef(t) => t.dependencies(),
        }
    }

    /// By-value-only dependencies: the set that must be laid out before
    /// this declaration and that participates in cycle detection.
    pub fn by_value_dependencies(&self) -> SmallVec<[String; 4]> {
        match self {
            Decl::Struct(s) => s.by_value_dependencies(),
            Decl::Union(u) => u.by_value_dependencies(),
            Decl::Typedef(t) => t.by_value_dependencies(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_names_walks_through_arrays_and_pointers() {
        let ty = Type::Pointer(Box::new(Type::Array(Box::new(Type::Named("Foo".into())), 4)));
        let mut names = Vec::new();
        ty.referenced_names(&mut names);
        assert_eq!(names, vec!["Foo"]);
    }

    #[test]
    fn struct_dependencies_collect_named_field_types() {
        let mut decl = StructDecl::new("S".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("a".into(), Type::Named("Inner".into()), None));
        decl.fields.push(Field::unlaidout("b".into(), Type::Primitive(PrimitiveKind::Int), None));
        assert_eq!(decl.dependencies().as_slice(), ["Inner".to_string()]);
    }

    #[test]
    fn by_value_reference_detection() {
        assert!(Type::Named("X".into()).is_by_value_reference());
        assert!(!Type::Pointer(Box::new(Type::Named("X".into()))).is_by_value_reference());
    }

    #[test]
    fn by_value_dependencies_exclude_pointer_targets() {
        let mut decl = StructDecl::new("Node".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("next".into(), Type::Pointer(Box::new(Type::Named("Node".into()))), None));
        decl.fields.push(Field::unlaidout("value".into(), Type::Primitive(PrimitiveKind::Int), None));
        assert!(decl.by_value_dependencies().is_empty());
        assert_eq!(decl.dependencies().as_slice(), ["Node".to_string()]);
    }
}
