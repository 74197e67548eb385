//! Computes byte offsets, size, alignment and bit-offsets for a parsed
//! struct or union declaration, per a selected [`Abi`].
//!
//! The field placement algorithm and the bitfield allocation rules follow
//! spec.md §4.4 directly; the bitfield accumulator itself lives in
//! [`bitfield`], grounded on the original's `BitfieldHandler`.

pub mod bitfield;

use thiserror::Error;

use crate::abi::{Abi, BitfieldRule};
use crate::ast::{BitView, Field, PrimitiveKind, StructDecl, Type, UnionDecl};
use crate::util::align_up;

use bitfield::{BitfieldGroup, LayoutStatistics};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    #[error("unknown type reference '{name}'")]
    UnknownType { name: String },
    #[error("bitfield '{field}' width {width} exceeds base type size ({bits} bits)")]
    BitfieldWidthExceedsType { field: String, width: u32, bits: u32 },
    #[error("bitfield '{field}' must have a primitive base type")]
    NonPrimitiveBitfieldBase { field: String },
    #[error("impossible pack value {value}")]
    ImpossiblePackValue { value: u8 },
}

/// A fully laid-out struct or union: every field carries its final offset,
/// size, alignment and (if a bitfield) bit-view.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub fields: Vec<Field>,
    pub total_size: usize,
    pub alignment: usize,
    pub stats: LayoutStatistics,
}

/// Resolves a named, non-primitive type to its `(size, alignment)`, as
/// already computed by the registry for a previously laid-out declaration.
pub trait TypeResolver {
    fn resolve(&self, name: &str) -> Option<(usize, usize)>;
}

impl<F: Fn(&str) -> Option<(usize, usize)>> TypeResolver for F {
    fn resolve(&self, name: &str) -> Option<(usize, usize)> {
        self(name)
    }
}

/// `(size, alignment)` for any [`Type`] under `abi`, the single function
/// the crate-level design note calls for instead of per-variant visitors.
pub fn describe_type(ty: &Type, abi: &Abi, resolver: &dyn TypeResolver) -> Result<(usize, usize), LayoutError> {
    match ty {
        Type::Primitive(kind) => Ok(abi.primitive_layout(*kind)),
        Type::Named(name) => resolver.resolve(name).ok_or_else(|| LayoutError::UnknownType { name: name.clone() }),
        Type::Array(elem, length) => {
            let (elem_size, elem_align) = describe_type(elem, abi, resolver)?;
            Ok((elem_size * (*length as usize), elem_align))
        }
        Type::Pointer(_) => Ok((abi.pointer_size(), abi.pointer_size())),
    }
}

/// Compute the layout of a struct: non-bitfield fields follow the
/// sequential placement algorithm, runs of bitfields coalesce into storage
/// units per `abi.bitfield_rule()`.
pub fn compute_struct(decl: &StructDecl, abi: &Abi, resolver: &dyn TypeResolver) -> Result<Layout, LayoutError> {
    if ![1u8, 2, 4, 8, 16].contains(&decl.pack_value) {
        return Err(LayoutError::ImpossiblePackValue { value: decl.pack_value });
    }

    let mut fields = Vec::with_capacity(decl.fields.len());
    let mut current_offset = 0usize;
    let mut struct_align = 1usize;
    let mut active_group: Option<BitfieldGroup> = None;
    let mut forced_align: Option<usize> = None;
    let mut stats = LayoutStatistics::default();
    let mut seen_groups = 0usize;

    for field in &decl.fields {
        let mut field = field.clone();

        if let Some(width) = field.bit_width {
            let kind = match &field.ty {
                Type::Primitive(k) => *k,
                _ => return Err(LayoutError::NonPrimitiveBitfieldBase { field: field.name.clone() }),
            };
            let (unit_size, unit_align) = abi.primitive_layout(kind);
            let unit_bits = unit_size as u32 * 8;
            if width > unit_bits {
                return Err(LayoutError::BitfieldWidthExceedsType { field: field.name.clone(), width, bits: unit_bits });
            }

            if width == 0 {
                // Zero-width: close the current group, and on GCC/Clang
                // force the next bitfield to realign to this type's
                // boundary; MSVC simply starts an ordinary new unit.
                active_group = None;
                forced_align = Some(unit_align);
                field.offset = current_offset;
                field.size = 0;
                field.alignment = unit_align;
                fields.push(field);
                continue;
            }

            let fits_current = match (&active_group, abi.bitfield_rule()) {
                (Some(g), BitfieldRule::Msvc) => forced_align.is_none() && g.base_kind == kind && g.can_fit(width),
                (Some(g), BitfieldRule::GccClang) => forced_align.is_none() && g.can_fit(width),
                (None, _) => false,
            };

            if fits_current {
                let group = active_group.as_mut().unwrap();
                let bit_offset = group.used_bits;
                group.used_bits += width;
                field.offset = group.unit_offset;
                field.size = group.unit_size;
                field.alignment = unit_align;
                field.bit_view = Some(BitView { bit_offset, bit_width: width, mask: bitfield_mask(bit_offset, width) });
            } else {
                let align = forced_align.take().unwrap_or(unit_align).min(decl.pack_value as usize).max(1);
                let unit_offset = align_up(current_offset, align);
                field.padding_before = unit_offset - current_offset;
                current_offset = unit_offset + unit_size;
                struct_align = struct_align.max(align);
                active_group = Some(BitfieldGroup { unit_offset, unit_size, base_kind: kind, used_bits: width });
                seen_groups += 1;
                field.offset = unit_offset;
                field.size = unit_size;
                field.alignment = align;
                field.bit_view = Some(BitView { bit_offset: 0, bit_width: width, mask: bitfield_mask(0, width) });
            }

            stats.used_bits += width as u64;
            fields.push(field);
            continue;
        }

        // Non-bitfield field: close any open bitfield run first.
        active_group = None;
        forced_align = None;

        let (natural_size, natural_align) = describe_type(&field.ty, abi, resolver)?;
        let field_align = natural_align.min(decl.pack_value as usize).max(1);
        let field_offset = align_up(current_offset, field_align);
        field.padding_before = field_offset - current_offset;
        current_offset = field_offset + natural_size;
        struct_align = struct_align.max(field_align);

        field.offset = field_offset;
        field.size = natural_size;
        field.alignment = field_align;
        fields.push(field);
        continue;
    }

    stats.total_groups = seen_groups;
    stats.allocated_bits = fields.iter()
        .filter(|f| f.bit_view.is_some())
        .map(|f| (f.offset, f.size))
        .collect::<std::collections::BTreeSet<_>>()
        .iter()
        .map(|(_, size)| *size as u64 * 8)
        .sum();

    let total_size = if decl.pack_value == 1 {
        current_offset
    } else {
        align_up(current_offset, struct_align)
    };

    if let Some(last) = fields.last_mut() {
        last.padding_after = total_size.saturating_sub(last.offset + last.size);
    }

    Ok(Layout { fields, total_size, alignment: struct_align, stats })
}

/// Union layout: every member at offset 0; size and alignment are the max
/// across members; no tail padding beyond alignment.
pub fn compute_union(decl: &UnionDecl, abi: &Abi, resolver: &dyn TypeResolver) -> Result<Layout, LayoutError> {
    let mut fields = Vec::with_capacity(decl.members.len());
    let mut total_size = 0usize;
    let mut alignment = 1usize;

    for member in &decl.members {
        let mut member = member.clone();
        let (size, align) = describe_type(&member.ty, abi, resolver)?;
        member.offset = 0;
        member.size = size;
        member.alignment = align;
        total_size = total_size.max(size);
        alignment = alignment.max(align);
        fields.push(member);
    }

    total_size = align_up(total_size, alignment.max(1));

    Ok(Layout { fields, total_size, alignment, stats: LayoutStatistics::default() })
}

#[inline]
fn bitfield_mask(bit_offset: u32, bit_width: u32) -> u64 {
    if bit_width >= 64 {
        u64::MAX
    } else {
        ((1u64 << bit_width) - 1) << bit_offset
    }
}

/// One step resolved while walking a field path such as `a.b[3].c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldPathResult {
    pub offset: usize,
    pub size: usize,
    pub bit_offset: Option<u32>,
    pub bit_width: Option<u32>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FieldPathError {
    #[error("no field named '{name}' at this point in the path")]
    UnknownField { name: String },
    #[error("array index {index} out of range (length {length})")]
    IndexOutOfRange { index: u32, length: u32 },
    #[error("'{name}' is not an array, cannot index it")]
    NotAnArray { name: String },
    #[error("'{name}' is not a struct or union, path cannot continue through it")]
    NotAggregate { name: String },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

struct PathSegment<'a> {
    name: &'a str,
    index: Option<u32>,
}

fn parse_path_segments(path: &str) -> Vec<PathSegment<'_>> {
    path.split('.').map(|part| {
        if let Some(bracket) = part.find('[') {
            let name = &part[..bracket];
            let index_str = &part[bracket + 1..part.len() - 1];
            PathSegment { name, index: index_str.parse().ok() }
        } else {
            PathSegment { name: part, index: None }
        }
    }).collect()
}

/// Walk `path` (e.g. `"a.b[3].c"`) from `root`, resolving named aggregate
/// types along the way via `resolve_layout`.
pub fn resolve_field_path(
    root: &Layout,
    path: &str,
    abi: &Abi,
    type_resolver: &dyn TypeResolver,
    layout_resolver: &dyn Fn(&str) -> Option<Layout>,
) -> Result<FieldPathResult, FieldPathError> {
    let segments = parse_path_segments(path);
    let mut current = root.clone();
    let mut base_offset = 0usize;

    for (i, seg) in segments.iter().enumerate() {
        let field = current.fields.iter()
            .find(|f| f.name == seg.name)
            .ok_or_else(|| FieldPathError::UnknownField { name: seg.name.to_string() })?;

        let mut offset = base_offset + field.offset;
        let mut size = field.size;
        let mut bit_offset = field.bit_view.map(|b| b.bit_offset);
        let mut bit_width = field.bit_view.map(|b| b.bit_width);
        let mut elem_ty = field.ty.clone();

        if let Some(index) = seg.index {
            let Type::Array(elem, length) = &field.ty else {
                return Err(FieldPathError::NotAnArray { name: seg.name.to_string() });
            };
            if *length != 0 && index >= *length {
                return Err(FieldPathError::IndexOutOfRange { index, length: *length });
            }
            let (elem_size, _) = describe_type(elem, abi, type_resolver)?;
            offset = base_offset + field.offset + index as usize * elem_size;
            size = elem_size;
            bit_offset = None;
            bit_width = None;
            elem_ty = (**elem).clone();
        }

        if i + 1 == segments.len() {
            return Ok(FieldPathResult { offset, size, bit_offset, bit_width });
        }

        base_offset = offset;
        let name = match &elem_ty {
            Type::Named(n) => n.clone(),
            _ => return Err(FieldPathError::NotAggregate { name: seg.name.to_string() }),
        };
        current = layout_resolver(&name).ok_or_else(|| FieldPathError::UnknownField { name })?;
    }

    Err(FieldPathError::UnknownField { name: path.to_string() })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Architecture, CompilerType};
    use crate::ast::{Field, SourceSpan};

    fn no_named(_name: &str) -> Option<(usize, usize)> { None }

    #[test]
    fn packed_layout_matches_scenario_one() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = StructDecl::new("P".into(), 1, SourceSpan::default());
        decl.fields.push(Field::unlaidout("a".into(), Type::Primitive(PrimitiveKind::Char), None));
        decl.fields.push(Field::unlaidout("b".into(), Type::Primitive(PrimitiveKind::Int), None));
        decl.fields.push(Field::unlaidout("c".into(), Type::Primitive(PrimitiveKind::Char), None));

        let layout = compute_struct(&decl, &abi, &no_named).unwrap();
        assert_eq!(layout.total_size, 6);
        assert_eq!(layout.alignment, 1);
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 1);
        assert_eq!(layout.fields[1].size, 4);
        assert_eq!(layout.fields[2].offset, 5);
    }

    #[test]
    fn natural_layout_matches_scenario_two() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = StructDecl::new("N".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("a".into(), Type::Primitive(PrimitiveKind::Char), None));
        decl.fields.push(Field::unlaidout("b".into(), Type::Primitive(PrimitiveKind::Int), None));
        decl.fields.push(Field::unlaidout("c".into(), Type::Primitive(PrimitiveKind::Char), None));

        let layout = compute_struct(&decl, &abi, &no_named).unwrap();
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 4);
        assert_eq!(layout.fields[1].padding_before, 3);
        assert_eq!(layout.fields[2].offset, 8);
        assert_eq!(layout.total_size, 12);
        assert_eq!(layout.alignment, 4);
    }

    #[test]
    fn bitfield_packing_matches_scenario_three() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = StructDecl::new("B".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("a".into(), Type::Primitive(PrimitiveKind::UnsignedInt), Some(3)));
        decl.fields.push(Field::unlaidout("b".into(), Type::Primitive(PrimitiveKind::UnsignedInt), Some(5)));
        decl.fields.push(Field::unlaidout("c".into(), Type::Primitive(PrimitiveKind::UnsignedInt), Some(25)));

        let layout = compute_struct(&decl, &abi, &no_named).unwrap();
        let a = &layout.fields[0];
        let b = &layout.fields[1];
        let c = &layout.fields[2];
        assert_eq!(a.bit_view.unwrap().bit_offset, 0);
        assert_eq!(a.bit_view.unwrap().bit_width, 3);
        assert_eq!(b.bit_view.unwrap().bit_offset, 3);
        assert_eq!(b.bit_view.unwrap().bit_width, 5);
        assert_eq!(c.offset, 4);
        assert_eq!(c.bit_view.unwrap().bit_offset, 0);
        assert_eq!(c.bit_view.unwrap().bit_width, 25);
        assert_eq!(layout.total_size, 8);
        assert_eq!(layout.alignment, 4);
    }

    #[test]
    fn union_layout_takes_max_size_and_alignment() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = UnionDecl::new("U".into(), SourceSpan::default());
        decl.members.push(Field::unlaidout("i".into(), Type::Primitive(PrimitiveKind::Int), None));
        decl.members.push(Field::unlaidout("d".into(), Type::Primitive(PrimitiveKind::Double), None));

        let layout = compute_union(&decl, &abi, &no_named).unwrap();
        assert_eq!(layout.total_size, 8);
        assert_eq!(layout.alignment, 8);
        assert!(layout.fields.iter().all(|f| f.offset == 0));
    }

    #[test]
    fn unknown_named_type_is_an_error() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = StructDecl::new("S".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("x".into(), Type::Named("Missing".into()), None));
        let err = compute_struct(&decl, &abi, &no_named).unwrap_err();
        assert!(matches!(err, LayoutError::UnknownType { .. }));
    }

    #[test]
    fn field_path_resolves_through_array_index() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = StructDecl::new("P".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("items".into(), Type::Array(Box::new(Type::Primitive(PrimitiveKind::Int)), 10), None));
        let layout = compute_struct(&decl, &abi, &no_named).unwrap();

        let result = resolve_field_path(&layout, "items[3]", &abi, &no_named, &|_| None).unwrap();
        assert_eq!(result.offset, 12);
        assert_eq!(result.size, 4);
    }

    #[test]
    fn field_path_rejects_out_of_range_index() {
        let abi = Abi::new(CompilerType::Gcc, Architecture::X64);
        let mut decl = StructDecl::new("P".into(), 8, SourceSpan::default());
        decl.fields.push(Field::unlaidout("items".into(), Type::Array(Box::new(Type::Primitive(PrimitiveKind::Int)), 4), None));
        let layout = compute_struct(&decl, &abi, &no_named).unwrap();

        let err = resolve_field_path(&layout, "items[9]", &abi, &no_named, &|_| None).unwrap_err();
        assert!(matches!(err, FieldPathError::IndexOutOfRange { .. }));
    }
}
