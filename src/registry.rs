//! Owns every parsed declaration, the dependency graph between them, and a
//! layout cache, behind a single [`RwLock`] — read-mostly, matching the
//! concurrency model's "queries take a shared lock" rule.
//!
//! The interned handle ([`Ty`]) mirrors the bootstrap model's `TySystem`:
//! non-negative indices point into a backing `Vec`, negative indices are
//! reserved for builtins (unused today — every primitive is described
//! directly by [`crate::abi::Abi`] rather than interned — but kept so the
//! handle space matches the pattern this was learned from).

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use crate::abi::{Abi, Architecture, CompilerType};
use crate::ast::{Decl, StructDecl, Type, TypedefDecl, UnionDecl};
use crate::layout::{self, FieldPathError, FieldPathResult, Layout, LayoutError, TypeResolver};
use crate::parser::{ParseError, ParseWarning, Parser};
use crate::preprocessor::{Preprocessor, PreprocessorError};

/// A handle into the registry's declaration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ty(pub isize);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("a declaration named '{name}' already exists")]
    DuplicateDeclaration { name: String },
    #[error("no declaration named '{name}'")]
    UnknownDeclaration { name: String },
    #[error("'{name}' depends on missing declaration '{missing}'")]
    DanglingDependency { name: String, missing: String },
    #[error("cyclic by-value dependency detected involving '{name}'")]
    CyclicByValueDependency { name: String },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    FieldPath(#[from] FieldPathError),
}

/// Outcome of a single [`StructureRegistry::parse`] call.
#[derive(Debug, Clone, Default)]
pub struct RegistryParseResult {
    pub inserted: Vec<String>,
    pub parse_errors: Vec<ParseError>,
    pub parse_warnings: Vec<ParseWarning>,
    pub preprocessor_errors: Vec<PreprocessorError>,
    pub registry_errors: Vec<RegistryError>,
}

fn abi_key(abi: &Abi) -> u8 {
    let compiler = match abi.compiler { CompilerType::Msvc => 0u8, CompilerType::Gcc => 1, CompilerType::Clang => 2 };
    let arch = match abi.arch { Architecture::X86 => 0u8, Architecture::X64 => 1, Architecture::Arm32 => 2, Architecture::Arm64 => 3 };
    compiler << 4 | arch
}

fn hash_decl(decl: &Decl) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    format!("{decl:?}").hash(&mut hasher);
    hasher.finish()
}

type CacheKey = (String, u64, u8);

/// Small LRU cache of computed layouts, keyed by `(struct_name, source_hash,
/// abi_key)`, evicted on capacity overflow or explicit invalidation.
struct LayoutCache {
    capacity: usize,
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, Layout>,
}

impl LayoutCache {
    fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), entries: HashMap::new() }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Layout> {
        if self.entries.contains_key(key) {
            self.touch(key);
            self.entries.get(key).cloned()
        } else {
            None
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).unwrap();
            self.order.push_back(k);
        }
    }

    fn insert(&mut self, key: CacheKey, layout: Layout) {
        if !self.entries.contains_key(&key) {
            if self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            self.order.push_back(key.clone());
        } else {
            self.touch(&key);
        }
        self.entries.insert(key, layout);
    }

    fn evict_name(&mut self, name: &str) {
        let stale: Vec<CacheKey> = self.entries.keys().filter(|k| k.0 == name).cloned().collect();
        for key in stale {
            self.entries.remove(&key);
            if let Some(pos) = self.order.iter().position(|k| k == &key) {
                self.order.remove(pos);
            }
        }
    }
}

struct Inner {
    decls: HashMap<String, Decl>,
    source_hash: HashMap<String, u64>,
    /// Full reference graph (includes pointer targets) — used for
    /// `dependencies`/`dependents` queries and cache invalidation.
    deps: HashMap<String, HashSet<String>>,
    rdeps: HashMap<String, HashSet<String>>,
    /// By-value-only subgraph — used for cycle detection and the order in
    /// which `layout_of` must resolve its dependencies before itself.
    by_value_deps: HashMap<String, HashSet<String>>,
    layout_cache: LayoutCache,
}

impl Inner {
    fn new(cache_capacity: usize) -> Self {
        Self {
            decls: HashMap::new(),
            source_hash: HashMap::new(),
            deps: HashMap::new(),
            rdeps: HashMap::new(),
            by_value_deps: HashMap::new(),
            layout_cache: LayoutCache::new(cache_capacity),
        }
    }

    fn insert_decl(&mut self, decl: Decl) -> Result<(), RegistryError> {
        let name = decl.name().to_string();
        if self.decls.contains_key(&name) {
            return Err(RegistryError::DuplicateDeclaration { name });
        }
        let deps: HashSet<String> = decl.dependencies().into_iter().collect();
        let by_value_deps: HashSet<String> = decl.by_value_dependencies().into_iter().collect();
        self.source_hash.insert(name.clone(), hash_decl(&decl));
        for dep in &deps {
            self.rdeps.entry(dep.clone()).or_default().insert(name.clone());
        }
        self.deps.insert(name.clone(), deps);
        self.by_value_deps.insert(name.clone(), by_value_deps);
        self.decls.insert(name, decl);
        Ok(())
    }

    fn evict_dependents(&mut self, name: &str) {
        self.layout_cache.evict_name(name);
        let dependents: Vec<String> = self.rdeps.get(name).cloned().unwrap_or_default().into_iter().collect();
        for dependent in dependents {
            self.evict_dependents(&dependent);
        }
    }

    fn layout_of(&mut self, name: &str, abi: &Abi, visiting: &mut HashSet<String>) -> Result<Layout, RegistryError> {
        if !visiting.insert(name.to_string()) {
            return Err(RegistryError::CyclicByValueDependency { name: name.to_string() });
        }

        let decl = self.decls.get(name).cloned().ok_or_else(|| RegistryError::UnknownDeclaration { name: name.to_string() })?;
        let hash = *self.source_hash.get(name).unwrap_or(&0);
        let key = (name.to_string(), hash, abi_key(abi));

        if let Some(cached) = self.layout_cache.get(&key) {
            visiting.remove(name);
            return Ok(cached);
        }

        // Resolve by-value dependencies first (populating the cache) so the
        // resolver below, which only reads already-cached facts, can see
        // them without needing to recurse through a shared borrow of self.
        // Pointer-only references are skipped here: their pointee's layout
        // is never needed (pointer size is ABI-fixed), and recursing into
        // them would turn a legal pointer-mediated self/mutual reference
        // into a false cyclic-dependency error.
        for dep in decl.by_value_dependencies() {
            if self.decls.contains_key(&dep) {
                self.layout_of(&dep, abi, visiting)?;
            }
        }

        let layout = match &decl {
            Decl::Struct(s) => {
                let resolver = self.resolver(abi, visiting);
                layout::compute_struct(s, abi, &resolver)?
            }
            Decl::Union(u) => {
                let resolver = self.resolver(abi, visiting);
                layout::compute_union(u, abi, &resolver)?
            }
            Decl::Typedef(t) => self.typedef_layout(t, abi, visiting)?,
        };

        self.layout_cache.insert(key, layout.clone());
        visiting.remove(name);
        Ok(layout)
    }

    fn typedef_layout(&mut self, t: &TypedefDecl, abi: &Abi, visiting: &mut HashSet<String>) -> Result<Layout, RegistryError> {
        let (size, align) = match &t.underlying {
            Type::Named(name) => {
                let inner = self.layout_of(name, abi, visiting)?;
                (inner.total_size, inner.alignment)
            }
            other => layout::describe_type(other, abi, &self.resolver(abi, visiting))?,
        };
        Ok(Layout { fields: Vec::new(), total_size: size, alignment: align, stats: Default::default() })
    }

    /// A [`TypeResolver`] closure that cannot itself recurse through
    /// `&mut self` (borrow-checker), so it only resolves already-cached
    /// or zero-cost lookups; true recursive resolution happens through
    /// [`Self::layout_of`] directly for struct/union members.
    fn resolver<'a>(&'a self, abi: &'a Abi, _visiting: &'a HashSet<String>) -> impl TypeResolver + 'a {
        move |name: &str| -> Option<(usize, usize)> {
            // Only resolves names whose layout has already been cached by
            // the by-value-dependency pre-pass in `layout_of` (i.e.
            // already-frozen structural facts, struct/union/typedef alike);
            // falling back to a conservative pointer-sized guess is never
            // done: unresolved names are a hard error surfaced by
            // `compute_struct`/`compute_union`.
            self.decls.get(name)?;
            let hash = *self.source_hash.get(name).unwrap_or(&0);
            let key = (name.to_string(), hash, abi_key(abi));
            self.layout_cache.entries.get(&key).map(|l| (l.total_size, l.alignment))
        }
    }
}

/// Owns all parsed declarations, their dependency graph, and a layout
/// cache. Query operations take a shared lock; `parse`/`remove` take an
/// exclusive one, which also serializes concurrent parses.
pub struct StructureRegistry {
    inner: RwLock<Inner>,
}

impl Default for StructureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureRegistry {

    pub fn new() -> Self {
        Self::with_cache_capacity(1000)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self { inner: RwLock::new(Inner::new(capacity)) }
    }

    /// Drives lexer → preprocessor → parser → insertion for `source`. Each
    /// struct's `#pragma pack` value is whatever was active in the source at
    /// the point it was declared, tracked by the parser as it drains the
    /// preprocessor's token stream.
    /// At most one parse runs at a time because it takes the write lock
    /// for its whole duration.
    pub fn parse(&self, source: &str) -> RegistryParseResult {
        let pp = Preprocessor::new(source);
        let (parser, preprocessor_errors) = Parser::from_preprocessor(pp);
        let parse_result = parser.parse();

        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut result = RegistryParseResult {
            parse_errors: parse_result.errors,
            parse_warnings: parse_result.warnings,
            preprocessor_errors,
            ..Default::default()
        };

        for decl in parse_result.decls {
            let name = decl.name().to_string();
            if has_by_value_cycle(&decl) {
                result.registry_errors.push(RegistryError::CyclicByValueDependency { name });
                continue;
            }
            match inner.insert_decl(decl) {
                Ok(()) => result.inserted.push(name),
                Err(e) => result.registry_errors.push(e),
            }
        }

        debug!(inserted = result.inserted.len(), "registry parse complete");
        result
    }

    /// Insert a declaration built outside of `parse` (e.g. by the
    /// serialization reader) directly into the registry.
    pub fn load_decl(&self, decl: Decl) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.insert_decl(decl)
    }

    /// All declaration names currently held by the registry.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.decls.keys().cloned().collect()
    }

    pub fn get_struct(&self, name: &str) -> Option<StructDecl> {
        let inner = self.inner.read().expect("registry lock poisoned");
        match inner.decls.get(name)? {
            Decl::Struct(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_union(&self, name: &str) -> Option<UnionDecl> {
        let inner = self.inner.read().expect("registry lock poisoned");
        match inner.decls.get(name)? {
            Decl::Union(u) => Some(u.clone()),
            _ => None,
        }
    }

    pub fn get_decl(&self, name: &str) -> Option<Decl> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.decls.get(name).cloned()
    }

    pub fn get_layout(&self, name: &str, abi: &Abi) -> Result<Layout, RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut visiting = HashSet::new();
        inner.layout_of(name, abi, &mut visiting)
    }

    pub fn size_of(&self, name: &str, abi: &Abi) -> Result<usize, RegistryError> {
        Ok(self.get_layout(name, abi)?.total_size)
    }

    pub fn offset_of(&self, name: &str, field_path: &str, abi: &Abi) -> Result<FieldPathResult, RegistryError> {
        let root = self.get_layout(name, abi)?;
        let type_resolver = |n: &str| -> Option<(usize, usize)> {
            self.get_layout(n, abi).ok().map(|l| (l.total_size, l.alignment))
        };
        let layout_resolver = |n: &str| -> Option<Layout> {
            self.get_layout(n, abi).ok()
        };
        Ok(layout::resolve_field_path(&root, field_path, abi, &type_resolver, &layout_resolver)?)
    }

    pub fn validate_field_path(&self, name: &str, field_path: &str, abi: &Abi) -> bool {
        self.offset_of(name, field_path, abi).is_ok()
    }

    /// Remove a declaration, evicting the layout cache for it and every
    /// transitive dependent. Dependents still referencing the removed name
    /// become dangling until [`Self::validate`] is consulted.
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.decls.remove(name).is_none() {
            return Err(RegistryError::UnknownDeclaration { name: name.to_string() });
        }
        inner.deps.remove(name);
        inner.by_value_deps.remove(name);
        inner.evict_dependents(name);
        Ok(())
    }

    pub fn dependencies(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.deps.get(name).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn dependents(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.rdeps.get(name).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Names with a dependency no longer present in the registry.
    pub fn validate(&self) -> Vec<RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut errors = Vec::new();
        for (name, deps) in &inner.deps {
            for dep in deps {
                if !inner.decls.contains_key(dep) {
                    errors.push(RegistryError::DanglingDependency { name: name.clone(), missing: dep.clone() });
                }
            }
        }
        errors
    }

    pub fn has_cycles(&self) -> bool {
        self.topological_order().is_err()
    }

    /// Kahn's algorithm over the by-value dependency subgraph, returning
    /// names in dependency-first order (a name's by-value dependencies all
    /// precede it). Pointer-only references never produce an edge needing
    /// ordering here, so a pointer-mediated cycle (e.g. a linked-list
    /// `next` pointer) never trips this check, matching spec.md §4.5's
    /// "cycles are allowed only through pointer types".
    pub fn topological_order(&self) -> Result<Vec<String>, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut in_degree: HashMap<&str, usize> = inner.decls.keys().map(|n| (n.as_str(), 0)).collect();
        let mut rdeps_by_value: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, deps) in &inner.by_value_deps {
            for dep in deps {
                if let Some(count) = in_degree.get_mut(name.as_str()) {
                    *count += 1;
                }
                if inner.decls.contains_key(dep.as_str()) {
                    rdeps_by_value.entry(dep.as_str()).or_default().push(name.as_str());
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree.iter().filter(|(_, c)| **c == 0).map(|(n, _)| *n).collect();
        let mut order = Vec::new();

        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            if let Some(dependents) = rdeps_by_value.get(name) {
                for dependent in dependents {
                    if let Some(count) = in_degree.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if order.len() != inner.decls.len() {
            return Err(RegistryError::CyclicByValueDependency { name: "<graph>".to_string() });
        }
        Ok(order)
    }
}

fn has_by_value_cycle(decl: &Decl) -> bool {
    // A single declaration directly referencing its own name by value is
    // the only cycle detectable before insertion; multi-node cycles are
    // caught later by `topological_order`. Pointer self-references (e.g. a
    // linked-list `next` pointer) are excluded: those are legal per
    // spec.md §4.5.
    decl.by_value_dependencies().iter().any(|d| d == decl.name())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{Architecture, CompilerType};

    fn abi() -> Abi {
        Abi::new(CompilerType::Gcc, Architecture::X64)
    }

    #[test]
    fn parse_inserts_struct_and_computes_layout() {
        let registry = StructureRegistry::new();
        let result = registry.parse("struct P { char a; int b; };");
        assert!(result.parse_errors.is_empty());
        assert_eq!(result.inserted, vec!["P".to_string()]);

        let layout = registry.get_layout("P", &abi()).unwrap();
        assert_eq!(layout.fields[1].offset, 4);
    }

    #[test]
    fn pragma_pack_directive_in_source_reaches_the_computed_layout() {
        let registry = StructureRegistry::new();
        let result = registry.parse("#pragma pack(1)\nstruct P { char a; int b; char c; };");
        assert!(result.parse_errors.is_empty());

        let layout = registry.get_layout("P", &abi()).unwrap();
        assert_eq!(layout.total_size, 6);
        assert_eq!(layout.alignment, 1);
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 1);
        assert_eq!(layout.fields[2].offset, 5);
    }

    #[test]
    fn duplicate_declaration_is_reported() {
        let registry = StructureRegistry::new();
        registry.parse("struct P { int a; };");
        let result = registry.parse("struct P { int b; };");
        assert!(matches!(result.registry_errors[0], RegistryError::DuplicateDeclaration { .. }));
    }

    #[test]
    fn struct_field_referencing_a_typedef_name_resolves() {
        let registry = StructureRegistry::new();
        registry.parse("typedef unsigned long MyHandle;\nstruct S { MyHandle h; char c; };");
        let layout = registry.get_layout("S", &abi()).unwrap();
        assert_eq!(layout.fields[0].size, 8);
        assert_eq!(layout.fields[1].offset, 8);
    }

    #[test]
    fn nested_struct_resolves_through_registry() {
        let registry = StructureRegistry::new();
        registry.parse("struct Inner { int x; };\nstruct Outer { struct Inner v; char c; };");
        let outer = registry.get_layout("Outer", &abi()).unwrap();
        assert_eq!(outer.fields[0].size, 4);
    }

    #[test]
    fn remove_evicts_dependent_layout_cache() {
        let registry = StructureRegistry::new();
        registry.parse("struct Inner { int x; };\nstruct Outer { struct Inner v; };");
        registry.get_layout("Inner", &abi()).unwrap();
        registry.get_layout("Outer", &abi()).unwrap();
        registry.remove("Inner").unwrap();
        let errors = registry.validate();
        assert!(errors.iter().any(|e| matches!(e, RegistryError::DanglingDependency { .. })));
    }

    #[test]
    fn direct_self_reference_is_a_cyclic_error() {
        let registry = StructureRegistry::new();
        let result = registry.parse("struct Node { struct Node next; };");
        assert!(result.registry_errors.iter().any(|e| matches!(e, RegistryError::CyclicByValueDependency { .. })));
    }

    #[test]
    fn pointer_self_reference_is_allowed_and_lays_out() {
        let registry = StructureRegistry::new();
        let result = registry.parse("struct Node { struct Node *next; int value; };");
        assert!(result.registry_errors.is_empty());
        assert!(!registry.has_cycles());
        let layout = registry.get_layout("Node", &abi()).unwrap();
        assert_eq!(layout.fields[0].size, abi().pointer_size());
    }

    #[test]
    fn mutual_pointer_cycle_between_two_structs_is_allowed() {
        let registry = StructureRegistry::new();
        let result = registry.parse(
            "struct A { struct B *b; }; struct B { struct A *a; };");
        assert!(result.registry_errors.is_empty());
        assert!(!registry.has_cycles());
        assert!(registry.get_layout("A", &abi()).is_ok());
        assert!(registry.get_layout("B", &abi()).is_ok());
    }

    #[test]
    fn topological_order_places_dependencies_before_dependents() {
        let registry = StructureRegistry::new();
        registry.parse("struct A { int x; };\nstruct B { struct A a; };");
        let order = registry.topological_order().unwrap();
        assert_eq!(order.len(), 2);
        let a_pos = order.iter().position(|n| n == "A").unwrap();
        let b_pos = order.iter().position(|n| n == "B").unwrap();
        assert!(a_pos < b_pos, "A has no dependencies and must precede B which depends on it");
        assert!(!registry.has_cycles());
    }

    #[test]
    fn offset_of_resolves_field_path() {
        let registry = StructureRegistry::new();
        registry.parse("struct P { int items[4]; };");
        let result = registry.offset_of("P", "items[2]", &abi()).unwrap();
        assert_eq!(result.offset, 8);
    }
}
