//! The name pool: canonical owner of one [`ResolveInfo`] per symbol name.
//!
//! [`NamePool::insert_symbol`] is the only path by which symbols enter the
//! link; it applies the full resolution order (definition precedence,
//! common promotion, shared-object binding, bitcode awareness, visibility
//! tightening) and reports whether the incoming declaration supplanted the
//! existing one.

use std::collections::{BTreeSet, HashMap};

use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::input::InputId;
use crate::section::fragment::FragmentRef;
use crate::section::SectionId;
use crate::symbol::{
    ExportScope, InfoFlags, InfoId, LdSymbol, ResolveInfo, SymbolBinding, SymbolDesc, SymbolId,
    SymbolType, Visibility,
};

#[derive(Debug, Clone, TypedBuilder)]
/// One declaration of a symbol, as an input contributes it
pub struct SymbolDecl {
    /// The declaring input
    pub origin: InputId,
    #[builder(setter(into))]
    /// Decorated path of the declaring input, for diagnostics
    pub origin_path: String,
    #[builder(setter(into))]
    /// The symbol name (wrap rewriting already applied)
    pub name: String,
    #[builder(default)]
    /// Declared from a shared object
    pub is_dyn: bool,
    #[builder(default)]
    /// Declared from a bitcode input
    pub in_bitcode: bool,
    #[builder(default)]
    /// `st_type`
    pub symbol_type: SymbolType,
    #[builder(default)]
    /// Definition state
    pub desc: SymbolDesc,
    #[builder(default)]
    /// Binding
    pub binding: SymbolBinding,
    #[builder(default)]
    /// Declared size
    pub size: u64,
    #[builder(default)]
    /// Declared value (alignment, for commons)
    pub value: u64,
    #[builder(default)]
    /// Declared visibility
    pub visibility: Visibility,
    #[builder(default, setter(strip_option))]
    /// Section holding the definition
    pub section: Option<SectionId>,
    #[builder(default = FragmentRef::null())]
    /// Placement of the definition's bytes
    pub frag_ref: FragmentRef,
    #[builder(default)]
    /// Section header index in the declaring file
    pub shndx: u32,
    #[builder(default)]
    /// The declaration comes from an LTO-generated native object
    pub is_post_lto: bool,
    #[builder(default)]
    /// The declaration is marked patchable
    pub is_patchable: bool,
}

#[derive(Debug, Clone, Copy)]
/// What [`NamePool::insert_symbol`] decided
pub struct ResolveResult {
    /// The canonical record for the name
    pub info: InfoId,
    /// The placement created for this declaration
    pub symbol: SymbolId,
    /// True when the incoming declaration supplanted the existing one
    pub overridden: bool,
}

#[derive(Debug, Clone)]
/// A `--wrap` rename applied during reading, undone after LTO
pub struct WrapRename {
    /// The name the input used
    pub original: String,
    /// The name resolution saw
    pub renamed: String,
}

/// Definition precedence; higher wins
fn precedence(desc: SymbolDesc, binding: SymbolBinding, is_dyn: bool) -> u8 {
    match desc {
        SymbolDesc::Defined | SymbolDesc::Absolute => {
            if is_dyn {
                3
            } else if binding == SymbolBinding::Weak {
                2
            } else {
                4
            }
        }
        SymbolDesc::Common => 1,
        SymbolDesc::Undefined => 0,
    }
}

#[derive(Debug, Default)]
/// Canonical name → record mapping plus every symbol placement in the link
pub struct NamePool {
    infos: Vec<ResolveInfo>,
    symbols: Vec<LdSymbol>,
    by_name: HashMap<String, InfoId>,
    wrap_renames: Vec<WrapRename>,
    /// Symbols under `--wrap`; references rewrite before resolution
    pub wraps: BTreeSet<String>,
    /// First wins among equal-precedence strong definitions
    pub allow_multiple_definition: bool,
}

impl NamePool {
    /// An empty pool
    pub fn new(allow_multiple_definition: bool) -> Self {
        NamePool { allow_multiple_definition, ..Default::default() }
    }

    /// The record arena
    pub fn infos(&self) -> &[ResolveInfo] {
        &self.infos
    }

    /// One record by id
    pub fn info(&self, id: InfoId) -> &ResolveInfo {
        &self.infos[id.idx()]
    }

    /// One record by id, mutably
    pub fn info_mut(&mut self, id: InfoId) -> &mut ResolveInfo {
        &mut self.infos[id.idx()]
    }

    /// The placement arena
    pub fn symbols(&self) -> &[LdSymbol] {
        &self.symbols
    }

    /// One placement by id
    pub fn symbol(&self, id: SymbolId) -> &LdSymbol {
        &self.symbols[id.idx()]
    }

    /// One placement by id, mutably
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut LdSymbol {
        &mut self.symbols[id.idx()]
    }

    /// Find the canonical record for `name`
    pub fn find_info(&self, name: &str) -> Option<InfoId> {
        self.by_name.get(name).copied()
    }

    /// Find the prevailing out-symbol for `name`
    pub fn find_symbol(&self, name: &str) -> Option<SymbolId> {
        self.find_info(name).and_then(|id| self.info(id).out_symbol())
    }

    /// Names that are still undefined and globally visible; drives archive
    /// member extraction
    pub fn undefined_globals(&self) -> impl Iterator<Item = &ResolveInfo> {
        self.infos
            .iter()
            .filter(|i| i.is_undefined() && i.binding != SymbolBinding::Local)
    }

    /// Record a wrap rename for restoration after LTO
    pub fn record_wrap(&mut self, original: impl Into<String>, renamed: impl Into<String>) {
        self.wrap_renames.push(WrapRename {
            original: original.into(),
            renamed: renamed.into(),
        });
    }

    /// The recorded wrap renames
    pub fn wrap_renames(&self) -> &[WrapRename] {
        &self.wrap_renames
    }

    /// Attach a version-script scope to a record
    pub fn set_scope(&mut self, id: InfoId, scope: ExportScope) {
        self.infos[id.idx()].scope = scope;
    }

    fn push_symbol(&mut self, info: InfoId, decl: &SymbolDecl) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols
            .push(LdSymbol::new(info, decl.frag_ref, decl.value, decl.shndx));
        id
    }

    /// Bare creation without resolution semantics: used for internal
    /// synthesis and section symbols. Registers the name only if it is not
    /// already present.
    pub fn create_symbol(&mut self, decl: SymbolDecl) -> (InfoId, SymbolId) {
        if let Some(&existing) = self.by_name.get(&decl.name) {
            let sym = self.push_symbol(existing, &decl);
            return (existing, sym);
        }
        let info_id = InfoId(self.infos.len() as u32);
        let mut info = ResolveInfo::new(decl.name.clone());
        info.symbol_type = decl.symbol_type;
        info.desc = decl.desc;
        info.binding = decl.binding;
        info.visibility = decl.visibility;
        info.size = decl.size;
        info.value = decl.value;
        info.origin = Some(decl.origin);
        info.origin_path = decl.origin_path.clone();
        info.section = decl.section;
        if decl.in_bitcode {
            info.flags |= InfoFlags::IN_BITCODE;
        }
        self.infos.push(info);
        if decl.binding != SymbolBinding::Local {
            self.by_name.insert(decl.name.clone(), info_id);
        }
        let sym = self.push_symbol(info_id, &decl);
        self.infos[info_id.idx()].placement = Some(sym);
        (info_id, sym)
    }

    /// Define (or redefine) `name` as an absolute symbol; the path used by
    /// script assignments, `--defsym`, and layout's standard symbols.
    pub fn define_absolute(
        &mut self,
        origin: InputId,
        origin_path: &str,
        name: &str,
        value: u64,
        binding: SymbolBinding,
        visibility: Visibility,
    ) -> InfoId {
        if let Some(&id) = self.by_name.get(name) {
            let sym = {
                let decl = SymbolDecl::builder()
                    .origin(origin)
                    .origin_path(origin_path)
                    .name(name)
                    .value(value)
                    .build();
                self.push_symbol(id, &decl)
            };
            let info = &mut self.infos[id.idx()];
            info.desc = SymbolDesc::Absolute;
            info.binding = binding;
            info.visibility = info.visibility.tighter(visibility);
            info.value = value;
            info.origin = Some(origin);
            info.origin_path = origin_path.to_string();
            info.placement = Some(sym);
            info.referenced_by_regular = true;
            info.dyn_defined = false;
            return id;
        }
        let (id, _) = self.create_symbol(
            SymbolDecl::builder()
                .origin(origin)
                .origin_path(origin_path)
                .name(name)
                .desc(SymbolDesc::Absolute)
                .binding(binding)
                .visibility(visibility)
                .value(value)
                .build(),
        );
        self.infos[id.idx()].referenced_by_regular = true;
        id
    }

    /// Rewrite a reference per `--wrap`: an undefined `foo` becomes
    /// `__wrap_foo`, an undefined `__real_foo` becomes `foo`. Applied
    /// before resolution; the rename is recorded for restoration after
    /// LTO.
    fn apply_wrap(&mut self, decl: &mut SymbolDecl) {
        if self.wraps.is_empty() || decl.desc != SymbolDesc::Undefined {
            return;
        }
        if let Some(real) = decl.name.strip_prefix("__real_") {
            if self.wraps.contains(real) {
                let renamed = real.to_string();
                self.record_wrap(decl.name.clone(), renamed.clone());
                decl.name = renamed;
                return;
            }
        }
        if self.wraps.contains(&decl.name) {
            let renamed = format!("__wrap_{}", decl.name);
            self.record_wrap(decl.name.clone(), renamed.clone());
            decl.name = renamed;
        }
    }

    /// The resolution gate: insert one declaration and reconcile it with
    /// whatever the pool already knows about the name.
    pub fn insert_symbol(&mut self, mut decl: SymbolDecl) -> Result<ResolveResult> {
        self.apply_wrap(&mut decl);
        let existing = self.by_name.get(&decl.name).copied();
        let info_id = match existing {
            None => {
                let (info, symbol) = self.create_symbol(decl.clone());
                let record = &mut self.infos[info.idx()];
                record.referenced_by_regular = !decl.is_dyn;
                record.dyn_defined = decl.is_dyn && decl.desc.is_defined();
                return Ok(ResolveResult { info, symbol, overridden: false });
            }
            Some(id) => id,
        };

        let symbol = self.push_symbol(info_id, &decl);
        let old = &self.infos[info_id.idx()];

        let old_rank = precedence(old.desc, old.binding, old.dyn_defined);
        let new_rank = precedence(decl.desc, decl.binding, decl.is_dyn);

        // Patchable conflicts surface before any override decision.
        if !decl.is_post_lto
            && old.is_defined()
            && decl.desc.is_defined()
            && (decl.is_patchable || old.flags.contains(InfoFlags::PATCHABLE))
        {
            return Err(Error::PatchableConflict { symbol: decl.name });
        }

        let overridden = if old_rank == 4 && new_rank == 4 {
            if decl.is_post_lto && old.in_bitcode() {
                // The LTO output replaces the bitcode definition it came from.
                true
            } else if !decl.is_post_lto && old.in_bitcode() != decl.in_bitcode {
                // Pre-LTO, bitcode and native definitions coexist; keep the
                // native copy visible and let the bridge pick the prevailing
                // definition.
                !decl.in_bitcode && old.in_bitcode()
            } else if self.allow_multiple_definition {
                false
            } else {
                return Err(Error::MultipleDefinition {
                    symbol: decl.name,
                    existing: old.origin_path.clone(),
                    incoming: decl.origin_path,
                });
            }
        } else if new_rank != old_rank {
            new_rank > old_rank
        } else {
            match new_rank {
                // Both commons: the larger size wins; larger alignment
                // breaks ties.
                1 => decl.size > old.size || (decl.size == old.size && decl.value > old.value),
                // Equal weak/shared definitions and repeated references:
                // the first wins.
                _ => false,
            }
        };

        let common_alignment = if old_rank == 1 && new_rank == 1 {
            Some(old.value.max(decl.value))
        } else {
            None
        };

        let record = &mut self.infos[info_id.idx()];
        record.visibility = record.visibility.tighter(decl.visibility);
        record.referenced_by_regular |= !decl.is_dyn;

        if overridden {
            let was_weak_undef_ref =
                record.desc == SymbolDesc::Undefined && record.binding == SymbolBinding::Weak;
            record.symbol_type = decl.symbol_type;
            record.desc = decl.desc;
            record.size = decl.size;
            record.value = common_alignment.unwrap_or(decl.value);
            record.origin = Some(decl.origin);
            record.origin_path = decl.origin_path.clone();
            record.section = decl.section;
            record.placement = Some(symbol);
            record.dyn_defined = decl.is_dyn && decl.desc.is_defined();
            record.flags.set(InfoFlags::IN_BITCODE, decl.in_bitcode);
            if decl.is_dyn {
                // A weak reference satisfied by a shared object keeps its
                // weak binding; the symbol now binds dynamically.
                if !was_weak_undef_ref {
                    record.binding = decl.binding;
                }
                if record.referenced_by_regular {
                    record.flags |= InfoFlags::DYN;
                }
            } else {
                record.binding = decl.binding;
                record.flags -= InfoFlags::DYN;
            }
        } else {
            if let Some(alignment) = common_alignment {
                record.value = alignment;
            }
            // A reference binding to a shared-object definition makes the
            // symbol dynamic.
            if record.dyn_defined && !decl.is_dyn {
                record.flags |= InfoFlags::DYN;
            }
            if record.desc == SymbolDesc::Undefined && decl.desc == SymbolDesc::Undefined {
                if record.binding == SymbolBinding::Weak && decl.binding == SymbolBinding::Global {
                    record.binding = SymbolBinding::Global;
                }
                if record.symbol_type == SymbolType::NoType {
                    record.symbol_type = decl.symbol_type;
                }
            }
        }
        if decl.is_patchable {
            record.flags |= InfoFlags::PATCHABLE;
        }

        Ok(ResolveResult { info: info_id, symbol, overridden })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, origin: u32) -> SymbolDecl {
        SymbolDecl::builder()
            .origin(InputId(origin))
            .origin_path(format!("in{origin}.o"))
            .name(name)
            .build()
    }

    fn defined(name: &str, origin: u32, binding: SymbolBinding, value: u64) -> SymbolDecl {
        let mut d = decl(name, origin);
        d.desc = SymbolDesc::Defined;
        d.binding = binding;
        d.value = value;
        d
    }

    #[test]
    fn weak_then_strong_keeps_the_strong_definition() {
        let mut pool = NamePool::new(false);
        let weak = pool
            .insert_symbol(defined("foo", 0, SymbolBinding::Weak, 0x10))
            .unwrap();
        assert!(!weak.overridden);
        let strong = pool
            .insert_symbol(defined("foo", 1, SymbolBinding::Global, 0x30))
            .unwrap();
        assert!(strong.overridden);
        let info = pool.info(strong.info);
        assert_eq!(info.value, 0x30);
        assert_eq!(info.origin, Some(InputId(1)));
        assert_eq!(info.out_symbol(), Some(strong.symbol));
    }

    #[test]
    fn strong_then_weak_keeps_the_strong_definition() {
        let mut pool = NamePool::new(false);
        let strong = pool
            .insert_symbol(defined("foo", 0, SymbolBinding::Global, 0x30))
            .unwrap();
        let weak = pool
            .insert_symbol(defined("foo", 1, SymbolBinding::Weak, 0x10))
            .unwrap();
        assert!(!weak.overridden);
        assert_eq!(pool.info(weak.info).value, 0x30);
        assert_eq!(pool.info(weak.info).out_symbol(), Some(strong.symbol));
    }

    #[test]
    fn two_strong_definitions_conflict() {
        let mut pool = NamePool::new(false);
        pool.insert_symbol(defined("foo", 0, SymbolBinding::Global, 0))
            .unwrap();
        let err = pool
            .insert_symbol(defined("foo", 1, SymbolBinding::Global, 0))
            .unwrap_err();
        assert!(matches!(err, Error::MultipleDefinition { .. }));

        let mut permissive = NamePool::new(true);
        permissive
            .insert_symbol(defined("foo", 0, SymbolBinding::Global, 0x10))
            .unwrap();
        let second = permissive
            .insert_symbol(defined("foo", 1, SymbolBinding::Global, 0x20))
            .unwrap();
        assert!(!second.overridden);
        assert_eq!(permissive.info(second.info).value, 0x10);
    }

    #[test]
    fn common_growth_keeps_largest() {
        let mut pool = NamePool::new(false);
        let mut first = decl("foo", 0);
        first.desc = SymbolDesc::Common;
        first.size = 50;
        first.value = 4;
        pool.insert_symbol(first).unwrap();

        let mut second = decl("foo", 1);
        second.desc = SymbolDesc::Common;
        second.size = 10;
        second.value = 16;
        let r = pool.insert_symbol(second).unwrap();
        assert!(!r.overridden);
        let info = pool.info(r.info);
        assert_eq!(info.size, 50);
        // Alignment grows even when the smaller common loses.
        assert_eq!(info.value, 16);

        let mut third = decl("foo", 2);
        third.desc = SymbolDesc::Common;
        third.size = 200;
        third.value = 8;
        let r = pool.insert_symbol(third).unwrap();
        assert!(r.overridden);
        let info = pool.info(r.info);
        assert_eq!(info.size, 200);
        assert_eq!(info.origin, Some(InputId(2)));
        assert_eq!(info.value, 16);
    }

    #[test]
    fn defined_overrides_common_regardless_of_size() {
        let mut pool = NamePool::new(false);
        let mut common = decl("foo", 0);
        common.desc = SymbolDesc::Common;
        common.size = 4096;
        pool.insert_symbol(common).unwrap();
        let strong = pool
            .insert_symbol(defined("foo", 1, SymbolBinding::Global, 0x30))
            .unwrap();
        assert!(strong.overridden);
        assert_eq!(pool.info(strong.info).desc, SymbolDesc::Defined);
    }

    #[test]
    fn weak_definition_is_not_displaced_by_common() {
        let mut pool = NamePool::new(false);
        let weak = pool
            .insert_symbol(defined("foo", 0, SymbolBinding::Weak, 0x10))
            .unwrap();
        let mut common = decl("foo", 1);
        common.desc = SymbolDesc::Common;
        common.size = 64;
        let r = pool.insert_symbol(common).unwrap();
        assert!(!r.overridden);
        assert_eq!(pool.info(r.info).out_symbol(), Some(weak.symbol));
    }

    #[test]
    fn shared_definition_satisfies_reference_and_marks_dyn() {
        let mut pool = NamePool::new(false);
        let mut dyn_def = defined("foo", 0, SymbolBinding::Global, 0x10);
        dyn_def.is_dyn = true;
        let first = pool.insert_symbol(dyn_def).unwrap();
        // Unreferenced shared definitions have no out-symbol yet.
        assert_eq!(pool.info(first.info).out_symbol(), None);

        let reference = pool.insert_symbol(decl("foo", 1)).unwrap();
        assert!(!reference.overridden);
        let info = pool.info(reference.info);
        assert!(info.is_dyn());
        assert_eq!(info.out_symbol(), Some(first.symbol));
        assert_eq!(info.value, 0x10);
        assert_eq!(info.origin, Some(InputId(0)));

        // A second shared definition does not displace the first.
        let mut other = defined("foo", 2, SymbolBinding::Global, 0x30);
        other.is_dyn = true;
        let r = pool.insert_symbol(other).unwrap();
        assert!(!r.overridden);
        assert_eq!(pool.info(r.info).value, 0x10);
    }

    #[test]
    fn weak_reference_bound_to_shared_definition_stays_weak() {
        let mut pool = NamePool::new(false);
        let mut weak_ref = decl("foo", 0);
        weak_ref.binding = SymbolBinding::Weak;
        pool.insert_symbol(weak_ref).unwrap();

        let mut dyn_def = defined("foo", 1, SymbolBinding::Global, 0x40);
        dyn_def.is_dyn = true;
        let r = pool.insert_symbol(dyn_def).unwrap();
        assert!(r.overridden);
        let info = pool.info(r.info);
        assert_eq!(info.binding, SymbolBinding::Weak);
        assert!(info.is_dyn());
    }

    #[test]
    fn bitcode_and_native_definitions_coexist_before_lto() {
        let mut pool = NamePool::new(false);
        let mut bitcode = defined("foo", 0, SymbolBinding::Global, 0x10);
        bitcode.in_bitcode = true;
        pool.insert_symbol(bitcode).unwrap();

        let native = pool
            .insert_symbol(defined("foo", 1, SymbolBinding::Global, 0x20))
            .unwrap();
        assert!(native.overridden);
        assert!(!pool.info(native.info).in_bitcode());
    }

    #[test]
    fn post_lto_output_replaces_bitcode_definition() {
        let mut pool = NamePool::new(false);
        let mut bitcode = defined("foo", 0, SymbolBinding::Global, 0x10);
        bitcode.in_bitcode = true;
        pool.insert_symbol(bitcode).unwrap();

        let mut native = defined("foo", 1, SymbolBinding::Global, 0x10);
        native.is_post_lto = true;
        let r = pool.insert_symbol(native).unwrap();
        assert!(r.overridden);
        assert!(!pool.info(r.info).in_bitcode());
    }

    #[test]
    fn patchable_with_second_definition_is_an_error() {
        let mut pool = NamePool::new(false);
        pool.insert_symbol(defined("foo", 0, SymbolBinding::Global, 0))
            .unwrap();
        let mut patch = defined("foo", 1, SymbolBinding::Weak, 0);
        patch.is_patchable = true;
        let err = pool.insert_symbol(patch).unwrap_err();
        assert!(matches!(err, Error::PatchableConflict { .. }));
    }

    #[test]
    fn wrap_rewrites_references_but_not_definitions() {
        let mut pool = NamePool::new(false);
        pool.wraps.insert("malloc".into());

        // The real definition keeps its name.
        pool.insert_symbol(defined("malloc", 0, SymbolBinding::Global, 0x100))
            .unwrap();
        // A reference is redirected to the wrapper.
        let reference = pool.insert_symbol(decl("malloc", 1)).unwrap();
        assert_eq!(pool.info(reference.info).name, "__wrap_malloc");
        // A `__real_` reference reaches the original definition.
        let real_ref = pool.insert_symbol(decl("__real_malloc", 2)).unwrap();
        assert_eq!(pool.info(real_ref.info).name, "malloc");
        assert_eq!(pool.info(real_ref.info).value, 0x100);
        assert_eq!(pool.wrap_renames().len(), 2);
    }

    #[test]
    fn undefined_references_tighten_binding_and_visibility() {
        let mut pool = NamePool::new(false);
        let mut weak_ref = decl("foo", 0);
        weak_ref.binding = SymbolBinding::Weak;
        pool.insert_symbol(weak_ref).unwrap();
        let mut strong_ref = decl("foo", 1);
        strong_ref.visibility = Visibility::Hidden;
        let r = pool.insert_symbol(strong_ref).unwrap();
        let info = pool.info(r.info);
        assert_eq!(info.binding, SymbolBinding::Global);
        assert_eq!(info.visibility, Visibility::Hidden);
    }
}
