//! Symbols as the resolver sees them.
//!
//! A [`ResolveInfo`] is the canonical record for one symbol *name*; a
//! [`LdSymbol`] is one concrete *placement* of that name contributed by an
//! input. Many placements may share one record during resolution; exactly
//! one becomes the prevailing out-symbol.

pub mod pool;

use crate::input::InputId;
use crate::section::fragment::FragmentRef;
use crate::section::SectionId;

use bitflags::bitflags;
use num_derive::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of a [`ResolveInfo`] in the name pool
pub struct InfoId(pub u32);

impl InfoId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of a [`LdSymbol`] in the name pool
pub struct SymbolId(pub u32);

impl SymbolId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
/// `st_type` as the resolver needs it
pub enum SymbolType {
    #[default]
    /// STT_NOTYPE
    NoType = 0,
    /// STT_OBJECT
    Object = 1,
    /// STT_FUNC
    Func = 2,
    /// STT_SECTION
    Section = 3,
    /// STT_FILE
    File = 4,
    /// STT_TLS
    Tls = 6,
    /// STT_GNU_IFUNC
    IndirectFunc = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What a declaration says about the symbol
pub enum SymbolDesc {
    #[default]
    /// A reference with no definition
    Undefined,
    /// A definition inside a section
    Defined,
    /// A tentative (common) definition
    Common,
    /// A definition with no section (SHN_ABS)
    Absolute,
}

impl SymbolDesc {
    /// True for definitions, tentative or not
    pub fn is_defined(self) -> bool {
        matches!(self, SymbolDesc::Defined | SymbolDesc::Absolute)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
/// `st_bind`
pub enum SymbolBinding {
    /// STB_LOCAL
    Local = 0,
    #[default]
    /// STB_GLOBAL
    Global = 1,
    /// STB_WEAK
    Weak = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
/// `st_visibility`
pub enum Visibility {
    #[default]
    /// STV_DEFAULT
    Default = 0,
    /// STV_INTERNAL
    Internal = 1,
    /// STV_HIDDEN
    Hidden = 2,
    /// STV_PROTECTED
    Protected = 3,
}

impl Visibility {
    fn restriction(self) -> u8 {
        match self {
            Visibility::Default => 0,
            Visibility::Protected => 1,
            Visibility::Hidden => 2,
            Visibility::Internal => 3,
        }
    }

    /// Combine two declarations: visibility tightens, never widens
    pub fn tighter(self, other: Visibility) -> Visibility {
        if other.restriction() > self.restriction() {
            other
        } else {
            self
        }
    }

    /// True for hidden or internal
    pub fn is_hidden(self) -> bool {
        matches!(self, Visibility::Hidden | Visibility::Internal)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Resolver-maintained symbol attributes
    pub struct InfoFlags: u32 {
        /// Exported to the dynamic symbol table
        const EXPORT_DYN = 0x1;
        /// The current definition lives in a bitcode input
        const IN_BITCODE = 0x2;
        /// Marked patchable
        const PATCHABLE = 0x4;
        /// Must survive garbage collection and LTO
        const SHOULD_PRESERVE = 0x8;
        /// An alias of another symbol
        const IS_ALIAS = 0x10;
        /// Bound to a shared-object definition at run time
        const DYN = 0x20;
        /// A `--wrap` rename was applied to references of this name
        const WRAPPED = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Scope attached by a version script
pub enum ExportScope {
    #[default]
    /// No version script claimed the symbol
    Unspecified,
    /// Listed global: exportable
    Global,
    /// Listed local: never exported
    Local,
}

#[derive(Debug, Clone)]
/// The canonical record for one symbol name.
///
/// Created at first insertion, mutated only by the resolver and explicit
/// API, never deleted; the whole pool drops with the link.
pub struct ResolveInfo {
    /// The symbol name
    pub name: String,
    /// `st_type` of the prevailing declaration
    pub symbol_type: SymbolType,
    /// Definition state of the prevailing declaration
    pub desc: SymbolDesc,
    /// Binding of the prevailing declaration
    pub binding: SymbolBinding,
    /// Tightest visibility seen across declarations
    pub visibility: Visibility,
    /// Size of the prevailing declaration
    pub size: u64,
    /// Value of the prevailing declaration (alignment, for commons)
    pub value: u64,
    /// Input holding the prevailing declaration
    pub origin: Option<InputId>,
    /// Decorated path of the prevailing origin, kept for diagnostics
    pub origin_path: String,
    /// Section of the prevailing definition
    pub section: Option<SectionId>,
    /// Placement of the prevailing declaration
    pub placement: Option<SymbolId>,
    /// True once a relocatable input referenced or defined the name
    pub referenced_by_regular: bool,
    /// True while the prevailing definition comes from a shared object
    pub dyn_defined: bool,
    /// Resolver-maintained attributes
    pub flags: InfoFlags,
    /// Version-script scope
    pub scope: ExportScope,
}

impl ResolveInfo {
    /// A fresh record for `name` with everything at its zero state
    pub fn new(name: impl Into<String>) -> Self {
        ResolveInfo {
            name: name.into(),
            symbol_type: SymbolType::NoType,
            desc: SymbolDesc::Undefined,
            binding: SymbolBinding::Global,
            visibility: Visibility::Default,
            size: 0,
            value: 0,
            origin: None,
            origin_path: String::new(),
            section: None,
            placement: None,
            referenced_by_regular: false,
            dyn_defined: false,
            flags: InfoFlags::empty(),
            scope: ExportScope::Unspecified,
        }
    }

    /// True for definitions, tentative or not
    pub fn is_defined(&self) -> bool {
        self.desc.is_defined()
    }

    /// True for tentative definitions
    pub fn is_common(&self) -> bool {
        self.desc == SymbolDesc::Common
    }

    /// True while nothing defined the name
    pub fn is_undefined(&self) -> bool {
        self.desc == SymbolDesc::Undefined
    }

    /// True for weak binding
    pub fn is_weak(&self) -> bool {
        self.binding == SymbolBinding::Weak
    }

    /// True once the name resolves to a shared-object definition
    pub fn is_dyn(&self) -> bool {
        self.flags.contains(InfoFlags::DYN)
    }

    /// True while the prevailing definition is bitcode
    pub fn in_bitcode(&self) -> bool {
        self.flags.contains(InfoFlags::IN_BITCODE)
    }

    /// The prevailing out-symbol.
    ///
    /// A shared-object definition only materializes an out-symbol once a
    /// relocatable input mentions the name.
    pub fn out_symbol(&self) -> Option<SymbolId> {
        if self.dyn_defined && !self.referenced_by_regular {
            return None;
        }
        self.placement
    }

    /// True when the symbol may appear in the dynamic symbol table
    pub fn is_exportable(&self) -> bool {
        self.scope != ExportScope::Local
            && !self.visibility.is_hidden()
            && self.binding != SymbolBinding::Local
    }
}

#[derive(Debug, Clone)]
/// One concrete placement of a symbol: where its value lives
pub struct LdSymbol {
    /// The record this placement belongs to
    pub info: InfoId,
    /// Location of the symbol's bytes, when it has any
    pub frag_ref: FragmentRef,
    /// The declared value
    pub value: u64,
    /// Section header index in the originating file
    pub shndx: u32,
    /// Slot in the output symbol table, once assigned
    pub symtab_index: Option<u32>,
}

impl LdSymbol {
    /// A placement of `info` at `frag_ref` with the given value
    pub fn new(info: InfoId, frag_ref: FragmentRef, value: u64, shndx: u32) -> Self {
        LdSymbol { info, frag_ref, value, shndx, symtab_index: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_only_tightens() {
        assert_eq!(Visibility::Default.tighter(Visibility::Hidden), Visibility::Hidden);
        assert_eq!(Visibility::Hidden.tighter(Visibility::Default), Visibility::Hidden);
        assert_eq!(Visibility::Internal.tighter(Visibility::Protected), Visibility::Internal);
        assert_eq!(Visibility::Protected.tighter(Visibility::Default), Visibility::Protected);
    }

    #[test]
    fn dyn_definition_has_no_out_symbol_until_referenced() {
        let mut info = ResolveInfo::new("foo");
        info.desc = SymbolDesc::Defined;
        info.dyn_defined = true;
        info.placement = Some(SymbolId(3));
        assert_eq!(info.out_symbol(), None);
        info.referenced_by_regular = true;
        assert_eq!(info.out_symbol(), Some(SymbolId(3)));
    }
}
