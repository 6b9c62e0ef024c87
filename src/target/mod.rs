//! The target capability seam.
//!
//! The engine embeds no target. Everything target-specific — relocation
//! arithmetic, PLT/GOT shapes, section ordering overrides, relaxation —
//! is reached through [`Backend`]. The crate ships the trait and the
//! generic defaults; per-target crates supply implementations.

use crate::error::Result;
use crate::module::Module;
use crate::object::section_map::OutputSectionEntry;
use crate::reloc::{Relocation, Relocator};
use crate::section::{SectionFlags, SectionKind};

#[derive(Debug, Clone)]
/// Target facts the engine needs for placement and bookkeeping
pub struct TargetInfo {
    /// ELF e_machine
    pub machine: u16,
    /// Little-endian output
    pub is_little_endian: bool,
    /// 64-bit output
    pub is_64bit: bool,
    /// PT_LOAD congruence modulus
    pub max_page_size: u64,
    /// RELRO rounding granule
    pub common_page_size: u64,
    /// Relocation sections carry explicit addends
    pub is_rela: bool,
    /// Bytes per GOT slot
    pub got_entry_size: u64,
    /// Bytes per PLT entry
    pub plt_entry_size: u64,
    /// Bytes of the PLT header entry
    pub plt_header_size: u64,
    /// Program interpreter, when dynamic linking applies
    pub dynamic_linker: Option<String>,
}

impl Default for TargetInfo {
    fn default() -> Self {
        TargetInfo {
            machine: 0,
            is_little_endian: true,
            is_64bit: true,
            max_page_size: 0x1000,
            common_page_size: 0x1000,
            is_rela: true,
            got_entry_size: 8,
            plt_entry_size: 16,
            plt_header_size: 16,
            dynamic_linker: None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Coarse ordering tag for orphan placement. Lower tags lay out earlier.
pub enum OrderTag {
    /// `.interp`
    Interp = 1,
    /// Allocated notes
    Note,
    /// Hash/dynsym/dynstr namepool group
    DynamicNamePool,
    /// Dynamic relocation sections
    RelDyn,
    /// `.init`/`.plt`/executable content
    Text,
    /// Read-only data
    Rodata,
    /// Unwind header
    EhFrameHdr,
    /// Unwind tables
    EhFrame,
    /// RELRO data (`.data.rel.ro`, `.init_array`, `.fini_array`, GOT)
    Relro,
    /// Writable data
    Data,
    /// Zero-initialized data
    Bss,
    /// Non-alloc symbol/string tables
    NamePool,
    /// Debug information
    Debug,
    /// Everything else non-alloc
    Other,
}

/// The default coarse order for an output section, from its name, flags,
/// and kind
pub fn default_section_order(module: &Module, entry: &OutputSectionEntry) -> OrderTag {
    let section = module.section(entry.section).elf();
    let name = entry.name.as_str();
    if name == ".interp" {
        return OrderTag::Interp;
    }
    if !section.is_alloc() {
        return match section.kind {
            SectionKind::Debug => OrderTag::Debug,
            SectionKind::NamePool => OrderTag::NamePool,
            _ => OrderTag::Other,
        };
    }
    if section.kind == SectionKind::Note {
        return OrderTag::Note;
    }
    if matches!(name, ".hash" | ".gnu.hash" | ".dynsym" | ".dynstr") {
        return OrderTag::DynamicNamePool;
    }
    if name.starts_with(".rela") || name.starts_with(".rel") {
        return OrderTag::RelDyn;
    }
    if section.is_executable() {
        return OrderTag::Text;
    }
    if name == ".eh_frame_hdr" {
        return OrderTag::EhFrameHdr;
    }
    if name == ".eh_frame" {
        return OrderTag::EhFrame;
    }
    if section.is_writable() {
        if section.is_nobits() {
            return OrderTag::Bss;
        }
        if is_relro_name(name) {
            return OrderTag::Relro;
        }
        return OrderTag::Data;
    }
    OrderTag::Rodata
}

/// Names that belong to the RELRO region
pub fn is_relro_name(name: &str) -> bool {
    name == ".data.rel.ro"
        || name.starts_with(".data.rel.ro.")
        || name == ".init_array"
        || name == ".fini_array"
        || name == ".preinit_array"
        || name == ".ctors"
        || name == ".dtors"
        || name == ".dynamic"
        || name == ".got"
        || name == ".jcr"
}

/// The per-target capability set the engine calls through.
///
/// Defaults implement the generic GNU behavior; a target overrides only
/// what its ABI changes.
pub trait Backend: Send + Sync {
    /// Target facts
    fn target_info(&self) -> &TargetInfo;

    /// The target's relocation arithmetic
    fn relocator(&self) -> &dyn Relocator;

    /// Coarse output order used for orphan placement
    fn section_order(&self, module: &Module, entry: &OutputSectionEntry) -> OrderTag {
        default_section_order(module, entry)
    }

    /// Relocations the target drops before scanning (e.g. marker types)
    fn should_skip_relocation(&self, _module: &Module, _reloc: &Relocation) -> bool {
        false
    }

    /// Substitute value for a relocation whose target was discarded
    fn value_for_discarded_relocation(&self, _reloc: &Relocation) -> u64 {
        0
    }

    /// One relaxation round: insert trampolines, shrink sequences.
    /// Returns true when a fixpoint was reached and layout can finish.
    fn relax(&self, _module: &mut Module) -> Result<bool> {
        Ok(true)
    }

    /// Give the backend a chance to re-classify a `Target` section
    fn classify_target_section(
        &self,
        _name: &str,
        _sh_type: u32,
        _flags: SectionFlags,
    ) -> Option<SectionKind> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relro_names() {
        assert!(is_relro_name(".data.rel.ro"));
        assert!(is_relro_name(".data.rel.ro.local"));
        assert!(is_relro_name(".init_array"));
        assert!(is_relro_name(".got"));
        assert!(!is_relro_name(".data"));
    }
}
