//! Input and output section model.
//!
//! Sections carry a *kind* (the closed classification driving link policy)
//! alongside their raw ELF type and flags. A [`Section`] is either a plain
//! ELF section or a common-symbol section that remembers which input the
//! common came from.

pub mod fragment;

use crate::input::InputId;
use crate::object::section_map::{OutputSectId, RuleId};
use crate::section::fragment::FragmentId;

use bitflags::bitflags;
use num_derive::FromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of a [`Section`] in the module arena
pub struct SectionId(pub u32);

impl SectionId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
/// Link-policy classification of a section.
///
/// The set is closed: every input section is classified exactly once when
/// its header is read, and the pipeline dispatches on the kind rather than
/// re-deriving policy from type/flags at each use.
pub enum SectionKind {
    /// The null section
    Null = 0,
    /// Ordinary content placed by rules
    Regular,
    /// Static relocation section
    Relocation,
    /// Synthesized dynamic relocation section
    DynamicRelocation,
    /// Common-symbol backing store
    Common,
    /// Non-alloc debug information
    Debug,
    /// `.eh_frame` unwind tables
    EhFrame,
    /// Synthesized `.eh_frame_hdr`
    EhFrameHdr,
    /// `.gcc_except_table` LSDA data
    GccExceptTable,
    /// `.note.gnu.property`
    GnuProperty,
    /// COMDAT group table section
    Group,
    /// Dropped duplicate: kept in the graph, emitted nowhere
    Ignore,
    /// Linker-synthesized content
    Internal,
    /// `.gnu.linkonce.*` sections
    LinkOnce,
    /// Mergeable string section (`SHF_MERGE|SHF_STRINGS`)
    MergeStr,
    /// Target metadata the linker carries through unchanged
    MetaData,
    /// String/symbol table namepool sections
    NamePool,
    /// `SHT_NOTE` content
    Note,
    /// Script-emitted literal data (`BYTE`, `LONG`, ...)
    OutputSectData,
    /// `.note.GNU-stack`
    StackNote,
    /// Target-specific section the backend owns
    Target,
    /// Link-time statistics payload
    Timing,
    /// Symbol-version sections
    Version,
    /// Matched a `/DISCARD/` rule
    Discard,
    /// `SHF_EXCLUDE` content
    Exclude,
    /// Classification failed; carried only to render a diagnostic
    Error,
}

impl SectionKind {
    /// Kinds that never reach the output image
    pub fn is_ignored(self) -> bool {
        matches!(
            self,
            SectionKind::Ignore | SectionKind::Discard | SectionKind::Exclude | SectionKind::Group
        )
    }
}

/// Raw `sh_type` values the engine needs by name; target ranges pass
/// through untouched.
pub mod section_type {
    /// SHT_NULL
    pub const NULL: u32 = 0;
    /// SHT_PROGBITS
    pub const PROGBITS: u32 = 1;
    /// SHT_SYMTAB
    pub const SYMTAB: u32 = 2;
    /// SHT_STRTAB
    pub const STRTAB: u32 = 3;
    /// SHT_RELA
    pub const RELA: u32 = 4;
    /// SHT_HASH
    pub const HASH: u32 = 5;
    /// SHT_DYNAMIC
    pub const DYNAMIC: u32 = 6;
    /// SHT_NOTE
    pub const NOTE: u32 = 7;
    /// SHT_NOBITS
    pub const NOBITS: u32 = 8;
    /// SHT_REL
    pub const REL: u32 = 9;
    /// SHT_DYNSYM
    pub const DYNSYM: u32 = 11;
    /// SHT_INIT_ARRAY
    pub const INIT_ARRAY: u32 = 14;
    /// SHT_FINI_ARRAY
    pub const FINI_ARRAY: u32 = 15;
    /// SHT_PREINIT_ARRAY
    pub const PREINIT_ARRAY: u32 = 16;
    /// SHT_GROUP
    pub const GROUP: u32 = 17;
    /// SHT_GNU_HASH
    pub const GNU_HASH: u32 = 0x6fff_fff6;
    /// SHT_GNU_verdef
    pub const GNU_VERDEF: u32 = 0x6fff_fffd;
    /// SHT_GNU_verneed
    pub const GNU_VERNEED: u32 = 0x6fff_fffe;
    /// SHT_GNU_versym
    pub const GNU_VERSYM: u32 = 0x6fff_ffff;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// `sh_flags` bits the engine interprets
    pub struct SectionFlags: u64 {
        /// SHF_WRITE
        const WRITE = 0x1;
        /// SHF_ALLOC
        const ALLOC = 0x2;
        /// SHF_EXECINSTR
        const EXECINSTR = 0x4;
        /// SHF_MERGE
        const MERGE = 0x10;
        /// SHF_STRINGS
        const STRINGS = 0x20;
        /// SHF_INFO_LINK
        const INFO_LINK = 0x40;
        /// SHF_LINK_ORDER
        const LINK_ORDER = 0x80;
        /// SHF_OS_NONCONFORMING
        const OS_NONCONFORMING = 0x100;
        /// SHF_GROUP
        const GROUP = 0x200;
        /// SHF_TLS
        const TLS = 0x400;
        /// SHF_COMPRESSED
        const COMPRESSED = 0x800;
        /// SHF_GNU_RETAIN
        const GNU_RETAIN = 0x20_0000;
        /// SHF_EXCLUDE
        const EXCLUDE = 0x8000_0000;
    }
}

#[derive(Debug, Clone)]
/// The shared shape of every section in the link
pub struct ElfSection {
    /// Section name
    pub name: String,
    /// Link-policy classification
    pub kind: SectionKind,
    /// Raw `sh_type`
    pub sh_type: u32,
    /// Interpreted `sh_flags`
    pub flags: SectionFlags,
    /// Alignment constraint in bytes (0 and 1 mean unconstrained)
    pub align: u64,
    /// `sh_entsize`
    pub entsize: u64,
    /// `sh_link` resolved to a module section, when meaningful
    pub link: Option<SectionId>,
    /// Raw `sh_info`
    pub info: u32,
    /// Owning input file; `None` for outputs and internal sections
    pub input: Option<InputId>,
    /// Section header index within the owning input
    pub index_in_file: u32,
    /// Current size in bytes; maintained as fragments are appended
    pub size: u64,
    /// Content, in placement order
    pub fragments: Vec<FragmentId>,
    /// Pre-sized opaque region: size is authoritative and no fragments
    /// may be appended (synthesized header/phdr sections)
    pub no_fragments: bool,
    /// Output section this section was assigned to
    pub output: Option<OutputSectId>,
    /// Rule that claimed this section
    pub matched_rule: Option<RuleId>,
    /// File offset, once layout assigned one
    pub offset: Option<u64>,
    /// Virtual address, once layout assigned one
    pub addr: Option<u64>,
    /// Load address when decoupled from the VMA
    pub pma: Option<u64>,
    /// COMDAT signature for group members
    pub group_signature: Option<String>,
}

impl ElfSection {
    /// Create a section with no content
    pub fn new(name: impl Into<String>, kind: SectionKind, sh_type: u32, flags: SectionFlags) -> Self {
        ElfSection {
            name: name.into(),
            kind,
            sh_type,
            flags,
            align: 1,
            entsize: 0,
            link: None,
            info: 0,
            input: None,
            index_in_file: 0,
            size: 0,
            fragments: Vec::new(),
            no_fragments: false,
            output: None,
            matched_rule: None,
            offset: None,
            addr: None,
            pma: None,
            group_signature: None,
        }
    }

    /// True if the section occupies memory at run time
    pub fn is_alloc(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC)
    }

    /// True if the section occupies no file bytes
    pub fn is_nobits(&self) -> bool {
        self.sh_type == section_type::NOBITS
    }

    /// True for thread-local content
    pub fn is_tls(&self) -> bool {
        self.flags.contains(SectionFlags::TLS)
    }

    /// True for writable content
    pub fn is_writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITE)
    }

    /// True for executable content
    pub fn is_executable(&self) -> bool {
        self.flags.contains(SectionFlags::EXECINSTR)
    }

    /// True when the section holds mergeable NUL-terminated strings
    pub fn is_merge_str(&self) -> bool {
        self.flags
            .contains(SectionFlags::MERGE | SectionFlags::STRINGS)
    }

    /// True once the section has been dropped from the link
    pub fn is_ignored(&self) -> bool {
        self.kind.is_ignored()
    }

    /// Load address, falling back to the VMA when not decoupled
    pub fn load_address(&self) -> Option<u64> {
        self.pma.or(self.addr)
    }

    /// File offset; calling this before layout assigned one is a bug
    pub fn file_offset(&self) -> u64 {
        debug_assert!(self.offset.is_some(), "offset queried before layout");
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
/// A common-symbol section synthesized on the internal input, one per
/// common symbol, recording where the common came from
pub struct CommonSection {
    /// The section shape
    pub elf: ElfSection,
    /// The real input that declared the common
    pub origin: InputId,
}

#[derive(Debug, Clone)]
/// A section in the module arena
pub enum Section {
    /// A plain ELF section
    Elf(ElfSection),
    /// A common-symbol section with a tracked origin
    Common(CommonSection),
}

impl Section {
    /// The shared ELF shape
    pub fn elf(&self) -> &ElfSection {
        match self {
            Section::Elf(s) => s,
            Section::Common(c) => &c.elf,
        }
    }

    /// The shared ELF shape, mutably
    pub fn elf_mut(&mut self) -> &mut ElfSection {
        match self {
            Section::Elf(s) => s,
            Section::Common(c) => &mut c.elf,
        }
    }

    /// The origin input of a common section
    pub fn common_origin(&self) -> Option<InputId> {
        match self {
            Section::Elf(_) => None,
            Section::Common(c) => Some(c.origin),
        }
    }
}

/// Classify an input section from its name, type, and flags.
///
/// The backend may re-classify `Target` sections afterwards; everything
/// else is final.
pub fn classify(name: &str, sh_type: u32, flags: SectionFlags) -> SectionKind {
    if flags.contains(SectionFlags::EXCLUDE) {
        return SectionKind::Exclude;
    }
    match sh_type {
        section_type::NULL => return SectionKind::Null,
        section_type::GROUP => return SectionKind::Group,
        section_type::RELA | section_type::REL => return SectionKind::Relocation,
        section_type::NOTE => {
            if name == ".note.GNU-stack" {
                return SectionKind::StackNote;
            }
            if name == ".note.gnu.property" {
                return SectionKind::GnuProperty;
            }
            return SectionKind::Note;
        }
        section_type::SYMTAB | section_type::STRTAB | section_type::DYNSYM => {
            return SectionKind::NamePool
        }
        section_type::GNU_VERDEF | section_type::GNU_VERNEED | section_type::GNU_VERSYM => {
            return SectionKind::Version
        }
        _ => {}
    }
    if !flags.contains(SectionFlags::ALLOC) {
        if name.starts_with(".debug") || name.starts_with(".zdebug") || name.starts_with(".line") {
            return SectionKind::Debug;
        }
    }
    if name.starts_with(".gnu.linkonce") {
        return SectionKind::LinkOnce;
    }
    if name == ".eh_frame" {
        return SectionKind::EhFrame;
    }
    if name == ".eh_frame_hdr" {
        return SectionKind::EhFrameHdr;
    }
    if name.starts_with(".gcc_except_table") {
        return SectionKind::GccExceptTable;
    }
    if flags.contains(SectionFlags::MERGE | SectionFlags::STRINGS) {
        return SectionKind::MergeStr;
    }
    SectionKind::Regular
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_policy_groups() {
        assert_eq!(
            classify(".text", section_type::PROGBITS, SectionFlags::ALLOC | SectionFlags::EXECINSTR),
            SectionKind::Regular
        );
        assert_eq!(
            classify(
                ".rodata.str1.1",
                section_type::PROGBITS,
                SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS
            ),
            SectionKind::MergeStr
        );
        assert_eq!(
            classify(".debug_info", section_type::PROGBITS, SectionFlags::empty()),
            SectionKind::Debug
        );
        assert_eq!(
            classify(".note.GNU-stack", section_type::NOTE, SectionFlags::empty()),
            SectionKind::StackNote
        );
        assert_eq!(
            classify(".group", section_type::GROUP, SectionFlags::empty()),
            SectionKind::Group
        );
        assert_eq!(
            classify(".drop", section_type::PROGBITS, SectionFlags::EXCLUDE),
            SectionKind::Exclude
        );
    }

    #[test]
    fn merge_str_requires_both_flags() {
        let merge_only = ElfSection::new(
            ".rodata.cst8",
            SectionKind::Regular,
            section_type::PROGBITS,
            SectionFlags::ALLOC | SectionFlags::MERGE,
        );
        assert!(!merge_only.is_merge_str());
    }
}
