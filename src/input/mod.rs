//! The input graph: every file participating in the link, with explicit
//! kinds and command-line ordering preserved.
//!
//! Byte-exact container knowledge lives behind the [`ObjectReader`] seam;
//! the graph only records what the engine needs: kind, attributes carried
//! from the command line, contributed sections/symbols/relocations, and
//! archive bookkeeping.

pub mod archive;
pub mod group;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::input::archive::ArchiveIndex;
use crate::module::Module;
use crate::reloc::Relocation;
use crate::section::fragment::{Fragment, FragmentKind, FragmentRef};
use crate::section::{ElfSection, Section, SectionFlags, SectionId, SectionKind};
use crate::symbol::pool::SymbolDecl;
use crate::symbol::{SymbolBinding, SymbolDesc, SymbolId, SymbolType, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of an [`InputFile`] in the module arena
pub struct InputId(pub u32);

impl InputId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// What kind of participant an input is
pub enum InputKind {
    /// ELF relocatable object
    ElfRelocObj,
    /// ELF executable (patch-base input)
    ElfExecutable,
    /// ELF shared object
    ElfDynObj,
    /// `ar` archive
    Archive,
    /// A member materialized out of an archive
    ArchiveMember,
    /// LTO bitcode
    Bitcode,
    /// GNU linker script
    LinkerScript,
    /// Symbol-definition file
    SymDef,
    /// Raw binary blob
    Binary,
    /// Linker-synthesized input (commons, internal sections)
    Internal,
}

impl InputKind {
    /// True for inputs that contribute sections to placement
    pub fn contributes_sections(self) -> bool {
        matches!(
            self,
            InputKind::ElfRelocObj
                | InputKind::ArchiveMember
                | InputKind::Bitcode
                | InputKind::Binary
                | InputKind::Internal
        )
    }

    /// True for relocatable ELF content (drives `referenced_by_regular`)
    pub fn is_regular_object(self) -> bool {
        matches!(self, InputKind::ElfRelocObj | InputKind::ArchiveMember)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Command-line attributes in effect when the input was named
pub struct InputAttrs {
    /// Inside `--whole-archive`
    pub whole_archive: bool,
    /// Inside `--as-needed` / `AS_NEEDED(...)`
    pub as_needed: bool,
    /// Inside `--start-lib`/`--end-lib`
    pub in_lib: bool,
    /// `-static` was in effect; shared resolution disallowed
    pub static_only: bool,
}

#[derive(Debug, Clone)]
/// One named input, before and independent of being read
pub struct Input {
    /// Resolved filesystem path
    pub path: PathBuf,
    /// Member name for archive members
    pub member_name: Option<String>,
    /// Attributes carried from the command line position
    pub attrs: InputAttrs,
}

impl Input {
    /// An input at `path` with default attributes
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Input { path: path.into(), member_name: None, attrs: InputAttrs::default() }
    }

    /// The path as rendered in diagnostics: `archive(member)` for members
    pub fn decorated_path(&self) -> String {
        match &self.member_name {
            Some(member) => format!("{}({member})", self.path.display()),
            None => self.path.display().to_string(),
        }
    }
}

#[derive(Debug)]
/// One participant in the link
pub struct InputFile {
    /// The named input
    pub input: Input,
    /// Its kind
    pub kind: InputKind,
    /// Raw file bytes; archives keep theirs until members are extracted,
    /// bitcode releases after LTO consumes it
    pub content: Vec<u8>,
    /// Sections contributed to the module
    pub sections: Vec<SectionId>,
    /// Local symbol placements
    pub local_symbols: Vec<SymbolId>,
    /// Global/weak symbol placements
    pub global_symbols: Vec<SymbolId>,
    /// Relocations, flat across the input's sections
    pub relocations: Vec<Relocation>,
    /// COMDAT group signatures this input contributed (winning or not)
    pub group_signatures: Vec<String>,
    /// Lazily built archive index
    pub archive: Option<ArchiveIndex>,
    /// Member's parent archive
    pub parent_archive: Option<InputId>,
    /// The input actually resolved something (drives AS_NEEDED)
    pub used: bool,
    /// Bitcode content was handed to the LTO engine and dropped
    pub released: bool,
    /// Position in command-line order
    pub ordinal: u32,
}

impl InputFile {
    /// Wrap `input` as a file of the given kind with its content
    pub fn new(input: Input, kind: InputKind, content: Vec<u8>) -> Self {
        InputFile {
            input,
            kind,
            content,
            sections: Vec::new(),
            local_symbols: Vec::new(),
            global_symbols: Vec::new(),
            relocations: Vec::new(),
            group_signatures: Vec::new(),
            archive: None,
            parent_archive: None,
            used: false,
            released: false,
            ordinal: 0,
        }
    }

    /// The decorated path for diagnostics
    pub fn decorated_path(&self) -> String {
        self.input.decorated_path()
    }

    /// Drop the content buffer (bitcode after LTO)
    pub fn release_memory(&mut self) {
        self.content = Vec::new();
        self.released = true;
    }
}

/// The byte-level reader seam.
///
/// Implementations own all container-format knowledge: ELF structures,
/// `ar` indexes, bitcode symbol tables. The engine hands them a loaded
/// input and expects the module arenas to be populated through the normal
/// insertion APIs (sections via the builder, symbols via the name pool).
pub trait ObjectReader {
    /// Classify the container held in `content`
    fn identify(&self, path: &Path, content: &[u8]) -> Result<InputKind>;

    /// Populate sections, symbols, and relocations for `input`
    fn read(&self, module: &mut Module, input: InputId) -> Result<()>;

    /// Build the archive's member/symbol index
    fn archive_index(&self, module: &Module, archive: InputId) -> Result<ArchiveIndex>;

    /// Materialize one archive member as a new input and read it
    fn extract_member(&self, module: &mut Module, archive: InputId, member: usize)
        -> Result<InputId>;
}

/// Turn a path into the identifier fragment of `_binary_<path>_start`
fn mangle_path(path: &Path) -> String {
    path.display()
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Synthesize the section and symbols of a raw binary input: one `.data`
/// section holding the file bytes plus `_binary_<path>_start`, `_end`,
/// and the absolute `_size`.
pub fn synthesize_binary_input(module: &mut Module, input: InputId) -> Result<()> {
    let (content, path) = {
        let file = module.input(input);
        (file.content.clone(), file.input.path.clone())
    };
    let size = content.len() as u64;

    let mut section = ElfSection::new(
        ".data",
        SectionKind::Regular,
        crate::section::section_type::PROGBITS,
        SectionFlags::ALLOC | SectionFlags::WRITE,
    );
    section.input = Some(input);
    let sid = module.add_section(Section::Elf(section));
    module.input_mut(input).sections.push(sid);
    let frag = module.add_fragment(Fragment::new(sid, 1, FragmentKind::Region(content)));

    let stem = mangle_path(&path);
    let path_str = module.input(input).decorated_path();
    for (suffix, desc, value, frag_ref) in [
        ("start", SymbolDesc::Defined, 0, FragmentRef::new(frag, 0)),
        ("end", SymbolDesc::Defined, size, FragmentRef::new(frag, size)),
        ("size", SymbolDesc::Absolute, size, FragmentRef::null()),
    ] {
        let mut decl = SymbolDecl::builder()
            .origin(input)
            .origin_path(path_str.clone())
            .name(format!("_binary_{stem}_{suffix}"))
            .desc(desc)
            .binding(SymbolBinding::Global)
            .symbol_type(SymbolType::Object)
            .value(value)
            .frag_ref(frag_ref)
            .build();
        if desc == SymbolDesc::Defined {
            decl.section = Some(sid);
        }
        let result = module.name_pool.insert_symbol(decl)?;
        module.input_mut(input).global_symbols.push(result.symbol);
    }
    Ok(())
}

/// Parse a SymDef file: one `#<ADDRESS> <name> <kind>` style line per
/// symbol, `#` comments and blank lines ignored. Returns the definitions
/// in file order.
pub fn parse_symdef(content: &str) -> Vec<(String, u64, SymbolType)> {
    let mut defs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(value), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.strip_prefix("0x").unwrap_or(value);
        let Ok(value) = u64::from_str_radix(value, 16) else {
            continue;
        };
        let symbol_type = match parts.next() {
            Some("FUNC") | Some("THUMBFUNC") => SymbolType::Func,
            Some("DATA") => SymbolType::Object,
            _ => SymbolType::NoType,
        };
        defs.push((name.to_string(), value, symbol_type));
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorated_path_names_archive_members() {
        let mut input = Input::new("libs/libc.a");
        assert_eq!(input.decorated_path(), "libs/libc.a");
        input.member_name = Some("printf.o".into());
        assert_eq!(input.decorated_path(), "libs/libc.a(printf.o)");
    }

    #[test]
    fn path_mangling_replaces_non_identifier_chars() {
        assert_eq!(mangle_path(Path::new("firmware/blob.bin")), "firmware_blob_bin");
    }

    #[test]
    fn symdef_lines_parse() {
        let defs = parse_symdef(
            "# comment\n\
             0x10000 reset_handler FUNC\n\
             0x20000 __stack_top DATA\n\
             bogus line\n",
        );
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0], ("reset_handler".to_string(), 0x10000, SymbolType::Func));
        assert_eq!(defs[1], ("__stack_top".to_string(), 0x20000, SymbolType::Object));
    }
}
