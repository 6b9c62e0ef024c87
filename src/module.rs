//! The [`Module`]: single owner of every arena in the link.
//!
//! The pointer-rich graph of the link — inputs ↔ sections ↔ fragments ↔
//! rules ↔ output entries ↔ symbols — lives here as typed arenas with
//! index back-edges. The module is append-only during the pipeline;
//! parallel phases only read it and write owned per-item buffers.

use std::collections::HashMap;

use crate::config::UnresolvedPolicy;
use crate::error::{DiagnosticEngine, Result};
use crate::input::{Input, InputFile, InputId, InputKind};
use crate::layout::segments::{ElfSegment, MemoryRegion};
use crate::object::section_map::{OutputSectId, OutputSectionEntry, SectionMap};
use crate::reloc::RelocBookkeeping;
use crate::script::LinkerScript;
use crate::section::fragment::{Fragment, FragmentId, FragmentKind, FragmentRef, StringRef};
use crate::section::{ElfSection, Section, SectionFlags, SectionId, SectionKind};
use crate::support::align_up;
use crate::symbol::{InfoId, SymbolDesc};

#[derive(Debug, Clone, Copy)]
/// One recorded fill range inside an output section
pub struct PaddingRecord {
    /// The padded output section
    pub output: OutputSectId,
    /// Start offset within the section
    pub start: u64,
    /// End offset within the section
    pub end: u64,
    /// The fill pattern
    pub fill: u64,
}

#[derive(Debug)]
/// The arena owner threaded through the whole pipeline
pub struct Module {
    /// Input files in command-line order
    pub inputs: Vec<InputFile>,
    /// Every section in the link, inputs and outputs alike
    pub sections: Vec<Section>,
    /// Every fragment
    pub fragments: Vec<Fragment>,
    /// The symbol resolver state
    pub name_pool: crate::symbol::pool::NamePool,
    /// Output section entries and rules
    pub section_map: SectionMap,
    /// Everything scripts contributed
    pub script: LinkerScript,
    /// Program segments, once layout built them
    pub segments: Vec<ElfSegment>,
    /// Script memory regions with their cursors
    pub memory_regions: Vec<MemoryRegion>,
    /// Merged relocation-scan bookkeeping
    pub reloc_state: RelocBookkeeping,
    /// The diagnostic channel
    pub diag: DiagnosticEngine,
    /// The location counter
    pub dot: u64,
    /// Worker threads for the parallel phases
    pub thread_count: usize,
    /// Unresolved-symbol policy, consulted by the reference checker
    pub unresolved_policy: UnresolvedPolicy,
    /// Merge non-alloc strings program-wide
    pub global_string_merge: bool,
    /// The linker-synthesized input holding commons and internal sections
    pub internal_input: Option<InputId>,
    /// Size of the ELF header plus program headers, for SIZEOF_HEADERS
    pub headers_size: u64,
    /// Base VMA of the image
    pub image_base: u64,
    /// Program-wide survivor map for non-alloc strings
    pub non_alloc_strings: HashMap<Vec<u8>, StringRef>,
    /// FILL ranges recorded during assignment evaluation
    pub paddings: Vec<PaddingRecord>,
    /// `ASSERT`s that do not use `.`, evaluated after layout
    pub deferred_asserts: Vec<crate::script::command::Assignment>,
    /// True while reading LTO-generated native objects
    pub is_post_lto: bool,
}

impl Module {
    /// An empty module
    pub fn new(
        thread_count: usize,
        unresolved_policy: UnresolvedPolicy,
        global_string_merge: bool,
    ) -> Self {
        Module {
            inputs: Vec::new(),
            sections: Vec::new(),
            fragments: Vec::new(),
            name_pool: crate::symbol::pool::NamePool::default(),
            section_map: SectionMap::new(),
            script: LinkerScript::new(),
            segments: Vec::new(),
            memory_regions: Vec::new(),
            reloc_state: RelocBookkeeping::default(),
            diag: DiagnosticEngine::new(),
            dot: 0,
            thread_count,
            unresolved_policy,
            global_string_merge,
            internal_input: None,
            headers_size: 0,
            image_base: 0,
            non_alloc_strings: HashMap::new(),
            paddings: Vec::new(),
            deferred_asserts: Vec::new(),
            is_post_lto: false,
        }
    }

    /// A single-threaded module for unit tests
    pub fn for_tests() -> Self {
        Module::new(1, UnresolvedPolicy::ReportAll, false)
    }

    // ----- inputs -----

    /// Append an input; ordinal follows arena order
    pub fn add_input(&mut self, mut file: InputFile) -> InputId {
        let id = InputId(self.inputs.len() as u32);
        file.ordinal = id.0;
        self.inputs.push(file);
        id
    }

    /// One input
    pub fn input(&self, id: InputId) -> &InputFile {
        &self.inputs[id.idx()]
    }

    /// One input, mutably
    pub fn input_mut(&mut self, id: InputId) -> &mut InputFile {
        &mut self.inputs[id.idx()]
    }

    /// Every input id in order
    pub fn input_ids(&self) -> impl Iterator<Item = InputId> {
        (0..self.inputs.len() as u32).map(InputId)
    }

    /// The internal input, created on first use; commons and synthesized
    /// sections hang off it
    pub fn internal_input(&mut self) -> InputId {
        if let Some(id) = self.internal_input {
            return id;
        }
        let file = InputFile::new(Input::new("<internal>"), InputKind::Internal, Vec::new());
        let id = self.add_input(file);
        self.internal_input = Some(id);
        id
    }

    // ----- sections -----

    /// Append a section
    pub fn add_section(&mut self, section: Section) -> SectionId {
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(section);
        id
    }

    /// One section
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.idx()]
    }

    /// One section, mutably
    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.idx()]
    }

    /// Create an output section plus its map entry
    pub fn create_output_section(
        &mut self,
        name: &str,
        kind: SectionKind,
        sh_type: u32,
        flags: SectionFlags,
        align: u64,
    ) -> OutputSectId {
        let mut section = ElfSection::new(name, kind, sh_type, flags);
        section.align = align.max(1);
        let sid = self.add_section(Section::Elf(section));
        let entry = OutputSectionEntry::new(name, sid);
        let id = self.section_map.push_entry(entry);
        self.section_mut(sid).elf_mut().output = Some(id);
        id
    }

    /// Create the per-rule section clone that accumulates a rule's merged
    /// fragments
    pub fn create_rule_section(&mut self, output: OutputSectId) -> SectionId {
        let out_section = self.section(self.section_map.entry(output).section).elf();
        let mut clone = ElfSection::new(
            out_section.name.clone(),
            out_section.kind,
            out_section.sh_type,
            out_section.flags,
        );
        clone.output = Some(output);
        self.add_section(Section::Elf(clone))
    }

    // ----- fragments -----

    /// Append a fragment to its owner, maintaining the size invariant:
    /// the owner grows by `align_up(size, align) + frag.size`
    pub fn add_fragment(&mut self, fragment: Fragment) -> FragmentId {
        let id = FragmentId(self.fragments.len() as u32);
        let owner = fragment.owner;
        let align = fragment.align;
        let size = fragment.size();
        self.fragments.push(fragment);
        let section = self.section_mut(owner).elf_mut();
        debug_assert!(!section.no_fragments, "fragment appended to a pre-sized section");
        section.fragments.push(id);
        section.size = align_up(section.size, align) + size;
        section.align = section.align.max(align);
        id
    }

    /// One fragment
    pub fn fragment(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id.idx()]
    }

    /// One fragment, mutably
    pub fn fragment_mut(&mut self, id: FragmentId) -> &mut Fragment {
        &mut self.fragments[id.idx()]
    }

    /// Resolve an offset within an input section to a fragment reference
    pub fn fragment_ref_in(&self, section: SectionId, offset: u64) -> Option<FragmentRef> {
        let elf = self.section(section).elf();
        let mut at = 0u64;
        for &fid in &elf.fragments {
            let frag = self.fragment(fid);
            at = align_up(at, frag.align);
            let size = frag.size();
            if offset < at + size || (size == 0 && offset == at) {
                return Some(FragmentRef::new(fid, offset - at));
            }
            at += size;
        }
        None
    }

    // ----- regions / segments -----

    /// Find a memory region by name
    pub fn memory_region(&self, name: &str) -> Option<&MemoryRegion> {
        self.memory_regions.iter().find(|r| r.name == name)
    }

    /// Find a memory region by name, mutably
    pub fn memory_region_mut(&mut self, name: &str) -> Option<&mut MemoryRegion> {
        self.memory_regions.iter_mut().find(|r| r.name == name)
    }

    /// ELF header plus program header table size, once layout fixed it
    pub fn sizeof_headers(&self) -> u64 {
        self.headers_size
    }

    // ----- symbol values -----

    /// Final virtual address of a symbol. Valid after layout assigned
    /// section addresses; undefined and purely-dynamic symbols are zero.
    pub fn symbol_vma(&self, id: InfoId) -> Result<u64> {
        let info = self.name_pool.info(id);
        if info.desc == SymbolDesc::Undefined || (info.is_dyn() && info.dyn_defined) {
            return Ok(0);
        }
        if info.desc == SymbolDesc::Absolute {
            return Ok(info.value);
        }
        let Some(placement) = info.placement else {
            return Ok(info.value);
        };
        let symbol = self.name_pool.symbol(placement);
        if symbol.frag_ref.is_null() || symbol.frag_ref.is_discarded() {
            return Ok(info.value);
        }
        let frag = self.fragment(symbol.frag_ref.frag);
        let owner = self.section(frag.owner).elf();
        let Some(output) = owner.output else {
            return Ok(info.value);
        };
        let out_section = self.section(self.section_map.entry(output).section).elf();
        let base = out_section.addr.unwrap_or(0);
        Ok(base + frag.offset.unwrap_or(0) + symbol.frag_ref.offset)
    }

    /// Fold every defined symbol's final VMA back into its record, so
    /// expressions and the writer read one canonical value
    pub fn finalize_symbol_values(&mut self) -> Result<()> {
        let count = self.name_pool.infos().len();
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let id = InfoId(i as u32);
            let info = self.name_pool.info(id);
            if info.desc == SymbolDesc::Defined {
                values.push(Some(self.symbol_vma(id)?));
            } else {
                values.push(None);
            }
        }
        for (i, value) in values.into_iter().enumerate() {
            if let Some(value) = value {
                self.name_pool.info_mut(InfoId(i as u32)).value = value;
            }
        }
        Ok(())
    }

    /// Redirect an offset into a merge-string input section to the final
    /// VMA of the surviving copy
    pub fn merge_string_target(&self, section: SectionId, input_offset: u64) -> Option<u64> {
        let elf = self.section(section).elf();
        let frag_id = *elf.fragments.first()?;
        let FragmentKind::MergeString(ms) = &self.fragment(frag_id).kind else {
            return None;
        };
        let index = ms.find_string(input_offset)?;
        let string = &ms.strings[index];
        let delta = input_offset - string.input_offset as u64;
        let (target_frag, target_index) = if string.exclude {
            let output = elf.output?;
            let survivor = if self.global_string_merge && !elf.is_alloc() {
                self.non_alloc_strings.get(&string.bytes).copied()?
            } else {
                let this = StringRef { frag: frag_id, index: index as u32 };
                self.section_map
                    .entry(output)
                    .merged_string(&string.bytes, this)?
            };
            (survivor.frag, survivor.index as usize)
        } else {
            (frag_id, index)
        };
        let FragmentKind::MergeString(target_ms) = &self.fragment(target_frag).kind else {
            return None;
        };
        let target_string = &target_ms.strings[target_index];
        let owner = self.section(self.fragment(target_frag).owner).elf();
        let output = owner.output?;
        let out_section = self.section(self.section_map.entry(output).section).elf();
        Some(out_section.addr? + target_string.output_offset as u64 + delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::section_type;

    #[test]
    fn fragment_append_maintains_size_invariant() {
        let mut module = Module::for_tests();
        let sid = module.add_section(Section::Elf(ElfSection::new(
            ".data",
            SectionKind::Regular,
            section_type::PROGBITS,
            SectionFlags::ALLOC | SectionFlags::WRITE,
        )));
        module.add_fragment(Fragment::new(sid, 1, FragmentKind::Region(vec![0; 3])));
        module.add_fragment(Fragment::new(sid, 8, FragmentKind::Region(vec![0; 5])));
        let elf = module.section(sid).elf();
        assert_eq!(elf.size, 8 + 5);
        assert_eq!(elf.align, 8);
    }

    #[test]
    fn fragment_ref_resolution_accounts_for_alignment() {
        let mut module = Module::for_tests();
        let sid = module.add_section(Section::Elf(ElfSection::new(
            ".text",
            SectionKind::Regular,
            section_type::PROGBITS,
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        )));
        let a = module.add_fragment(Fragment::new(sid, 1, FragmentKind::Region(vec![0; 3])));
        let b = module.add_fragment(Fragment::new(sid, 4, FragmentKind::Region(vec![0; 4])));
        assert_eq!(module.fragment_ref_in(sid, 2), Some(FragmentRef::new(a, 2)));
        assert_eq!(module.fragment_ref_in(sid, 5), Some(FragmentRef::new(b, 1)));
        assert_eq!(module.fragment_ref_in(sid, 100), None);
    }

    #[test]
    fn internal_input_is_created_once() {
        let mut module = Module::for_tests();
        let a = module.internal_input();
        let b = module.internal_input();
        assert_eq!(a, b);
        assert_eq!(module.input(a).kind, InputKind::Internal);
    }
}
