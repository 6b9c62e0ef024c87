//! The phase driver: one batch computation from inputs to one output
//! artifact.
//!
//! Phases run in the fixed order of the link pipeline; the diagnostic
//! channel is checked at every boundary and the first fatal aborts the
//! link without producing output.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::LinkerConfig;
use crate::error::{Error, Result};
use crate::input::{
    archive, group::GroupReader, synthesize_binary_input, Input, InputAttrs, InputFile, InputId,
    InputKind, ObjectReader,
};
use crate::layout;
use crate::lto::{LtoBridge, LtoEngine};
use crate::module::Module;
use crate::object::builder;
use crate::plugin::{LinkState, PluginManager};
use crate::script::command::ScriptCommand;
use crate::script::expression::{eval, EvalContext};
use crate::section::fragment::{Fragment, FragmentKind, FragmentRef};
use crate::section::{
    section_type, CommonSection, ElfSection, Section, SectionFlags, SectionId, SectionKind,
};
use crate::symbol::pool::SymbolDecl;
use crate::symbol::{SymbolBinding, SymbolDesc, SymbolType};
use crate::target::Backend;

#[derive(Debug)]
/// What a completed link produced
pub struct LinkOutput {
    /// The laid-out file image (headers left for the writer to fill)
    pub image: Vec<u8>,
    /// The entry point VMA
    pub entry: u64,
    /// The rendered link map, when requested
    pub map_text: Option<String>,
}

/// The byte-exact emission seam: serializes ELF headers, section
/// headers, and symbol tables around the engine-produced image
pub trait ObjectWriter {
    /// Write the final artifact
    fn write(&self, module: &Module, output: &LinkOutput, path: &Path) -> Result<()>;
}

/// Drives the link phases over one [`Module`]
pub struct ObjectLinker<'a> {
    /// The immutable configuration
    pub config: &'a LinkerConfig,
    /// The target capability set
    pub backend: &'a dyn Backend,
    /// The container-format reader
    pub reader: &'a dyn ObjectReader,
    /// The delegated LTO compiler, when bitcode may appear
    pub lto_engine: Option<&'a dyn LtoEngine>,
    /// The plugin bus
    pub plugins: PluginManager,
    /// The link state
    pub module: Module,
    groups: Vec<Vec<InputId>>,
    group_start: Option<usize>,
    build_id_frag: Option<crate::section::fragment::FragmentId>,
    timing_frag: Option<crate::section::fragment::FragmentId>,
}

impl<'a> ObjectLinker<'a> {
    /// A linker over fresh state
    pub fn new(
        config: &'a LinkerConfig,
        backend: &'a dyn Backend,
        reader: &'a dyn ObjectReader,
    ) -> Self {
        let mut module = Module::new(
            config.thread_count(),
            config.unresolved,
            config.global_string_merge,
        );
        module.name_pool.allow_multiple_definition = config.allow_multiple_definition;
        module.name_pool.wraps = config.wraps.clone();
        ObjectLinker {
            config,
            backend,
            reader,
            lto_engine: None,
            plugins: PluginManager::new(),
            module,
            groups: Vec::new(),
            group_start: None,
            build_id_frag: None,
            timing_frag: None,
        }
    }

    /// Attach the LTO engine
    pub fn with_lto(mut self, engine: &'a dyn LtoEngine) -> Self {
        self.lto_engine = Some(engine);
        self
    }

    // ---------------- input graph construction ----------------

    fn io_error(path: &Path, e: std::io::Error) -> Error {
        Error::Io { path: path.display().to_string(), kind: e.kind() }
    }

    /// Resolve a `-l` namespec or plain file name against the search
    /// directories
    pub fn resolve_input_name(&self, name: &str, static_only: bool) -> Option<PathBuf> {
        if let Some(spec) = name.strip_prefix("-l") {
            for dir in &self.config.search_dirs {
                if !static_only && !self.config.static_link {
                    let shared = dir.join(format!("lib{spec}.so"));
                    if shared.is_file() {
                        return Some(shared);
                    }
                }
                let archive = dir.join(format!("lib{spec}.a"));
                if archive.is_file() {
                    return Some(archive);
                }
            }
            return None;
        }
        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Some(direct);
        }
        self.config
            .search_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|p| p.is_file())
    }

    /// Load and add one input from the filesystem
    pub fn add_file(&mut self, path: &Path, attrs: InputAttrs) -> Result<InputId> {
        let content = std::fs::read(path).map_err(|e| Self::io_error(path, e))?;
        self.add_input_bytes(path, content, attrs)
    }

    /// Add one input whose bytes the driver already holds
    pub fn add_input_bytes(
        &mut self,
        path: &Path,
        content: Vec<u8>,
        attrs: InputAttrs,
    ) -> Result<InputId> {
        let kind = self.reader.identify(path, &content)?;
        let mut input = Input::new(path);
        input.attrs = attrs;
        let id = self.module.add_input(InputFile::new(input, kind, content));
        debug!("input {} classified {kind:?}", path.display());
        match kind {
            InputKind::LinkerScript => self.read_linker_script(id, attrs)?,
            InputKind::Binary => synthesize_binary_input(&mut self.module, id)?,
            InputKind::SymDef => self.read_symdef(id)?,
            InputKind::Archive => {}
            _ => self.reader.read(&mut self.module, id)?,
        }
        Ok(id)
    }

    fn read_linker_script(&mut self, id: InputId, attrs: InputAttrs) -> Result<()> {
        let (text, path) = {
            let file = self.module.input(id);
            (
                String::from_utf8_lossy(&file.content).into_owned(),
                file.decorated_path(),
            )
        };
        let before = self.module.script.commands.len();
        self.module.script.read_script(&text, &path)?;
        // Expand INPUT(...)/GROUP(...) the script contributed.
        let new_commands: Vec<ScriptCommand> =
            self.module.script.commands[before..].to_vec();
        for command in new_commands {
            match command {
                ScriptCommand::Input(names) => {
                    for name in names {
                        self.add_named_input(&name, attrs)?;
                    }
                }
                ScriptCommand::Group(names) => {
                    self.begin_group();
                    for name in names {
                        self.add_named_input(&name, attrs)?;
                    }
                    self.end_group();
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_named_input(&mut self, name: &str, attrs: InputAttrs) -> Result<InputId> {
        let path = self
            .resolve_input_name(name, attrs.static_only)
            .ok_or_else(|| Error::Io {
                path: name.to_string(),
                kind: std::io::ErrorKind::NotFound,
            })?;
        self.add_file(&path, attrs)
    }

    fn read_symdef(&mut self, id: InputId) -> Result<()> {
        let (text, path) = {
            let file = self.module.input(id);
            (
                String::from_utf8_lossy(&file.content).into_owned(),
                file.decorated_path(),
            )
        };
        for (name, value, symbol_type) in crate::input::parse_symdef(&text) {
            let decl = SymbolDecl::builder()
                .origin(id)
                .origin_path(path.clone())
                .name(name)
                .desc(SymbolDesc::Absolute)
                .binding(SymbolBinding::Global)
                .symbol_type(symbol_type)
                .value(value)
                .build();
            self.module.name_pool.insert_symbol(decl)?;
        }
        Ok(())
    }

    /// Open a `--start-group`
    pub fn begin_group(&mut self) {
        self.group_start = Some(self.module.inputs.len());
    }

    /// Close a `--end-group`; members are everything added since the
    /// matching open
    pub fn end_group(&mut self) {
        if let Some(start) = self.group_start.take() {
            let members: Vec<InputId> = (start..self.module.inputs.len())
                .map(|i| InputId(i as u32))
                .collect();
            if !members.is_empty() {
                self.groups.push(members);
            }
        }
    }

    /// Force an undefined global reference, so archives extract it
    pub fn force_undefined(&mut self, name: &str) -> Result<()> {
        let origin = self.module.internal_input();
        let decl = SymbolDecl::builder()
            .origin(origin)
            .origin_path("<internal>")
            .name(name)
            .desc(SymbolDesc::Undefined)
            .binding(SymbolBinding::Global)
            .build();
        self.module.name_pool.insert_symbol(decl)?;
        Ok(())
    }

    // ---------------- phases ----------------

    fn read_remaining_archives(&mut self) -> Result<()> {
        let groups = self.groups.clone();
        for group in &groups {
            GroupReader::read_group(&mut self.module, self.reader, group)?;
        }
        loop {
            let mut progressed = false;
            for id in self.module.input_ids().collect::<Vec<_>>() {
                if self.module.input(id).kind != InputKind::Archive {
                    continue;
                }
                progressed |= archive::extract_for_undefined(&mut self.module, self.reader, id)?;
            }
            if !progressed {
                break;
            }
        }
        self.module.diag.check_phase()
    }

    fn apply_version_scopes(&mut self) {
        let scopes: Vec<_> = self
            .module
            .name_pool
            .infos()
            .iter()
            .enumerate()
            .filter_map(|(i, info)| {
                self.module
                    .script
                    .version_scope_of(&info.name)
                    .map(|scope| (crate::symbol::InfoId(i as u32), scope))
            })
            .collect();
        for (id, scope) in scopes {
            self.module.name_pool.set_scope(id, scope);
        }
    }

    fn mark_needed_shared_objects(&mut self) {
        let used: Vec<InputId> = self
            .module
            .name_pool
            .infos()
            .iter()
            .filter(|info| info.referenced_by_regular && info.dyn_defined)
            .filter_map(|info| info.origin)
            .collect();
        for id in used {
            self.module.input_mut(id).used = true;
        }
    }

    /// Promote surviving commons to definitions in per-symbol
    /// `COMMON.<name>` sections on the internal input
    fn allocate_commons(&mut self) -> Result<()> {
        if self.config.is_relocatable() {
            return Ok(());
        }
        let internal = self.module.internal_input();
        let commons: Vec<(crate::symbol::InfoId, String, u64, u64, Option<InputId>)> = self
            .module
            .name_pool
            .infos()
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_common())
            .map(|(i, info)| {
                (
                    crate::symbol::InfoId(i as u32),
                    info.name.clone(),
                    info.size,
                    info.value.max(1),
                    info.origin,
                )
            })
            .collect();
        for (info_id, name, size, align, origin) in commons {
            let mut elf = ElfSection::new(
                format!("COMMON.{name}"),
                SectionKind::Common,
                section_type::NOBITS,
                SectionFlags::ALLOC | SectionFlags::WRITE,
            );
            elf.align = align;
            elf.input = Some(internal);
            let sid = self.module.add_section(Section::Common(CommonSection {
                elf,
                origin: origin.unwrap_or(internal),
            }));
            self.module.input_mut(internal).sections.push(sid);
            let frag = self.module.add_fragment(Fragment::new(
                sid,
                align,
                FragmentKind::Fill { value: 0, value_size: 1, size },
            ));
            let decl = SymbolDecl::builder()
                .origin(internal)
                .origin_path("<common>")
                .name(name)
                .desc(SymbolDesc::Defined)
                .binding(SymbolBinding::Global)
                .symbol_type(SymbolType::Object)
                .size(size)
                .frag_ref(FragmentRef::new(frag, 0))
                .section(sid)
                .build();
            // Bare placement creation; the record flips to Defined below
            // without re-running resolution.
            let (_, symbol) = self.module.name_pool.create_symbol(decl);
            let record = self.module.name_pool.info_mut(info_id);
            record.desc = SymbolDesc::Defined;
            record.section = Some(sid);
            record.placement = Some(symbol);
            record.value = 0;
        }
        Ok(())
    }

    /// Synthesize the `.note.gnu.build-id` section with a zeroed digest;
    /// the digest lands after the image is complete
    fn synthesize_build_id(&mut self) {
        let Some(style) = &self.config.build_id else { return };
        let digest_len = match style {
            crate::config::BuildIdStyle::Fast => 8usize,
            crate::config::BuildIdStyle::Uuid => 16,
            crate::config::BuildIdStyle::Sha1 => 20,
            crate::config::BuildIdStyle::Hex(bytes) => bytes.len(),
        };
        // Generic ELF note: namesz, descsz, NT_GNU_BUILD_ID, "GNU\0".
        let mut note = Vec::with_capacity(16 + digest_len);
        note.extend_from_slice(&4u32.to_le_bytes());
        note.extend_from_slice(&(digest_len as u32).to_le_bytes());
        note.extend_from_slice(&3u32.to_le_bytes());
        note.extend_from_slice(b"GNU\0");
        if let crate::config::BuildIdStyle::Hex(bytes) = style {
            note.extend_from_slice(bytes);
        } else {
            note.extend_from_slice(&vec![0u8; digest_len]);
        }
        let internal = self.module.internal_input();
        let mut elf = ElfSection::new(
            ".note.gnu.build-id",
            SectionKind::Note,
            section_type::NOTE,
            SectionFlags::ALLOC,
        );
        elf.align = 4;
        elf.input = Some(internal);
        let sid = self.module.add_section(Section::Elf(elf));
        self.module.input_mut(internal).sections.push(sid);
        let frag = self
            .module
            .add_fragment(Fragment::new(sid, 4, FragmentKind::BuildId(note)));
        self.build_id_frag = Some(frag);
    }

    /// Synthesize the timing section; the duration lands at emit
    fn synthesize_timing_section(&mut self) {
        if !self.config.emit_timing_stats {
            return;
        }
        let begin_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let slice = crate::section::fragment::TimingSlice {
            begin_ms,
            duration_ms: 0,
            module_name: self.config.output_path.display().to_string(),
        };
        let internal = self.module.internal_input();
        let mut elf = ElfSection::new(
            ".note.linker.timing",
            SectionKind::Timing,
            section_type::NOTE,
            SectionFlags::empty(),
        );
        elf.align = 8;
        elf.input = Some(internal);
        let sid = self.module.add_section(Section::Elf(elf));
        self.module.input_mut(internal).sections.push(sid);
        let frag = self
            .module
            .add_fragment(Fragment::new(sid, 8, FragmentKind::Timing(slice)));
        self.timing_frag = Some(frag);
    }

    /// File position of a synthesized fragment, once layout ran
    fn fragment_file_pos(&self, frag: crate::section::fragment::FragmentId) -> Option<u64> {
        let module = &self.module;
        let fragment = module.fragment(frag);
        let owner = module.section(fragment.owner).elf();
        let output = owner.output?;
        let out = module.section(module.section_map.entry(output).section).elf();
        Some(out.offset? + fragment.offset?)
    }

    /// Fold the finished image into the build-id digest and patch it in
    fn patch_build_id(&self, image: &mut [u8]) {
        let Some(frag) = self.build_id_frag else { return };
        if matches!(self.config.build_id, Some(crate::config::BuildIdStyle::Hex(_))) {
            return;
        }
        let Some(pos) = self.fragment_file_pos(frag) else { return };
        let size = self.module.fragment(frag).size() as usize;
        let digest_at = pos as usize + 16;
        let digest_len = size - 16;
        if digest_at + digest_len > image.len() {
            return;
        }
        // FNV-1a folded in digest-sized chunks over the zero-digest image.
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for &byte in image.iter() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        let mut cursor = hash;
        for chunk in image[digest_at..digest_at + digest_len].chunks_mut(8) {
            let bytes = cursor.to_le_bytes();
            for (b, v) in chunk.iter_mut().zip(bytes.iter()) {
                *b = *v;
            }
            cursor = cursor.wrapping_mul(0x100_0000_01b3).rotate_left(17);
        }
    }

    /// `--gc-sections`: mark from the entry symbol, KEEP-matched
    /// sections, and `SHF_GNU_RETAIN`, following relocation edges; sweep
    /// unreached allocatable sections
    fn gc_sections(&mut self) -> Result<()> {
        if !self.config.gc_sections || self.config.is_relocatable() {
            return Ok(());
        }
        let module = &self.module;
        let mut reachable = vec![false; module.sections.len()];
        let mut worklist: Vec<SectionId> = Vec::new();

        let mut root = |sid: SectionId, worklist: &mut Vec<SectionId>| {
            if !reachable[sid.idx()] {
                reachable[sid.idx()] = true;
                worklist.push(sid);
            }
        };
        for &sid in &module.section_map.entry_sections {
            root(sid, &mut worklist);
        }
        let entry_name = self
            .config
            .entry
            .clone()
            .or_else(|| module.script.entry_symbol().map(str::to_string))
            .unwrap_or_else(|| "_start".to_string());
        if let Some(id) = module.name_pool.find_info(&entry_name) {
            if let Some(sid) = module.name_pool.info(id).section {
                root(sid, &mut worklist);
            }
        }
        for (idx, section) in module.sections.iter().enumerate() {
            let elf = section.elf();
            let retained = elf.flags.contains(SectionFlags::GNU_RETAIN);
            // Non-alloc metadata survives collection.
            if retained || (!elf.is_alloc() && elf.input.is_some()) {
                root(SectionId(idx as u32), &mut worklist);
            }
        }

        // Relocation edges: the section holding the relocation keeps the
        // section holding its target alive.
        let mut edges: std::collections::HashMap<SectionId, Vec<SectionId>> =
            std::collections::HashMap::new();
        for input in module.input_ids() {
            for reloc in &module.input(input).relocations {
                if let Some(target) = module.name_pool.info(reloc.symbol).section {
                    edges.entry(reloc.section).or_default().push(target);
                }
            }
        }
        while let Some(sid) = worklist.pop() {
            if let Some(targets) = edges.get(&sid) {
                for &target in targets {
                    if !reachable[target.idx()] {
                        reachable[target.idx()] = true;
                        worklist.push(target);
                    }
                }
            }
        }

        let mut swept = 0usize;
        for (idx, section) in self.module.sections.iter_mut().enumerate() {
            let elf = section.elf_mut();
            if reachable[idx] || elf.input.is_none() || !elf.is_alloc() || elf.is_ignored() {
                continue;
            }
            elf.kind = SectionKind::Ignore;
            elf.output = None;
            swept += 1;
        }
        debug!("gc-sections swept {swept} section(s)");
        Ok(())
    }

    fn run_lto(&mut self) -> Result<bool> {
        let Some(engine) = self.lto_engine else { return Ok(false) };
        if LtoBridge::bitcode_inputs(&self.module).is_empty() {
            return Ok(false);
        }
        self.plugins.before_lto(&self.module)?;
        let mut bridge = LtoBridge::new();
        let natives = bridge.run_phase_a(&mut self.module, self.config, engine)?;
        bridge.enter_phase_b(&mut self.module);
        self.module.is_post_lto = true;
        for path in natives {
            let content = std::fs::read(&path).map_err(|e| Self::io_error(&path, e))?;
            self.add_input_bytes(&path, content, InputAttrs::default())?;
        }
        bridge.restore_wraps(&mut self.module);
        self.module.diag.check_phase()?;
        Ok(true)
    }

    fn match_and_order(&mut self, script_count: usize) -> Result<()> {
        let orphans =
            builder::assign_output_sections(&mut self.module, self.config, &mut self.plugins)?;
        let discard_orphans = self.config.orphan_handling
            == crate::config::OrphanMode::Discard
            && self.module.script.has_sections_command;
        if discard_orphans {
            for &sid in &orphans {
                self.module.section_mut(sid).elf_mut().kind = SectionKind::Discard;
            }
        } else {
            layout::place_orphans(&mut self.module, &orphans)?;
        }
        layout::order_output_sections(&mut self.module, self.backend, script_count);
        Ok(())
    }

    /// Run the whole pipeline and produce the output image
    pub fn link(&mut self) -> Result<LinkOutput> {
        let started = std::time::Instant::now();
        let config = self.config;
        info!(
            "linking {} input(s) into {}",
            self.module.inputs.len(),
            config.output_path.display()
        );
        self.synthesize_build_id();
        self.synthesize_timing_section();

        // Forced references keep archive extraction honest.
        let mut forced: Vec<String> = Vec::new();
        if let Some(entry) = &config.entry {
            forced.push(entry.clone());
        } else if let Some(entry) = self.module.script.entry_symbol() {
            forced.push(entry.to_string());
        }
        forced.extend(self.module.script.extern_symbols.clone());
        forced.extend(config.export_dynamic_symbols.iter().cloned());
        for name in forced {
            if self.module.name_pool.find_info(&name).is_none() {
                self.force_undefined(&name)?;
            }
        }

        self.read_remaining_archives()?;
        self.apply_version_scopes();
        self.mark_needed_shared_objects();

        self.plugins.init();
        self.plugins.run_section_iterators(&self.module)?;
        self.module.diag.check_phase()?;

        builder::dedup_comdat_groups(&mut self.module)?;
        self.allocate_commons()?;

        builder::build_script_section_map(&mut self.module)?;
        let script_count = self.module.section_map.len();
        self.match_and_order(script_count)?;
        crate::reloc::scan_relocations(&mut self.module, self.backend)?;
        self.module.diag.check_phase()?;

        // LTO re-entry: native objects substitute for bitcode, matching
        // and scanning re-run over the new inputs.
        if self.run_lto()? {
            builder::dedup_comdat_groups(&mut self.module)?;
            self.match_and_order(script_count)?;
            crate::reloc::scan_relocations(&mut self.module, self.backend)?;
            self.module.diag.check_phase()?;
        }

        self.gc_sections()?;
        builder::prepare_merge_strings(&mut self.module)?;
        builder::merge_strings(&mut self.module)?;

        self.plugins
            .run_output_iterators(&self.module, LinkState::BeforeLayout)?;
        builder::merge_matched_sections(&mut self.module)?;
        layout::sweep_discarded(&mut self.module);
        self.plugins
            .run_output_iterators(&self.module, LinkState::CreatingSections)?;
        self.apply_size_controls()?;

        self.plugins
            .run_output_iterators(&self.module, LinkState::CreatingSegments)?;
        layout::run_layout(&mut self.module, config, self.backend)?;
        layout::verify_fragment_offsets(&self.module)?;
        self.plugins
            .run_output_iterators(&self.module, LinkState::AfterLayout)?;

        layout::evaluate_data_commands(&mut self.module)?;
        crate::reloc::check_undefined(&self.module)?;

        let mut image = self.emit_image()?;
        crate::reloc::apply_relocations(&self.module, self.backend, &mut image)?;
        self.patch_build_id(&mut image);
        if let Some(frag) = self.timing_frag {
            if let Some(pos) = self.fragment_file_pos(frag) {
                let duration = started.elapsed().as_millis() as u64;
                let at = pos as usize + 8;
                if at + 8 <= image.len() {
                    image[at..at + 8].copy_from_slice(&duration.to_le_bytes());
                }
            }
        }

        let entry = self.entry_address()?;
        let map_text = config.map_file.is_some().then(|| {
            layout::map_file::render(&self.module)
        });
        self.plugins.destroy();
        info!("link complete: {} bytes, entry {entry:#x}", image.len());
        Ok(LinkOutput { image, entry, map_text })
    }

    /// Size-control plugins see each claimed output section as a block
    /// list and may re-partition it; the section's contents are replaced
    /// with one region per returned block.
    fn apply_size_controls(&mut self) -> Result<()> {
        if self.plugins.is_empty() {
            return Ok(());
        }
        let outputs: Vec<crate::object::section_map::OutputSectId> =
            self.module.section_map.ids().collect();
        for output in outputs {
            if !self.plugins.controls_size(&self.module, output) {
                continue;
            }
            let mut blocks = Vec::new();
            let rules: Vec<_> = self.module.section_map.entry(output).rules.clone();
            for rule in &rules {
                let rule_section = self.module.section_map.rule(*rule).section;
                let name = self.module.section(rule_section).elf().name.clone();
                for &fid in &self.module.section(rule_section).elf().fragments {
                    let frag = self.module.fragment(fid);
                    let mut data = vec![0u8; frag.size() as usize];
                    frag.emit_into(&mut data);
                    blocks.push(crate::plugin::Block {
                        size: data.len() as u64,
                        data,
                        address: None,
                        name: name.clone(),
                        alignment: frag.align,
                    });
                }
            }
            let replaced = self
                .plugins
                .run_size_controls(&self.module, output, blocks)?;
            // Rebuild the first rule's section from the returned blocks.
            let Some(&first_rule) = rules.first() else { continue };
            let rule_section = self.module.section_map.rule(first_rule).section;
            for rule in &rules {
                let section = self.module.section_map.rule(*rule).section;
                let elf = self.module.section_mut(section).elf_mut();
                elf.fragments.clear();
                elf.size = 0;
            }
            for block in replaced {
                let frag = Fragment::new(
                    rule_section,
                    block.alignment.max(1),
                    FragmentKind::Region(block.data),
                );
                let fid = self.module.add_fragment(frag);
                self.plugins.record_move(fid);
            }
        }
        Ok(())
    }

    fn entry_address(&self) -> Result<u64> {
        let name = self
            .config
            .entry
            .clone()
            .or_else(|| self.module.script.entry_symbol().map(str::to_string))
            .unwrap_or_else(|| "_start".to_string());
        match self.module.name_pool.find_info(&name) {
            Some(id) => self.module.symbol_vma(id),
            None => Ok(self.module.image_base),
        }
    }

    fn emit_image(&self) -> Result<Vec<u8>> {
        let module = &self.module;
        let mut file_size = module.headers_size;
        for id in layout::ordered_entries(module) {
            let entry = module.section_map.entry(id);
            if entry.is_discard {
                continue;
            }
            let elf = module.section(entry.section).elf();
            if elf.is_nobits() {
                continue;
            }
            if let Some(offset) = elf.offset {
                file_size = file_size.max(offset + elf.size);
            }
        }
        let mut image = vec![0u8; file_size as usize];

        for id in layout::ordered_entries(module) {
            let entry = module.section_map.entry(id);
            if entry.is_discard {
                continue;
            }
            let elf = module.section(entry.section).elf();
            if elf.is_nobits() {
                continue;
            }
            let Some(base) = elf.offset else { continue };

            // The epilog fill covers the whole span; fragments overwrite.
            if let Some(fill_expr) = &entry.epilog.fill {
                let ctx = EvalContext {
                    module,
                    dot: module.dot,
                    inside_sections: true,
                    current_section: Some(id),
                };
                let fill = eval(fill_expr, &ctx)?;
                fill_range(
                    &mut image,
                    base as usize,
                    (base + elf.size) as usize,
                    fill,
                );
            }

            for &rule_id in &entry.rules {
                let rule_section = module.section_map.rule(rule_id).section;
                for &fid in &module.section(rule_section).elf().fragments {
                    let frag = module.fragment(fid);
                    let size = frag.size() as usize;
                    if size == 0 {
                        continue;
                    }
                    let pos = (base + frag.get_offset()) as usize;
                    if pos + size <= image.len() {
                        frag.emit_into(&mut image[pos..pos + size]);
                    }
                }
            }
        }

        for padding in &module.paddings {
            let entry = module.section_map.entry(padding.output);
            let elf = module.section(entry.section).elf();
            if elf.is_nobits() {
                continue;
            }
            let Some(base) = elf.offset else { continue };
            fill_range(
                &mut image,
                (base + padding.start) as usize,
                (base + padding.end) as usize,
                padding.fill,
            );
        }
        Ok(image)
    }
}

/// Fill `[start, end)` with the pattern: a single byte for values that
/// fit one, the 4-byte big-endian pattern otherwise
fn fill_range(image: &mut [u8], start: usize, end: usize, fill: u64) {
    let end = end.min(image.len());
    if start >= end {
        return;
    }
    if fill <= 0xff {
        image[start..end].fill(fill as u8);
        return;
    }
    let pattern = (fill as u32).to_be_bytes();
    for (i, byte) in image[start..end].iter_mut().enumerate() {
        *byte = pattern[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_range_patterns() {
        let mut image = vec![0u8; 8];
        fill_range(&mut image, 1, 5, 0x90);
        assert_eq!(image, [0, 0x90, 0x90, 0x90, 0x90, 0, 0, 0]);
        let mut wide = vec![0u8; 6];
        fill_range(&mut wide, 0, 6, 0xdeadbeef);
        assert_eq!(wide, [0xde, 0xad, 0xbe, 0xef, 0xde, 0xad]);
    }
}
