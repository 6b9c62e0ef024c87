//! The LTO bridge: classify bitcode globals, hand the bitcode to the
//! external engine with per-symbol resolutions, and fold the generated
//! native objects back into the link.

use std::collections::BTreeSet;
use std::path::PathBuf;

use log::debug;

use crate::config::LinkerConfig;
use crate::error::Result;
use crate::input::{InputId, InputKind};
use crate::module::Module;
use crate::symbol::{InfoFlags, SymbolBinding};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Per-symbol resolution handed to the LTO engine
pub struct SymbolResolutionFlags {
    /// This copy is the one the link keeps
    pub prevailing: bool,
    /// A regular object can observe the symbol
    pub visible_to_regular_obj: bool,
    /// No definition outside the linkage unit can preempt this one
    pub final_definition_in_linkage_unit: bool,
    /// The linker renamed the symbol (`--wrap`)
    pub linker_redefined: bool,
}

#[derive(Debug, Clone)]
/// One bitcode input's resolutions, symbol by symbol
pub struct InputResolutions {
    /// The bitcode input
    pub input: InputId,
    /// `(name, flags)` per global the input declares
    pub symbols: Vec<(String, SymbolResolutionFlags)>,
}

/// The delegated LTO compiler.
///
/// Receives every bitcode input and the per-symbol resolutions, runs
/// code generation, and returns the paths of the generated native
/// objects.
pub trait LtoEngine {
    /// Compile the bitcode; returns native object paths
    fn run(&self, module: &Module, resolutions: &[InputResolutions]) -> Result<Vec<PathBuf>>;
}

/// State saved in phase A and restored in phase B
#[derive(Debug, Default)]
pub struct LtoBridge {
    /// Wrap renames to restore once the native objects are in
    saved_wraps: Vec<(String, String)>,
}

impl LtoBridge {
    /// An idle bridge
    pub fn new() -> Self {
        LtoBridge::default()
    }

    /// The bitcode inputs currently in the link
    pub fn bitcode_inputs(module: &Module) -> Vec<InputId> {
        module
            .input_ids()
            .filter(|&id| module.input(id).kind == InputKind::Bitcode && !module.input(id).released)
            .collect()
    }

    /// The symbols that must survive LTO regardless of what the bitcode
    /// compiler could prove
    pub fn preserved_symbols(module: &Module, config: &LinkerConfig) -> BTreeSet<String> {
        let mut preserved: BTreeSet<String> = BTreeSet::new();
        preserved.extend(config.export_dynamic_symbols.iter().cloned());
        preserved.extend(config.preserve_symbols_lto.iter().cloned());
        for wrap in &config.wraps {
            preserved.insert(wrap.clone());
            preserved.insert(format!("__wrap_{wrap}"));
            preserved.insert(format!("__real_{wrap}"));
        }
        if let Some(entry) = &config.entry {
            preserved.insert(entry.clone());
        }
        let script_has_sections = module.script.has_sections_command;
        for info in module.name_pool.infos() {
            if info.flags.contains(InfoFlags::SHOULD_PRESERVE) {
                preserved.insert(info.name.clone());
                continue;
            }
            // Referenced from a regular object.
            if info.in_bitcode() && info.referenced_by_regular {
                preserved.insert(info.name.clone());
                continue;
            }
            // Commons stay when a linker script may place them.
            if info.is_common() && script_has_sections {
                preserved.insert(info.name.clone());
                continue;
            }
            if module.script.in_dynamic_list(&info.name) {
                preserved.insert(info.name.clone());
            }
        }
        preserved
    }

    /// Phase A classification: compute `(prevailing, visible, final,
    /// redefined)` for every global of every bitcode input
    pub fn compute_resolutions(
        module: &Module,
        config: &LinkerConfig,
    ) -> Vec<InputResolutions> {
        let preserved = Self::preserved_symbols(module, config);
        let mut out = Vec::new();
        for input in Self::bitcode_inputs(module) {
            let file = module.input(input);
            let mut symbols = Vec::new();
            for &sym_id in &file.global_symbols {
                let info_id = module.name_pool.symbol(sym_id).info;
                let info = module.name_pool.info(info_id);
                let prevailing = info.origin == Some(input) && info.is_defined();
                let visible = preserved.contains(&info.name)
                    || info.referenced_by_regular && !info.visibility.is_hidden()
                    || config.export_dynamic && info.is_exportable();
                let final_def = prevailing
                    && !info.is_dyn()
                    && (config.is_shared() || !info.is_exportable() || config.static_link);
                let redefined = config.wraps.contains(&info.name)
                    || info.name.starts_with("__wrap_")
                        && config.wraps.contains(&info.name["__wrap_".len()..]);
                symbols.push((
                    info.name.clone(),
                    SymbolResolutionFlags {
                        prevailing,
                        visible_to_regular_obj: visible,
                        final_definition_in_linkage_unit: final_def,
                        linker_redefined: redefined,
                    },
                ));
            }
            out.push(InputResolutions { input, symbols });
        }
        out
    }

    /// Phase A: classify, preserve, and run the engine. Returns the
    /// generated native object paths; empty when no bitcode is present.
    pub fn run_phase_a(
        &mut self,
        module: &mut Module,
        config: &LinkerConfig,
        engine: &dyn LtoEngine,
    ) -> Result<Vec<PathBuf>> {
        let bitcode = Self::bitcode_inputs(module);
        if bitcode.is_empty() {
            return Ok(Vec::new());
        }
        self.saved_wraps = module
            .name_pool
            .wrap_renames()
            .iter()
            .map(|w| (w.original.clone(), w.renamed.clone()))
            .collect();
        let resolutions = Self::compute_resolutions(module, config);
        debug!("LTO: compiling {} bitcode input(s)", resolutions.len());
        engine.run(module, &resolutions)
    }

    /// Phase B: release bitcode memory and reset the per-input caches so
    /// the post-LTO re-entry re-runs matching and scanning cleanly
    pub fn enter_phase_b(&mut self, module: &mut Module) {
        for input in Self::bitcode_inputs(module) {
            module.input_mut(input).release_memory();
            let sections: Vec<_> = module.input(input).sections.clone();
            for sid in sections {
                module.section_mut(sid).elf_mut().kind = crate::section::SectionKind::Ignore;
            }
        }
        module.reloc_state = crate::reloc::RelocBookkeeping::default();
    }

    /// Restore `__wrap_`/`__real_` bindings saved in phase A
    pub fn restore_wraps(&self, module: &mut Module) {
        for (original, renamed) in &self.saved_wraps {
            let Some(renamed_id) = module.name_pool.find_info(renamed) else { continue };
            if module.name_pool.info(renamed_id).is_undefined() {
                if let Some(original_id) = module.name_pool.find_info(original) {
                    let binding = module.name_pool.info(original_id).binding;
                    let value = module.name_pool.info(original_id).value;
                    let record = module.name_pool.info_mut(renamed_id);
                    record.value = value;
                    record.binding = binding;
                    record.flags |= InfoFlags::IS_ALIAS;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetOptions;
    use crate::input::{Input, InputFile};
    use crate::symbol::pool::SymbolDecl;
    use crate::symbol::SymbolDesc;

    fn config() -> LinkerConfig {
        LinkerConfig::builder()
            .target(TargetOptions::builder().machine(62).build())
            .build()
    }

    #[test]
    fn prevailing_follows_the_name_pool() {
        let mut module = Module::for_tests();
        let bc = module.add_input(InputFile::new(
            Input::new("a.bc"),
            InputKind::Bitcode,
            vec![1, 2, 3],
        ));
        let decl = SymbolDecl::builder()
            .origin(bc)
            .origin_path("a.bc")
            .name("foo")
            .desc(SymbolDesc::Defined)
            .binding(SymbolBinding::Global)
            .in_bitcode(true)
            .build();
        let result = module.name_pool.insert_symbol(decl).unwrap();
        module.input_mut(bc).global_symbols.push(result.symbol);

        let resolutions = LtoBridge::compute_resolutions(&module, &config());
        assert_eq!(resolutions.len(), 1);
        let (name, flags) = &resolutions[0].symbols[0];
        assert_eq!(name, "foo");
        assert!(flags.prevailing);
    }

    #[test]
    fn phase_b_releases_bitcode() {
        let mut module = Module::for_tests();
        let bc = module.add_input(InputFile::new(
            Input::new("a.bc"),
            InputKind::Bitcode,
            vec![0; 128],
        ));
        let mut bridge = LtoBridge::new();
        bridge.enter_phase_b(&mut module);
        assert!(module.input(bc).released);
        assert!(module.input(bc).content.is_empty());
    }

    #[test]
    fn wrap_targets_are_preserved() {
        let mut module = Module::for_tests();
        let _ = module.internal_input();
        let mut config = config();
        config.wraps.insert("malloc".into());
        let preserved = LtoBridge::preserved_symbols(&module, &config);
        assert!(preserved.contains("malloc"));
        assert!(preserved.contains("__wrap_malloc"));
        assert!(preserved.contains("__real_malloc"));
    }
}
