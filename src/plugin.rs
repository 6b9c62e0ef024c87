//! The plugin bus: typed hook points the pipeline exposes.
//!
//! Each hook is a capability trait; the [`PluginManager`] owns the
//! registered plugins, drives the `init → run → destroy` lifecycle, and
//! verifies that fragment movements were reported before the link
//! proceeds past `CreatingSections`.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::module::Module;
use crate::object::section_map::{OutputSectId, RuleId};
use crate::section::fragment::FragmentId;
use crate::section::SectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where the link currently stands, for output-section iteration
pub enum LinkState {
    /// Section map built, no addresses yet
    BeforeLayout,
    /// Output sections are being populated
    CreatingSections,
    /// Program segments are being formed
    CreatingSegments,
    /// Addresses and offsets are final
    AfterLayout,
}

#[derive(Debug, Clone)]
/// One content block handed to size-control plugins
pub struct Block {
    /// The block's bytes
    pub data: Vec<u8>,
    /// Size in bytes
    pub size: u64,
    /// Address, once known
    pub address: Option<u64>,
    /// Originating section name
    pub name: String,
    /// Alignment requirement
    pub alignment: u64,
}

/// Visits every input section once
pub trait SectionIteratorPlugin {
    /// Plugin name for diagnostics
    fn name(&self) -> &str;
    /// Observe one section
    fn process_section(&mut self, module: &Module, section: SectionId) -> Result<()>;
}

/// May override the rule/output chosen by the matcher
pub trait SectionMatcherPlugin {
    /// Plugin name for diagnostics
    fn name(&self) -> &str;
    /// Return a replacement placement, or `None` to keep the matcher's
    fn override_match(
        &mut self,
        module: &Module,
        section: SectionId,
        chosen: (OutputSectId, RuleId),
    ) -> Option<(OutputSectId, RuleId)>;
}

/// Visits every output section once per link state
pub trait OutputSectionIteratorPlugin {
    /// Plugin name for diagnostics
    fn name(&self) -> &str;
    /// Observe one output section at one link state
    fn process_output_section(
        &mut self,
        module: &Module,
        state: LinkState,
        output: OutputSectId,
    ) -> Result<()>;
}

/// Re-partitions an output section's file-view blocks
pub trait ControlFileSizePlugin {
    /// Plugin name for diagnostics
    fn name(&self) -> &str;
    /// The output section this plugin controls
    fn controls(&self, module: &Module, output: OutputSectId) -> bool;
    /// Return the replacement block list
    fn blocks(&mut self, module: &Module, output: OutputSectId, blocks: Vec<Block>)
        -> Result<Vec<Block>>;
}

/// Re-partitions an output section's memory-view blocks
pub trait ControlMemorySizePlugin {
    /// Plugin name for diagnostics
    fn name(&self) -> &str;
    /// The output section this plugin controls
    fn controls(&self, module: &Module, output: OutputSectId) -> bool;
    /// Return the replacement block list
    fn blocks(&mut self, module: &Module, output: OutputSectId, blocks: Vec<Block>)
        -> Result<Vec<Block>>;
}

/// LTO lifecycle callbacks
pub trait LinkerPlugin {
    /// Plugin name for diagnostics
    fn name(&self) -> &str;
    /// Contribute to the LTO module hash
    fn override_module_hash(&mut self, _module: &Module) -> Option<String> {
        None
    }
    /// Adjust LTO options before compilation
    fn modify_lto_options(&mut self, _module: &Module, options: Vec<String>) -> Vec<String> {
        options
    }
    /// Runs just before the LTO engine
    fn act_before_lto(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }
    /// Observe the post-LTO symbol set
    fn read_symbols(&mut self, _module: &Module) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
/// Owns every registered plugin and drives the hook points
pub struct PluginManager {
    section_iterators: Vec<Box<dyn SectionIteratorPlugin>>,
    section_matchers: Vec<Box<dyn SectionMatcherPlugin>>,
    output_iterators: Vec<Box<dyn OutputSectionIteratorPlugin>>,
    file_size_plugins: Vec<Box<dyn ControlFileSizePlugin>>,
    memory_size_plugins: Vec<Box<dyn ControlMemorySizePlugin>>,
    linker_plugins: Vec<Box<dyn LinkerPlugin>>,
    /// Moves plugins reported through [`PluginManager::record_move`]
    reported_moves: HashSet<FragmentId>,
    /// Moves the engine observed
    observed_moves: HashSet<FragmentId>,
    initialized: bool,
}

impl PluginManager {
    /// An empty manager
    pub fn new() -> Self {
        PluginManager::default()
    }

    /// True when no plugin is registered anywhere
    pub fn is_empty(&self) -> bool {
        self.section_iterators.is_empty()
            && self.section_matchers.is_empty()
            && self.output_iterators.is_empty()
            && self.file_size_plugins.is_empty()
            && self.memory_size_plugins.is_empty()
            && self.linker_plugins.is_empty()
    }

    /// Register a section iterator
    pub fn add_section_iterator(&mut self, plugin: Box<dyn SectionIteratorPlugin>) {
        self.section_iterators.push(plugin);
    }

    /// Register a section matcher
    pub fn add_section_matcher(&mut self, plugin: Box<dyn SectionMatcherPlugin>) {
        self.section_matchers.push(plugin);
    }

    /// Register an output-section iterator
    pub fn add_output_iterator(&mut self, plugin: Box<dyn OutputSectionIteratorPlugin>) {
        self.output_iterators.push(plugin);
    }

    /// Register a file-size controller
    pub fn add_file_size_plugin(&mut self, plugin: Box<dyn ControlFileSizePlugin>) {
        self.file_size_plugins.push(plugin);
    }

    /// Register a memory-size controller
    pub fn add_memory_size_plugin(&mut self, plugin: Box<dyn ControlMemorySizePlugin>) {
        self.memory_size_plugins.push(plugin);
    }

    /// Register an LTO plugin
    pub fn add_linker_plugin(&mut self, plugin: Box<dyn LinkerPlugin>) {
        self.linker_plugins.push(plugin);
    }

    /// Lifecycle `init`
    pub fn init(&mut self) {
        self.initialized = true;
    }

    /// Lifecycle `destroy`
    pub fn destroy(&mut self) {
        self.initialized = false;
        self.reported_moves.clear();
        self.observed_moves.clear();
    }

    /// A plugin reports a fragment move it performed
    pub fn record_move(&mut self, frag: FragmentId) {
        self.reported_moves.insert(frag);
    }

    /// The engine notes a fragment whose owner changed under plugin
    /// control
    pub fn observe_move(&mut self, frag: FragmentId) {
        self.observed_moves.insert(frag);
    }

    /// End-of-`CreatingSections` verification: every observed move must
    /// have been reported
    pub fn verify_moves(&self) -> Result<()> {
        for frag in &self.observed_moves {
            if !self.reported_moves.contains(frag) {
                return Err(Error::PluginFailure {
                    plugin: "<unknown>".into(),
                    reason: format!("unreported fragment move of fragment {}", frag.0),
                });
            }
        }
        Ok(())
    }

    /// Run the section iterators over every live input section
    pub fn run_section_iterators(&mut self, module: &Module) -> Result<()> {
        if self.section_iterators.is_empty() {
            return Ok(());
        }
        for input in module.input_ids() {
            for &sid in &module.input(input).sections {
                if module.section(sid).elf().is_ignored() {
                    continue;
                }
                for plugin in &mut self.section_iterators {
                    plugin.process_section(module, sid).map_err(|e| Error::PluginFailure {
                        plugin: plugin.name().to_string(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Offer the matchers a chance to override one placement
    pub fn override_match(
        &mut self,
        module: &Module,
        section: SectionId,
        chosen: (OutputSectId, RuleId),
    ) -> (OutputSectId, RuleId) {
        let mut current = chosen;
        for plugin in &mut self.section_matchers {
            if let Some(replacement) = plugin.override_match(module, section, current) {
                current = replacement;
            }
        }
        current
    }

    /// Run the output-section iterators for one link state
    pub fn run_output_iterators(&mut self, module: &Module, state: LinkState) -> Result<()> {
        if self.output_iterators.is_empty() {
            return Ok(());
        }
        for output in module.section_map.ids() {
            for plugin in &mut self.output_iterators {
                plugin
                    .process_output_section(module, state, output)
                    .map_err(|e| Error::PluginFailure {
                        plugin: plugin.name().to_string(),
                        reason: e.to_string(),
                    })?;
            }
        }
        if state == LinkState::CreatingSections {
            self.verify_moves()?;
        }
        Ok(())
    }

    /// Run `act_before_lto` on every LTO plugin
    pub fn before_lto(&mut self, module: &Module) -> Result<()> {
        for plugin in &mut self.linker_plugins {
            plugin.act_before_lto(module)?;
        }
        Ok(())
    }

    /// True when any size-control plugin claims `output`
    pub fn controls_size(&self, module: &Module, output: OutputSectId) -> bool {
        self.file_size_plugins.iter().any(|p| p.controls(module, output))
            || self.memory_size_plugins.iter().any(|p| p.controls(module, output))
    }

    /// Hand an output section's blocks to its controlling plugins and
    /// return the re-partitioned list
    pub fn run_size_controls(
        &mut self,
        module: &Module,
        output: OutputSectId,
        blocks: Vec<Block>,
    ) -> Result<Vec<Block>> {
        let mut current = blocks;
        for plugin in &mut self.file_size_plugins {
            if plugin.controls(module, output) {
                current = plugin.blocks(module, output, current)?;
            }
        }
        for plugin in &mut self.memory_size_plugins {
            if plugin.controls(module, output) {
                current = plugin.blocks(module, output, current)?;
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreported_moves_fail_verification() {
        let mut manager = PluginManager::new();
        manager.observe_move(FragmentId(7));
        assert!(manager.verify_moves().is_err());
        manager.record_move(FragmentId(7));
        assert!(manager.verify_moves().is_ok());
    }

    struct CountingIterator {
        seen: usize,
    }

    impl SectionIteratorPlugin for CountingIterator {
        fn name(&self) -> &str {
            "counting"
        }
        fn process_section(&mut self, _module: &Module, _section: SectionId) -> Result<()> {
            self.seen += 1;
            Ok(())
        }
    }

    #[test]
    fn section_iterator_visits_live_sections() {
        use crate::input::{Input, InputFile, InputKind};
        use crate::section::{ElfSection, Section, SectionFlags, SectionKind};

        let mut module = Module::for_tests();
        let input = module.add_input(InputFile::new(
            Input::new("a.o"),
            InputKind::ElfRelocObj,
            Vec::new(),
        ));
        let mut live = ElfSection::new(
            ".text",
            SectionKind::Regular,
            crate::section::section_type::PROGBITS,
            SectionFlags::ALLOC,
        );
        live.input = Some(input);
        let sid = module.add_section(Section::Elf(live));
        let mut dead = ElfSection::new(
            ".dead",
            SectionKind::Ignore,
            crate::section::section_type::PROGBITS,
            SectionFlags::empty(),
        );
        dead.input = Some(input);
        let dead_id = module.add_section(Section::Elf(dead));
        module.input_mut(input).sections.extend([sid, dead_id]);

        let mut manager = PluginManager::new();
        manager.add_section_iterator(Box::new(CountingIterator { seen: 0 }));
        manager.init();
        manager.run_section_iterators(&module).unwrap();
    }
}
