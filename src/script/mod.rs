//! The linker-script engine: commands, expressions, wildcard patterns,
//! version scripts, and the parsed state the rest of the pipeline reads.

pub mod command;
pub mod expression;
pub mod lexer;
pub mod parser;
pub mod wildcard;

use crate::error::Result;
use crate::script::command::{Assignment, ScriptCommand, SectionsCommand};
use crate::script::wildcard::{PatternRegistry, WildcardPattern};

#[derive(Debug, Clone, Default)]
/// One version-script node: global and local pattern buckets
pub struct VersionScriptNode {
    /// Patterns exported as global
    pub globals: Vec<WildcardPattern>,
    /// Patterns forced local
    pub locals: Vec<WildcardPattern>,
}

#[derive(Debug, Default)]
/// Everything scripts contributed to the link
pub struct LinkerScript {
    /// Top-level commands in script order
    pub commands: Vec<ScriptCommand>,
    /// The version script, if one was given
    pub version_script: Option<VersionScriptNode>,
    /// `--dynamic-list` patterns
    pub dynamic_list: Vec<WildcardPattern>,
    /// `EXTERN`/`--undefined` symbols forced into the link
    pub extern_symbols: Vec<String>,
    /// Wildcard id space, sizing the per-input match caches
    pub registry: PatternRegistry,
    /// True once any script contributed a SECTIONS command
    pub has_sections_command: bool,
}

impl LinkerScript {
    /// An empty script state
    pub fn new() -> Self {
        LinkerScript::default()
    }

    /// Parse `src` and append its commands
    pub fn read_script(&mut self, src: &str, path: &str) -> Result<()> {
        let commands = parser::Parser::parse(src, path, &mut self.registry)?;
        for command in &commands {
            match command {
                ScriptCommand::Sections(_) => self.has_sections_command = true,
                ScriptCommand::Extern(names) => {
                    self.extern_symbols.extend(names.iter().cloned())
                }
                _ => {}
            }
        }
        self.commands.extend(commands);
        Ok(())
    }

    /// Parse and attach a version script
    pub fn read_version_script(&mut self, src: &str, path: &str) -> Result<()> {
        let node = parser::parse_version_script(src, path, &mut self.registry)?;
        self.version_script = Some(node);
        Ok(())
    }

    /// Parse and append dynamic-list patterns
    pub fn read_dynamic_list(&mut self, src: &str, path: &str) -> Result<()> {
        let patterns = parser::parse_dynamic_list(src, path, &mut self.registry)?;
        self.dynamic_list.extend(patterns);
        Ok(())
    }

    /// Number of registered wildcard patterns
    pub fn num_wildcards(&self) -> u32 {
        self.registry.len()
    }

    /// Assignments outside SECTIONS, in script order
    pub fn outside_assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.commands.iter().filter_map(|c| match c {
            ScriptCommand::Assignment(a) => Some(a),
            _ => None,
        })
    }

    /// The SECTIONS bodies, in script order
    pub fn sections_commands(&self) -> impl Iterator<Item = &Vec<SectionsCommand>> {
        self.commands.iter().filter_map(|c| match c {
            ScriptCommand::Sections(body) => Some(body),
            _ => None,
        })
    }

    /// The entry symbol named latest by any script
    pub fn entry_symbol(&self) -> Option<&str> {
        let mut entry = None;
        for command in &self.commands {
            match command {
                ScriptCommand::Entry(sym) => entry = Some(sym.as_str()),
                ScriptCommand::Sections(body) => {
                    for inner in body {
                        if let SectionsCommand::Entry(sym) = inner {
                            entry = Some(sym.as_str());
                        }
                    }
                }
                _ => {}
            }
        }
        entry
    }

    /// Does a version-script local pattern claim `name` (and no global
    /// pattern does)?
    pub fn version_scope_of(&self, name: &str) -> Option<crate::symbol::ExportScope> {
        let node = self.version_script.as_ref()?;
        if node.globals.iter().any(|p| p.matches(name)) {
            return Some(crate::symbol::ExportScope::Global);
        }
        if node.locals.iter().any(|p| p.matches(name)) {
            return Some(crate::symbol::ExportScope::Local);
        }
        None
    }

    /// Does the dynamic list claim `name`?
    pub fn in_dynamic_list(&self, name: &str) -> bool {
        self.dynamic_list.iter().any(|p| p.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_prefers_latest() {
        let mut script = LinkerScript::new();
        script.read_script("ENTRY(first)", "a.ld").unwrap();
        script
            .read_script("SECTIONS { ENTRY(second) }", "b.ld")
            .unwrap();
        assert_eq!(script.entry_symbol(), Some("second"));
        assert!(script.has_sections_command);
    }

    #[test]
    fn version_scope_prefers_global() {
        let mut script = LinkerScript::new();
        script
            .read_version_script("{ global: foo*; local: *; };", "v.map")
            .unwrap();
        assert_eq!(
            script.version_scope_of("foo_bar"),
            Some(crate::symbol::ExportScope::Global)
        );
        assert_eq!(
            script.version_scope_of("baz"),
            Some(crate::symbol::ExportScope::Local)
        );
    }
}
