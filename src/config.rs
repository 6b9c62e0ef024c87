//! Link-wide configuration assembled by the driver before the pipeline runs.
//!
//! The pipeline treats [`LinkerConfig`] as immutable; per-input attributes
//! that toggle along the command line (`--whole-archive`, `--start-lib`,
//! `AS_NEEDED`) are resolved into the input graph instead of living here.

use std::collections::BTreeSet;
use std::path::PathBuf;
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What kind of artifact the link produces
pub enum OutputKind {
    #[default]
    /// A fixed-address ELF executable
    Executable,
    /// A position-independent executable
    PositionIndependentExecutable,
    /// An ELF shared object
    SharedObject,
    /// A relocatable object (`-r`)
    Relocatable,
    /// A raw binary image
    Binary,
}

impl OutputKind {
    /// True for shared objects and PIEs, which need a dynamic base
    pub fn is_position_independent(self) -> bool {
        matches!(
            self,
            OutputKind::SharedObject | OutputKind::PositionIndependentExecutable
        )
    }

    /// True for partial links
    pub fn is_relocatable(self) -> bool {
        matches!(self, OutputKind::Relocatable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Policy for `--unresolved-symbols=`
pub enum UnresolvedPolicy {
    #[default]
    /// Report every unresolved symbol
    ReportAll,
    /// Report none
    IgnoreAll,
    /// Ignore unresolved symbols from object files
    IgnoreInObjectFiles,
    /// Ignore unresolved symbols from shared libraries
    IgnoreInSharedLibs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Policy for `--orphan-handling=`
pub enum OrphanMode {
    #[default]
    /// Place orphans silently
    Place,
    /// Place orphans and warn
    Warn,
    /// Treat an orphan as a link error
    Error,
    /// Discard orphan sections
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Which hash table sections to emit
pub enum HashStyle {
    /// `.hash` only
    SysV,
    /// `.gnu.hash` only
    Gnu,
    #[default]
    /// Both tables
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Style of the `.note.gnu.build-id` payload
pub enum BuildIdStyle {
    /// Fast non-cryptographic hash of the output
    Fast,
    /// 128-bit random identifier
    Uuid,
    /// SHA-1 of the output
    Sha1,
    /// Caller-supplied hex payload
    Hex(Vec<u8>),
}

#[derive(Debug, Clone, TypedBuilder)]
/// Immutable description of the target the link is producing code for.
///
/// Byte-exact format knowledge lives behind the reader/writer seams; the
/// engine only needs the facts that influence placement and bookkeeping.
pub struct TargetOptions {
    /// ELF e_machine of the output
    pub machine: u16,
    #[builder(default = true)]
    /// 64-bit output when true
    pub is_64bit: bool,
    #[builder(default = true)]
    /// Little-endian output when true
    pub is_little_endian: bool,
    #[builder(default = 0x1000)]
    /// Maximum page size; PT_LOAD congruence is modulo this
    pub max_page_size: u64,
    #[builder(default = 0x1000)]
    /// Common page size used for RELRO rounding
    pub common_page_size: u64,
    #[builder(default = true)]
    /// Relocation sections carry explicit addends (`.rela`)
    pub is_rela: bool,
    #[builder(default, setter(into, strip_option))]
    /// Program interpreter for dynamically linked executables
    pub dynamic_linker: Option<String>,
    #[builder(default, setter(into))]
    /// Emulation name, as `-m` would report it
    pub emulation: String,
}

#[derive(Debug, Clone, TypedBuilder)]
/// Everything the driver decided from the command line.
pub struct LinkerConfig {
    #[builder(default)]
    /// Kind of artifact to produce
    pub output_kind: OutputKind,
    #[builder(default = PathBuf::from("a.out"), setter(into))]
    /// Path of the output artifact
    pub output_path: PathBuf,
    /// Target facts
    pub target: TargetOptions,
    #[builder(default, setter(into, strip_option))]
    /// Entry symbol (`-e`), resolved late
    pub entry: Option<String>,
    #[builder(default)]
    /// Worker thread count; zero means hardware concurrency
    pub threads: usize,
    #[builder(default)]
    /// Symbols affected by `--wrap=`
    pub wraps: BTreeSet<String>,
    #[builder(default)]
    /// `--defsym name=expr` definitions, unparsed
    pub defsyms: Vec<(String, String)>,
    #[builder(default)]
    /// `--export-dynamic`
    pub export_dynamic: bool,
    #[builder(default)]
    /// `--export-dynamic-symbol` names
    pub export_dynamic_symbols: BTreeSet<String>,
    #[builder(default)]
    /// `--gc-sections`
    pub gc_sections: bool,
    #[builder(default)]
    /// `--emit-relocs`
    pub emit_relocs: bool,
    #[builder(default, setter(strip_option))]
    /// `--build-id[=style]`
    pub build_id: Option<BuildIdStyle>,
    #[builder(default = true)]
    /// `--relro` / `--no-relro`
    pub relro: bool,
    #[builder(default)]
    /// `-z now`: resolve all dynamic relocations at load time
    pub bind_now: bool,
    #[builder(default)]
    /// `--no-undefined`
    pub no_undefined: bool,
    #[builder(default)]
    /// `--unresolved-symbols=` policy
    pub unresolved: UnresolvedPolicy,
    #[builder(default)]
    /// `--orphan-handling=` policy
    pub orphan_handling: OrphanMode,
    #[builder(default)]
    /// `--hash-style=`
    pub hash_style: HashStyle,
    #[builder(default)]
    /// `--allow-multiple-definition`
    pub allow_multiple_definition: bool,
    #[builder(default)]
    /// `--global-string-merge`: merge non-alloc strings program-wide
    pub global_string_merge: bool,
    #[builder(default)]
    /// `--noinhibit-exec`: best-effort output despite errors
    pub noinhibit_exec: bool,
    #[builder(default)]
    /// `--strip-all`
    pub strip_all: bool,
    #[builder(default)]
    /// `--strip-debug`
    pub strip_debug: bool,
    #[builder(default)]
    /// `-static`
    pub static_link: bool,
    #[builder(default, setter(strip_option))]
    /// `--Map` output path
    pub map_file: Option<PathBuf>,
    #[builder(default, setter(strip_option))]
    /// `--save-temps[-dir]` directory for LTO artifacts
    pub save_temps_dir: Option<PathBuf>,
    #[builder(default)]
    /// Symbols preserved across LTO regardless of references
    pub preserve_symbols_lto: BTreeSet<String>,
    #[builder(default)]
    /// `--compress-debug-sections`
    pub compress_debug_sections: bool,
    #[builder(default)]
    /// Record link wall-clock statistics into a timing section
    pub emit_timing_stats: bool,
    #[builder(default)]
    /// Library search directories (`-L`)
    pub search_dirs: Vec<PathBuf>,
}

impl LinkerConfig {
    /// True when the output needs `.dynsym`/`.dynamic` machinery
    pub fn has_dynamic_sections(&self) -> bool {
        !self.static_link
            && matches!(
                self.output_kind,
                OutputKind::Executable
                    | OutputKind::PositionIndependentExecutable
                    | OutputKind::SharedObject
            )
    }

    /// True for `-shared`
    pub fn is_shared(&self) -> bool {
        self.output_kind == OutputKind::SharedObject
    }

    /// True for `-r`
    pub fn is_relocatable(&self) -> bool {
        self.output_kind.is_relocatable()
    }

    /// Effective worker thread count
    pub fn thread_count(&self) -> usize {
        if self.threads != 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Rewrites a referenced name per `--wrap` rules
    pub fn wrap_reference(&self, name: &str) -> Option<String> {
        if let Some(real) = name.strip_prefix("__real_") {
            if self.wraps.contains(real) {
                return Some(real.to_string());
            }
        }
        if self.wraps.contains(name) {
            return Some(format!("__wrap_{name}"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LinkerConfig {
        LinkerConfig::builder()
            .target(TargetOptions::builder().machine(62).build())
            .wraps(BTreeSet::from(["malloc".to_string()]))
            .build()
    }

    #[test]
    fn wrap_rewrites_references() {
        let config = config();
        assert_eq!(config.wrap_reference("malloc").as_deref(), Some("__wrap_malloc"));
        assert_eq!(config.wrap_reference("__real_malloc").as_deref(), Some("malloc"));
        assert_eq!(config.wrap_reference("free"), None);
        assert_eq!(config.wrap_reference("__real_free"), None);
    }

    #[test]
    fn dynamic_sections_follow_output_kind() {
        let mut config = config();
        assert!(config.has_dynamic_sections());
        config.static_link = true;
        assert!(!config.has_dynamic_sections());
        config.static_link = false;
        config.output_kind = OutputKind::Relocatable;
        assert!(!config.has_dynamic_sections());
    }
}
