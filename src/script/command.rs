//! Parsed linker-script commands: assignments, output section
//! descriptions, PHDRS and MEMORY declarations.

use bitflags::bitflags;

use crate::script::expression::Expression;
use crate::script::wildcard::WildcardPattern;
use crate::section::SectionFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where an assignment appears in the script
pub enum AssignmentLevel {
    /// Outside any SECTIONS command
    OutsideSections,
    /// Directly inside SECTIONS, between output descriptions
    OutputSection,
    /// Inside an output section description
    InputSection,
    /// Recorded to run after SECTIONS completes
    SectionsEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Flavor of an assignment statement
pub enum AssignmentKind {
    /// Plain `name = expr`
    Default,
    /// `HIDDEN(name = expr)`
    Hidden,
    /// `PROVIDE(name = expr)`
    Provide,
    /// `PROVIDE_HIDDEN(name = expr)`
    ProvideHidden,
    /// `FILL(expr)`
    Fill,
    /// `ASSERT(expr, message)`
    Assert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Compound-assignment operator (`name op= expr`)
pub enum AssignOp {
    /// `=`
    Assign,
    /// `+=`
    Add,
    /// `-=`
    Sub,
    /// `*=`
    Mul,
    /// `/=`
    Div,
    /// `<<=`
    Shl,
    /// `>>=`
    Shr,
    /// `&=`
    And,
    /// `|=`
    Or,
}

#[derive(Debug, Clone)]
/// One assignment statement
pub struct Assignment {
    /// Where it appears
    pub level: AssignmentLevel,
    /// Its flavor
    pub kind: AssignmentKind,
    /// The assigned symbol (`.` for the location counter); empty for
    /// `FILL`/`ASSERT`
    pub name: String,
    /// The operator
    pub op: AssignOp,
    /// The right-hand side
    pub expr: Expression,
    /// Assertion message, for `ASSERT`
    pub message: Option<String>,
}

impl Assignment {
    /// Plain assignment of `expr` to `name`
    pub fn new(level: AssignmentLevel, name: impl Into<String>, expr: Expression) -> Self {
        Assignment {
            level,
            kind: AssignmentKind::Default,
            name: name.into(),
            op: AssignOp::Assign,
            expr,
            message: None,
        }
    }

    /// True for assignments to the location counter
    pub fn is_dot(&self) -> bool {
        self.name == "."
    }

    /// True when the right-hand side mentions the location counter
    pub fn has_dot(&self) -> bool {
        self.expr.has_dot()
    }

    /// True for `PROVIDE`/`PROVIDE_HIDDEN`
    pub fn is_provide(&self) -> bool {
        matches!(self.kind, AssignmentKind::Provide | AssignmentKind::ProvideHidden)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `ONLY_IF_RO` / `ONLY_IF_RW` output-section constraint
pub enum Constraint {
    #[default]
    /// No constraint
    None,
    /// Match only read-only input sections
    OnlyIfRo,
    /// Match only writable input sections
    OnlyIfRw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Parenthesized output-section type in a prolog
pub enum ScriptSectionType {
    /// `(NOLOAD)`
    NoLoad,
    /// `(DSECT)`
    DSect,
    /// `(COPY)`
    Copy,
    /// `(INFO)`
    Info,
    /// `(OVERLAY)`
    Overlay,
}

#[derive(Debug, Clone, Default)]
/// Everything before the `{` of an output section description
pub struct Prolog {
    /// VMA expression
    pub vma: Option<Expression>,
    /// Script-specified type
    pub section_type: Option<ScriptSectionType>,
    /// `AT(expr)` load address
    pub lma: Option<Expression>,
    /// `ALIGN(expr)`
    pub align: Option<Expression>,
    /// `SUBALIGN(expr)` forced on every input section
    pub subalign: Option<Expression>,
    /// Matching constraint
    pub constraint: Constraint,
    /// Plugin name attached to this output section
    pub plugin: Option<String>,
}

#[derive(Debug, Clone, Default)]
/// Everything after the `}` of an output section description
pub struct Epilog {
    /// `>region`
    pub region: Option<String>,
    /// `AT>region`
    pub lma_region: Option<String>,
    /// `:phdr` list
    pub phdrs: Vec<String>,
    /// `=fillexpr`
    pub fill: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Retention/placement policy of an input section description
pub enum InputSectPolicy {
    #[default]
    /// Plain description
    NoKeep,
    /// `KEEP(...)`: exempt from garbage collection
    Keep,
    /// Fixed-address description
    Fixed,
    /// Tentative catch-all a later rule may steal from
    SpecialNoKeep,
    /// Tentative catch-all, GC exempt
    SpecialKeep,
    /// `KEEP` at a fixed address
    KeepFixed,
}

impl InputSectPolicy {
    /// True for GC-root policies
    pub fn is_keep(self) -> bool {
        matches!(
            self,
            InputSectPolicy::Keep | InputSectPolicy::SpecialKeep | InputSectPolicy::KeepFixed
        )
    }

    /// True for tentative policies a later rule may override
    pub fn is_special(self) -> bool {
        matches!(self, InputSectPolicy::SpecialKeep | InputSectPolicy::SpecialNoKeep)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// `INPUT_SECTION_FLAGS(+a & !b)` requirements
pub struct InputSectionFlagsSpec {
    /// Flags every matched section must carry
    pub with: SectionFlags,
    /// Flags no matched section may carry
    pub without: SectionFlags,
}

impl InputSectionFlagsSpec {
    /// Check `flags` against the requirements
    pub fn accepts(&self, flags: SectionFlags) -> bool {
        flags.contains(self.with) && (flags & self.without).is_empty()
    }
}

#[derive(Debug, Clone)]
/// The matching half of an input section description
pub struct InputSectSpec {
    /// File pattern (resolved path base name)
    pub file: WildcardPattern,
    /// Archive member pattern for `archive:member` syntax
    pub archive_member: Option<WildcardPattern>,
    /// Section name patterns
    pub sections: Vec<WildcardPattern>,
    /// `EXCLUDE_FILE(...)` negations
    pub exclude_files: Vec<WildcardPattern>,
    /// `INPUT_SECTION_FLAGS` requirements
    pub flags: Option<InputSectionFlagsSpec>,
}

impl InputSectSpec {
    /// A spec matching every section of every file
    pub fn match_all(file: WildcardPattern, section: WildcardPattern) -> Self {
        InputSectSpec {
            file,
            archive_member: None,
            sections: vec![section],
            exclude_files: Vec::new(),
            flags: None,
        }
    }
}

#[derive(Debug, Clone)]
/// One input section description inside an output section
pub struct InputSectDesc {
    /// Retention policy
    pub policy: InputSectPolicy,
    /// What it matches
    pub spec: InputSectSpec,
}

#[derive(Debug, Clone)]
/// A command inside an output section description
pub enum OutputSectCommand {
    /// Symbol assignment / ASSERT / FILL
    Assign(Assignment),
    /// Input section description
    Input(InputSectDesc),
    /// `BYTE`/`SHORT`/`LONG`/`QUAD` literal data
    Data {
        /// Width in bytes
        size: u8,
        /// The value expression
        expr: Expression,
    },
}

#[derive(Debug, Clone)]
/// One output section description
pub struct OutputSectDesc {
    /// The output section name
    pub name: String,
    /// Prolog attributes
    pub prolog: Prolog,
    /// Body commands in source order
    pub commands: Vec<OutputSectCommand>,
    /// Epilog attributes
    pub epilog: Epilog,
}

impl OutputSectDesc {
    /// True for the `/DISCARD/` description
    pub fn is_discard(&self) -> bool {
        self.name == "/DISCARD/"
    }
}

#[derive(Debug, Clone)]
/// One PHDRS entry
pub struct PhdrSpec {
    /// Segment name
    pub name: String,
    /// `p_type`
    pub p_type: u32,
    /// `FILEHDR` keyword present
    pub has_filehdr: bool,
    /// `PHDRS` keyword present
    pub has_phdrs: bool,
    /// `AT(expr)` fixed load address
    pub at: Option<Expression>,
    /// `FLAGS(expr)`
    pub flags: Option<Expression>,
}

impl PhdrSpec {
    /// True for the `NONE` segment that excludes sections from loading
    pub fn is_none_segment(&self) -> bool {
        self.name.eq_ignore_ascii_case("none")
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// MEMORY region attribute letters
    pub struct RegionAttrs: u8 {
        /// `r`: readable
        const READ = 1;
        /// `w`: writable
        const WRITE = 2;
        /// `x`: executable
        const EXEC = 4;
        /// `a`: allocatable
        const ALLOC = 8;
        /// `i`/`l`: initialized
        const INIT = 16;
        /// `!` prefix inverted the following letters
        const INVERTED = 32;
    }
}

impl RegionAttrs {
    /// Parse a `(rwxail)` attribute string
    pub fn parse(text: &str) -> Self {
        let mut attrs = RegionAttrs::empty();
        let mut invert = false;
        for c in text.chars() {
            match c.to_ascii_lowercase() {
                'r' => attrs |= RegionAttrs::READ,
                'w' => attrs |= RegionAttrs::WRITE,
                'x' => attrs |= RegionAttrs::EXEC,
                'a' => attrs |= RegionAttrs::ALLOC,
                'i' | 'l' => attrs |= RegionAttrs::INIT,
                '!' => invert = true,
                _ => {}
            }
        }
        if invert {
            attrs |= RegionAttrs::INVERTED;
        }
        attrs
    }
}

#[derive(Debug, Clone)]
/// One MEMORY region declaration
pub struct MemoryDesc {
    /// Region name
    pub name: String,
    /// Attribute letters
    pub attrs: RegionAttrs,
    /// Origin expression
    pub origin: Expression,
    /// Length expression
    pub length: Expression,
}

#[derive(Debug, Clone)]
/// A command inside SECTIONS
pub enum SectionsCommand {
    /// An assignment / ASSERT between descriptions
    Assignment(Assignment),
    /// An output section description
    OutputSection(OutputSectDesc),
    /// `ENTRY(sym)`
    Entry(String),
}

#[derive(Debug, Clone)]
/// A top-level script command
pub enum ScriptCommand {
    /// `ENTRY(sym)`
    Entry(String),
    /// Assignment / PROVIDE / ASSERT at file scope
    Assignment(Assignment),
    /// `SECTIONS { ... }`
    Sections(Vec<SectionsCommand>),
    /// `PHDRS { ... }`
    Phdrs(Vec<PhdrSpec>),
    /// `MEMORY { ... }`
    Memory(Vec<MemoryDesc>),
    /// `INPUT(files...)`
    Input(Vec<String>),
    /// `GROUP(files...)`
    Group(Vec<String>),
    /// `OUTPUT(file)`
    Output(String),
    /// `OUTPUT_FORMAT(...)`, recorded for validation only
    OutputFormat(Vec<String>),
    /// `OUTPUT_ARCH(name)`
    OutputArch(String),
    /// `SEARCH_DIR(path)`
    SearchDir(String),
    /// `EXTERN(sym...)`
    Extern(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_spec_requires_and_rejects() {
        let spec = InputSectionFlagsSpec {
            with: SectionFlags::ALLOC,
            without: SectionFlags::WRITE,
        };
        assert!(spec.accepts(SectionFlags::ALLOC));
        assert!(spec.accepts(SectionFlags::ALLOC | SectionFlags::EXECINSTR));
        assert!(!spec.accepts(SectionFlags::ALLOC | SectionFlags::WRITE));
        assert!(!spec.accepts(SectionFlags::EXECINSTR));
    }

    #[test]
    fn region_attrs_parse_letters() {
        let attrs = RegionAttrs::parse("rwx");
        assert!(attrs.contains(RegionAttrs::READ | RegionAttrs::WRITE | RegionAttrs::EXEC));
        assert!(RegionAttrs::parse("!r").contains(RegionAttrs::INVERTED));
    }

    #[test]
    fn keep_policies() {
        assert!(InputSectPolicy::Keep.is_keep());
        assert!(InputSectPolicy::SpecialKeep.is_keep());
        assert!(InputSectPolicy::SpecialKeep.is_special());
        assert!(!InputSectPolicy::Fixed.is_keep());
    }
}
