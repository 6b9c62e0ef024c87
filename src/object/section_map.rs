//! How input sections map into output sections: the ordered collection of
//! [`OutputSectionEntry`]s, each holding its [`RuleContainer`] chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::script::command::{
    Assignment, Epilog, InputSectDesc, InputSectPolicy, InputSectSpec, Prolog,
};
use crate::script::expression::Expression;
use crate::script::wildcard::WildcardPattern;
use crate::section::fragment::{FragmentId, StringRef};
use crate::section::SectionId;
use crate::symbol::InfoId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of an [`OutputSectionEntry`] in the section map
pub struct OutputSectId(pub u32);

impl OutputSectId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of a [`RuleContainer`] in the section map
pub struct RuleId(pub u32);

impl RuleId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
/// One input section description instantiated inside an output section:
/// its policy, its matching spec, and the sections it claimed
pub struct RuleContainer {
    /// Retention/placement policy
    pub policy: InputSectPolicy,
    /// What the rule matches
    pub spec: InputSectSpec,
    /// Per-rule section clone that accumulates the matched fragments
    pub section: SectionId,
    /// Sections this rule claimed, in match order
    pub matched: Vec<SectionId>,
    /// Assignments written between this rule and the next
    pub assignments: Vec<Assignment>,
    /// The output entry this rule belongs to
    pub output: OutputSectId,
    /// Next rule in the owning output section
    pub next_rule: Option<RuleId>,
    /// Set when a plugin or re-match invalidated the rule's contents
    pub dirty: bool,
    /// Matches observed; updated concurrently during rule matching
    pub match_count: AtomicU32,
    /// Cumulative time spent matching against this rule
    pub match_time: Mutex<Duration>,
    /// Source rendering for the map file
    pub annotation: String,
}

impl RuleContainer {
    /// Build a rule from a parsed description
    pub fn from_desc(desc: &InputSectDesc, output: OutputSectId, section: SectionId) -> Self {
        RuleContainer {
            policy: desc.policy,
            spec: desc.spec.clone(),
            section,
            matched: Vec::new(),
            assignments: Vec::new(),
            output,
            next_rule: None,
            dirty: false,
            match_count: AtomicU32::new(0),
            match_time: Mutex::new(Duration::ZERO),
            annotation: String::new(),
        }
    }

    /// True for GC-root rules
    pub fn is_entry(&self) -> bool {
        self.policy.is_keep()
    }

    /// True for tentative rules a more specific rule may steal from
    pub fn is_special(&self) -> bool {
        self.policy.is_special()
    }

    /// True for fixed-address rules
    pub fn is_fixed(&self) -> bool {
        matches!(self.policy, InputSectPolicy::Fixed | InputSectPolicy::KeepFixed)
    }

    /// Matches observed so far
    pub fn match_count(&self) -> u32 {
        self.match_count.load(Ordering::Relaxed)
    }

    /// Count one match
    pub fn inc_match_count(&self) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulate match time under the stats guard
    pub fn add_match_time(&self, inc: Duration) {
        if let Ok(mut total) = self.match_time.lock() {
            *total += inc;
        }
    }

    /// True when any symbol assignments follow the rule
    pub fn has_assignments(&self) -> bool {
        !self.assignments.is_empty()
    }
}

#[derive(Debug, Clone)]
/// A trampoline synthesized near an output section for an out-of-range
/// branch
pub struct BranchIsland {
    /// Island symbol name
    pub name: String,
    /// The symbol the island reaches
    pub target: InfoId,
    /// The fragment holding the island's code
    pub frag: FragmentId,
    /// Relocations attached to the island, applied with island flush
    /// ordering
    pub relocations: Vec<crate::reloc::Relocation>,
}

#[derive(Debug, Clone)]
/// A `BYTE`/`SHORT`/`LONG`/`QUAD` literal whose value is evaluated once
/// addresses are known
pub struct DataCommand {
    /// The reserved fragment the value lands in
    pub frag: FragmentId,
    /// Width in bytes
    pub size: u8,
    /// The value expression
    pub expr: Expression,
}

#[derive(Debug)]
/// One output section: prolog/epilog attributes, the rule chain, symbol
/// assignments, islands, and the merge-string dedup map
pub struct OutputSectionEntry {
    /// Output section name
    pub name: String,
    /// Prolog attributes (VMA/LMA expressions, type, align, constraint)
    pub prolog: Prolog,
    /// Epilog attributes (regions, phdr list, fill)
    pub epilog: Epilog,
    /// The output section shape in the module arena
    pub section: SectionId,
    /// Rules in description order
    pub rules: Vec<RuleId>,
    /// Assignments evaluated when the section opens
    pub assignments: Vec<Assignment>,
    /// Assignments evaluated after the section's content
    pub end_assignments: Vec<Assignment>,
    /// Position in the output; `usize::MAX` until ordered
    pub order: usize,
    /// The load segment the section was placed into
    pub load_segment: Option<crate::layout::segments::SegmentId>,
    /// First rule with content, for fragment queries
    pub first_non_empty_rule: Option<RuleId>,
    /// Last rule in the chain
    pub last_rule: Option<RuleId>,
    /// Branch islands attached to this section
    pub islands: Vec<BranchIsland>,
    /// Island indexes by target symbol, for trampoline reuse
    islands_by_symbol: HashMap<InfoId, Vec<usize>>,
    /// First-seen survivor per string content
    unique_strings: HashMap<Vec<u8>, StringRef>,
    /// Every string destined for this section
    all_strings: Vec<StringRef>,
    /// Script literal data to evaluate after layout
    pub data_commands: Vec<DataCommand>,
    /// This entry is the `/DISCARD/` sink
    pub is_discard: bool,
    /// Content hash, for plugin bookkeeping
    pub hash: u64,
}

impl OutputSectionEntry {
    /// A fresh entry for `name` over the output `section`
    pub fn new(name: impl Into<String>, section: SectionId) -> Self {
        let name = name.into();
        let is_discard = name == "/DISCARD/";
        OutputSectionEntry {
            name,
            prolog: Prolog::default(),
            epilog: Epilog::default(),
            section,
            rules: Vec::new(),
            assignments: Vec::new(),
            end_assignments: Vec::new(),
            order: usize::MAX,
            load_segment: None,
            first_non_empty_rule: None,
            last_rule: None,
            islands: Vec::new(),
            islands_by_symbol: HashMap::new(),
            unique_strings: HashMap::new(),
            all_strings: Vec::new(),
            data_commands: Vec::new(),
            is_discard,
            hash: 0,
        }
    }

    /// True once the entry was given an output order
    pub fn has_order(&self) -> bool {
        self.order != usize::MAX
    }

    /// The survivor for `content`, unless `content` is its own survivor
    pub fn merged_string(&self, content: &[u8], this: StringRef) -> Option<StringRef> {
        let survivor = self.unique_strings.get(content).copied()?;
        if survivor == this {
            return None;
        }
        Some(survivor)
    }

    /// Record a string destined for this section; the first occurrence of
    /// each content becomes the survivor
    pub fn add_string(&mut self, content: Vec<u8>, sref: StringRef) {
        self.all_strings.push(sref);
        self.unique_strings.entry(content).or_insert(sref);
    }

    /// Every string recorded for this section
    pub fn strings(&self) -> &[StringRef] {
        &self.all_strings
    }

    /// Register an island for `target`
    pub fn add_island(&mut self, island: BranchIsland) {
        let target = island.target;
        self.islands_by_symbol
            .entry(target)
            .or_default()
            .push(self.islands.len());
        self.islands.push(island);
    }

    /// Islands already reaching `target`, for reuse
    pub fn islands_for(&self, target: InfoId) -> impl Iterator<Item = &BranchIsland> {
        self.islands_by_symbol
            .get(&target)
            .into_iter()
            .flatten()
            .map(|&i| &self.islands[i])
    }
}

#[derive(Debug, Default)]
/// The ordered collection of output section entries plus the rule arena.
///
/// Iteration order defines output-section order when no script imposes
/// one.
pub struct SectionMap {
    entries: Vec<OutputSectionEntry>,
    rules: Vec<RuleContainer>,
    by_name: HashMap<String, OutputSectId>,
    /// Sections matched by KEEP rules; the garbage collector's roots
    pub entry_sections: Vec<SectionId>,
}

impl SectionMap {
    /// An empty map
    pub fn new() -> Self {
        SectionMap::default()
    }

    /// Entries in output order
    pub fn entries(&self) -> &[OutputSectionEntry] {
        &self.entries
    }

    /// Entry ids in output order
    pub fn ids(&self) -> impl Iterator<Item = OutputSectId> {
        (0..self.entries.len() as u32).map(OutputSectId)
    }

    /// One entry
    pub fn entry(&self, id: OutputSectId) -> &OutputSectionEntry {
        &self.entries[id.idx()]
    }

    /// One entry, mutably
    pub fn entry_mut(&mut self, id: OutputSectId) -> &mut OutputSectionEntry {
        &mut self.entries[id.idx()]
    }

    /// One rule
    pub fn rule(&self, id: RuleId) -> &RuleContainer {
        &self.rules[id.idx()]
    }

    /// One rule, mutably
    pub fn rule_mut(&mut self, id: RuleId) -> &mut RuleContainer {
        &mut self.rules[id.idx()]
    }

    /// All rules
    pub fn rules(&self) -> &[RuleContainer] {
        &self.rules
    }

    /// Find an entry by output section name
    pub fn find(&self, name: &str) -> Option<OutputSectId> {
        self.by_name.get(name).copied()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries exist
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; first entry of a name wins the name lookup
    pub fn push_entry(&mut self, entry: OutputSectionEntry) -> OutputSectId {
        let id = OutputSectId(self.entries.len() as u32);
        self.by_name.entry(entry.name.clone()).or_insert(id);
        self.entries.push(entry);
        id
    }

    /// Append a rule to an entry, maintaining the chain links
    pub fn push_rule(&mut self, output: OutputSectId, mut rule: RuleContainer) -> RuleId {
        rule.output = output;
        let id = RuleId(self.rules.len() as u32);
        if let Some(&last) = self.entries[output.idx()].rules.last() {
            self.rules[last.idx()].next_rule = Some(id);
        }
        self.rules.push(rule);
        let entry = &mut self.entries[output.idx()];
        entry.rules.push(id);
        entry.last_rule = Some(id);
        id
    }

    /// Install the `*` fall-through rule used when no explicit
    /// description matched; `section` is the fresh per-rule clone
    pub fn create_default_rule(&mut self, output: OutputSectId, section: SectionId) -> RuleId {
        let spec = InputSectSpec::match_all(
            WildcardPattern::match_all(),
            WildcardPattern::match_all(),
        );
        let desc = InputSectDesc { policy: InputSectPolicy::NoKeep, spec };
        let mut rule = RuleContainer::from_desc(&desc, output, section);
        rule.annotation = "<default>".to_string();
        self.push_rule(output, rule)
    }

    /// Rules of `output` whose per-rule sections have fragments, in chain
    /// order; the next-rule-with-content query of layout
    pub fn next_rule_with_content(
        &self,
        module_sections: &[crate::section::Section],
        mut from: Option<RuleId>,
    ) -> Option<RuleId> {
        while let Some(id) = from {
            let rule = self.rule(id);
            let section = module_sections[rule.section.idx()].elf();
            if !section.fragments.is_empty() {
                return Some(id);
            }
            from = rule.next_rule;
        }
        None
    }

    /// Record a KEEP-matched section as a GC root
    pub fn add_entry_section(&mut self, section: SectionId) {
        self.entry_sections.push(section);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_chain_links_in_order() {
        let mut map = SectionMap::new();
        let out = map.push_entry(OutputSectionEntry::new(".text", SectionId(0)));
        let a = map.create_default_rule(out, SectionId(1));
        let b = map.create_default_rule(out, SectionId(2));
        assert_eq!(map.rule(a).next_rule, Some(b));
        assert_eq!(map.rule(b).next_rule, None);
        assert_eq!(map.entry(out).last_rule, Some(b));
        assert_eq!(map.entry(out).rules, vec![a, b]);
    }

    #[test]
    fn first_entry_wins_name_lookup() {
        let mut map = SectionMap::new();
        let first = map.push_entry(OutputSectionEntry::new(".data", SectionId(0)));
        let _second = map.push_entry(OutputSectionEntry::new(".data", SectionId(1)));
        assert_eq!(map.find(".data"), Some(first));
    }

    #[test]
    fn islands_index_by_target_symbol() {
        let mut entry = OutputSectionEntry::new(".text", SectionId(0));
        let target = InfoId(5);
        entry.add_island(BranchIsland {
            name: "__trampoline_for_far".into(),
            target,
            frag: FragmentId(9),
            relocations: Vec::new(),
        });
        assert_eq!(entry.islands.len(), 1);
        assert_eq!(entry.islands_for(target).count(), 1);
        assert_eq!(entry.islands_for(InfoId(6)).count(), 0);
    }

    #[test]
    fn next_rule_with_content_walks_the_chain() {
        use crate::section::{ElfSection, Section, SectionFlags, SectionKind};

        let mut sections = Vec::new();
        for name in ["out", "empty", "full"] {
            sections.push(Section::Elf(ElfSection::new(
                name,
                SectionKind::Regular,
                crate::section::section_type::PROGBITS,
                SectionFlags::ALLOC,
            )));
        }
        sections[2].elf_mut().fragments.push(FragmentId(0));

        let mut map = SectionMap::new();
        let out = map.push_entry(OutputSectionEntry::new(".text", SectionId(0)));
        let empty = map.create_default_rule(out, SectionId(1));
        let full = map.create_default_rule(out, SectionId(2));
        assert_eq!(map.next_rule_with_content(&sections, Some(empty)), Some(full));
        assert_eq!(
            map.next_rule_with_content(&sections, map.rule(full).next_rule),
            None
        );
    }

    #[test]
    fn string_survivor_is_first_seen() {
        let mut entry = OutputSectionEntry::new(".rodata.str", SectionId(0));
        let a = StringRef { frag: FragmentId(0), index: 0 };
        let b = StringRef { frag: FragmentId(1), index: 0 };
        entry.add_string(b"hi\0".to_vec(), a);
        entry.add_string(b"hi\0".to_vec(), b);
        assert_eq!(entry.merged_string(b"hi\0", b), Some(a));
        assert_eq!(entry.merged_string(b"hi\0", a), None);
    }
}
