//! The object builder: instantiates the script's section map, matches
//! input sections to rules, merges sections into their outputs, and
//! deduplicates COMDAT groups and mergeable strings.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::{LinkerConfig, OrphanMode};
use crate::error::{Error, Result};
use crate::input::InputId;
use crate::module::Module;
use crate::object::section_map::{DataCommand, OutputSectId, RuleContainer, RuleId};
use crate::script::command::{
    Assignment, Constraint, InputSectDesc, OutputSectCommand, OutputSectDesc, SectionsCommand,
};
use crate::script::wildcard::{SortPolicy, WildcardPattern};
use crate::section::fragment::{Fragment, FragmentId, FragmentKind, MergeStringFragment, StringRef};
use crate::section::{section_type, SectionFlags, SectionId, SectionKind};

/// Per-input cache of file/archive pattern match results, indexed by
/// pattern id
pub struct PatternCache {
    slots: Vec<Option<bool>>,
}

impl PatternCache {
    /// A cache sized for the script's pattern id space
    pub fn new(num_wildcards: u32) -> Self {
        PatternCache { slots: vec![None; num_wildcards as usize] }
    }

    /// Look up or compute a pattern's verdict for this input
    pub fn matched(&mut self, pattern: &WildcardPattern, name: &str) -> bool {
        let slot = pattern.id as usize;
        if slot >= self.slots.len() {
            return pattern.matches(name);
        }
        if let Some(cached) = self.slots[slot] {
            return cached;
        }
        let verdict = pattern.matches(name);
        self.slots[slot] = Some(verdict);
        verdict
    }
}

/// Instantiate the SECTIONS command into the section map: one output
/// entry per description, one rule per input description.
pub fn build_script_section_map(module: &mut Module) -> Result<()> {
    let bodies: Vec<Vec<SectionsCommand>> =
        module.script.sections_commands().cloned().collect();
    for body in bodies {
        let mut pending: Vec<Assignment> = Vec::new();
        for command in body {
            match command {
                SectionsCommand::Entry(_) => {}
                SectionsCommand::Assignment(assignment) => pending.push(assignment),
                SectionsCommand::OutputSection(desc) => {
                    let id = instantiate_output_desc(module, &desc)?;
                    let entry = module.section_map.entry_mut(id);
                    entry.assignments.splice(0..0, pending.drain(..));
                }
            }
        }
        // Assignments after the last description run once SECTIONS ends.
        if !pending.is_empty() {
            if let Some(last) = module.section_map.ids().last() {
                module
                    .section_map
                    .entry_mut(last)
                    .end_assignments
                    .extend(pending);
            }
        }
    }
    Ok(())
}

fn instantiate_output_desc(module: &mut Module, desc: &OutputSectDesc) -> Result<OutputSectId> {
    let kind = if desc.is_discard() { SectionKind::Discard } else { SectionKind::Regular };
    let id = module.create_output_section(&desc.name, kind, section_type::PROGBITS, SectionFlags::empty(), 1);
    {
        let entry = module.section_map.entry_mut(id);
        entry.prolog = desc.prolog.clone();
        entry.epilog = desc.epilog.clone();
    }
    let mut current_rule: Option<RuleId> = None;
    for command in &desc.commands {
        match command {
            OutputSectCommand::Assign(assignment) => match current_rule {
                Some(rule) => module
                    .section_map
                    .rule_mut(rule)
                    .assignments
                    .push(assignment.clone()),
                None => module
                    .section_map
                    .entry_mut(id)
                    .assignments
                    .push(assignment.clone()),
            },
            OutputSectCommand::Input(input_desc) => {
                let rule = instantiate_rule(module, id, input_desc);
                current_rule = Some(rule);
            }
            OutputSectCommand::Data { size, expr } => {
                // Reserve zeroed bytes now; the value lands after layout.
                let rule_section = module.create_rule_section(id);
                let frag = module.add_fragment(Fragment::new(
                    rule_section,
                    1,
                    FragmentKind::Region(vec![0u8; *size as usize]),
                ));
                let desc_all = InputSectDesc {
                    policy: crate::script::command::InputSectPolicy::Fixed,
                    spec: crate::script::command::InputSectSpec::match_all(
                        WildcardPattern::new("", SortPolicy::None),
                        WildcardPattern::new("", SortPolicy::None),
                    ),
                };
                let mut rule = RuleContainer::from_desc(&desc_all, id, rule_section);
                rule.annotation = "<data>".to_string();
                let rule_id = module.section_map.push_rule(id, rule);
                current_rule = Some(rule_id);
                module.section_map.entry_mut(id).data_commands.push(DataCommand {
                    frag,
                    size: *size,
                    expr: expr.clone(),
                });
            }
        }
    }
    Ok(id)
}

fn instantiate_rule(module: &mut Module, output: OutputSectId, desc: &InputSectDesc) -> RuleId {
    let section = module.create_rule_section(output);
    let mut rule = RuleContainer::from_desc(desc, output, section);
    rule.annotation = format!(
        "{}({})",
        desc.spec.file.pattern,
        desc.spec
            .sections
            .iter()
            .map(|p| p.pattern.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    );
    module.section_map.push_rule(output, rule)
}

/// Common patterns get syntactic sugar: `COMMON` also matches the
/// internal per-symbol `COMMON.<name>` sections, `.scommon.x` matches
/// `.scommon.x.<name>`
fn common_pattern_matches(pattern: &WildcardPattern, name: &str) -> bool {
    if pattern.matches(name) {
        return true;
    }
    if pattern.pattern == "COMMON" {
        return name.starts_with("COMMON.");
    }
    if let Some(rest) = name.strip_prefix(pattern.pattern.as_str()) {
        if pattern.pattern.starts_with(".scommon.") {
            return rest.starts_with('.');
        }
    }
    false
}

struct MatchOutcome {
    section: SectionId,
    rule: RuleId,
    elapsed: Duration,
}

/// Does `rule` accept this section of this input? `cache` holds the
/// per-input file/archive verdicts.
fn rule_accepts(
    module: &Module,
    rule: &RuleContainer,
    cache: &mut PatternCache,
    file_name: &str,
    member_name: Option<&str>,
    section_name: &str,
    flags: SectionFlags,
    is_common: bool,
) -> bool {
    // Constraint check against the section's writability.
    match rule_constraint(module, rule) {
        Constraint::OnlyIfRo if flags.contains(SectionFlags::WRITE) => return false,
        Constraint::OnlyIfRw if !flags.contains(SectionFlags::WRITE) => return false,
        _ => {}
    }
    if !cache.matched(&rule.spec.file, file_name) {
        return false;
    }
    if let Some(member_pattern) = &rule.spec.archive_member {
        let Some(member) = member_name else { return false };
        if !cache.matched(member_pattern, member) {
            return false;
        }
    }
    // Exclusions test both names, so they bypass the per-input cache.
    for excluded in &rule.spec.exclude_files {
        if excluded.matches(file_name) {
            return false;
        }
        if let Some(member) = member_name {
            if excluded.matches(member) {
                return false;
            }
        }
    }
    if let Some(flag_spec) = &rule.spec.flags {
        if !flag_spec.accepts(flags) {
            return false;
        }
    }
    rule.spec.sections.iter().any(|pattern| {
        if is_common {
            common_pattern_matches(pattern, section_name)
        } else {
            pattern.matches(section_name)
        }
    })
}

fn rule_constraint(module: &Module, rule: &RuleContainer) -> Constraint {
    module.section_map.entry(rule.output).prolog.constraint
}

/// Match one input's sections against every rule. A tentative (special)
/// match holds only until a non-special rule also wants the section.
fn match_input(module: &Module, input: InputId) -> (Vec<MatchOutcome>, Vec<SectionId>) {
    let file = module.input(input);
    let file_name = file.input.path.display().to_string();
    let member_name = file.input.member_name.clone();
    let mut cache = PatternCache::new(module.script.num_wildcards());
    let mut outcomes = Vec::new();
    let mut orphans = Vec::new();
    for &sid in &file.sections {
        let section = module.section(sid);
        let elf = section.elf();
        if elf.kind.is_ignored() || elf.kind == SectionKind::Null {
            continue;
        }
        if elf.output.is_some() {
            continue;
        }
        let is_common = section.common_origin().is_some() || elf.kind == SectionKind::Common;
        let started = Instant::now();
        let mut special: Option<RuleId> = None;
        let mut chosen: Option<RuleId> = None;
        'rules: for (idx, rule) in module.section_map.rules().iter().enumerate() {
            let rule_id = RuleId(idx as u32);
            if rule.annotation == "<data>" {
                continue;
            }
            if !rule_accepts(
                module,
                rule,
                &mut cache,
                &file_name,
                member_name.as_deref(),
                &elf.name,
                elf.flags,
                is_common,
            ) {
                continue;
            }
            if rule.is_special() {
                if special.is_none() {
                    special = Some(rule_id);
                }
                continue;
            }
            chosen = Some(rule_id);
            break 'rules;
        }
        match chosen.or(special) {
            Some(rule) => outcomes.push(MatchOutcome {
                section: sid,
                rule,
                elapsed: started.elapsed(),
            }),
            None => orphans.push(sid),
        }
    }
    (outcomes, orphans)
}

/// Assign every input section to exactly one rule. Regular inputs run
/// first (in parallel); common sections on the internal input run last
/// because they aggregate commons from many real inputs. Section-matcher
/// plugins may override each placement before it lands. Returns the
/// orphans.
pub fn assign_output_sections(
    module: &mut Module,
    config: &LinkerConfig,
    plugins: &mut crate::plugin::PluginManager,
) -> Result<Vec<SectionId>> {
    let internal = module.internal_input;
    let regular: Vec<InputId> = module
        .input_ids()
        .filter(|&id| Some(id) != internal && module.input(id).kind.contributes_sections())
        .collect();
    let pool = crate::support::threads::ThreadPool::new(module.thread_count);
    let results: Vec<(Vec<MatchOutcome>, Vec<SectionId>)> = {
        let shared: &Module = module;
        pool.parallel_map(&regular, |&input| match_input(shared, input))
    };
    let mut orphans = Vec::new();
    let mut all_outcomes = Vec::new();
    for (outcomes, mut missed) in results {
        all_outcomes.extend(outcomes);
        orphans.append(&mut missed);
    }
    if let Some(internal) = internal {
        let (outcomes, mut missed) = match_input(module, internal);
        all_outcomes.extend(outcomes);
        orphans.append(&mut missed);
    }
    for mut outcome in all_outcomes {
        let chosen = module.section_map.rule(outcome.rule).output;
        let (_, rule) = plugins.override_match(module, outcome.section, (chosen, outcome.rule));
        outcome.rule = rule;
        apply_match(module, outcome);
    }
    report_orphans(module, config, &orphans)?;
    Ok(orphans)
}

fn apply_match(module: &mut Module, outcome: MatchOutcome) {
    let MatchOutcome { section, rule, elapsed } = outcome;
    let output = module.section_map.rule(rule).output;
    let keep = module.section_map.rule(rule).is_entry();
    let discard = module.section_map.entry(output).is_discard;
    {
        let rule_ref = module.section_map.rule(rule);
        rule_ref.inc_match_count();
        rule_ref.add_match_time(elapsed);
    }
    module.section_map.rule_mut(rule).matched.push(section);
    let elf = module.section_mut(section).elf_mut();
    elf.output = Some(output);
    elf.matched_rule = Some(rule);
    if discard {
        elf.kind = SectionKind::Discard;
        return;
    }
    if keep {
        module.section_map.add_entry_section(section);
    }
}

fn report_orphans(
    module: &Module,
    config: &LinkerConfig,
    orphans: &[SectionId],
) -> Result<()> {
    if !module.script.has_sections_command {
        return Ok(());
    }
    for &sid in orphans {
        let elf = module.section(sid).elf();
        let path = elf
            .input
            .map(|i| module.input(i).decorated_path())
            .unwrap_or_default();
        match config.orphan_handling {
            OrphanMode::Place => {}
            OrphanMode::Warn => {
                warn!("orphan section `{}` from {path}", elf.name);
            }
            OrphanMode::Error => {
                // Synthesized internal sections are never orphans.
                if elf.input.is_some() && elf.input != module.internal_input {
                    module.diag.error(Error::LinkerScriptSemantic {
                        context: path.clone(),
                        reason: format!("orphan section `{}`", elf.name),
                    });
                }
            }
            OrphanMode::Discard => {}
        }
    }
    module.diag.check_phase()
}

/// Combine one more contributor into an output section's flags: union,
/// except `MERGE`/`STRINGS`/`LINK_ORDER`, which drop as soon as any
/// contributor lacks them.
pub fn update_section_flags(to: &mut SectionFlags, from: SectionFlags, first: bool) {
    let fragile = SectionFlags::MERGE | SectionFlags::STRINGS | SectionFlags::LINK_ORDER;
    if first {
        *to = from;
        return;
    }
    let kept_fragile = *to & from & fragile;
    *to = ((*to | from) - fragile) | kept_fragile;
}

/// Move every fragment of `from` into `to`, preserving order and
/// updating ownership and sizes
pub fn move_section(module: &mut Module, from: SectionId, to: SectionId) {
    let frags: Vec<_> = module.section(from).elf().fragments.clone();
    let from_align = module.section(from).elf().align;
    for fid in frags {
        let (align, size) = {
            let frag = module.fragment_mut(fid);
            frag.owner = to;
            (frag.align, frag.size())
        };
        let to_elf = module.section_mut(to).elf_mut();
        to_elf.fragments.push(fid);
        to_elf.size = crate::support::align_up(to_elf.size, align) + size;
    }
    let to_elf = module.section_mut(to).elf_mut();
    to_elf.align = to_elf.align.max(from_align);
}

/// Sort a rule's matched sections per its first pattern's sort policy
fn sort_matched(module: &Module, rule: &RuleContainer) -> Option<Vec<SectionId>> {
    let policy = rule.spec.sections.first().map(|p| p.sort).unwrap_or(SortPolicy::None);
    if policy == SortPolicy::None {
        return None;
    }
    let mut matched = rule.matched.clone();
    let name_of = |id: &SectionId| module.section(*id).elf().name.clone();
    let align_of = |id: &SectionId| module.section(*id).elf().align;
    match policy {
        SortPolicy::ByName => matched.sort_by_key(name_of),
        SortPolicy::ByAlignment => matched.sort_by(|a, b| align_of(b).cmp(&align_of(a))),
        SortPolicy::ByNameAlignment => {
            matched.sort_by(|a, b| name_of(a).cmp(&name_of(b)).then(align_of(b).cmp(&align_of(a))))
        }
        SortPolicy::ByAlignmentName => {
            matched.sort_by(|a, b| align_of(b).cmp(&align_of(a)).then(name_of(a).cmp(&name_of(b))))
        }
        SortPolicy::ByInitPriority => {
            // .init_array.NNNNN sorts numerically; unsuffixed entries last.
            let priority = |id: &SectionId| {
                let name = module.section(*id).elf().name.clone();
                name.rsplit('.')
                    .next()
                    .and_then(|tail| tail.parse::<u64>().ok())
                    .unwrap_or(u64::MAX)
            };
            matched.sort_by_key(priority);
        }
        SortPolicy::None => {}
    }
    Some(matched)
}

/// Merge every matched input section into its rule's clone, updating the
/// output section's flags, type, and alignment
pub fn merge_matched_sections(module: &mut Module) -> Result<()> {
    for rule_id in 0..module.section_map.rules().len() {
        let rule_id = RuleId(rule_id as u32);
        let (matched, rule_section, output) = {
            let rule = module.section_map.rule(rule_id);
            let matched = sort_matched(module, rule).unwrap_or_else(|| rule.matched.clone());
            (matched, rule.section, rule.output)
        };
        if module.section_map.entry(output).is_discard {
            continue;
        }
        let mut first = module.section(module.section_map.entry(output).section).elf().flags
            == SectionFlags::empty()
            && module.section(module.section_map.entry(output).section).elf().size == 0;
        for section in matched {
            let (in_flags, in_type, in_align, ignored) = {
                let elf = module.section(section).elf();
                (elf.flags, elf.sh_type, elf.align, elf.is_ignored())
            };
            if ignored {
                continue;
            }
            move_section(module, section, rule_section);
            let out_sid = module.section_map.entry(output).section;
            let out = module.section_mut(out_sid).elf_mut();
            update_section_flags(&mut out.flags, in_flags, first);
            out.align = out.align.max(in_align);
            // The first contributor sets the type; afterwards any
            // PROGBITS contributor upgrades a NOBITS output.
            if first {
                out.sh_type = in_type;
            } else if out.sh_type == section_type::NOBITS && in_type != section_type::NOBITS {
                out.sh_type = in_type;
            }
            first = false;
        }
    }
    // Output sizes follow from the rule clones at layout; here we only
    // fold rule sizes up so SIZEOF during assignment evaluation is sane.
    for id in module.section_map.ids().collect::<Vec<_>>() {
        let mut size = 0u64;
        let mut align = module.section(module.section_map.entry(id).section).elf().align;
        for &rule in &module.section_map.entry(id).rules {
            let elf = module.section(module.section_map.rule(rule).section).elf();
            size = crate::support::align_up(size, elf.align.max(1)) + elf.size;
            align = align.max(elf.align);
        }
        let out_sid = module.section_map.entry(id).section;
        let out = module.section_mut(out_sid).elf_mut();
        out.size = size;
        out.align = align;
    }
    Ok(())
}

/// COMDAT deduplication: the first input contributing a group signature
/// wins; every member section of a losing group is marked `Ignore`.
pub fn dedup_comdat_groups(module: &mut Module) -> Result<()> {
    let mut winners: HashMap<String, InputId> = HashMap::new();
    let inputs: Vec<InputId> = module.input_ids().collect();
    for input in inputs {
        let signatures: Vec<String> = module.input(input).group_signatures.clone();
        for signature in signatures {
            let winner = *winners.entry(signature.clone()).or_insert(input);
            if winner == input {
                continue;
            }
            debug!(
                "COMDAT group `{signature}` from {} discarded (kept from {})",
                module.input(input).decorated_path(),
                module.input(winner).decorated_path()
            );
            let sections: Vec<SectionId> = module.input(input).sections.clone();
            for sid in sections {
                let elf = module.section_mut(sid).elf_mut();
                if elf.group_signature.as_deref() == Some(signature.as_str()) {
                    elf.kind = SectionKind::Ignore;
                }
            }
        }
    }
    Ok(())
}

/// Convert the raw payload of every merge-string input section into a
/// [`MergeStringFragment`], splitting on NUL
pub fn prepare_merge_strings(module: &mut Module) -> Result<()> {
    let mut work = Vec::new();
    for input in module.input_ids() {
        for &sid in &module.input(input).sections {
            let elf = module.section(sid).elf();
            if elf.kind == SectionKind::MergeStr && !elf.is_ignored() {
                work.push((input, sid));
            }
        }
    }
    for (input, sid) in work {
        let path = module.input(input).decorated_path();
        let (name, frags) = {
            let elf = module.section(sid).elf();
            (elf.name.clone(), elf.fragments.clone())
        };
        for fid in frags {
            let bytes = match &module.fragment(fid).kind {
                FragmentKind::Region(bytes) => bytes.clone(),
                _ => continue,
            };
            let strings = MergeStringFragment::read_strings(&bytes, &path, &name)?;
            module.fragment_mut(fid).kind = FragmentKind::MergeString(strings);
        }
    }
    Ok(())
}

/// String deduplication: alloc strings merge per output section,
/// non-alloc strings merge program-wide under `--global-string-merge`
pub fn merge_strings(module: &mut Module) -> Result<()> {
    let mut work: Vec<(FragmentId, OutputSectId, bool)> = Vec::new();
    for (idx, fragment) in module.fragments.iter().enumerate() {
        if !matches!(fragment.kind, FragmentKind::MergeString(_)) {
            continue;
        }
        let owner = module.section(fragment.owner).elf();
        let Some(output) = owner.output else { continue };
        if owner.is_ignored() {
            continue;
        }
        work.push((FragmentId(idx as u32), output, owner.is_alloc()));
    }
    let mut excluded = 0usize;
    for (fid, output, alloc) in work {
        let count = match &module.fragment(fid).kind {
            FragmentKind::MergeString(ms) => ms.strings.len(),
            _ => 0,
        };
        for index in 0..count {
            let bytes = match &module.fragment(fid).kind {
                FragmentKind::MergeString(ms) => ms.strings[index].bytes.clone(),
                _ => continue,
            };
            let this = StringRef { frag: fid, index: index as u32 };
            let global = module.global_string_merge && !alloc;
            let survivor = if global {
                let existing = module.non_alloc_strings.get(&bytes).copied();
                if existing.is_none() {
                    module.non_alloc_strings.insert(bytes.clone(), this);
                }
                existing.filter(|s| *s != this)
            } else {
                let entry = module.section_map.entry_mut(output);
                let existing = entry.merged_string(&bytes, this);
                entry.add_string(bytes.clone(), this);
                existing
            };
            if survivor.is_some() {
                if let FragmentKind::MergeString(ms) = &mut module.fragment_mut(fid).kind {
                    ms.strings[index].exclude();
                }
                excluded += 1;
            }
        }
        // Shrink the owning sections to the surviving size.
        let new_size = module.fragment(fid).size();
        let owner = module.fragment(fid).owner;
        module.section_mut(owner).elf_mut().size = new_size;
    }
    debug!("string merge: {excluded} duplicates excluded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_merge_drops_fragile_bits() {
        let mut flags = SectionFlags::empty();
        update_section_flags(
            &mut flags,
            SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS,
            true,
        );
        assert!(flags.contains(SectionFlags::MERGE));
        update_section_flags(&mut flags, SectionFlags::ALLOC | SectionFlags::WRITE, false);
        assert!(flags.contains(SectionFlags::ALLOC | SectionFlags::WRITE));
        assert!(!flags.contains(SectionFlags::MERGE));
        assert!(!flags.contains(SectionFlags::STRINGS));
    }

    #[test]
    fn common_sugar_widens_patterns() {
        let common = WildcardPattern::new("COMMON", SortPolicy::None);
        assert!(common_pattern_matches(&common, "COMMON.foo"));
        assert!(!common_pattern_matches(&common, ".bss.foo"));
        let scommon = WildcardPattern::new(".scommon.2", SortPolicy::None);
        assert!(common_pattern_matches(&scommon, ".scommon.2.counter"));
        assert!(!common_pattern_matches(&scommon, ".scommon.4.counter"));
    }

    #[test]
    fn pattern_cache_caches_verdicts() {
        let mut registry = crate::script::wildcard::PatternRegistry::default();
        let pattern = registry.register(WildcardPattern::new("*.o", SortPolicy::None));
        let mut cache = PatternCache::new(registry.len());
        assert!(cache.matched(&pattern, "crt0.o"));
        // The cached verdict answers even for a different name.
        assert!(cache.matched(&pattern, "not-an-object"));
    }
}
