//! The layout engine: output-section placement, address and file-offset
//! assignment, program-header synthesis, standard and magic symbols,
//! deferred assertions, and the overlap check.
//!
//! Stages are idempotent relative to their predecessors; the relaxation
//! driver re-runs them from a clean slate until the backend reports a
//! fixpoint.

pub mod map_file;
pub mod segments;

use log::debug;

use crate::config::{LinkerConfig, OutputKind};
use crate::error::{Error, Result};
use crate::layout::segments::{segment_type, ElfSegment, MemoryRegion, SegmentFlags, SegmentId};
use crate::module::{Module, PaddingRecord};
use crate::object::section_map::{OutputSectId, RuleId};
use crate::script::command::{Assignment, AssignmentKind, ScriptCommand, ScriptSectionType};
use crate::script::expression::{eval, EvalContext};
use crate::section::{SectionId, SectionKind};
use crate::support::align_up;
use crate::symbol::{SymbolBinding, Visibility};
use crate::target::{is_relro_name, Backend, OrderTag};

/// Default VMA base for the output kind
pub fn default_image_base(config: &LinkerConfig) -> u64 {
    match config.output_kind {
        OutputKind::Executable => 0x40_0000,
        _ => 0,
    }
}

/// ELF header size for the word width
fn ehdr_size(is_64bit: bool) -> u64 {
    if is_64bit {
        64
    } else {
        52
    }
}

/// Program header entry size for the word width
fn phdr_entsize(is_64bit: bool) -> u64 {
    if is_64bit {
        56
    } else {
        32
    }
}

/// Map an input section name onto the conventional output section it
/// joins when no script rule says otherwise
pub fn default_output_name(name: &str) -> &str {
    const GROUPS: &[(&str, &str)] = &[
        (".text", ".text"),
        (".rodata", ".rodata"),
        (".data.rel.ro", ".data.rel.ro"),
        (".data", ".data"),
        (".bss", ".bss"),
        (".tdata", ".tdata"),
        (".tbss", ".tbss"),
        (".init_array", ".init_array"),
        (".fini_array", ".fini_array"),
        (".ctors", ".ctors"),
        (".dtors", ".dtors"),
        (".gcc_except_table", ".gcc_except_table"),
        (".sdata", ".sdata"),
        (".sbss", ".sbss"),
    ];
    for (prefix, output) in GROUPS {
        if let Some(rest) = name.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('.') {
                return output;
            }
        }
    }
    if name.starts_with("COMMON.") {
        return ".bss";
    }
    if name.starts_with(".scommon.") {
        return ".sbss";
    }
    name
}

/// Place every orphan into an output entry: find one by conventional
/// name or synthesize one, install the fall-through rule, and attach the
/// section to it.
pub fn place_orphans(module: &mut Module, orphans: &[SectionId]) -> Result<()> {
    for &sid in orphans {
        let (name, kind, sh_type, flags, align, ignored) = {
            let elf = module.section(sid).elf();
            (
                elf.name.clone(),
                elf.kind,
                elf.sh_type,
                elf.flags,
                elf.align,
                elf.is_ignored(),
            )
        };
        if ignored {
            continue;
        }
        let out_name = default_output_name(&name).to_string();
        let output = match module.section_map.find(&out_name) {
            Some(id) => id,
            None => module.create_output_section(&out_name, kind, sh_type, flags, align),
        };
        let rule = match module
            .section_map
            .entry(output)
            .rules
            .last()
            .copied()
            .filter(|r| module.section_map.rule(*r).annotation == "<default>")
        {
            Some(rule) => rule,
            None => {
                let rule_section = module.create_rule_section(output);
                module.section_map.create_default_rule(output, rule_section)
            }
        };
        module.section_map.rule_mut(rule).matched.push(sid);
        module.section_map.rule(rule).inc_match_count();
        let elf = module.section_mut(sid).elf_mut();
        elf.output = Some(output);
        elf.matched_rule = Some(rule);
    }
    Ok(())
}

/// Order the output entries: scripted entries keep script order, orphan
/// entries slot in by coarse order tag.
pub fn order_output_sections(module: &mut Module, backend: &dyn Backend, script_count: usize) {
    let ids: Vec<OutputSectId> = module.section_map.ids().collect();
    let tags: Vec<OrderTag> = ids
        .iter()
        .map(|&id| backend.section_order(module, module.section_map.entry(id)))
        .collect();
    let mut order: Vec<usize> = (0..ids.len()).collect();
    if script_count == 0 {
        order.sort_by_key(|&i| (tags[i], i));
    } else {
        // Keep scripted entries in place; each orphan goes after the last
        // scripted entry whose tag does not exceed its own.
        let mut keyed: Vec<(usize, usize, usize)> = Vec::new();
        for (i, &_id) in ids.iter().enumerate() {
            if i < script_count {
                keyed.push((i, 0, i));
            } else {
                let mut anchor = script_count.saturating_sub(1);
                for j in (0..script_count).rev() {
                    if tags[j] <= tags[i] {
                        anchor = j;
                        break;
                    }
                }
                keyed.push((anchor, 1, i));
            }
        }
        keyed.sort();
        order = keyed.into_iter().map(|(_, _, i)| i).collect();
    }
    for (rank, &i) in order.iter().enumerate() {
        module.section_map.entry_mut(ids[i]).order = rank;
    }
}

/// Output entry ids sorted by assigned order
pub fn ordered_entries(module: &Module) -> Vec<OutputSectId> {
    let mut ids: Vec<OutputSectId> = module.section_map.ids().collect();
    ids.sort_by_key(|&id| module.section_map.entry(id).order);
    ids
}

/// Instantiate the script's MEMORY regions, evaluating origin/length
pub fn build_memory_regions(module: &mut Module) -> Result<()> {
    let descs: Vec<_> = module
        .script
        .commands
        .iter()
        .filter_map(|c| match c {
            ScriptCommand::Memory(regions) => Some(regions.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    for desc in descs {
        let ctx = EvalContext { module: &*module, dot: 0, inside_sections: false, current_section: None };
        let origin = eval(&desc.origin, &ctx)?;
        let length = eval(&desc.length, &ctx)?;
        module
            .memory_regions
            .push(MemoryRegion::new(desc.name, desc.attrs, origin, length));
    }
    Ok(())
}

/// State accumulated while assigning addresses
struct AddressState {
    dot: u64,
    deferred_asserts: Vec<Assignment>,
    current_fill: Option<u64>,
}

fn apply_assignment(
    module: &mut Module,
    assignment: &Assignment,
    state: &mut AddressState,
    inside_sections: bool,
    current: Option<OutputSectId>,
) -> Result<()> {
    match assignment.kind {
        AssignmentKind::Assert => {
            if assignment.has_dot() || module.segments.is_empty() {
                if !assignment.has_dot() {
                    state.deferred_asserts.push(assignment.clone());
                    return Ok(());
                }
                let ctx = EvalContext {
                    module: &*module,
                    dot: state.dot,
                    inside_sections,
                    current_section: current,
                };
                let value = eval(&assignment.expr, &ctx)?;
                if value == 0 {
                    return Err(Error::Assert {
                        message: assignment.message.clone().unwrap_or_default(),
                    });
                }
            }
            return Ok(());
        }
        AssignmentKind::Fill => {
            let ctx = EvalContext {
                module: &*module,
                dot: state.dot,
                inside_sections,
                current_section: current,
            };
            state.current_fill = Some(eval(&assignment.expr, &ctx)?);
            return Ok(());
        }
        _ => {}
    }

    // PROVIDE takes effect only for symbols that are referenced and
    // otherwise undefined.
    if assignment.is_provide() {
        let provide_needed = match module.name_pool.find_info(&assignment.name) {
            Some(id) => {
                let info = module.name_pool.info(id);
                info.is_undefined()
            }
            None => false,
        };
        if !provide_needed {
            return Ok(());
        }
    }

    let rhs = {
        let ctx = EvalContext {
            module: &*module,
            dot: state.dot,
            inside_sections,
            current_section: current,
        };
        eval(&assignment.expr, &ctx)?
    };
    let old = if assignment.is_dot() {
        state.dot
    } else {
        module
            .name_pool
            .find_info(&assignment.name)
            .map(|id| module.name_pool.info(id).value)
            .unwrap_or(0)
    };
    use crate::script::command::AssignOp;
    let value = match assignment.op {
        AssignOp::Assign => rhs,
        AssignOp::Add => old.wrapping_add(rhs),
        AssignOp::Sub => old.wrapping_sub(rhs),
        AssignOp::Mul => old.wrapping_mul(rhs),
        AssignOp::Div => {
            if rhs == 0 {
                return Err(Error::ExprEval {
                    context: assignment.expr.to_string(),
                    reason: "division by zero in compound assignment".into(),
                });
            }
            old / rhs
        }
        AssignOp::Shl => old.wrapping_shl(rhs as u32),
        AssignOp::Shr => old.wrapping_shr(rhs as u32),
        AssignOp::And => old & rhs,
        AssignOp::Or => old | rhs,
    };

    if assignment.is_dot() {
        if !inside_sections {
            return Err(Error::LinkerScriptSemantic {
                context: assignment.expr.to_string(),
                reason: "assignment to `.` outside SECTIONS".into(),
            });
        }
        if value < state.dot && current.is_some() {
            return Err(Error::LinkerScriptSemantic {
                context: assignment.expr.to_string(),
                reason: "location counter moved backwards".into(),
            });
        }
        // Advancing `.` inside a section records a fill range.
        if let (Some(out), Some(fill)) = (current, state.current_fill) {
            if value > state.dot {
                let base = module
                    .section(module.section_map.entry(out).section)
                    .elf()
                    .addr
                    .unwrap_or(0);
                module.paddings.push(PaddingRecord {
                    output: out,
                    start: state.dot - base,
                    end: value - base,
                    fill,
                });
            }
        }
        state.dot = value;
        module.dot = value;
        return Ok(());
    }

    let hidden = matches!(
        assignment.kind,
        AssignmentKind::Hidden | AssignmentKind::ProvideHidden
    );
    let origin = module.internal_input();
    module.name_pool.define_absolute(
        origin,
        "<linker script>",
        &assignment.name,
        value,
        SymbolBinding::Global,
        if hidden { Visibility::Hidden } else { Visibility::Default },
    );
    Ok(())
}

/// Pick the VMA for an output entry and lay its fragments, advancing
/// the address state
fn assign_entry_addresses(
    module: &mut Module,
    id: OutputSectId,
    state: &mut AddressState,
) -> Result<()> {
    let assignments: Vec<Assignment> = module.section_map.entry(id).assignments.clone();
    for assignment in &assignments {
        apply_assignment(module, assignment, state, true, Some(id))?;
    }

    let (prolog_vma, prolog_lma, prolog_align, prolog_subalign, region_name, lma_region_name, noload) = {
        let entry = module.section_map.entry(id);
        (
            entry.prolog.vma.clone(),
            entry.prolog.lma.clone(),
            entry.prolog.align.clone(),
            entry.prolog.subalign.clone(),
            entry.epilog.region.clone(),
            entry.epilog.lma_region.clone(),
            entry.prolog.section_type == Some(ScriptSectionType::NoLoad),
        )
    };

    let section_id = module.section_map.entry(id).section;
    let (mut align, size, is_alloc) = {
        let elf = module.section(section_id).elf();
        (elf.align.max(1), elf.size, elf.is_alloc())
    };
    if let Some(align_expr) = &prolog_align {
        let ctx = EvalContext { module: &*module, dot: state.dot, inside_sections: true, current_section: Some(id) };
        align = align.max(eval(align_expr, &ctx)?);
    }
    let subalign = match &prolog_subalign {
        Some(expr) => {
            let ctx = EvalContext { module: &*module, dot: state.dot, inside_sections: true, current_section: Some(id) };
            Some(eval(expr, &ctx)?)
        }
        None => None,
    };

    // VMA: explicit expression, memory region, or the aligned dot.
    let vma = if let Some(expr) = &prolog_vma {
        let ctx = EvalContext { module: &*module, dot: state.dot, inside_sections: true, current_section: Some(id) };
        eval(expr, &ctx)?
    } else if is_alloc {
        if let Some(region_name) = &region_name {
            let region = module.memory_region_mut(region_name).ok_or_else(|| {
                Error::LinkerScriptSemantic {
                    context: region_name.clone(),
                    reason: "unknown memory region".into(),
                }
            })?;
            region.allocate_vma(size, align)?
        } else {
            align_up(state.dot, align)
        }
    } else {
        0
    };

    // LMA: AT(expr), an LMA region, or coupled to the VMA.
    let lma = if let Some(expr) = &prolog_lma {
        let ctx = EvalContext { module: &*module, dot: state.dot, inside_sections: true, current_section: Some(id) };
        Some(eval(expr, &ctx)?)
    } else if let Some(lma_region_name) = &lma_region_name {
        let region = module.memory_region_mut(lma_region_name).ok_or_else(|| {
            Error::LinkerScriptSemantic {
                context: lma_region_name.clone(),
                reason: "unknown memory region".into(),
            }
        })?;
        Some(region.allocate_lma(size, align)?)
    } else {
        None
    };

    {
        let elf = module.section_mut(section_id).elf_mut();
        elf.addr = Some(vma);
        elf.pma = lma;
        elf.align = align;
        if noload {
            elf.sh_type = crate::section::section_type::NOBITS;
        }
    }

    if is_alloc {
        state.dot = vma;
        module.dot = vma;
    }

    // Lay fragments rule by rule, evaluating per-rule assignments as the
    // cursor passes them.
    let rules: Vec<RuleId> = module.section_map.entry(id).rules.clone();
    let mut cursor = 0u64;
    let mut first_non_empty = None;
    for rule in rules {
        let rule_section = module.section_map.rule(rule).section;
        let frags: Vec<_> = module.section(rule_section).elf().fragments.clone();
        if !frags.is_empty() && first_non_empty.is_none() {
            first_non_empty = Some(rule);
        }
        for fid in frags {
            let (frag_align, frag_size) = {
                let frag = module.fragment(fid);
                (frag.align.max(subalign.unwrap_or(1)), frag.size())
            };
            cursor = align_up(cursor, frag_align);
            module.fragment_mut(fid).set_offset(cursor);
            cursor += frag_size;
        }
        if is_alloc {
            state.dot = vma + cursor;
            module.dot = state.dot;
        }
        let rule_assignments: Vec<Assignment> = module.section_map.rule(rule).assignments.clone();
        for assignment in &rule_assignments {
            apply_assignment(module, assignment, state, true, Some(id))?;
        }
        if state.dot > vma + cursor && is_alloc {
            cursor = state.dot - vma;
        }
    }
    cursor = cursor.max(size);
    {
        let elf = module.section_mut(section_id).elf_mut();
        elf.size = cursor;
    }
    module.section_map.entry_mut(id).first_non_empty_rule = first_non_empty;

    if is_alloc {
        state.dot = vma + cursor;
        module.dot = state.dot;
    }

    let end_assignments: Vec<Assignment> = module.section_map.entry(id).end_assignments.clone();
    for assignment in &end_assignments {
        apply_assignment(module, assignment, state, true, Some(id))?;
    }
    Ok(())
}

/// Stage 3/7 for addresses: evaluate assignments in source order and
/// give every output section and fragment its VMA
pub fn assign_addresses(
    module: &mut Module,
    config: &LinkerConfig,
    _backend: &dyn Backend,
) -> Result<()> {
    // Without a script, placement begins past the loaded headers; a
    // script owns the location counter from zero.
    let initial_dot = if module.script.has_sections_command {
        module.image_base
    } else {
        module.image_base + module.headers_size
    };
    let mut state = AddressState {
        dot: initial_dot,
        deferred_asserts: Vec::new(),
        current_fill: None,
    };

    let outside: Vec<Assignment> = module.script.outside_assignments().cloned().collect();
    for assignment in &outside {
        // `.` is an error at file scope; everything else defines eagerly.
        apply_assignment(module, assignment, &mut state, false, None)?;
    }
    for (name, expr_text) in config.defsyms.clone() {
        let mut registry_parser_dummy = crate::script::wildcard::PatternRegistry::default();
        let commands = crate::script::parser::Parser::parse(
            &format!("{name} = {expr_text};"),
            "<--defsym>",
            &mut registry_parser_dummy,
        )?;
        for command in commands {
            if let ScriptCommand::Assignment(assignment) = command {
                apply_assignment(module, &assignment, &mut state, false, None)?;
            }
        }
    }

    for id in ordered_entries(module) {
        if module.section_map.entry(id).is_discard {
            continue;
        }
        assign_entry_addresses(module, id, &mut state)?;
    }

    module.deferred_asserts = state.deferred_asserts;
    Ok(())
}

/// Default program-header synthesis: open a new PT_LOAD on permission
/// changes, LMA decoupling, region changes, or a RELRO boundary; emit
/// the auxiliary segments alongside.
pub fn create_default_segments(
    module: &mut Module,
    config: &LinkerConfig,
    backend: &dyn Backend,
) -> Result<()> {
    module.segments.clear();
    let entries = ordered_entries(module);
    let page = backend.target_info().max_page_size;

    let mut phdr_seg = ElfSegment::new(segment_type::PHDR);
    phdr_seg.includes_phdrs = true;
    phdr_seg.align = 8;

    let mut loads: Vec<ElfSegment> = Vec::new();
    let mut current: Option<ElfSegment> = None;
    let mut prev_flags = SegmentFlags::empty();
    let mut prev_relro = false;
    let mut prev_lma_delta: Option<i128> = None;

    let mut tls_sections = Vec::new();
    let mut note_sections = Vec::new();
    let mut relro_sections = Vec::new();
    let mut interp_section = None;
    let mut dynamic_section = None;
    let mut eh_frame_hdr_section = None;

    for id in entries {
        let entry = module.section_map.entry(id);
        if entry.is_discard {
            continue;
        }
        let elf = module.section(entry.section).elf();
        if !elf.is_alloc() || elf.size == 0 && entry.name != ".interp" {
            continue;
        }
        let mut flags = SegmentFlags::R;
        if elf.is_writable() {
            flags |= SegmentFlags::W;
        }
        if elf.is_executable() {
            flags |= SegmentFlags::X;
        }
        let relro = config.relro && is_relro_name(&entry.name);
        let lma_delta = elf
            .pma
            .map(|pma| pma as i128 - elf.addr.unwrap_or(0) as i128);

        if entry.name == ".interp" {
            interp_section = Some(id);
        }
        if entry.name == ".dynamic" {
            dynamic_section = Some(id);
        }
        if entry.name == ".eh_frame_hdr" {
            eh_frame_hdr_section = Some(id);
        }
        if elf.is_tls() {
            tls_sections.push(id);
        }
        if elf.sh_type == crate::section::section_type::NOTE {
            note_sections.push(id);
        }
        if relro {
            relro_sections.push(id);
        }

        let split = match &current {
            None => true,
            Some(_) => {
                flags != prev_flags
                    || relro != prev_relro && !relro
                    || lma_delta.unwrap_or(0) != prev_lma_delta.unwrap_or(0)
            }
        };
        if split {
            if let Some(done) = current.take() {
                loads.push(done);
            }
            let mut seg = ElfSegment::new(segment_type::LOAD);
            seg.flags = flags;
            seg.align = page;
            current = Some(seg);
        }
        if let Some(seg) = &mut current {
            seg.update_flags(flags);
            seg.append(id, elf.align);
        }
        prev_flags = flags;
        prev_relro = relro;
        prev_lma_delta = lma_delta;
    }
    if let Some(done) = current.take() {
        loads.push(done);
    }

    // The first load covers the file and program headers, unless its
    // content sits below them or decouples its load address.
    if let Some(first) = loads.first_mut() {
        let headers_fit = first
            .sections
            .first()
            .map(|&id| {
                let elf = module.section(module.section_map.entry(id).section).elf();
                elf.pma.is_none()
                    && elf.addr.unwrap_or(0) >= module.image_base + module.headers_size
            })
            .unwrap_or(false);
        if headers_fit {
            first.includes_filehdr = true;
            first.includes_phdrs = true;
        }
    }

    let headers_loaded = loads.first().map(|l| l.includes_phdrs).unwrap_or(false);
    let needs_phdr_segment = config.has_dynamic_sections() && headers_loaded;
    if needs_phdr_segment {
        module.segments.push(phdr_seg);
    }
    if let Some(interp) = interp_section {
        let mut seg = ElfSegment::new(segment_type::INTERP);
        seg.append(interp, 1);
        module.segments.push(seg);
    }
    for load in loads {
        module.segments.push(load);
    }
    if let Some(dynamic) = dynamic_section {
        let mut seg = ElfSegment::new(segment_type::DYNAMIC);
        seg.flags = SegmentFlags::R | SegmentFlags::W;
        seg.append(dynamic, 8);
        module.segments.push(seg);
    }
    if !tls_sections.is_empty() {
        let mut seg = ElfSegment::new(segment_type::TLS);
        for id in tls_sections {
            let align = module.section(module.section_map.entry(id).section).elf().align;
            seg.append(id, align);
        }
        module.segments.push(seg);
    }
    if let Some(hdr) = eh_frame_hdr_section {
        let mut seg = ElfSegment::new(segment_type::GNU_EH_FRAME);
        seg.append(hdr, 4);
        module.segments.push(seg);
    }
    for note in note_sections {
        let mut seg = ElfSegment::new(segment_type::NOTE);
        let align = module.section(module.section_map.entry(note).section).elf().align;
        seg.append(note, align);
        module.segments.push(seg);
    }
    if config.relro && !relro_sections.is_empty() {
        let mut seg = ElfSegment::new(segment_type::GNU_RELRO);
        for id in relro_sections {
            let align = module.section(module.section_map.entry(id).section).elf().align;
            seg.append(id, align);
        }
        module.segments.push(seg);
    }
    let mut stack = ElfSegment::new(segment_type::GNU_STACK);
    stack.flags = SegmentFlags::R | SegmentFlags::W;
    stack.align = 16;
    module.segments.push(stack);

    for (ordinal, segment) in module.segments.iter_mut().enumerate() {
        segment.ordinal = ordinal as u16;
    }
    Ok(())
}

/// PHDRS-directed synthesis: segments come only from the script; a
/// section joins the segments its epilog names, or inherits the previous
/// section's segments.
pub fn create_script_segments(module: &mut Module, _config: &LinkerConfig) -> Result<()> {
    module.segments.clear();
    let specs: Vec<_> = module
        .script
        .commands
        .iter()
        .filter_map(|c| match c {
            ScriptCommand::Phdrs(specs) => Some(specs.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    for (idx, spec) in specs.iter().enumerate() {
        let mut segment = ElfSegment::new(spec.p_type);
        segment.name = spec.name.clone();
        segment.spec = Some(idx);
        segment.includes_filehdr = spec.has_filehdr;
        segment.includes_phdrs = spec.has_phdrs;
        segment.fixed_lma = spec.at.clone();
        if let Some(flags_expr) = &spec.flags {
            let ctx = EvalContext { module: &*module, dot: 0, inside_sections: false, current_section: None };
            let bits = eval(flags_expr, &ctx)?;
            segment.flags = SegmentFlags::from_bits_truncate(bits as u32);
        }
        module.segments.push(segment);
    }

    let mut inherited: Vec<String> = Vec::new();
    for id in ordered_entries(module) {
        let entry = module.section_map.entry(id);
        if entry.is_discard {
            continue;
        }
        let elf = module.section(entry.section).elf();
        if !elf.is_alloc() {
            continue;
        }
        let named: Vec<String> = if entry.epilog.phdrs.is_empty() {
            inherited.clone()
        } else {
            entry.epilog.phdrs.clone()
        };
        let align = elf.align;
        let mut flags = SegmentFlags::R;
        if elf.is_writable() {
            flags |= SegmentFlags::W;
        }
        if elf.is_executable() {
            flags |= SegmentFlags::X;
        }
        for name in &named {
            let Some(segment) = module.segments.iter_mut().find(|s| &s.name == name) else {
                return Err(Error::LinkerScriptSemantic {
                    context: name.clone(),
                    reason: "section placed into undeclared phdr".into(),
                });
            };
            if segment.is_none_segment() {
                continue;
            }
            segment.append(id, align);
            segment.update_flags(flags);
        }
        inherited = named;
    }
    for (ordinal, segment) in module.segments.iter_mut().enumerate() {
        segment.ordinal = ordinal as u16;
    }
    Ok(())
}

/// Stage 7: pack file offsets per PT_LOAD, keeping offset ≡ vaddr
/// (mod max page size); SHT_NOBITS consumes memory but no file bytes.
pub fn assign_file_offsets(module: &mut Module, backend: &dyn Backend) -> Result<()> {
    let page = backend.target_info().max_page_size;
    let info = backend.target_info();
    let phnum = module.segments.len() as u64;
    module.headers_size = ehdr_size(info.is_64bit) + phnum * phdr_entsize(info.is_64bit);

    let mut offset = module.headers_size;
    let mut placed: Vec<OutputSectId> = Vec::new();

    let load_ids: Vec<SegmentId> = (0..module.segments.len() as u32)
        .map(SegmentId)
        .filter(|id| module.segments[id.idx()].is_load())
        .collect();

    for seg_id in &load_ids {
        let sections = module.segments[seg_id.idx()].sections.clone();
        let mut first_in_segment = true;
        for out_id in sections {
            if placed.contains(&out_id) {
                continue;
            }
            let section_id = module.section_map.entry(out_id).section;
            let (vaddr, size, nobits) = {
                let elf = module.section(section_id).elf();
                (elf.addr.unwrap_or(0), elf.size, elf.is_nobits())
            };
            if nobits {
                let elf = module.section_mut(section_id).elf_mut();
                elf.offset = Some(offset);
                placed.push(out_id);
                continue;
            }
            if first_in_segment {
                // Congruence: skip forward until offset ≡ vaddr (mod page).
                let want = vaddr % page;
                let have = offset % page;
                if want != have {
                    offset += (want + page - have) % page;
                }
                first_in_segment = false;
            } else {
                let want = vaddr % page;
                let have = offset % page;
                if want != have {
                    offset += (want + page - have) % page;
                }
            }
            let elf = module.section_mut(section_id).elf_mut();
            elf.offset = Some(offset);
            offset += size;
            placed.push(out_id);
            module.section_map.entry_mut(out_id).load_segment = Some(*seg_id);
        }
    }

    // Sections outside every load segment (non-alloc, or NONE-directed)
    // pack at the end of the file.
    for out_id in ordered_entries(module) {
        if placed.contains(&out_id) {
            continue;
        }
        if module.section_map.entry(out_id).is_discard {
            continue;
        }
        let section_id = module.section_map.entry(out_id).section;
        let (align, size, nobits) = {
            let elf = module.section(section_id).elf();
            (elf.align.max(1), elf.size, elf.is_nobits())
        };
        offset = align_up(offset, align);
        let elf = module.section_mut(section_id).elf_mut();
        elf.offset = Some(offset);
        if !nobits {
            offset += size;
        }
    }

    // Segment geometry from member sections.
    for seg_id in 0..module.segments.len() {
        let sections = module.segments[seg_id].sections.clone();
        let mut file_start = u64::MAX;
        let mut file_end = 0u64;
        let mut va_start = u64::MAX;
        let mut mem_end = 0u64;
        let mut pa_start = u64::MAX;
        for out_id in &sections {
            let elf = module
                .section(module.section_map.entry(*out_id).section)
                .elf();
            let off = elf.offset.unwrap_or(0);
            let va = elf.addr.unwrap_or(0);
            let pa = elf.load_address().unwrap_or(va);
            va_start = va_start.min(va);
            pa_start = pa_start.min(pa);
            mem_end = mem_end.max(va + elf.size);
            if !elf.is_nobits() {
                file_start = file_start.min(off);
                file_end = file_end.max(off + elf.size);
            } else {
                file_start = file_start.min(off);
                file_end = file_end.max(off);
            }
        }
        let segment = &mut module.segments[seg_id];
        if segment.p_type == segment_type::PHDR {
            // Filled from the covering load below.
            segment.filesz = phnum * phdr_entsize(info.is_64bit);
            segment.memsz = segment.filesz;
            continue;
        }
        if segment.includes_filehdr {
            if sections.is_empty() {
                segment.offset = 0;
                segment.vaddr = module.image_base;
                segment.paddr = module.image_base;
                segment.filesz = module.headers_size;
                segment.memsz = module.headers_size;
                continue;
            }
            // The headers map below the first section, preserving the
            // section's offset/address congruence.
            segment.offset = 0;
            segment.vaddr = va_start.saturating_sub(file_start);
            segment.paddr = segment.vaddr;
            segment.filesz = file_end;
            segment.memsz = mem_end.saturating_sub(segment.vaddr);
            continue;
        }
        if sections.is_empty() {
            continue;
        }
        segment.offset = file_start;
        segment.vaddr = va_start;
        segment.paddr = pa_start;
        segment.filesz = file_end.saturating_sub(file_start);
        segment.memsz = mem_end.saturating_sub(va_start);
    }

    // PT_PHDR mirrors the program header table inside the covering load.
    let phdr_base = module
        .segments
        .iter()
        .find(|s| s.is_load() && s.includes_phdrs)
        .map(|s| s.vaddr + ehdr_size(info.is_64bit));
    if let Some(base) = phdr_base {
        for segment in &mut module.segments {
            if segment.p_type == segment_type::PHDR {
                segment.offset = ehdr_size(info.is_64bit);
                segment.vaddr = base;
                segment.paddr = base;
            }
        }
    }
    Ok(())
}

/// Stage 9: the standard symbols, defined only where the script did not
pub fn define_standard_symbols(module: &mut Module, config: &LinkerConfig) -> Result<()> {
    let origin = module.internal_input();
    let base = module.image_base;

    let mut text_end = base;
    let mut data_end = base;
    let mut bss_start = None;
    let mut image_end = base;
    let mut dynamic_addr = None;
    for id in ordered_entries(module) {
        let entry = module.section_map.entry(id);
        let elf = module.section(entry.section).elf();
        let Some(addr) = elf.addr else { continue };
        if !elf.is_alloc() {
            continue;
        }
        let end = addr + elf.size;
        image_end = image_end.max(end);
        if elf.is_executable() {
            text_end = text_end.max(end);
        }
        if elf.is_writable() && !elf.is_nobits() {
            data_end = data_end.max(end);
        }
        if elf.is_nobits() && elf.is_writable() && bss_start.is_none() {
            bss_start = Some(addr);
        }
        if entry.name == ".dynamic" {
            dynamic_addr = Some(addr);
        }
    }

    let mut define = |module: &mut Module, name: &str, value: u64| {
        let already_defined = module
            .name_pool
            .find_info(name)
            .map(|id| module.name_pool.info(id).is_defined())
            .unwrap_or(false);
        if already_defined {
            return;
        }
        module.name_pool.define_absolute(
            origin,
            "<internal>",
            name,
            value,
            SymbolBinding::Global,
            Visibility::Default,
        );
    };

    define(module, "__ehdr_start", base);
    define(module, "__executable_start", base);
    define(module, "etext", text_end);
    define(module, "_etext", text_end);
    define(module, "__etext", text_end);
    define(module, "edata", data_end);
    define(module, "_edata", data_end);
    define(module, "end", image_end);
    define(module, "_end", image_end);
    define(module, "__bss_start", bss_start.unwrap_or(data_end));
    if let Some(dynamic) = dynamic_addr {
        define(module, "_DYNAMIC", dynamic);
    }
    for (start_name, end_name, section) in [
        ("__init_array_start", "__init_array_end", ".init_array"),
        ("__fini_array_start", "__fini_array_end", ".fini_array"),
        ("__preinit_array_start", "__preinit_array_end", ".preinit_array"),
    ] {
        if let Some(id) = module.section_map.find(section) {
            let elf = module.section(module.section_map.entry(id).section).elf();
            if let Some(addr) = elf.addr {
                let size = elf.size;
                define(module, start_name, addr);
                define(module, end_name, addr + size);
            }
        }
    }
    let _ = config;
    Ok(())
}

/// True for names usable as C identifiers, the precondition for
/// section magic symbols
fn is_c_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Stage 10: `__start_<section>` / `__stop_<section>` for every
/// referenced C-identifier-named output section
pub fn define_magic_section_symbols(module: &mut Module) -> Result<()> {
    let mut pending = Vec::new();
    for info in module.name_pool.infos() {
        if !info.is_undefined() {
            continue;
        }
        let (prefix, start) = if let Some(rest) = info.name.strip_prefix("__start_") {
            (rest.to_string(), true)
        } else if let Some(rest) = info.name.strip_prefix("__stop_") {
            (rest.to_string(), false)
        } else {
            continue;
        };
        if !is_c_identifier(&prefix) {
            continue;
        }
        let Some(id) = module.section_map.find(&prefix) else { continue };
        let elf = module.section(module.section_map.entry(id).section).elf();
        let Some(addr) = elf.addr else { continue };
        let value = if start { addr } else { addr + elf.size };
        pending.push((info.name.clone(), value));
    }
    let origin = module.internal_input();
    for (name, value) in pending {
        module.name_pool.define_absolute(
            origin,
            "<internal>",
            &name,
            value,
            SymbolBinding::Global,
            Visibility::Protected,
        );
    }
    Ok(())
}

/// Stage 11: deferred assertions plus the pairwise overlap check over
/// file offsets, VMAs, and LMAs
pub fn check_assertions_and_overlap(module: &mut Module) -> Result<()> {
    let deferred = std::mem::take(&mut module.deferred_asserts);
    for assignment in &deferred {
        let ctx = EvalContext {
            module: &*module,
            dot: module.dot,
            inside_sections: true,
            current_section: None,
        };
        let value = eval(&assignment.expr, &ctx)?;
        if value == 0 {
            return Err(Error::Assert {
                message: assignment.message.clone().unwrap_or_default(),
            });
        }
    }

    struct Extent {
        name: String,
        file: Option<(u64, u64)>,
        vma: Option<(u64, u64)>,
        lma: Option<(u64, u64)>,
    }
    let mut extents = Vec::new();
    for id in ordered_entries(module) {
        let entry = module.section_map.entry(id);
        if entry.is_discard {
            continue;
        }
        let elf = module.section(entry.section).elf();
        if elf.size == 0 {
            continue;
        }
        let file = (!elf.is_nobits())
            .then(|| elf.offset.map(|o| (o, o + elf.size)))
            .flatten();
        let vma = (elf.is_alloc() && !elf.is_tls())
            .then(|| elf.addr.map(|a| (a, a + elf.size)))
            .flatten();
        let lma = (elf.is_alloc() && !elf.is_nobits())
            .then(|| elf.load_address().map(|a| (a, a + elf.size)))
            .flatten();
        extents.push(Extent { name: entry.name.clone(), file, vma, lma });
    }
    let overlaps = |a: (u64, u64), b: (u64, u64)| a.0 < b.1 && b.0 < a.1;
    for i in 0..extents.len() {
        for j in i + 1..extents.len() {
            let (a, b) = (&extents[i], &extents[j]);
            for (space, left, right) in [
                ("file offsets", a.file, b.file),
                ("virtual memory", a.vma, b.vma),
                ("load memory", a.lma, b.lma),
            ] {
                if let (Some(l), Some(r)) = (left, right) {
                    if overlaps(l, r) {
                        return Err(Error::OverlappingSection {
                            a: a.name.clone(),
                            b: b.name.clone(),
                            space: space.into(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reset per-iteration layout state so a relaxation round starts clean
pub fn reset_layout_state(module: &mut Module) {
    module.segments.clear();
    module.paddings.clear();
    module.dot = 0;
    for region in &mut module.memory_regions {
        region.vma_cursor = region.origin;
        region.lma_cursor = region.origin;
    }
    let section_ids: Vec<SectionId> = module
        .section_map
        .ids()
        .map(|id| module.section_map.entry(id).section)
        .collect();
    for sid in section_ids {
        let elf = module.section_mut(sid).elf_mut();
        elf.addr = None;
        elf.pma = None;
        elf.offset = None;
    }
    for fragment in &mut module.fragments {
        fragment.offset = None;
    }
}

/// The relaxation driver: `{assign → segments → offsets → relax}` until
/// the backend reports a fixpoint and the header size stabilizes
pub fn run_layout(
    module: &mut Module,
    config: &LinkerConfig,
    backend: &dyn Backend,
) -> Result<()> {
    module.image_base = if module.script.has_sections_command {
        0
    } else {
        default_image_base(config)
    };
    build_memory_regions(module)?;
    let has_phdrs_command = module
        .script
        .commands
        .iter()
        .any(|c| matches!(c, ScriptCommand::Phdrs(_)));

    // Seed the header estimate; iterations refine it.
    let info = backend.target_info();
    module.headers_size = ehdr_size(info.is_64bit) + 10 * phdr_entsize(info.is_64bit);

    for round in 0..8 {
        assign_addresses(module, config, backend)?;
        if has_phdrs_command {
            create_script_segments(module, config)?;
        } else {
            create_default_segments(module, config, backend)?;
        }
        let before = module.headers_size;
        assign_file_offsets(module, backend)?;
        let finished = backend.relax(module)?;
        if finished && module.headers_size == before {
            debug!("layout converged after {} round(s)", round + 1);
            break;
        }
        let headers = module.headers_size;
        reset_layout_state(module);
        module.headers_size = headers;
    }

    define_standard_symbols(module, config)?;
    define_magic_section_symbols(module)?;
    module.finalize_symbol_values()?;
    check_assertions_and_overlap(module)?;
    Ok(())
}

/// Evaluate the script's literal data commands into their reserved
/// fragments; runs once addresses are final
pub fn evaluate_data_commands(module: &mut Module) -> Result<()> {
    let mut work = Vec::new();
    for id in module.section_map.ids().collect::<Vec<_>>() {
        for cmd in &module.section_map.entry(id).data_commands {
            work.push((id, cmd.clone()));
        }
    }
    for (id, cmd) in work {
        let value = {
            let ctx = EvalContext {
                module: &*module,
                dot: module.dot,
                inside_sections: true,
                current_section: Some(id),
            };
            eval(&cmd.expr, &ctx)?
        };
        if let crate::section::fragment::FragmentKind::Region(bytes) =
            &mut module.fragment_mut(cmd.frag).kind
        {
            let width = cmd.size as usize;
            let le = value.to_le_bytes();
            bytes.copy_from_slice(&le[..width]);
        }
    }
    Ok(())
}

/// Discarded/ignored sections must not reach the image; garbage
/// collection additionally drops unreferenced sections when requested
pub fn sweep_discarded(module: &mut Module) -> usize {
    let mut swept = 0;
    for section in &mut module.sections {
        let elf = section.elf_mut();
        if elf.kind == SectionKind::Discard || elf.kind == SectionKind::Exclude {
            elf.output = None;
            swept += 1;
        }
    }
    swept
}

/// Fragment-offset monotonicity: within a section's list, each
/// fragment starts at or after the previous one's end
pub fn verify_fragment_offsets(module: &Module) -> Result<()> {
    for (idx, section) in module.sections.iter().enumerate() {
        let elf = section.elf();
        let mut last_end = 0u64;
        for &fid in &elf.fragments {
            let frag = module.fragment(fid);
            if frag.owner.idx() != idx {
                // Spliced away; ownership moved with the fragment.
                continue;
            }
            let Some(offset) = frag.offset else { continue };
            if offset < last_end {
                return Err(Error::OverlappingSection {
                    a: elf.name.clone(),
                    b: elf.name.clone(),
                    space: "fragment offsets".into(),
                });
            }
            last_end = offset + frag.size();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_names_group_conventionally() {
        assert_eq!(default_output_name(".text.startup"), ".text");
        assert_eq!(default_output_name(".text"), ".text");
        assert_eq!(default_output_name(".textual"), ".textual");
        assert_eq!(default_output_name(".data.rel.ro.local"), ".data.rel.ro");
        assert_eq!(default_output_name("COMMON.foo"), ".bss");
        assert_eq!(default_output_name(".mysection"), ".mysection");
    }

    #[test]
    fn c_identifier_rules() {
        assert!(is_c_identifier("my_section"));
        assert!(is_c_identifier("_tag2"));
        assert!(!is_c_identifier(".text"));
        assert!(!is_c_identifier("2tag"));
        assert!(!is_c_identifier(""));
    }
}
