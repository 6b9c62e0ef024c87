//! The link map: a stable, human-readable section-by-section dump of
//! placement, with per-rule match statistics.

use std::fmt::Write as _;

use crate::layout::ordered_entries;
use crate::module::Module;

/// Render the link map as text
pub fn render(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Link map");
    let _ = writeln!(out);

    if !module.memory_regions.is_empty() {
        let _ = writeln!(out, "Memory Configuration");
        let _ = writeln!(out, "{:<16} {:>18} {:>18}", "Name", "Origin", "Length");
        for region in &module.memory_regions {
            let _ = writeln!(
                out,
                "{:<16} {:>#18x} {:>#18x}",
                region.name, region.origin, region.length
            );
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "Output sections");
    for id in ordered_entries(module) {
        let entry = module.section_map.entry(id);
        if entry.is_discard {
            continue;
        }
        let elf = module.section(entry.section).elf();
        let _ = writeln!(
            out,
            "{:<24} {:>#14x} {:>#10x} align {:#x}",
            entry.name,
            elf.addr.unwrap_or(0),
            elf.size,
            elf.align
        );
        if let Some(pma) = elf.pma {
            let _ = writeln!(out, "    load address {pma:#x}");
        }
        for &rule_id in &entry.rules {
            let rule = module.section_map.rule(rule_id);
            if rule.matched.is_empty() && rule.annotation != "<default>" {
                continue;
            }
            let _ = writeln!(
                out,
                "  rule {:<40} matched {}",
                rule.annotation,
                rule.match_count()
            );
            for &sid in &rule.matched {
                let section = module.section(sid).elf();
                let input = section
                    .input
                    .map(|i| module.input(i).decorated_path())
                    .unwrap_or_else(|| "<internal>".into());
                let _ = writeln!(
                    out,
                    "    {:<28} {:>#10x} {input}",
                    section.name, section.size
                );
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Program headers");
    for segment in &module.segments {
        let _ = writeln!(
            out,
            "  type {:#x} offset {:#x} vaddr {:#x} paddr {:#x} filesz {:#x} memsz {:#x} align {:#x}",
            segment.p_type,
            segment.offset,
            segment.vaddr,
            segment.paddr,
            segment.filesz,
            segment.memsz,
            segment.align
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_module_renders_headers() {
        let module = Module::for_tests();
        let text = render(&module);
        assert!(text.contains("# Link map"));
        assert!(text.contains("Output sections"));
    }
}
