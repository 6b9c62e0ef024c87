//! The relocation engine: a two-phase scan/apply protocol.
//!
//! The scan pass runs once per object after output sections are fixed and
//! reserves GOT/PLT slots, dynamic relocation entries, and copy
//! relocations into per-input buffers that merge deterministically. The
//! apply pass runs after layout, computes final values through the
//! target's [`Relocator`], and writes them into the output image.

use std::collections::HashMap;

use log::debug;

use crate::error::{Error, Result};
use crate::input::InputId;
use crate::module::Module;
use crate::object::section_map::OutputSectId;
use crate::section::{SectionId, SectionKind};
use crate::symbol::InfoId;
use crate::target::Backend;

#[derive(Debug, Clone)]
/// One relocation record, flat across an input's sections
pub struct Relocation {
    /// Target-specific relocation type
    pub kind: u32,
    /// The input section whose bytes the relocation edits
    pub section: SectionId,
    /// Offset of the edited bytes within that section
    pub offset: u64,
    /// The referenced symbol
    pub symbol: InfoId,
    /// The explicit addend
    pub addend: i64,
}

#[derive(Debug, Clone, Copy)]
/// What a relocator's apply computed
pub struct RelocWrite {
    /// The value to store
    pub value: u64,
    /// Width of the store in bytes; zero means no write
    pub width: u8,
}

impl RelocWrite {
    /// A no-op write
    pub const fn none() -> Self {
        RelocWrite { value: 0, width: 0 }
    }
}

/// Target-specific relocation arithmetic, reached through the backend.
///
/// `scan` may reserve GOT/PLT/dynamic/copy bookkeeping; `apply` turns the
/// symbol value and place into the stored value.
pub trait Relocator: Send + Sync {
    /// Inspect one relocation and reserve whatever it needs
    fn scan(
        &self,
        module: &Module,
        reservations: &mut Reservations,
        input: InputId,
        reloc: &Relocation,
    ) -> Result<()>;

    /// Compute the stored value for one relocation
    fn apply(
        &self,
        module: &Module,
        reloc: &Relocation,
        place: u64,
        symbol_value: u64,
    ) -> Result<RelocWrite>;
}

#[derive(Debug, Clone)]
/// One reserved dynamic relocation
pub struct DynRelocRequest {
    /// Dynamic relocation type
    pub kind: u32,
    /// The referenced symbol
    pub symbol: InfoId,
    /// The input section the relocation edits; its output section keys
    /// the size accounting
    pub section: SectionId,
}

#[derive(Debug, Default)]
/// Per-input scan reservations; owned by one worker, merged serially
pub struct Reservations {
    /// Symbols needing GOT slots, in scan order
    pub got: Vec<InfoId>,
    /// Symbols needing PLT entries, in scan order
    pub plt: Vec<InfoId>,
    /// Dynamic relocations to emit
    pub dynamic: Vec<DynRelocRequest>,
    /// Shared-object data symbols needing copy relocations
    pub copies: Vec<InfoId>,
}

impl Reservations {
    /// Reserve a GOT slot for `symbol`
    pub fn reserve_got(&mut self, symbol: InfoId) {
        self.got.push(symbol);
    }

    /// Reserve a PLT entry for `symbol`
    pub fn reserve_plt(&mut self, symbol: InfoId) {
        self.plt.push(symbol);
    }

    /// Reserve a dynamic relocation
    pub fn reserve_dynamic(&mut self, request: DynRelocRequest) {
        self.dynamic.push(request);
    }

    /// Queue a copy relocation for `symbol`
    pub fn request_copy(&mut self, symbol: InfoId) {
        self.copies.push(symbol);
    }
}

#[derive(Debug, Default)]
/// Merged scan results: the link-wide GOT/PLT/dynamic bookkeeping
pub struct RelocBookkeeping {
    /// GOT entries in deterministic first-reservation order
    pub got_entries: Vec<InfoId>,
    got_index: HashMap<InfoId, u32>,
    /// PLT entries in deterministic first-reservation order
    pub plt_entries: Vec<InfoId>,
    plt_index: HashMap<InfoId, u32>,
    /// Dynamic relocations to emit, deduplicated
    pub dyn_relocs: Vec<DynRelocRequest>,
    /// Emission counts per (target output section, relocation type);
    /// sizes the `.rel(a).<name>` sections exactly
    pub dyn_counts: HashMap<(OutputSectId, u32), u64>,
    /// Copy-relocation symbols in deterministic order
    pub copy_symbols: Vec<InfoId>,
}

impl RelocBookkeeping {
    /// Index of `symbol` in the GOT, once reserved
    pub fn got_slot(&self, symbol: InfoId) -> Option<u32> {
        self.got_index.get(&symbol).copied()
    }

    /// Index of `symbol` in the PLT, once reserved
    pub fn plt_slot(&self, symbol: InfoId) -> Option<u32> {
        self.plt_index.get(&symbol).copied()
    }

    /// Fold one input's reservations in; idempotent per symbol
    pub fn merge(&mut self, module: &Module, reservations: Reservations) {
        for symbol in reservations.got {
            if !self.got_index.contains_key(&symbol) {
                self.got_index.insert(symbol, self.got_entries.len() as u32);
                self.got_entries.push(symbol);
            }
        }
        for symbol in reservations.plt {
            if !self.plt_index.contains_key(&symbol) {
                self.plt_index.insert(symbol, self.plt_entries.len() as u32);
                self.plt_entries.push(symbol);
            }
        }
        for request in reservations.dynamic {
            if let Some(output) = module.section(request.section).elf().output {
                *self.dyn_counts.entry((output, request.kind)).or_insert(0) += 1;
            }
            self.dyn_relocs.push(request);
        }
        for symbol in reservations.copies {
            if !self.copy_symbols.contains(&symbol) {
                self.copy_symbols.push(symbol);
            }
        }
    }

    /// Total dynamic relocation count
    pub fn dyn_total(&self) -> u64 {
        self.dyn_counts.values().sum()
    }
}

/// Scan every input's relocations, fan-out per input, serial merge.
///
/// Copy relocations queue during the scan and materialize after it, so
/// shared-symbol rewrites are deterministic across threads.
pub fn scan_relocations(module: &mut Module, backend: &dyn Backend) -> Result<()> {
    let inputs: Vec<InputId> = module.input_ids().collect();
    let relocator = backend.relocator();
    let pool = crate::support::threads::ThreadPool::new(module.thread_count);
    let results: Vec<Result<Reservations>> = {
        let shared: &Module = module;
        pool.parallel_map(&inputs, |&input| {
            let mut reservations = Reservations::default();
            for reloc in &shared.input(input).relocations {
                if backend.should_skip_relocation(shared, reloc) {
                    continue;
                }
                if shared.section(reloc.section).elf().is_ignored() {
                    continue;
                }
                relocator.scan(shared, &mut reservations, input, reloc)?;
            }
            Ok(reservations)
        })
    };
    let mut merged = RelocBookkeeping::default();
    for result in results {
        merged.merge(module, result?);
    }
    debug!(
        "relocation scan: {} got, {} plt, {} dynamic, {} copy",
        merged.got_entries.len(),
        merged.plt_entries.len(),
        merged.dyn_relocs.len(),
        merged.copy_symbols.len()
    );
    module.reloc_state = merged;
    Ok(())
}

/// Write one little/big-endian value of `width` bytes at `pos`
pub fn write_value(image: &mut [u8], pos: usize, value: u64, width: u8, little_endian: bool) {
    let width = width as usize;
    if width == 0 || pos + width > image.len() {
        return;
    }
    let bytes = if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    if little_endian {
        image[pos..pos + width].copy_from_slice(&bytes[..width]);
    } else {
        image[pos..pos + width].copy_from_slice(&bytes[8 - width..]);
    }
}

fn apply_one(
    module: &Module,
    backend: &dyn Backend,
    reloc: &Relocation,
    image: &mut [u8],
) -> Result<()> {
    let section = module.section(reloc.section).elf();
    if section.is_ignored() || section.kind == SectionKind::Discard {
        return Ok(());
    }
    let Some(output) = section.output else { return Ok(()) };
    let out_section = module.section(module.section_map.entry(output).section).elf();
    if out_section.is_nobits() {
        return Ok(());
    }

    let place_ref = module.fragment_ref_in(reloc.section, reloc.offset);
    let Some(place_ref) = place_ref else { return Ok(()) };
    let frag = module.fragment(place_ref.frag);
    let frag_out = module.section(frag.owner).elf().output;
    let Some(frag_out) = frag_out else { return Ok(()) };
    let frag_out_section = module.section(module.section_map.entry(frag_out).section).elf();
    let Some(out_addr) = frag_out_section.addr else { return Ok(()) };
    let place = out_addr + frag.get_offset() + place_ref.offset;
    let file_pos = frag_out_section.file_offset() + frag.get_offset() + place_ref.offset;

    // Targets in discarded sections get the backend's substitute value and
    // no write happens.
    let info = module.name_pool.info(reloc.symbol);
    let discarded = info
        .section
        .map(|s| {
            let elf = module.section(s).elf();
            elf.kind == SectionKind::Discard || elf.kind == SectionKind::Ignore
        })
        .unwrap_or(false);
    if discarded {
        let _ = backend.value_for_discarded_relocation(reloc);
        return Ok(());
    }

    // Targets inside merged string sections redirect to the surviving
    // copy's output offset.
    if let Some(target_section) = info.section {
        if module.section(target_section).elf().kind == SectionKind::MergeStr {
            let symbol_offset = info
                .placement
                .map(|s| module.name_pool.symbol(s).frag_ref.offset)
                .unwrap_or(0);
            let input_offset = symbol_offset.wrapping_add(reloc.addend as u64);
            if let Some(target) = module.merge_string_target(target_section, input_offset) {
                let mut redirected = reloc.clone();
                redirected.addend = 0;
                let write = backend
                    .relocator()
                    .apply(module, &redirected, place, target)?;
                write_value(
                    image,
                    file_pos as usize,
                    write.value,
                    write.width,
                    backend.target_info().is_little_endian,
                );
                return Ok(());
            }
        }
    }

    let symbol_value = module.symbol_vma(reloc.symbol)?;
    let write = backend
        .relocator()
        .apply(module, reloc, place, symbol_value)?;
    write_value(
        image,
        file_pos as usize,
        write.value,
        write.width,
        backend.target_info().is_little_endian,
    );
    Ok(())
}

/// Apply every relocation into the laid-out image.
///
/// Branch-island relocations flush before input relocations: an island's
/// store must not be overwritten by a later input relocation at the same
/// address, so the two groups are separated by a barrier.
pub fn apply_relocations(module: &Module, backend: &dyn Backend, image: &mut [u8]) -> Result<()> {
    for entry in module.section_map.entries() {
        for island in &entry.islands {
            for reloc in &island.relocations {
                apply_one(module, backend, reloc, image)?;
            }
        }
    }
    for input in module.input_ids() {
        for reloc in &module.input(input).relocations {
            if backend.should_skip_relocation(module, reloc) {
                continue;
            }
            apply_one(module, backend, reloc, image)?;
        }
    }
    Ok(())
}

/// Check for references that must fail the link: undefined symbols per
/// the unresolved policy, and references into discarded sections
pub fn check_undefined(module: &Module) -> Result<()> {
    use crate::config::UnresolvedPolicy;
    let policy = module.unresolved_policy;
    if policy == UnresolvedPolicy::IgnoreAll {
        return Ok(());
    }
    for input in module.input_ids() {
        let file = module.input(input);
        for reloc in &file.relocations {
            let info = module.name_pool.info(reloc.symbol);
            if info.is_undefined() && !info.is_weak() && !info.is_dyn() {
                module.diag.error(Error::UndefinedSymbol {
                    symbol: info.name.clone(),
                    referer: file.decorated_path(),
                });
            }
        }
    }
    module.diag.check_phase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_value_truncates_to_width() {
        let mut image = vec![0u8; 8];
        write_value(&mut image, 2, 0x1122_3344, 4, true);
        assert_eq!(&image[2..6], &[0x44, 0x33, 0x22, 0x11]);
        let mut be = vec![0u8; 8];
        write_value(&mut be, 0, 0x1122, 2, false);
        assert_eq!(&be[0..2], &[0x11, 0x22]);
    }

    #[test]
    fn bookkeeping_dedups_got_and_plt() {
        let module = Module::for_tests();
        let mut merged = RelocBookkeeping::default();
        let mut a = Reservations::default();
        a.reserve_got(InfoId(1));
        a.reserve_got(InfoId(2));
        a.reserve_plt(InfoId(1));
        merged.merge(&module, a);
        let mut b = Reservations::default();
        b.reserve_got(InfoId(2));
        b.reserve_got(InfoId(3));
        merged.merge(&module, b);
        assert_eq!(merged.got_entries, vec![InfoId(1), InfoId(2), InfoId(3)]);
        assert_eq!(merged.got_slot(InfoId(2)), Some(1));
        assert_eq!(merged.plt_slot(InfoId(1)), Some(0));
    }
}
