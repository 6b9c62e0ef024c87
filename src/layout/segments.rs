//! Program segments and script memory regions.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::object::section_map::OutputSectId;
use crate::script::command::RegionAttrs;
use crate::script::expression::Expression;
use crate::support::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of an [`ElfSegment`] in the module arena
pub struct SegmentId(pub u32);

impl SegmentId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// `p_type` values the engine synthesizes
pub mod segment_type {
    /// PT_NULL
    pub const NULL: u32 = 0;
    /// PT_LOAD
    pub const LOAD: u32 = 1;
    /// PT_DYNAMIC
    pub const DYNAMIC: u32 = 2;
    /// PT_INTERP
    pub const INTERP: u32 = 3;
    /// PT_NOTE
    pub const NOTE: u32 = 4;
    /// PT_PHDR
    pub const PHDR: u32 = 6;
    /// PT_TLS
    pub const TLS: u32 = 7;
    /// PT_GNU_EH_FRAME
    pub const GNU_EH_FRAME: u32 = 0x6474_e550;
    /// PT_GNU_STACK
    pub const GNU_STACK: u32 = 0x6474_e551;
    /// PT_GNU_RELRO
    pub const GNU_RELRO: u32 = 0x6474_e552;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// `p_flags` permission bits
    pub struct SegmentFlags: u32 {
        /// PF_X
        const X = 1;
        /// PF_W
        const W = 2;
        /// PF_R
        const R = 4;
    }
}

#[derive(Debug)]
/// One program header in the making
pub struct ElfSegment {
    /// Script name, when PHDRS declared it
    pub name: String,
    /// `p_type`
    pub p_type: u32,
    /// Permissions
    pub flags: SegmentFlags,
    /// `p_offset`
    pub offset: u64,
    /// `p_vaddr`
    pub vaddr: u64,
    /// `p_paddr`
    pub paddr: u64,
    /// `p_filesz`
    pub filesz: u64,
    /// `p_memsz`
    pub memsz: u64,
    /// `p_align`
    pub align: u64,
    /// Largest section alignment inside the segment
    pub max_section_align: u64,
    /// Position among the emitted program headers
    pub ordinal: u16,
    /// Script-fixed load address
    pub fixed_lma: Option<Expression>,
    /// Index of the PHDRS spec that declared the segment
    pub spec: Option<usize>,
    /// Output sections in layout order
    pub sections: Vec<OutputSectId>,
    /// The segment covers the ELF header
    pub includes_filehdr: bool,
    /// The segment covers the program header table
    pub includes_phdrs: bool,
}

impl ElfSegment {
    /// An empty segment of `p_type` with read permission
    pub fn new(p_type: u32) -> Self {
        ElfSegment {
            name: String::new(),
            p_type,
            flags: SegmentFlags::R,
            offset: 0,
            vaddr: 0,
            paddr: 0,
            filesz: 0,
            memsz: 0,
            align: 1,
            max_section_align: 1,
            ordinal: 0,
            fixed_lma: None,
            spec: None,
            sections: Vec::new(),
            includes_filehdr: false,
            includes_phdrs: false,
        }
    }

    /// True for PT_LOAD
    pub fn is_load(&self) -> bool {
        self.p_type == segment_type::LOAD
    }

    /// Widen permissions; PT_TLS stays read-only
    pub fn update_flags(&mut self, flags: SegmentFlags) {
        if self.p_type != segment_type::TLS {
            self.flags |= flags;
        }
    }

    /// Append an output section
    pub fn append(&mut self, section: OutputSectId, section_align: u64) {
        self.sections.push(section);
        self.max_section_align = self.max_section_align.max(section_align);
    }

    /// True for the script `NONE` pseudo-segment
    pub fn is_none_segment(&self) -> bool {
        self.name.eq_ignore_ascii_case("none")
    }
}

#[derive(Debug, Clone)]
/// One MEMORY region with its running cursors; enforces both VMA and LMA
/// residency
pub struct MemoryRegion {
    /// Region name
    pub name: String,
    /// Permission/attribute letters
    pub attrs: RegionAttrs,
    /// Evaluated origin
    pub origin: u64,
    /// Evaluated length
    pub length: u64,
    /// Next free VMA
    pub vma_cursor: u64,
    /// Next free LMA
    pub lma_cursor: u64,
}

impl MemoryRegion {
    /// A region at `origin` of `length` bytes
    pub fn new(name: impl Into<String>, attrs: RegionAttrs, origin: u64, length: u64) -> Self {
        MemoryRegion {
            name: name.into(),
            attrs,
            origin,
            length,
            vma_cursor: origin,
            lma_cursor: origin,
        }
    }

    /// Bytes left after the VMA cursor
    pub fn available(&self) -> u64 {
        (self.origin + self.length).saturating_sub(self.vma_cursor)
    }

    /// Take `size` bytes at `align` from the VMA cursor
    pub fn allocate_vma(&mut self, size: u64, align: u64) -> Result<u64> {
        let at = align_up(self.vma_cursor, align);
        let end = at.checked_add(size).ok_or_else(|| self.overflow(size))?;
        if end > self.origin + self.length {
            return Err(self.overflow(size));
        }
        self.vma_cursor = end;
        Ok(at)
    }

    /// Take `size` bytes at `align` from the LMA cursor
    pub fn allocate_lma(&mut self, size: u64, align: u64) -> Result<u64> {
        let at = align_up(self.lma_cursor, align);
        let end = at.checked_add(size).ok_or_else(|| self.overflow(size))?;
        if end > self.origin + self.length {
            return Err(self.overflow(size));
        }
        self.lma_cursor = end;
        Ok(at)
    }

    fn overflow(&self, needed: u64) -> Error {
        Error::OutOfMemoryRegion {
            region: self.name.clone(),
            needed,
            available: self.available(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_allocates_and_overflows() {
        let mut region = MemoryRegion::new("ram", RegionAttrs::parse("rwx"), 0x1000, 0x100);
        assert_eq!(region.allocate_vma(0x80, 1).unwrap(), 0x1000);
        assert_eq!(region.allocate_vma(0x10, 0x40).unwrap(), 0x1080);
        let err = region.allocate_vma(0x100, 1).unwrap_err();
        assert!(matches!(err, Error::OutOfMemoryRegion { .. }));
    }

    #[test]
    fn tls_segment_keeps_read_only() {
        let mut tls = ElfSegment::new(segment_type::TLS);
        tls.update_flags(SegmentFlags::W | SegmentFlags::X);
        assert_eq!(tls.flags, SegmentFlags::R);
        let mut load = ElfSegment::new(segment_type::LOAD);
        load.update_flags(SegmentFlags::X);
        assert!(load.flags.contains(SegmentFlags::R | SegmentFlags::X));
    }
}
