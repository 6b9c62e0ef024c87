//! Fragments: the atomic units of section content.
//!
//! Every byte of the output image is produced by exactly one fragment. A
//! fragment belongs to exactly one section at any time; moving content
//! between sections is an explicit splice performed by the object builder.

use crate::error::{Error, Result};
use crate::section::SectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of a [`Fragment`] in the module arena
pub struct FragmentId(pub u32);

impl FragmentId {
    /// Arena slot for this id
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Sentinel id for the null fragment reference
const NULL_FRAG: FragmentId = FragmentId(u32::MAX);
/// Sentinel id for references into discarded sections
const DISCARDED_FRAG: FragmentId = FragmentId(u32::MAX - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// A stable, address-independent reference to a byte position inside a
/// fragment. `null` and `discarded` are distinguished sentinels.
pub struct FragmentRef {
    /// The referenced fragment
    pub frag: FragmentId,
    /// Byte offset within the fragment
    pub offset: u64,
}

impl FragmentRef {
    /// The distinguished null reference
    pub const fn null() -> Self {
        FragmentRef { frag: NULL_FRAG, offset: 0 }
    }

    /// A reference whose section was discarded from the link
    pub const fn discarded() -> Self {
        FragmentRef { frag: DISCARDED_FRAG, offset: 0 }
    }

    /// Build a reference to `offset` within `frag`
    pub fn new(frag: FragmentId, offset: u64) -> Self {
        FragmentRef { frag, offset }
    }

    /// True for the null sentinel
    pub fn is_null(&self) -> bool {
        self.frag == NULL_FRAG
    }

    /// True for the discarded sentinel
    pub fn is_discarded(&self) -> bool {
        self.frag == DISCARDED_FRAG
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which symbol hash table a hash fragment materializes
pub enum HashTableKind {
    /// `.hash`
    SysV,
    /// `.gnu.hash`
    Gnu,
}

#[derive(Debug, Clone)]
/// Wall-clock slice recorded into the timing section
pub struct TimingSlice {
    /// Link start, milliseconds since the epoch
    pub begin_ms: u64,
    /// Link duration in milliseconds
    pub duration_ms: u64,
    /// Name recorded for this invocation
    pub module_name: String,
}

impl TimingSlice {
    /// Serialized size: two 64-bit words plus the padded name field
    pub const NAME_FIELD: usize = 32;

    /// Serialized size in bytes
    pub fn byte_size(&self) -> u64 {
        16 + Self::NAME_FIELD as u64
    }
}

/// A null terminated string carved out of a merge-string input section,
/// mergeable with identical strings destined for the same output section.
#[derive(Debug, Clone)]
pub struct MergeableString {
    /// The string bytes, including the terminating NUL
    pub bytes: Vec<u8>,
    /// Offset of this string in its input section
    pub input_offset: u32,
    /// Offset in the output section; `u32::MAX` until assigned
    pub output_offset: u32,
    /// True once a duplicate elsewhere was chosen as the survivor
    pub exclude: bool,
}

impl MergeableString {
    /// Size in bytes, NUL included
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Mark this copy as replaced by a survivor
    pub fn exclude(&mut self) {
        self.exclude = true;
    }

    /// True once layout assigned an output offset
    pub fn has_output_offset(&self) -> bool {
        self.output_offset != u32::MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Reference to one string inside a merge-string fragment
pub struct StringRef {
    /// The owning fragment
    pub frag: FragmentId,
    /// Index into the fragment's string list
    pub index: u32,
}

#[derive(Debug, Clone, Default)]
/// A fragment that manages the [`MergeableString`]s of one merge-string
/// input section
pub struct MergeStringFragment {
    /// The strings, in input order
    pub strings: Vec<MergeableString>,
}

impl MergeStringFragment {
    /// Split `contents` on NUL into mergeable strings.
    ///
    /// The payload must be a sequence of NUL terminated strings; a missing
    /// terminator on the final string is a malformed-file condition.
    pub fn read_strings(contents: &[u8], path: &str, section: &str) -> Result<Self> {
        let mut strings = Vec::new();
        let mut offset = 0usize;
        let mut rest = contents;
        while !rest.is_empty() {
            let end = match rest.iter().position(|&b| b == 0) {
                Some(end) => end,
                None => {
                    return Err(Error::StringNotNullTerminated {
                        path: path.to_string(),
                        section: section.to_string(),
                        offset: offset as u64,
                    })
                }
            };
            // account for the null character
            let size = end + 1;
            strings.push(MergeableString {
                bytes: rest[..size].to_vec(),
                input_offset: offset as u32,
                output_offset: u32::MAX,
                exclude: false,
            });
            rest = &rest[size..];
            offset += size;
        }
        Ok(MergeStringFragment { strings })
    }

    /// Size of the surviving strings
    pub fn size(&self) -> u64 {
        self.strings.iter().filter(|s| !s.exclude).map(|s| s.size()).sum()
    }

    /// True when nothing survives
    pub fn is_zero_sized(&self) -> bool {
        self.size() == 0
    }

    /// Find the string containing the input-section `offset`
    pub fn find_string(&self, offset: u64) -> Option<usize> {
        let idx = self
            .strings
            .partition_point(|s| (s.input_offset as u64) <= offset);
        idx.checked_sub(1).filter(|&i| {
            let s = &self.strings[i];
            offset < s.input_offset as u64 + s.size()
        })
    }

    /// Once the fragment has an output offset, give every surviving string
    /// its final offset
    pub fn assign_output_offsets(&mut self, base: u32) {
        let mut offset = base;
        for s in &mut self.strings {
            if s.exclude {
                continue;
            }
            s.output_offset = offset;
            offset += s.size() as u32;
        }
    }

    /// Copy the surviving strings into `buf`, which must be exactly
    /// [`MergeStringFragment::size`] bytes long
    pub fn emit_into(&self, buf: &mut [u8]) {
        let mut at = 0usize;
        for s in &self.strings {
            if s.exclude {
                continue;
            }
            let len = s.bytes.len();
            buf[at..at + len].copy_from_slice(&s.bytes);
            at += len;
        }
        debug_assert_eq!(at, buf.len());
    }
}

#[derive(Debug, Clone)]
/// The closed set of fragment payloads
pub enum FragmentKind {
    /// Raw bytes copied from an input section
    Region(Vec<u8>),
    /// A repeated fill pattern
    Fill {
        /// The pattern, interpreted as `value_size` big-endian bytes
        value: u64,
        /// Pattern width in bytes (1, 2, 4, or 8)
        value_size: u8,
        /// Total bytes covered by the fill
        size: u64,
    },
    /// Mergeable strings with duplicate exclusion
    MergeString(MergeStringFragment),
    /// A single linker-owned NUL terminated string
    String(Vec<u8>),
    /// A symbol hash table; sized late by the namepool emitter
    Hash {
        /// Which table
        kind: HashTableKind,
        /// Size reserved for the table
        size: u64,
    },
    /// The `.eh_frame_hdr` search table; sized late
    EhFrameHdr {
        /// Size reserved for the header
        size: u64,
    },
    /// The build-id note payload
    BuildId(Vec<u8>),
    /// Link timing statistics
    Timing(TimingSlice),
}

#[derive(Debug, Clone)]
/// One atomic unit of section content
pub struct Fragment {
    /// The section this fragment belongs to
    pub owner: SectionId,
    /// Alignment constraint in bytes
    pub align: u64,
    /// Offset within the owning output section; assigned during layout
    pub offset: Option<u64>,
    /// The payload
    pub kind: FragmentKind,
}

impl Fragment {
    /// Create a fragment owned by `owner`
    pub fn new(owner: SectionId, align: u64, kind: FragmentKind) -> Self {
        Fragment { owner, align: align.max(1), offset: None, kind }
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        match &self.kind {
            FragmentKind::Region(bytes) => bytes.len() as u64,
            FragmentKind::Fill { size, .. } => *size,
            FragmentKind::MergeString(ms) => ms.size(),
            FragmentKind::String(bytes) => bytes.len() as u64,
            FragmentKind::Hash { size, .. } => *size,
            FragmentKind::EhFrameHdr { size } => *size,
            FragmentKind::BuildId(payload) => payload.len() as u64,
            FragmentKind::Timing(slice) => slice.byte_size(),
        }
    }

    /// True for fragments that currently contribute no bytes
    pub fn is_zero_sized(&self) -> bool {
        self.size() == 0
    }

    /// Offset within the owning output section.
    ///
    /// Calling this before layout assigned offsets is a bug.
    pub fn get_offset(&self) -> u64 {
        debug_assert!(self.offset.is_some(), "fragment offset queried before layout");
        self.offset.unwrap_or(0)
    }

    /// Assign the fragment's output offset; merge-string fragments cascade
    /// the assignment onto their surviving strings
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = Some(offset);
        if let FragmentKind::MergeString(ms) = &mut self.kind {
            ms.assign_output_offsets(offset as u32);
        }
    }

    /// Copy the fragment's bytes into `buf`, which must be exactly
    /// [`Fragment::size`] bytes long
    pub fn emit_into(&self, buf: &mut [u8]) {
        match &self.kind {
            FragmentKind::Region(bytes) | FragmentKind::String(bytes) | FragmentKind::BuildId(bytes) => {
                buf.copy_from_slice(bytes);
            }
            FragmentKind::Fill { value, value_size, size } => {
                let width = (*value_size).clamp(1, 8) as usize;
                let pattern = value.to_be_bytes();
                let pattern = &pattern[8 - width..];
                for (i, b) in buf.iter_mut().enumerate().take(*size as usize) {
                    *b = pattern[i % width];
                }
            }
            FragmentKind::MergeString(ms) => ms.emit_into(buf),
            FragmentKind::Hash { .. } | FragmentKind::EhFrameHdr { .. } => {
                // Reserved space; the namepool/unwind emitters fill it in
                // after symbol indices are final.
                buf.fill(0);
            }
            FragmentKind::Timing(slice) => {
                buf[..8].copy_from_slice(&slice.begin_ms.to_le_bytes());
                buf[8..16].copy_from_slice(&slice.duration_ms.to_le_bytes());
                let name = slice.module_name.as_bytes();
                let take = name.len().min(TimingSlice::NAME_FIELD);
                buf[16..16 + take].copy_from_slice(&name[..take]);
                buf[16 + take..].fill(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_strings_splits_on_nul() {
        let ms = MergeStringFragment::read_strings(b"hello\0world\0", "a.o", ".rodata.str1.1")
            .unwrap();
        assert_eq!(ms.strings.len(), 2);
        assert_eq!(ms.strings[0].bytes, b"hello\0");
        assert_eq!(ms.strings[1].input_offset, 6);
        assert_eq!(ms.size(), 12);
    }

    #[test]
    fn read_strings_requires_terminator() {
        let err = MergeStringFragment::read_strings(b"hello\0wor", "a.o", ".s").unwrap_err();
        assert!(matches!(err, Error::StringNotNullTerminated { offset: 6, .. }));
    }

    #[test]
    fn find_string_uses_partition_point() {
        let ms = MergeStringFragment::read_strings(b"ab\0cde\0f\0", "a.o", ".s").unwrap();
        assert_eq!(ms.find_string(0), Some(0));
        assert_eq!(ms.find_string(2), Some(0));
        assert_eq!(ms.find_string(3), Some(1));
        assert_eq!(ms.find_string(6), Some(1));
        assert_eq!(ms.find_string(7), Some(2));
        assert_eq!(ms.find_string(9), None);
    }

    #[test]
    fn excluded_strings_do_not_get_offsets() {
        let mut ms = MergeStringFragment::read_strings(b"aa\0bb\0", "a.o", ".s").unwrap();
        ms.strings[0].exclude();
        ms.assign_output_offsets(0x10);
        assert!(!ms.strings[0].has_output_offset());
        assert_eq!(ms.strings[1].output_offset, 0x10);
        assert_eq!(ms.size(), 3);
    }

    #[test]
    fn fill_repeats_pattern() {
        let frag = Fragment::new(
            SectionId(0),
            1,
            FragmentKind::Fill { value: 0xdead, value_size: 2, size: 6 },
        );
        let mut buf = vec![0u8; 6];
        frag.emit_into(&mut buf);
        assert_eq!(buf, [0xde, 0xad, 0xde, 0xad, 0xde, 0xad]);
    }

    #[test]
    fn reserved_fragments_emit_zeroed_space() {
        let hash = Fragment::new(
            SectionId(0),
            8,
            FragmentKind::Hash { kind: HashTableKind::Gnu, size: 0x20 },
        );
        assert_eq!(hash.size(), 0x20);
        let mut buf = vec![0xaau8; 0x20];
        hash.emit_into(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));

        let hdr = Fragment::new(SectionId(0), 4, FragmentKind::EhFrameHdr { size: 12 });
        assert_eq!(hdr.size(), 12);
    }

    #[test]
    fn timing_fragment_serializes_begin_and_name() {
        let slice = TimingSlice {
            begin_ms: 0x1122_3344,
            duration_ms: 7,
            module_name: "a.out".into(),
        };
        let frag = Fragment::new(SectionId(0), 8, FragmentKind::Timing(slice));
        let mut buf = vec![0u8; frag.size() as usize];
        frag.emit_into(&mut buf);
        assert_eq!(&buf[0..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[8..9], &[7]);
        assert_eq!(&buf[16..21], b"a.out");
        assert_eq!(buf[21], 0);
    }

    #[test]
    fn fragment_ref_sentinels_are_distinct() {
        assert!(FragmentRef::null().is_null());
        assert!(FragmentRef::discarded().is_discarded());
        assert!(!FragmentRef::discarded().is_null());
    }
}
