//! End-to-end link scenarios driven through a minimal little-endian
//! 64-bit test backend: absolute/pc-relative relocations only, no PLT
//! or GOT synthesis.

use std::path::Path;

use eld::config::{LinkerConfig, TargetOptions};
use eld::error::Result;
use eld::input::archive::ArchiveIndex;
use eld::input::{Input, InputFile, InputId, InputKind, ObjectReader};
use eld::module::Module;
use eld::object::linker::ObjectLinker;
use eld::reloc::{Relocation, RelocWrite, Relocator, Reservations};
use eld::section::fragment::{Fragment, FragmentKind, FragmentRef};
use eld::section::{classify, section_type, ElfSection, Section, SectionFlags, SectionId};
use eld::symbol::pool::SymbolDecl;
use eld::symbol::{InfoId, SymbolBinding, SymbolDesc, SymbolType, Visibility};
use eld::target::{Backend, TargetInfo};

/// Test relocation kinds
const R_ABS64: u32 = 1;
const R_ABS32: u32 = 2;
const R_PC32: u32 = 3;

struct TestRelocator;

impl Relocator for TestRelocator {
    fn scan(
        &self,
        _module: &Module,
        _reservations: &mut Reservations,
        _input: InputId,
        _reloc: &Relocation,
    ) -> Result<()> {
        Ok(())
    }

    fn apply(
        &self,
        _module: &Module,
        reloc: &Relocation,
        place: u64,
        symbol_value: u64,
    ) -> Result<RelocWrite> {
        let biased = symbol_value.wrapping_add(reloc.addend as u64);
        Ok(match reloc.kind {
            R_ABS64 => RelocWrite { value: biased, width: 8 },
            R_ABS32 => RelocWrite { value: biased & 0xffff_ffff, width: 4 },
            R_PC32 => RelocWrite {
                value: biased.wrapping_sub(place) & 0xffff_ffff,
                width: 4,
            },
            _ => RelocWrite::none(),
        })
    }
}

struct TestBackend {
    info: TargetInfo,
    relocator: TestRelocator,
}

impl TestBackend {
    fn new() -> Self {
        TestBackend { info: TargetInfo { machine: 62, ..TargetInfo::default() }, relocator: TestRelocator }
    }
}

impl Backend for TestBackend {
    fn target_info(&self) -> &TargetInfo {
        &self.info
    }

    fn relocator(&self) -> &dyn Relocator {
        &self.relocator
    }
}

/// Inputs are constructed programmatically; nothing goes through bytes
struct NullReader;

impl ObjectReader for NullReader {
    fn identify(&self, _path: &Path, _content: &[u8]) -> Result<InputKind> {
        Ok(InputKind::ElfRelocObj)
    }

    fn read(&self, _module: &mut Module, _input: InputId) -> Result<()> {
        Ok(())
    }

    fn archive_index(&self, _module: &Module, _archive: InputId) -> Result<ArchiveIndex> {
        Ok(ArchiveIndex::default())
    }

    fn extract_member(
        &self,
        _module: &mut Module,
        _archive: InputId,
        _member: usize,
    ) -> Result<InputId> {
        unreachable!("no archives in these scenarios")
    }
}

fn test_config() -> LinkerConfig {
    LinkerConfig::builder()
        .target(TargetOptions::builder().machine(62).build())
        .threads(1)
        .build()
}

fn add_object(module: &mut Module, name: &str, kind: InputKind) -> InputId {
    module.add_input(InputFile::new(Input::new(name), kind, Vec::new()))
}

/// Add one section with a single region fragment; returns the pair
fn add_section(
    module: &mut Module,
    input: InputId,
    name: &str,
    flags: SectionFlags,
    sh_type: u32,
    bytes: Vec<u8>,
    align: u64,
) -> (SectionId, eld::section::fragment::FragmentId) {
    let kind = classify(name, sh_type, flags);
    let mut elf = ElfSection::new(name, kind, sh_type, flags);
    elf.align = align;
    elf.input = Some(input);
    let sid = module.add_section(Section::Elf(elf));
    module.input_mut(input).sections.push(sid);
    let frag = module.add_fragment(Fragment::new(sid, align, FragmentKind::Region(bytes)));
    (sid, frag)
}

/// Define one global symbol inside a section
fn define_in_section(
    module: &mut Module,
    input: InputId,
    name: &str,
    section: SectionId,
    frag: eld::section::fragment::FragmentId,
    offset: u64,
    size: u64,
    binding: SymbolBinding,
) -> InfoId {
    let path = module.input(input).decorated_path();
    let decl = SymbolDecl::builder()
        .origin(input)
        .origin_path(path)
        .name(name)
        .desc(SymbolDesc::Defined)
        .binding(binding)
        .symbol_type(SymbolType::Func)
        .size(size)
        .value(offset)
        .section(section)
        .frag_ref(FragmentRef::new(frag, offset))
        .build();
    let result = module.name_pool.insert_symbol(decl).unwrap();
    module.input_mut(input).global_symbols.push(result.symbol);
    result.info
}

/// Create a local section symbol for relocation targets
fn section_symbol(
    module: &mut Module,
    input: InputId,
    section: SectionId,
    frag: eld::section::fragment::FragmentId,
) -> InfoId {
    let path = module.input(input).decorated_path();
    let name = format!(
        "<section {} of {}>",
        module.section(section).elf().name,
        path
    );
    let decl = SymbolDecl::builder()
        .origin(input)
        .origin_path(path)
        .name(name)
        .desc(SymbolDesc::Defined)
        .binding(SymbolBinding::Local)
        .symbol_type(SymbolType::Section)
        .section(section)
        .frag_ref(FragmentRef::new(frag, 0))
        .build();
    let (info, symbol) = module.name_pool.create_symbol(decl);
    module.input_mut(input).local_symbols.push(symbol);
    info
}

#[test]
fn weak_then_strong_resolves_to_the_strong_definition() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    let (text_a, frag_a) = add_section(
        &mut linker.module,
        a,
        ".text",
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        section_type::PROGBITS,
        vec![0u8; 0x40],
        16,
    );
    define_in_section(&mut linker.module, a, "foo", text_a, frag_a, 0x10, 8, SymbolBinding::Weak);

    let b = add_object(&mut linker.module, "b.o", InputKind::ElfRelocObj);
    let (text_b, frag_b) = add_section(
        &mut linker.module,
        b,
        ".text",
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        section_type::PROGBITS,
        vec![0u8; 0x40],
        16,
    );
    let foo = define_in_section(
        &mut linker.module,
        b,
        "foo",
        text_b,
        frag_b,
        0x30,
        8,
        SymbolBinding::Global,
    );

    linker.link().unwrap();

    let module = &linker.module;
    let info = module.name_pool.info(foo);
    assert_eq!(info.origin, Some(b));
    assert_eq!(info.binding, SymbolBinding::Global);
    // The final value is the strong definition's place in the merged
    // output: b.o's .text lands after a.o's 0x40 bytes.
    let text_out = module.section_map.find(".text").unwrap();
    let out_addr = module
        .section(module.section_map.entry(text_out).section)
        .elf()
        .addr
        .unwrap();
    assert_eq!(info.value, out_addr + 0x40 + 0x30);
}

#[test]
fn common_growth_lands_in_bss_with_largest_size() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    let mut declare_common = |module: &mut Module, name: &str, origin: InputId, size: u64, align: u64| {
        let path = module.input(origin).decorated_path();
        let decl = SymbolDecl::builder()
            .origin(origin)
            .origin_path(path)
            .name(name)
            .desc(SymbolDesc::Common)
            .binding(SymbolBinding::Global)
            .symbol_type(SymbolType::Object)
            .size(size)
            .value(align)
            .build();
        module.name_pool.insert_symbol(decl).unwrap()
    };

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    let b = add_object(&mut linker.module, "b.o", InputKind::ElfRelocObj);
    let c = add_object(&mut linker.module, "c.o", InputKind::ElfRelocObj);
    declare_common(&mut linker.module, "foo", a, 50, 4);
    declare_common(&mut linker.module, "foo", b, 10, 4);
    let result = declare_common(&mut linker.module, "foo", c, 200, 8);

    linker.link().unwrap();

    let module = &linker.module;
    let info = module.name_pool.info(result.info);
    assert_eq!(info.size, 200);
    assert_eq!(info.origin, Some(c));
    // The common was promoted to a definition in a COMMON.<name> section
    // routed to .bss.
    let section = info.section.expect("common allocated");
    assert_eq!(module.section(section).elf().name, "COMMON.foo");
    assert_eq!(module.section(section).common_origin(), Some(c));
    let bss = module.section_map.find(".bss").expect(".bss exists");
    assert_eq!(module.section(section).elf().output, Some(bss));
    let bss_elf = module.section(module.section_map.entry(bss).section).elf();
    assert!(bss_elf.size >= 200);
}

#[test]
fn shared_definition_satisfies_undefined_reference() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    let so = add_object(&mut linker.module, "a.so", InputKind::ElfDynObj);
    {
        let path = linker.module.input(so).decorated_path();
        let decl = SymbolDecl::builder()
            .origin(so)
            .origin_path(path)
            .name("foo")
            .desc(SymbolDesc::Defined)
            .binding(SymbolBinding::Global)
            .symbol_type(SymbolType::Func)
            .value(0x10)
            .is_dyn(true)
            .build();
        linker.module.name_pool.insert_symbol(decl).unwrap();
    }

    let b = add_object(&mut linker.module, "b.o", InputKind::ElfRelocObj);
    {
        let path = linker.module.input(b).decorated_path();
        let decl = SymbolDecl::builder()
            .origin(b)
            .origin_path(path)
            .name("foo")
            .desc(SymbolDesc::Undefined)
            .binding(SymbolBinding::Global)
            .build();
        linker.module.name_pool.insert_symbol(decl).unwrap();
    }

    linker.link().unwrap();

    let module = &linker.module;
    let foo = module.name_pool.find_info("foo").unwrap();
    let info = module.name_pool.info(foo);
    assert!(info.is_dyn());
    assert!(info.out_symbol().is_some());
    assert_eq!(info.origin, Some(so));
    // The providing shared object is now needed.
    assert!(module.input(so).used);
}

#[test]
fn mergeable_strings_are_deduplicated_and_relocations_redirected() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    let strings = SectionFlags::ALLOC | SectionFlags::MERGE | SectionFlags::STRINGS;
    let payload = b"hello\0world\0".to_vec();

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    let (str_a, frag_str_a) = add_section(
        &mut linker.module,
        a,
        ".rodata.str1.1",
        strings,
        section_type::PROGBITS,
        payload.clone(),
        1,
    );
    let (text_a, _) = add_section(
        &mut linker.module,
        a,
        ".text",
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        section_type::PROGBITS,
        vec![0u8; 16],
        8,
    );
    let str_sym_a = section_symbol(&mut linker.module, a, str_a, frag_str_a);
    // A reference to "world" in a.o's copy.
    linker.module.input_mut(a).relocations.push(Relocation {
        kind: R_ABS64,
        section: text_a,
        offset: 0,
        symbol: str_sym_a,
        addend: 6,
    });

    let b = add_object(&mut linker.module, "b.o", InputKind::ElfRelocObj);
    let (str_b, frag_str_b) = add_section(
        &mut linker.module,
        b,
        ".rodata.str1.1",
        strings,
        section_type::PROGBITS,
        payload,
        1,
    );
    let (text_b, _) = add_section(
        &mut linker.module,
        b,
        ".text",
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        section_type::PROGBITS,
        vec![0u8; 16],
        8,
    );
    let str_sym_b = section_symbol(&mut linker.module, b, str_b, frag_str_b);
    // A reference to "world" in b.o's (excluded) copy.
    linker.module.input_mut(b).relocations.push(Relocation {
        kind: R_ABS64,
        section: text_b,
        offset: 8,
        symbol: str_sym_b,
        addend: 6,
    });

    let output = linker.link().unwrap();
    let module = &linker.module;

    // Exactly one copy of the 12 payload bytes survives, in the
    // conventional .rodata output.
    let merged = module.section_map.find(".rodata").unwrap();
    let merged_elf = module.section(module.section_map.entry(merged).section).elf();
    assert_eq!(merged_elf.size, 12);
    let base = merged_elf.offset.unwrap() as usize;
    assert_eq!(&output.image[base..base + 12], b"hello\0world\0");

    // Both relocations point at the surviving "world".
    let expected = merged_elf.addr.unwrap() + 6;
    let text_out = module.section_map.find(".text").unwrap();
    let text_elf = module.section(module.section_map.entry(text_out).section).elf();
    let text_off = text_elf.offset.unwrap() as usize;
    let read64 = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&output.image[at..at + 8]);
        u64::from_le_bytes(buf)
    };
    assert_eq!(read64(text_off), expected);
    // b.o's .text is laid after a.o's 16 bytes; its relocation sat at
    // input offset 8.
    assert_eq!(read64(text_off + 16 + 8), expected);
}

#[test]
fn script_at_decouples_load_address_with_congruent_offsets() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    linker
        .module
        .script
        .read_script(
            "SECTIONS { .text 0x400000 : AT(0x100000) { *(.text*) } }",
            "test.ld",
        )
        .unwrap();

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    add_section(
        &mut linker.module,
        a,
        ".text",
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        section_type::PROGBITS,
        vec![0x90u8; 0x100],
        16,
    );

    linker.link().unwrap();
    let module = &linker.module;

    let text = module.section_map.find(".text").unwrap();
    let elf = module.section(module.section_map.entry(text).section).elf();
    assert_eq!(elf.addr, Some(0x400000));
    assert_eq!(elf.pma, Some(0x100000));

    let load = module
        .segments
        .iter()
        .find(|s| s.is_load() && s.sections.contains(&text))
        .expect("a PT_LOAD covers .text");
    assert_eq!(load.vaddr, 0x400000);
    assert_eq!(load.paddr, 0x100000);
    // Segment/section congruence modulo the max page size.
    let page = backend.target_info().max_page_size;
    assert_eq!(load.offset % page, load.vaddr % page);
    assert_eq!(elf.offset.unwrap() % page, elf.addr.unwrap() % page);
}

#[test]
fn comdat_groups_keep_exactly_one_copy() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    let signature = "_ZN1CC1Ev";
    let mut add_group_member = |module: &mut Module, input: InputId| -> SectionId {
        let (sid, _) = add_section(
            module,
            input,
            ".text._ZN1CC1Ev",
            SectionFlags::ALLOC | SectionFlags::EXECINSTR | SectionFlags::GROUP,
            section_type::PROGBITS,
            vec![0u8; 0x20],
            16,
        );
        module.section_mut(sid).elf_mut().group_signature = Some(signature.to_string());
        module.input_mut(input).group_signatures.push(signature.to_string());
        sid
    };

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    let kept = add_group_member(&mut linker.module, a);
    let b = add_object(&mut linker.module, "b.o", InputKind::ElfRelocObj);
    let dropped = add_group_member(&mut linker.module, b);

    linker.link().unwrap();
    let module = &linker.module;

    use eld::section::SectionKind;
    assert_eq!(module.section(kept).elf().kind, SectionKind::Regular);
    assert_eq!(module.section(dropped).elf().kind, SectionKind::Ignore);
    // Only the winner contributed to the output.
    let text = module.section_map.find(".text").unwrap();
    let elf = module.section(module.section_map.entry(text).section).elf();
    assert_eq!(elf.size, 0x20);
}

#[test]
fn linker_script_symbols_and_asserts_participate() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    linker
        .module
        .script
        .read_script(
            "SECTIONS {\n\
               . = 0x10000;\n\
               .text : { *(.text*) }\n\
               __text_end = .;\n\
             }\n\
             ASSERT(__text_end > 0x10000, \"empty text\")",
            "test.ld",
        )
        .unwrap();

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    add_section(
        &mut linker.module,
        a,
        ".text",
        SectionFlags::ALLOC | SectionFlags::EXECINSTR,
        section_type::PROGBITS,
        vec![0u8; 0x80],
        4,
    );

    linker.link().unwrap();
    let module = &linker.module;
    let text = module.section_map.find(".text").unwrap();
    let elf = module.section(module.section_map.entry(text).section).elf();
    assert_eq!(elf.addr, Some(0x10000));
    let end = module.name_pool.find_info("__text_end").unwrap();
    assert_eq!(module.name_pool.info(end).value, 0x10000 + 0x80);
}

#[test]
fn magic_start_stop_symbols_bound_their_section() {
    let config = test_config();
    let backend = TestBackend::new();
    let reader = NullReader;
    let mut linker = ObjectLinker::new(&config, &backend, &reader);

    let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
    add_section(
        &mut linker.module,
        a,
        "tracepoints",
        SectionFlags::ALLOC,
        section_type::PROGBITS,
        vec![0u8; 0x30],
        8,
    );
    // An undefined reference makes the magic symbols materialize.
    {
        let path = linker.module.input(a).decorated_path();
        for name in ["__start_tracepoints", "__stop_tracepoints"] {
            let decl = SymbolDecl::builder()
                .origin(a)
                .origin_path(path.clone())
                .name(name)
                .desc(SymbolDesc::Undefined)
                .binding(SymbolBinding::Global)
                .visibility(Visibility::Hidden)
                .build();
            linker.module.name_pool.insert_symbol(decl).unwrap();
        }
    }

    linker.link().unwrap();
    let module = &linker.module;
    let out = module.section_map.find("tracepoints").unwrap();
    let elf = module.section(module.section_map.entry(out).section).elf();
    let start = module.name_pool.info(module.name_pool.find_info("__start_tracepoints").unwrap());
    let stop = module.name_pool.info(module.name_pool.find_info("__stop_tracepoints").unwrap());
    assert_eq!(start.value, elf.addr.unwrap());
    assert_eq!(stop.value, elf.addr.unwrap() + elf.size);
    assert!(start.value <= stop.value);
}

macro_rules! orphan_name_test {
    ($name:ident, $input:expr, $output:expr) => {
        paste::paste! {
            #[test]
            fn [<orphan_output_name_ $name>]() {
                assert_eq!(eld::layout::default_output_name($input), $output);
            }
        }
    };
}

orphan_name_test!(text_suffix, ".text.startup", ".text");
orphan_name_test!(rodata_str, ".rodata.str1.1", ".rodata");
orphan_name_test!(relro_local, ".data.rel.ro.local", ".data.rel.ro");
orphan_name_test!(tbss, ".tbss.counter", ".tbss");
orphan_name_test!(common, "COMMON.state", ".bss");
orphan_name_test!(custom, ".interp", ".interp");

#[test]
fn layout_is_idempotent_across_reruns() {
    let run = || {
        let config = test_config();
        let backend = TestBackend::new();
        let reader = NullReader;
        let mut linker = ObjectLinker::new(&config, &backend, &reader);
        let a = add_object(&mut linker.module, "a.o", InputKind::ElfRelocObj);
        add_section(
            &mut linker.module,
            a,
            ".text",
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            section_type::PROGBITS,
            vec![1u8; 0x123],
            16,
        );
        add_section(
            &mut linker.module,
            a,
            ".data",
            SectionFlags::ALLOC | SectionFlags::WRITE,
            section_type::PROGBITS,
            vec![2u8; 0x77],
            8,
        );
        let output = linker.link().unwrap();
        let module = &linker.module;
        let mut placements = Vec::new();
        for id in eld::layout::ordered_entries(module) {
            let entry = module.section_map.entry(id);
            let elf = module.section(entry.section).elf();
            placements.push((entry.name.clone(), elf.addr, elf.pma, elf.offset, elf.size));
        }
        let segments: Vec<_> = module
            .segments
            .iter()
            .map(|s| (s.p_type, s.offset, s.vaddr, s.paddr, s.filesz, s.memsz))
            .collect();
        (output.image, placements, segments)
    };
    let first = run();
    let second = run();
    assert_eq!(first.1, second.1);
    assert_eq!(first.2, second.2);
    assert_eq!(first.0, second.0);
}
