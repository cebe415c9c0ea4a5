//! Emits the final ELF file.
//!
//! Output happens in two steps. `prepare_output_sections` runs before layout
//! and creates the synthetic sections whose sizes are already known: the
//! symbol table, its string table, the section name table and, for `-r`
//! output, one `.rela` section per section with pending relocations. After
//! layout has assigned offsets, `write` fills in their bytes and assembles
//! the headers around the section payloads.

use crate::LinkerContext;
use crate::arch::Arch;
use crate::args::OutputKind;
use crate::bail;
use crate::elf;
use crate::error::Result;
use crate::layout::Layout;
use crate::sections::SectionId;
use crate::sections::align_up;
use crate::symbol_db::Binding;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolPlacement;
use lode_utils::elf::SectionFlags;
use lode_utils::elf::sht;
use object::LittleEndian;
use object::U16;
use object::U32;
use object::U64;

const EHDR_SIZE: u64 = size_of::<elf::FileHeader>() as u64;
const PHDR_SIZE: u64 = size_of::<elf::ProgramHeader>() as u64;
const SHDR_SIZE: u64 = size_of::<elf::SectionHeader>() as u64;
const SYM_SIZE: u64 = size_of::<elf::SymtabEntry>() as u64;
const RELA_SIZE: u64 = size_of::<elf::Rela>() as u64;

const E: LittleEndian = LittleEndian;

/// Creates the symbol table, string tables and (for relocatable output) the
/// `.rela` sections, sized but empty. Their sizes must be final before layout
/// runs; their contents are produced by `write`.
#[tracing::instrument(skip_all, name = "Prepare output sections")]
pub(crate) fn prepare_output_sections(
    ctx: &mut LinkerContext,
    output_kind: OutputKind,
) -> Result {
    if output_kind == OutputKind::Relocatable {
        let with_relocations: Vec<SectionId> = ctx
            .sections
            .ids()
            .filter(|&id| !ctx.sections[id].relocations.is_empty())
            .collect();
        for target in with_relocations {
            let count = ctx.sections[target].relocations.len() as u64;
            let name = format!(".rela{}", ctx.sections[target].name);
            let rela = ctx
                .sections
                .ensure(&name, sht::RELA, SectionFlags::empty())?;
            let section = &mut ctx.sections[rela];
            section.len = count * RELA_SIZE;
            section.entsize = RELA_SIZE;
            section.alignment = 8;
        }
    }

    let symtab = ctx
        .sections
        .ensure(".symtab", sht::SYMTAB, SectionFlags::empty())?;
    {
        let section = &mut ctx.sections[symtab];
        section.len = (1 + ctx.symbols.len() as u64) * SYM_SIZE;
        section.entsize = SYM_SIZE;
        section.alignment = 8;
    }

    let strtab = ctx
        .sections
        .ensure(".strtab", sht::STRTAB, SectionFlags::empty())?;
    ctx.sections[strtab].len = 1 + ctx
        .symbols
        .iter()
        .map(|(_, symbol)| symbol.name.len() as u64 + 1)
        .sum::<u64>();

    // Created last so that it sorts after every named section; it names
    // itself too, so every section must exist by now.
    let shstrtab = ctx
        .sections
        .ensure(".shstrtab", sht::STRTAB, SectionFlags::empty())?;
    ctx.sections[shstrtab].len = 1 + ctx
        .sections
        .ids()
        .map(|id| ctx.sections[id].name.len() as u64 + 1)
        .sum::<u64>();
    Ok(())
}

#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write<A: Arch>(
    ctx: &mut LinkerContext,
    layout: &Layout,
    output_kind: OutputKind,
    entry: &str,
) -> Result<Vec<u8>> {
    // Section id -> output header index (entry 0 is the null header).
    let mut shndx_of = vec![0u16; ctx.sections.len()];
    for (position, &id) in layout.ordered.iter().enumerate() {
        shndx_of[id.0] = (position + 1) as u16;
    }

    // Locals first, as the format requires; stable so ties keep input order.
    let mut symbol_order: Vec<SymbolId> = ctx.symbols.ids().collect();
    symbol_order.sort_by_key(|&id| ctx.symbols.get(id).binding != Binding::Local);
    let local_count = symbol_order
        .iter()
        .take_while(|&&id| ctx.symbols.get(id).binding == Binding::Local)
        .count();
    let mut symbol_index = vec![0u32; ctx.symbols.len()];
    for (position, &id) in symbol_order.iter().enumerate() {
        symbol_index[id.0 as usize] = (position + 1) as u32;
    }

    let strtab_offsets = fill_strtab(ctx, &symbol_order)?;
    fill_symtab(ctx, &symbol_order, &strtab_offsets, &shndx_of)?;
    let shstrtab_offsets = fill_shstrtab(ctx, layout)?;
    if output_kind == OutputKind::Relocatable {
        fill_rela_sections(ctx, &symbol_index)?;
    }

    let e_entry = match output_kind {
        OutputKind::Executable => {
            let id = ctx
                .symbols
                .lookup(entry)
                .ok_or_else(|| anyhow::anyhow!("undefined entry symbol `{entry}`"))?;
            let symbol = ctx.symbols.get(id);
            if !symbol.is_defined() {
                bail!("undefined entry symbol `{entry}`");
            }
            symbol.value
        }
        OutputKind::Relocatable => 0,
    };

    let e_shoff = align_up(layout.file_end, 8);
    let shnum = layout.ordered.len() + 1;
    let total = e_shoff + shnum as u64 * SHDR_SIZE;
    let mut out = vec![0u8; total as usize];

    // Program headers directly after the file header.
    for (index, segment) in layout.segments.iter().enumerate() {
        let phdr = elf::ProgramHeader {
            p_type: U32::new(E, segment.p_type),
            p_flags: U32::new(E, segment.flags.bits()),
            p_offset: U64::new(E, segment.file_offset),
            p_vaddr: U64::new(E, segment.address),
            p_paddr: U64::new(E, segment.address),
            p_filesz: U64::new(E, segment.file_size),
            p_memsz: U64::new(E, segment.mem_size),
            p_align: U64::new(E, segment.align),
        };
        let start = (EHDR_SIZE + index as u64 * PHDR_SIZE) as usize;
        out[start..start + PHDR_SIZE as usize].copy_from_slice(object::bytes_of(&phdr));
    }

    // Section payloads.
    for &id in &layout.ordered {
        let section = &ctx.sections[id];
        if section.is_nobits() || section.data.is_empty() {
            continue;
        }
        let start = section.file_offset as usize;
        out[start..start + section.data.len()].copy_from_slice(&section.data);
    }

    // Section headers, then the names that tie them together.
    let symtab = ctx.sections.lookup(".symtab");
    let strtab = ctx.sections.lookup(".strtab");
    for (position, &id) in layout.ordered.iter().enumerate() {
        let section = &ctx.sections[id];
        let (sh_link, sh_info) = if section.section_type == sht::SYMTAB {
            let strtab = strtab.ok_or_else(|| anyhow::anyhow!("no .strtab emitted"))?;
            (u32::from(shndx_of[strtab.0]), local_count as u32 + 1)
        } else if section.section_type == sht::RELA {
            let symtab = symtab.ok_or_else(|| anyhow::anyhow!("no .symtab emitted"))?;
            let target = ctx
                .sections
                .lookup(rela_target_name(&section.name))
                .ok_or_else(|| anyhow::anyhow!("`{}` has no target section", section.name))?;
            (u32::from(shndx_of[symtab.0]), u32::from(shndx_of[target.0]))
        } else {
            (0, 0)
        };
        let shdr = elf::SectionHeader {
            sh_name: U32::new(E, shstrtab_offsets[id.0]),
            sh_type: U32::new(E, section.section_type.raw()),
            sh_flags: U64::new(E, section.flags.raw()),
            sh_addr: U64::new(E, section.address),
            sh_offset: U64::new(E, section.file_offset),
            sh_size: U64::new(E, section.len),
            sh_link: U32::new(E, sh_link),
            sh_info: U32::new(E, sh_info),
            sh_addralign: U64::new(E, section.alignment),
            sh_entsize: U64::new(E, section.entsize),
        };
        let start = (e_shoff + (position + 1) as u64 * SHDR_SIZE) as usize;
        out[start..start + SHDR_SIZE as usize].copy_from_slice(object::bytes_of(&shdr));
    }

    let shstrtab = ctx
        .sections
        .lookup(".shstrtab")
        .ok_or_else(|| anyhow::anyhow!("no .shstrtab emitted"))?;
    let ehdr = elf::FileHeader {
        e_ident: object::elf::Ident {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(
            E,
            match output_kind {
                OutputKind::Executable => object::elf::ET_EXEC,
                OutputKind::Relocatable => object::elf::ET_REL,
            },
        ),
        e_machine: U16::new(E, A::ELF_HEADER_ARCH_MAGIC),
        e_version: U32::new(E, u32::from(object::elf::EV_CURRENT)),
        e_entry: U64::new(E, e_entry),
        e_phoff: U64::new(E, if layout.segments.is_empty() { 0 } else { EHDR_SIZE }),
        e_shoff: U64::new(E, e_shoff),
        e_flags: U32::new(E, A::ELF_HEADER_FLAGS),
        e_ehsize: U16::new(E, EHDR_SIZE as u16),
        e_phentsize: U16::new(E, PHDR_SIZE as u16),
        e_phnum: U16::new(E, layout.segments.len() as u16),
        e_shentsize: U16::new(E, SHDR_SIZE as u16),
        e_shnum: U16::new(E, shnum as u16),
        e_shstrndx: U16::new(E, shndx_of[shstrtab.0]),
    };
    out[..EHDR_SIZE as usize].copy_from_slice(object::bytes_of(&ehdr));

    Ok(out)
}

fn rela_target_name(rela_name: &str) -> &str {
    rela_name.strip_prefix(".rela").unwrap_or(rela_name)
}

/// Builds `.strtab`, returning each symbol's name offset, indexed by
/// `SymbolId`.
fn fill_strtab(ctx: &mut LinkerContext, symbol_order: &[SymbolId]) -> Result<Vec<u32>> {
    let mut offsets = vec![0u32; ctx.symbols.len()];
    let mut data = vec![0u8];
    for &id in symbol_order {
        offsets[id.0 as usize] = data.len() as u32;
        data.extend_from_slice(ctx.symbols.get(id).name.as_bytes());
        data.push(0);
    }
    store_section_bytes(ctx, ".strtab", data)?;
    Ok(offsets)
}

fn fill_symtab(
    ctx: &mut LinkerContext,
    symbol_order: &[SymbolId],
    strtab_offsets: &[u32],
    shndx_of: &[u16],
) -> Result {
    let mut data = vec![0u8; SYM_SIZE as usize];
    for &id in symbol_order {
        let symbol = ctx.symbols.get(id);
        let st_shndx = match symbol.placement {
            SymbolPlacement::Section(section) => shndx_of[section.0],
            SymbolPlacement::Absolute => object::elf::SHN_ABS,
            SymbolPlacement::Common => object::elf::SHN_COMMON,
            SymbolPlacement::Undefined => object::elf::SHN_UNDEF,
        };
        let entry = elf::SymtabEntry {
            st_name: U32::new(E, strtab_offsets[id.0 as usize]),
            st_info: symbol.binding.st_bind() << 4 | symbol.kind.st_type(),
            st_other: symbol.visibility.st_other(),
            st_shndx: U16::new(E, st_shndx),
            st_value: U64::new(E, symbol.value),
            st_size: U64::new(E, symbol.size),
        };
        data.extend_from_slice(object::bytes_of(&entry));
    }
    store_section_bytes(ctx, ".symtab", data)
}

/// Builds `.shstrtab`, returning each section's name offset, indexed by
/// `SectionId`.
fn fill_shstrtab(ctx: &mut LinkerContext, layout: &Layout) -> Result<Vec<u32>> {
    let mut offsets = vec![0u32; ctx.sections.len()];
    let mut data = vec![0u8];
    for &id in &layout.ordered {
        offsets[id.0] = data.len() as u32;
        data.extend_from_slice(ctx.sections[id].name.as_bytes());
        data.push(0);
    }
    store_section_bytes(ctx, ".shstrtab", data)?;
    Ok(offsets)
}

fn fill_rela_sections(ctx: &mut LinkerContext, symbol_index: &[u32]) -> Result {
    let rela_ids: Vec<SectionId> = ctx
        .sections
        .ids()
        .filter(|&id| ctx.sections[id].section_type == sht::RELA)
        .collect();
    for rela in rela_ids {
        let target = ctx
            .sections
            .lookup(rela_target_name(&ctx.sections[rela].name))
            .ok_or_else(|| {
                anyhow::anyhow!("`{}` has no target section", ctx.sections[rela].name)
            })?;
        let mut data = Vec::with_capacity(ctx.sections[target].relocations.len() * 24);
        for rel in &ctx.sections[target].relocations {
            let sym = u64::from(symbol_index[rel.symbol.0 as usize]);
            let entry = elf::Rela {
                r_offset: U64::new(E, rel.offset),
                r_info: U64::new(E, sym << 32 | u64::from(rel.r_type)),
                r_addend: object::I64::new(E, rel.addend),
            };
            data.extend_from_slice(object::bytes_of(&entry));
        }
        let name = ctx.sections[rela].name.clone();
        store_section_bytes_by_id(ctx, rela, &name, data)?;
    }
    Ok(())
}

fn store_section_bytes(ctx: &mut LinkerContext, name: &str, data: Vec<u8>) -> Result {
    let id = ctx
        .sections
        .lookup(name)
        .ok_or_else(|| anyhow::anyhow!("section `{name}` was never created"))?;
    store_section_bytes_by_id(ctx, id, name, data)
}

fn store_section_bytes_by_id(
    ctx: &mut LinkerContext,
    id: SectionId,
    name: &str,
    data: Vec<u8>,
) -> Result {
    let section = &mut ctx.sections[id];
    if data.len() as u64 != section.len {
        bail!(
            "section `{name}` was sized as {} bytes but produced {}",
            section.len,
            data.len()
        );
    }
    section.data = data;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::relocate;
    use crate::sections::Relocation;
    use crate::symbol_db::Symbol;
    use crate::symbol_db::SymbolKind;
    use crate::symbol_db::Visibility;
    use crate::x86_64::X86_64;
    use lode_utils::elf::shf;
    use object::read::elf::FileHeader as _;
    use object::read::elf::SectionHeader as _;
    use object::read::elf::Sym as _;

    fn context_with_start() -> LinkerContext {
        let mut ctx = LinkerContext::new();
        let text = ctx
            .sections
            .ensure(".text", sht::PROGBITS, shf::ALLOC.with(shf::EXECINSTR))
            .unwrap();
        ctx.sections.append(text, &[0x90; 16], 16);
        ctx.symbols
            .add(Symbol {
                name: "_start".to_owned(),
                placement: SymbolPlacement::Section(text),
                value: 0,
                size: 16,
                binding: Binding::Global,
                kind: SymbolKind::Func,
                visibility: Visibility::Default,
            })
            .unwrap();
        ctx
    }

    #[test]
    fn executable_round_trips_through_a_parser() {
        let mut ctx = context_with_start();
        prepare_output_sections(&mut ctx, OutputKind::Executable).unwrap();
        let layout = layout::compute::<X86_64>(&mut ctx, OutputKind::Executable).unwrap();
        relocate::finalise_symbol_addresses(&mut ctx).unwrap();
        let bytes =
            write::<X86_64>(&mut ctx, &layout, OutputKind::Executable, "_start").unwrap();

        let header = elf::FileHeader::parse(&bytes[..]).unwrap();
        let endian = header.endian().unwrap();
        assert_eq!(header.e_type.get(endian), object::elf::ET_EXEC);
        assert_eq!(header.e_machine.get(endian), object::elf::EM_X86_64);
        assert!(header.e_entry.get(endian) >= X86_64::LOAD_ADDRESS);

        let phdrs = header.program_headers(endian, &bytes[..]).unwrap();
        let first = &phdrs[0];
        assert_eq!(first.p_type.get(endian), object::elf::PT_LOAD);
        assert_eq!(first.p_offset.get(endian), 0);
        assert_eq!(first.p_vaddr.get(endian), X86_64::LOAD_ADDRESS);

        let sections = header.sections(endian, &bytes[..]).unwrap();
        let names: Vec<&[u8]> = sections
            .iter()
            .map(|s| sections.section_name(endian, s).unwrap())
            .collect();
        assert!(names.contains(&b".text".as_slice()));
        assert!(names.contains(&b".symtab".as_slice()));
        assert!(names.contains(&b".shstrtab".as_slice()));
    }

    #[test]
    fn entry_symbol_must_be_defined() {
        let mut ctx = context_with_start();
        prepare_output_sections(&mut ctx, OutputKind::Executable).unwrap();
        let layout = layout::compute::<X86_64>(&mut ctx, OutputKind::Executable).unwrap();
        relocate::finalise_symbol_addresses(&mut ctx).unwrap();
        let err = write::<X86_64>(&mut ctx, &layout, OutputKind::Executable, "nonexistent");
        assert!(err.is_err());
    }

    #[test]
    fn relocatable_output_carries_rela_sections() {
        let mut ctx = context_with_start();
        let text = ctx.sections.lookup(".text").unwrap();
        let puts = ctx
            .symbols
            .add(Symbol {
                name: "puts".to_owned(),
                placement: SymbolPlacement::Undefined,
                value: 0,
                size: 0,
                binding: Binding::Global,
                kind: SymbolKind::NoType,
                visibility: Visibility::Default,
            })
            .unwrap();
        ctx.sections[text].relocations.push(Relocation {
            offset: 4,
            symbol: puts,
            r_type: object::elf::R_X86_64_PLT32,
            addend: -4,
        });

        prepare_output_sections(&mut ctx, OutputKind::Relocatable).unwrap();
        let layout = layout::compute::<X86_64>(&mut ctx, OutputKind::Relocatable).unwrap();
        let bytes = write::<X86_64>(&mut ctx, &layout, OutputKind::Relocatable, "_start").unwrap();

        let header = elf::FileHeader::parse(&bytes[..]).unwrap();
        let endian = header.endian().unwrap();
        assert_eq!(header.e_type.get(endian), object::elf::ET_REL);
        assert_eq!(header.e_phnum.get(endian), 0);

        let sections = header.sections(endian, &bytes[..]).unwrap();
        let rela = sections
            .iter()
            .find(|s| sections.section_name(endian, s).unwrap() == b".rela.text")
            .unwrap();
        let (entries, _) = rela.rela(endian, &bytes[..]).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.r_offset.get(endian), 4);
        assert_eq!(entry.r_type(endian, false), object::elf::R_X86_64_PLT32);

        // The relocation points at the `puts` symbol table row.
        let symtab = sections.symbols(endian, &bytes[..], object::elf::SHT_SYMTAB).unwrap();
        let sym = symtab.symbol(object::SymbolIndex(entry.r_sym(endian, false) as usize)).unwrap();
        assert_eq!(symtab.symbol_name(endian, sym).unwrap(), b"puts");
        assert!(sym.is_undefined(endian));
    }
}
