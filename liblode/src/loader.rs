//! Loads input objects and archives into the link context.
//!
//! Sections are merged into output sections, symbols go through the global
//! table, and relocations are rebased so that nothing downstream needs to
//! know which file anything came from. Archive members are loaded lazily,
//! driven by the archive's symbol index.

use crate::LinkerContext;
use crate::arch::Arch;
use crate::archive::ArchiveContent;
use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::bail;
use crate::elf;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::sections::Relocation;
use crate::sections::SectionId;
use crate::sections::output_section_name;
use crate::symbol_db::Binding;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolKind;
use crate::symbol_db::SymbolPlacement;
use crate::symbol_db::Visibility;
use anyhow::Context as _;
use foldhash::HashMap;
use lode_utils::elf::SectionFlags;
use lode_utils::elf::SectionType;
use lode_utils::elf::shf;
use lode_utils::elf::sht;
use object::LittleEndian;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;

#[tracing::instrument(skip_all, name = "Load inputs")]
pub(crate) fn load_inputs<A: Arch>(ctx: &mut LinkerContext, input_data: &InputData) -> Result {
    for file in &input_data.files {
        let result = match file.kind {
            FileKind::ElfObject => load_object::<A>(ctx, file.data()),
            FileKind::Archive => load_archive::<A>(ctx, file.data()),
        };
        result.with_context(|| format!("Failed to load `{}`", file.filename.display()))?;
    }
    Ok(())
}

/// Where an input section ended up: which output section and at what offset
/// within it.
#[derive(Clone, Copy)]
struct LoadedSection {
    id: SectionId,
    offset: u64,
}

pub(crate) fn load_object<A: Arch>(ctx: &mut LinkerContext, data: &[u8]) -> Result {
    let file = elf::File::parse(data)?;
    let e = LittleEndian;
    if file.e_machine != A::ELF_HEADER_ARCH_MAGIC {
        bail!(
            "input has e_machine {}, expected {}",
            file.e_machine,
            A::ELF_HEADER_ARCH_MAGIC
        );
    }

    let mut loaded: Vec<Option<LoadedSection>> = vec![None; file.sections.len()];

    for (index, header) in file.sections.enumerate() {
        let section_type = SectionType::from_header(header);
        if !matches!(
            section_type,
            sht::PROGBITS | sht::NOBITS | sht::INIT_ARRAY | sht::FINI_ARRAY
        ) {
            continue;
        }
        let flags = SectionFlags::from_header(header);
        if flags.should_exclude() || !flags.is_alloc() {
            // Notes, comments and debug info have no place in our output.
            continue;
        }
        let name = file.sections.section_name(e, header)?;
        let name = std::str::from_utf8(name).context("section name is invalid UTF-8")?;
        let id = ctx
            .sections
            .ensure(output_section_name(name), section_type, flags)
            .with_context(|| format!("Failed to merge section `{name}`"))?;
        let align = header.sh_addralign(e).max(1);
        let offset = if section_type == sht::NOBITS {
            ctx.sections.reserve(id, header.sh_size(e), align)
        } else {
            let bytes = header.data(e, data)?;
            ctx.sections.append(id, bytes, align)
        };
        loaded[index.0] = Some(LoadedSection { id, offset });
    }

    let symbol_map = load_symbols(ctx, &file, &loaded)?;
    load_relocations::<A>(ctx, &file, data, &loaded, &symbol_map)?;
    Ok(())
}

fn load_symbols(
    ctx: &mut LinkerContext,
    file: &elf::File,
    loaded: &[Option<LoadedSection>],
) -> Result<Vec<Option<SymbolId>>> {
    let e = LittleEndian;
    let mut symbol_map: Vec<Option<SymbolId>> = vec![None; file.symbols.len()];

    for (index, sym) in file.symbols.iter().enumerate() {
        if index == 0 || sym.st_type() == object::elf::STT_FILE {
            continue;
        }
        let name = file.symbols.symbol_name(e, sym)?;
        let name = std::str::from_utf8(name).context("symbol name is invalid UTF-8")?;

        let (placement, value) = match sym.st_shndx(e) {
            object::elf::SHN_UNDEF => (SymbolPlacement::Undefined, 0),
            object::elf::SHN_ABS => (SymbolPlacement::Absolute, sym.st_value(e)),
            // For commons, st_value holds the required alignment.
            object::elf::SHN_COMMON => (SymbolPlacement::Common, sym.st_value(e)),
            shndx => {
                let Some(local) = loaded.get(shndx as usize).copied().flatten() else {
                    // Defined in a section we chose not to load.
                    continue;
                };
                (
                    SymbolPlacement::Section(local.id),
                    sym.st_value(e) + local.offset,
                )
            }
        };

        let id = ctx
            .symbols
            .add(Symbol {
                name: name.to_owned(),
                placement,
                value,
                size: sym.st_size(e),
                binding: Binding::from_st_bind(sym.st_bind())?,
                kind: SymbolKind::from_st_type(sym.st_type()),
                visibility: Visibility::from_st_other(sym.st_other()),
            })
            .with_context(|| format!("Failed to resolve symbol `{name}`"))?;
        symbol_map[index] = Some(id);
    }
    Ok(symbol_map)
}

fn load_relocations<A: Arch>(
    ctx: &mut LinkerContext,
    file: &elf::File,
    data: &[u8],
    loaded: &[Option<LoadedSection>],
    symbol_map: &[Option<SymbolId>],
) -> Result {
    let e = LittleEndian;
    for header in file.sections.iter() {
        if SectionType::from_header(header) != sht::RELA {
            continue;
        }
        let Some(target) = loaded
            .get(header.sh_info(e) as usize)
            .copied()
            .flatten()
        else {
            continue;
        };
        let entries: &[elf::Rela] = header.data_as_array(e, data)?;
        for rela in entries {
            let r_type = rela.r_type(e, false);
            let sym_index = rela.r_sym(e, false) as usize;
            let Some(symbol) = symbol_map.get(sym_index).copied().flatten() else {
                if A::is_exempt_relocation(r_type) {
                    continue;
                }
                bail!(
                    "{} relocation at offset 0x{:x} references unusable symbol {sym_index}",
                    A::rel_type_to_string(r_type),
                    rela.r_offset.get(e),
                );
            };
            ctx.sections[target.id].relocations.push(Relocation {
                offset: rela.r_offset.get(e) + target.offset,
                symbol,
                r_type,
                addend: rela.r_addend.get(e),
            });
        }
    }
    Ok(())
}

fn load_archive<A: Arch>(ctx: &mut LinkerContext, data: &[u8]) -> Result {
    let mut index = None;
    let mut filenames = None;
    let mut members: Vec<ArchiveContent> = Vec::new();
    for entry in ArchiveIterator::from_archive_bytes(data)? {
        match entry? {
            ArchiveEntry::Regular(content) => members.push(content),
            ArchiveEntry::SymbolIndex(symbols) => index = Some(symbols),
            ArchiveEntry::Filenames(table) => filenames = Some(table),
        }
    }

    let member_context = |member: &ArchiveContent| {
        format!(
            "Failed to load archive member `{}`",
            String::from_utf8_lossy(member.identifier(filenames))
        )
    };

    let Some(index) = index else {
        // Without an index we can't tell which members are needed, so take
        // them all.
        for member in &members {
            load_object::<A>(ctx, member.entry_data).with_context(|| member_context(member))?;
        }
        return Ok(());
    };

    let by_offset: HashMap<usize, usize> = members
        .iter()
        .enumerate()
        .map(|(position, member)| (member.header_offset, position))
        .collect();
    let mut is_loaded = vec![false; members.len()];

    // Loading one member can make more symbols undefined, so iterate to a
    // fixpoint.
    loop {
        let mut progress = false;
        for &(name, offset) in &index.entries()? {
            let Some(&position) = by_offset.get(&offset) else {
                bail!("archive symbol index references invalid offset {offset}");
            };
            if is_loaded[position] {
                continue;
            }
            let needed = ctx
                .symbols
                .lookup(name)
                .is_some_and(|id| !ctx.symbols.get(id).is_defined());
            if !needed {
                continue;
            }
            is_loaded[position] = true;
            load_object::<A>(ctx, members[position].entry_data)
                .with_context(|| member_context(&members[position]))?;
            progress = true;
        }
        if !progress {
            break;
        }
    }
    Ok(())
}

/// Gives every COMMON symbol a home at the end of `.bss`.
#[tracing::instrument(skip_all, name = "Allocate common symbols")]
pub(crate) fn resolve_common_symbols(ctx: &mut LinkerContext) -> Result {
    let commons: Vec<SymbolId> = ctx
        .symbols
        .iter()
        .filter(|(_, symbol)| symbol.placement == SymbolPlacement::Common)
        .map(|(id, _)| id)
        .collect();
    if commons.is_empty() {
        return Ok(());
    }
    let bss = ctx
        .sections
        .ensure(".bss", sht::NOBITS, shf::ALLOC.with(shf::WRITE))?;
    for id in commons {
        let symbol = ctx.symbols.get(id);
        let (alignment, size) = (symbol.value.max(1), symbol.size);
        let offset = ctx.sections.reserve(bss, size, alignment);
        let symbol = ctx.symbols.get_mut(id);
        symbol.placement = SymbolPlacement::Section(bss);
        symbol.value = offset;
    }
    Ok(())
}
