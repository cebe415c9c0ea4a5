//! Builds the global offset table and procedure linkage table.
//!
//! Runs after all inputs are loaded and before layout. Each relocation is
//! asked, via the architecture's policy table, whether it needs a GOT slot
//! and possibly a PLT stub. Slots are recorded as synthetic relocations
//! against `.got` so that the ordinary relocation pass fills them in.

use crate::LinkerContext;
use crate::arch::Arch;
use crate::arch::GotPltPolicy;
use crate::error::Result;
use crate::sections::Relocation;
use crate::symbol_db::Binding;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolKind;
use crate::symbol_db::SymbolPlacement;
use crate::symbol_db::Visibility;
use lode_utils::elf::shf;
use lode_utils::elf::sht;

/// Per-symbol GOT/PLT state. A symbol gets at most one slot and one stub,
/// however many relocations reference it.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SymAttr {
    pub(crate) got_offset: Option<u64>,
    pub(crate) plt_offset: Option<u64>,
    pub(crate) plt_symbol: Option<SymbolId>,
}

pub(crate) struct SymAttrTable {
    attrs: Vec<SymAttr>,
}

impl SymAttrTable {
    pub(crate) fn new() -> SymAttrTable {
        SymAttrTable { attrs: Vec::new() }
    }

    pub(crate) fn get(&self, id: SymbolId) -> SymAttr {
        self.attrs.get(id.0 as usize).copied().unwrap_or_default()
    }

    fn get_mut(&mut self, id: SymbolId) -> &mut SymAttr {
        let index = id.0 as usize;
        if index >= self.attrs.len() {
            self.attrs.resize_with(index + 1, SymAttr::default);
        }
        &mut self.attrs[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SymbolId, SymAttr)> {
        self.attrs
            .iter()
            .enumerate()
            .map(|(i, attr)| (SymbolId(i as u32), *attr))
    }
}

#[tracing::instrument(skip_all, name = "Build GOT and PLT")]
pub(crate) fn build_got_entries<A: Arch>(ctx: &mut LinkerContext) -> Result {
    let got = ctx
        .sections
        .ensure(".got", sht::PROGBITS, shf::ALLOC.with(shf::WRITE))?;
    ctx.sections[got].alignment = ctx.sections[got].alignment.max(8);

    // The ABI expects this to resolve to the start of the table.
    ctx.symbols.add(Symbol {
        name: "_GLOBAL_OFFSET_TABLE_".to_owned(),
        placement: SymbolPlacement::Section(got),
        value: 0,
        size: 0,
        binding: Binding::Global,
        kind: SymbolKind::Object,
        visibility: Visibility::Hidden,
    })?;

    // Code sections first, so that call rewrites settle before data
    // references are examined.
    let section_ids: Vec<_> = ctx.sections.ids().collect();
    for pass in 0..2 {
        for &section_id in &section_ids {
            let is_code_section = ctx.sections[section_id].flags.contains(shf::EXECINSTR);
            if (pass == 0) != is_code_section {
                continue;
            }
            for rel_index in 0..ctx.sections[section_id].relocations.len() {
                let rel = ctx.sections[section_id].relocations[rel_index];
                let policy = A::got_plt_policy(rel.r_type)?;
                if policy == GotPltPolicy::None {
                    continue;
                }
                let defined = ctx.symbols.get(rel.symbol).is_defined();
                if policy == GotPltPolicy::IfUndefined && defined {
                    continue;
                }
                if defined && let Some(direct) = A::plt_relocation_to_direct(rel.r_type) {
                    // A call to a symbol in the image needs no stub; turn it
                    // into a plain PC-relative branch.
                    ctx.sections[section_id].relocations[rel_index].r_type = direct;
                    continue;
                }

                let is_code = A::is_code_relocation(rel.r_type)?;
                let got_offset = match ctx.sym_attrs.get(rel.symbol).got_offset {
                    Some(offset) => offset,
                    None => {
                        let offset = ctx.sections.append(got, &[0u8; 8], 8);
                        ctx.sym_attrs.get_mut(rel.symbol).got_offset = Some(offset);
                        ctx.sections[got].relocations.push(Relocation {
                            offset,
                            symbol: rel.symbol,
                            r_type: A::got_slot_relocation(rel.r_type, is_code),
                            addend: 0,
                        });
                        offset
                    }
                };

                if !is_code || policy == GotPltPolicy::GotOnly {
                    continue;
                }

                if ctx.sym_attrs.get(rel.symbol).plt_offset.is_none() {
                    let plt_offset = append_plt_stub::<A>(ctx, rel.symbol, got_offset)?;
                    ctx.sym_attrs.get_mut(rel.symbol).plt_offset = Some(plt_offset);
                }
                if let Some(plt_symbol) = ctx.sym_attrs.get(rel.symbol).plt_symbol {
                    // Point the call site at the stub.
                    ctx.sections[section_id].relocations[rel_index].symbol = plt_symbol;
                }
            }
        }
    }
    Ok(())
}

fn append_plt_stub<A: Arch>(
    ctx: &mut LinkerContext,
    symbol: SymbolId,
    got_offset: u64,
) -> Result<u64> {
    let plt = ctx
        .sections
        .ensure(".plt", sht::PROGBITS, shf::ALLOC.with(shf::EXECINSTR))?;
    {
        let section = &mut ctx.sections[plt];
        section.alignment = section.alignment.max(16);
        if section.data.is_empty() {
            A::write_plt_header(&mut section.data);
        }
    }
    let plt_offset = ctx.sections[plt].data.len() as u64;
    A::write_plt_entry(&mut ctx.sections[plt].data, got_offset);
    ctx.sections[plt].len = ctx.sections[plt].data.len() as u64;

    let name = format!("{}@plt", ctx.symbols.get(symbol).name);
    let plt_symbol = ctx.symbols.add(Symbol {
        name,
        placement: SymbolPlacement::Section(plt),
        value: plt_offset,
        size: A::PLT_ENTRY_SIZE,
        binding: Binding::Local,
        kind: SymbolKind::Func,
        visibility: Visibility::Default,
    })?;
    ctx.sym_attrs.get_mut(symbol).plt_symbol = Some(plt_symbol);
    Ok(plt_offset)
}

/// Re-encodes every PLT stub with final addresses. Must run after layout.
pub(crate) fn fixup_plt_entries<A: Arch>(ctx: &mut LinkerContext) -> Result {
    let (Some(plt), Some(got)) = (ctx.sections.lookup(".plt"), ctx.sections.lookup(".got"))
    else {
        return Ok(());
    };
    let plt_address = ctx.sections[plt].address;
    let got_address = ctx.sections[got].address;
    let fixups: Vec<(u64, u64)> = ctx
        .sym_attrs
        .iter()
        .filter_map(|(_, attr)| Some((attr.got_offset?, attr.plt_offset?)))
        .collect();
    for (got_offset, plt_offset) in fixups {
        let start = plt_offset as usize;
        let entry = &mut ctx.sections[plt].data[start..start + A::PLT_ENTRY_SIZE as usize];
        A::fixup_plt_entry(entry, got_address + got_offset, plt_address + plt_offset);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::SectionId;
    use crate::x86_64::X86_64;

    fn undefined_symbol(ctx: &mut LinkerContext, name: &str) -> SymbolId {
        ctx.symbols
            .add(Symbol {
                name: name.to_owned(),
                placement: SymbolPlacement::Undefined,
                value: 0,
                size: 0,
                binding: Binding::Global,
                kind: SymbolKind::NoType,
                visibility: Visibility::Default,
            })
            .unwrap()
    }

    fn text_with_relocs(ctx: &mut LinkerContext, relocs: Vec<Relocation>) -> SectionId {
        let text = ctx
            .sections
            .ensure(".text", sht::PROGBITS, shf::ALLOC.with(shf::EXECINSTR))
            .unwrap();
        ctx.sections.append(text, &[0u8; 32], 16);
        ctx.sections[text].relocations = relocs;
        text
    }

    #[test]
    fn undefined_calls_get_one_stub_each_and_builds_are_idempotent() {
        let mut ctx = LinkerContext::new();
        let puts = undefined_symbol(&mut ctx, "puts");
        let stdout = undefined_symbol(&mut ctx, "stdout");
        let text = text_with_relocs(
            &mut ctx,
            vec![
                Relocation {
                    offset: 1,
                    symbol: puts,
                    r_type: object::elf::R_X86_64_PLT32,
                    addend: -4,
                },
                Relocation {
                    offset: 9,
                    symbol: puts,
                    r_type: object::elf::R_X86_64_PLT32,
                    addend: -4,
                },
                Relocation {
                    offset: 17,
                    symbol: stdout,
                    r_type: object::elf::R_X86_64_GOTPCREL,
                    addend: -4,
                },
            ],
        );

        build_got_entries::<X86_64>(&mut ctx).unwrap();

        let got = ctx.sections.lookup(".got").unwrap();
        let plt = ctx.sections.lookup(".plt").unwrap();
        // One slot per symbol, one stub for the function.
        assert_eq!(ctx.sections[got].len, 16);
        assert_eq!(
            ctx.sections[plt].len,
            X86_64::PLT_HEADER_SIZE + X86_64::PLT_ENTRY_SIZE
        );
        assert_eq!(ctx.sections[got].relocations.len(), 2);
        assert_eq!(
            ctx.sections[got].relocations[0].r_type,
            object::elf::R_X86_64_JUMP_SLOT
        );
        assert_eq!(
            ctx.sections[got].relocations[1].r_type,
            object::elf::R_X86_64_GLOB_DAT
        );

        // Both call sites now target the stub symbol.
        let plt_symbol = ctx.sym_attrs.get(puts).plt_symbol.unwrap();
        assert_eq!(ctx.symbols.get(plt_symbol).name, "puts@plt");
        assert_eq!(ctx.sections[text].relocations[0].symbol, plt_symbol);
        assert_eq!(ctx.sections[text].relocations[1].symbol, plt_symbol);
        // The data reference is left pointing at the real symbol.
        assert_eq!(ctx.sections[text].relocations[2].symbol, stdout);

        // Running the builder again must not grow anything.
        build_got_entries::<X86_64>(&mut ctx).unwrap();
        assert_eq!(ctx.sections[got].len, 16);
        assert_eq!(
            ctx.sections[plt].len,
            X86_64::PLT_HEADER_SIZE + X86_64::PLT_ENTRY_SIZE
        );
        assert_eq!(ctx.sections[got].relocations.len(), 2);
    }

    #[test]
    fn calls_to_defined_symbols_become_direct() {
        let mut ctx = LinkerContext::new();
        let text = text_with_relocs(&mut ctx, Vec::new());
        let callee = ctx
            .symbols
            .add(Symbol {
                name: "callee".to_owned(),
                placement: SymbolPlacement::Section(text),
                value: 16,
                size: 4,
                binding: Binding::Global,
                kind: SymbolKind::Func,
                visibility: Visibility::Default,
            })
            .unwrap();
        ctx.sections[text].relocations.push(Relocation {
            offset: 1,
            symbol: callee,
            r_type: object::elf::R_X86_64_PLT32,
            addend: -4,
        });

        build_got_entries::<X86_64>(&mut ctx).unwrap();

        assert_eq!(
            ctx.sections[text].relocations[0].r_type,
            object::elf::R_X86_64_PC32
        );
        assert_eq!(ctx.sym_attrs.get(callee).got_offset, None);
        assert_eq!(ctx.sections[ctx.sections.lookup(".got").unwrap()].len, 0);
        assert!(ctx.sections.lookup(".plt").is_none());
    }

    #[test]
    fn got_table_symbol_is_defined_at_the_start() {
        let mut ctx = LinkerContext::new();
        text_with_relocs(&mut ctx, Vec::new());
        build_got_entries::<X86_64>(&mut ctx).unwrap();
        let id = ctx.symbols.lookup("_GLOBAL_OFFSET_TABLE_").unwrap();
        let symbol = ctx.symbols.get(id);
        let got = ctx.sections.lookup(".got").unwrap();
        assert_eq!(symbol.placement, SymbolPlacement::Section(got));
        assert_eq!(symbol.value, 0);
    }
}
