//! Turns section-relative symbol values into absolute addresses and applies
//! every recorded relocation to the section bytes.

use crate::LinkerContext;
use crate::arch::Arch;
use crate::arch::RelocationModifier;
use crate::arch::RelocationParams;
use crate::arch::Relocator as _;
use crate::bail;
use crate::error::Result;
use crate::symbol_db::Binding;
use crate::symbol_db::SymbolPlacement;
use anyhow::Context as _;

/// Rebase section-relative symbol values onto the addresses layout assigned.
/// Undefined weak symbols resolve to zero; any other undefined symbol is an
/// error at this point.
#[tracing::instrument(skip_all, name = "Finalise symbol addresses")]
pub(crate) fn finalise_symbol_addresses(ctx: &mut LinkerContext) -> Result {
    for id in ctx.symbols.ids() {
        match ctx.symbols.get(id).placement {
            SymbolPlacement::Section(section) => {
                let base = ctx.sections[section].address;
                let symbol = ctx.symbols.get_mut(id);
                symbol.value = symbol.value.wrapping_add(base);
            }
            SymbolPlacement::Undefined => {
                let symbol = ctx.symbols.get(id);
                if symbol.binding == Binding::Weak {
                    ctx.symbols.get_mut(id).value = 0;
                } else {
                    bail!("undefined symbol `{}`", symbol.name);
                }
            }
            SymbolPlacement::Absolute => {}
            SymbolPlacement::Common => {
                bail!(
                    "common symbol `{}` was never allocated",
                    ctx.symbols.get(id).name
                );
            }
        }
    }
    Ok(())
}

#[tracing::instrument(skip_all, name = "Apply relocations")]
pub(crate) fn relocate_sections<A: Arch>(ctx: &mut LinkerContext) -> Result {
    let got_address = ctx
        .sections
        .lookup(".got")
        .map_or(0, |id| ctx.sections[id].address);
    let text_address = ctx
        .sections
        .lookup(".text")
        .map_or(0, |id| ctx.sections[id].address);

    for section_id in ctx.sections.ids().collect::<Vec<_>>() {
        if ctx.sections[section_id].relocations.is_empty() {
            continue;
        }
        // Paired relocation schemes need a fresh state per section.
        let mut relocator = A::new_relocator();
        let relocations = std::mem::take(&mut ctx.sections[section_id].relocations);
        let section_address = ctx.sections[section_id].address;

        let mut skip_next = false;
        for rel in &relocations {
            // TLS relaxation consumes the call relocation that follows it.
            if std::mem::take(&mut skip_next) {
                continue;
            }
            let symbol = ctx.symbols.get(rel.symbol);
            let value = symbol.value.wrapping_add(rel.addend as u64);
            let place = section_address + rel.offset;
            let symbol_section_extent = match symbol.placement {
                SymbolPlacement::Section(defining) => {
                    let defining = &ctx.sections[defining];
                    Some((defining.address, defining.len))
                }
                _ => None,
            };
            let params = RelocationParams {
                r_type: rel.r_type,
                place,
                value,
                addend: rel.addend,
                got_address,
                got_entry_address: ctx
                    .sym_attrs
                    .get(rel.symbol)
                    .got_offset
                    .map(|offset| got_address + offset),
                symbol_section_extent,
                text_address,
            };
            let site = rel.offset as usize;
            let section = &mut ctx.sections[section_id];
            let modifier = relocator
                .apply(&mut section.data, site, &params)
                .with_context(|| {
                    format!(
                        "failed to apply {} at {}+0x{:x}",
                        A::rel_type_to_string(rel.r_type),
                        section.name,
                        rel.offset,
                    )
                })?;
            skip_next = modifier == RelocationModifier::SkipNextRelocation;
        }

        ctx.sections[section_id].relocations = relocations;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::Relocation;
    use crate::symbol_db::Symbol;
    use crate::symbol_db::SymbolKind;
    use crate::symbol_db::Visibility;
    use crate::x86_64::X86_64;
    use lode_utils::elf::shf;
    use lode_utils::elf::sht;
    use lode_utils::utils::read_u32;

    fn context_with_text(data: &[u8]) -> (LinkerContext, crate::sections::SectionId) {
        let mut ctx = LinkerContext::new();
        let text = ctx
            .sections
            .ensure(".text", sht::PROGBITS, shf::ALLOC.with(shf::EXECINSTR))
            .unwrap();
        ctx.sections.append(text, data, 16);
        (ctx, text)
    }

    #[test]
    fn section_symbols_get_absolute_addresses() {
        let (mut ctx, text) = context_with_text(&[0u8; 8]);
        ctx.sections[text].address = 0x40_1000;
        let id = ctx
            .symbols
            .add(Symbol {
                name: "main".to_owned(),
                placement: SymbolPlacement::Section(text),
                value: 4,
                size: 0,
                binding: Binding::Global,
                kind: SymbolKind::Func,
                visibility: Visibility::Default,
            })
            .unwrap();

        finalise_symbol_addresses(&mut ctx).unwrap();
        assert_eq!(ctx.symbols.get(id).value, 0x40_1004);
    }

    #[test]
    fn undefined_weak_resolves_to_zero_but_global_errors() {
        let mut ctx = LinkerContext::new();
        let weak = ctx
            .symbols
            .add(Symbol {
                name: "maybe".to_owned(),
                placement: SymbolPlacement::Undefined,
                value: 0,
                size: 0,
                binding: Binding::Weak,
                kind: SymbolKind::NoType,
                visibility: Visibility::Default,
            })
            .unwrap();
        finalise_symbol_addresses(&mut ctx).unwrap();
        assert_eq!(ctx.symbols.get(weak).value, 0);

        ctx.symbols
            .add(Symbol {
                name: "missing".to_owned(),
                placement: SymbolPlacement::Undefined,
                value: 0,
                size: 0,
                binding: Binding::Global,
                kind: SymbolKind::NoType,
                visibility: Visibility::Default,
            })
            .unwrap();
        let err = finalise_symbol_addresses(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn call_displacement_reaches_the_target() {
        // call rel32 at offset 3, so the displacement field sits at 4.
        let mut code = vec![0x90, 0x90, 0x90, 0xe8, 0, 0, 0, 0, 0x90, 0x90];
        code.resize(16, 0x90);
        let (mut ctx, text) = context_with_text(&code);
        ctx.sections[text].address = 0x40_1000;
        let callee = ctx
            .symbols
            .add(Symbol {
                name: "callee".to_owned(),
                placement: SymbolPlacement::Section(text),
                value: 0x40_100c,
                size: 4,
                binding: Binding::Global,
                kind: SymbolKind::Func,
                visibility: Visibility::Default,
            })
            .unwrap();
        ctx.sections[text].relocations.push(Relocation {
            offset: 4,
            symbol: callee,
            r_type: object::elf::R_X86_64_PC32,
            addend: -4,
        });

        relocate_sections::<X86_64>(&mut ctx).unwrap();

        // Next instruction is at 0x401008; target is 0x40100c.
        assert_eq!(read_u32(&ctx.sections[text].data[4..]) as i32, 4);
    }

    #[test]
    fn tls_relaxation_consumes_the_call_relocation() {
        // nops, then leaq x@tlsgd(%rip),%rdi + call __tls_get_addr@plt with
        // zeroed displacements, then nops. Relaxation rewrites the pair and
        // must swallow the call's own relocation.
        let mut code = vec![0x90; 4];
        code.extend_from_slice(&[
            0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0,
        ]);
        code.extend_from_slice(&[0x90; 4]);
        let (mut ctx, text) = context_with_text(&code);
        ctx.sections[text].address = 0x40_1000;

        let tdata = ctx
            .sections
            .ensure(
                ".tdata",
                sht::PROGBITS,
                shf::ALLOC.with(shf::WRITE).with(shf::TLS),
            )
            .unwrap();
        ctx.sections.append(tdata, &[0u8; 16], 8);
        ctx.sections[tdata].address = 0x40_4000;

        let var = ctx
            .symbols
            .add(Symbol {
                name: "counter".to_owned(),
                placement: SymbolPlacement::Section(tdata),
                value: 0x40_4008,
                size: 8,
                binding: Binding::Global,
                kind: SymbolKind::Tls,
                visibility: Visibility::Default,
            })
            .unwrap();
        let helper = ctx
            .symbols
            .add(Symbol {
                name: "__tls_get_addr".to_owned(),
                placement: SymbolPlacement::Undefined,
                value: 0,
                size: 0,
                binding: Binding::Global,
                kind: SymbolKind::Func,
                visibility: Visibility::Default,
            })
            .unwrap();

        ctx.sections[text].relocations.push(Relocation {
            offset: 8,
            symbol: var,
            r_type: object::elf::R_X86_64_TLSGD,
            addend: -4,
        });
        ctx.sections[text].relocations.push(Relocation {
            offset: 16,
            symbol: helper,
            r_type: object::elf::R_X86_64_PLT32,
            addend: -4,
        });

        relocate_sections::<X86_64>(&mut ctx).unwrap();

        let data = &ctx.sections[text].data;
        // mov %fs:0,%rax; lea -8(%rax),%rax. Had the dead call relocation
        // been applied, the lea displacement would have been clobbered.
        assert_eq!(&data[4..9], &[0x64, 0x48, 0x8b, 0x04, 0x25]);
        assert_eq!(read_u32(&data[16..]) as i32, -8);
    }

    #[test]
    fn failures_name_the_section_and_offset() {
        let (mut ctx, text) = context_with_text(&[0u8; 16]);
        ctx.sections[text].address = 0x40_1000;
        let far = ctx
            .symbols
            .add(Symbol {
                name: "far".to_owned(),
                placement: SymbolPlacement::Absolute,
                value: 0x1_0000_0000,
                size: 0,
                binding: Binding::Global,
                kind: SymbolKind::NoType,
                visibility: Visibility::Default,
            })
            .unwrap();
        ctx.sections[text].relocations.push(Relocation {
            offset: 8,
            symbol: far,
            r_type: object::elf::R_X86_64_PC32,
            addend: 0,
        });

        let err = relocate_sections::<X86_64>(&mut ctx).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains(".text"), "{message}");
        assert!(message.contains("0x8"), "{message}");
    }
}
