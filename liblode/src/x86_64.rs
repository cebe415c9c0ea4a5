//! x86-64 relocation application and PLT generation.

use crate::arch::Arch;
use crate::arch::GotPltPolicy;
use crate::arch::RelocationModifier;
use crate::arch::RelocationParams;
use crate::arch::Relocator;
use crate::bail;
use crate::error::Result;
use anyhow::Context as _;
use lode_utils::bit_misc::BitExtraction as _;
use lode_utils::elf::x86_64_rel_type_to_string;
use lode_utils::utils::add_u32;
use lode_utils::utils::add_u64;
use lode_utils::utils::write_u32;
use lode_utils::utils::write_u64;

pub(crate) struct X86_64;

impl Arch for X86_64 {
    type Relocator = X86_64Relocator;

    const ELF_HEADER_ARCH_MAGIC: u16 = object::elf::EM_X86_64;
    const LOAD_ADDRESS: u64 = 0x40_0000;
    const PAGE_SIZE: u64 = 0x20_0000;
    const PLT_HEADER_SIZE: u64 = 16;
    const PLT_ENTRY_SIZE: u64 = 16;
    const GLOB_DAT: u32 = object::elf::R_X86_64_GLOB_DAT;
    const JUMP_SLOT: u32 = object::elf::R_X86_64_JUMP_SLOT;

    fn got_plt_policy(r_type: u32) -> Result<GotPltPolicy> {
        let policy = match r_type {
            object::elf::R_X86_64_NONE
            | object::elf::R_X86_64_GLOB_DAT
            | object::elf::R_X86_64_JUMP_SLOT
            | object::elf::R_X86_64_COPY
            | object::elf::R_X86_64_RELATIVE
            | object::elf::R_X86_64_TPOFF32
            | object::elf::R_X86_64_TPOFF64 => GotPltPolicy::None,

            object::elf::R_X86_64_32
            | object::elf::R_X86_64_32S
            | object::elf::R_X86_64_64
            | object::elf::R_X86_64_PC32
            | object::elf::R_X86_64_PC64 => GotPltPolicy::IfUndefined,

            object::elf::R_X86_64_GOTTPOFF => GotPltPolicy::GotOnly,

            object::elf::R_X86_64_GOT32
            | object::elf::R_X86_64_GOT64
            | object::elf::R_X86_64_GOTPC32
            | object::elf::R_X86_64_GOTPC64
            | object::elf::R_X86_64_GOTOFF64
            | object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX
            | object::elf::R_X86_64_TLSGD
            | object::elf::R_X86_64_TLSLD
            | object::elf::R_X86_64_DTPOFF32
            | object::elf::R_X86_64_DTPOFF64
            | object::elf::R_X86_64_PLT32
            | object::elf::R_X86_64_PLTOFF64 => GotPltPolicy::Always,

            _ => bail!(
                "Unsupported relocation type {}",
                Self::rel_type_to_string(r_type)
            ),
        };
        Ok(policy)
    }

    fn is_code_relocation(r_type: u32) -> Result<bool> {
        Ok(matches!(
            r_type,
            object::elf::R_X86_64_PC32
                | object::elf::R_X86_64_PC64
                | object::elf::R_X86_64_PLT32
                | object::elf::R_X86_64_PLTOFF64
                | object::elf::R_X86_64_JUMP_SLOT
        ))
    }

    fn is_exempt_relocation(r_type: u32) -> bool {
        r_type == object::elf::R_X86_64_NONE
    }

    fn got_slot_relocation(r_type: u32, is_code: bool) -> u32 {
        if r_type == object::elf::R_X86_64_GOTTPOFF {
            return object::elf::R_X86_64_TPOFF64;
        }
        if is_code { Self::JUMP_SLOT } else { Self::GLOB_DAT }
    }

    fn plt_relocation_to_direct(r_type: u32) -> Option<u32> {
        (r_type == object::elf::R_X86_64_PLT32).then_some(object::elf::R_X86_64_PC32)
    }

    fn write_plt_header(plt: &mut Vec<u8>) {
        // pushq GOT+8(%rip); jmp *GOT+16(%rip). Nothing jumps back through
        // the header in a static link, so the displacements stay as
        // placeholders; only the entries are fixed up.
        plt.extend_from_slice(&[0xff, 0x35]);
        plt.extend_from_slice(&8u32.to_le_bytes());
        plt.extend_from_slice(&[0xff, 0x25]);
        plt.extend_from_slice(&16u32.to_le_bytes());
        plt.resize(Self::PLT_HEADER_SIZE as usize, 0x90);
    }

    fn write_plt_entry(plt: &mut Vec<u8>, got_offset: u64) {
        let index = (plt.len() as u64 - Self::PLT_HEADER_SIZE) / Self::PLT_ENTRY_SIZE;

        // jmp *got_offset; pushq $index; jmp PLT0
        plt.extend_from_slice(&[0xff, 0x25]);
        plt.extend_from_slice(&(got_offset as u32).to_le_bytes());
        plt.push(0x68);
        plt.extend_from_slice(&(index as u32).to_le_bytes());
        plt.push(0xe9);
        let disp = -((plt.len() as i64) + 4);
        plt.extend_from_slice(&(disp as i32).to_le_bytes());
    }

    fn fixup_plt_entry(entry: &mut [u8], got_entry_address: u64, plt_entry_address: u64) {
        // The first instruction becomes jmp *disp32(%rip).
        let disp = got_entry_address.wrapping_sub(plt_entry_address + 6);
        write_u32(&mut entry[2..], disp as u32);
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        x86_64_rel_type_to_string(r_type)
    }

    fn new_relocator() -> X86_64Relocator {
        X86_64Relocator
    }
}

pub(crate) struct X86_64Relocator;

/// `__tls_get_addr(&x)` under the general-dynamic model, displacements still
/// zeroed: .byte 0x66; leaq x@tlsgd(%rip), %rdi; .word 0x6666; rex64;
/// call __tls_get_addr@plt. The TLSGD relocation sits on the lea displacement,
/// four bytes into the sequence.
const TLSGD_SEQUENCE: [u8; 16] = [
    0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0,
];

/// Same size local-exec replacement: mov %fs:0, %rax; lea x@tpoff(%rax), %rax.
const TLSGD_REPLACEMENT: [u8; 16] = [
    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x8d, 0x80, 0, 0, 0, 0,
];

/// leaq x@tlsld(%rip), %rdi; call __tls_get_addr@plt, relocation on the lea
/// displacement three bytes in.
const TLSLD_SEQUENCE: [u8; 12] = [0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];

/// data16 data16 data16 mov %fs:0, %rax. Later DTPOFF relocations add the
/// per-variable offsets.
const TLSLD_REPLACEMENT: [u8; 12] = [
    0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0,
];

impl X86_64Relocator {
    fn thread_offset(params: &RelocationParams) -> Result<u64> {
        // Local-exec TLS offsets are negative offsets from the end of the
        // TLS block, which for us is the end of the defining section.
        let (base, len) = params
            .symbol_section_extent
            .context("TLS relocation against a symbol with no section")?;
        Ok(params.value.wrapping_sub(base + len))
    }

    /// A static executable has exactly one TLS block, so the
    /// `__tls_get_addr` call sequence is rewritten to read `%fs:0` directly.
    /// The call relocation that follows is consumed along with the call.
    fn relax_general_dynamic(
        data: &mut [u8],
        offset: usize,
        params: &RelocationParams,
    ) -> Result<RelocationModifier> {
        match offset
            .checked_sub(4)
            .and_then(|start| data.get_mut(start..start + 16))
        {
            Some(window) if *window == TLSGD_SEQUENCE => {
                window.copy_from_slice(&TLSGD_REPLACEMENT);
                // The lea takes the symbol's thread offset, without the
                // rip-relative addend the original instruction carried.
                let offset = Self::thread_offset(params)?.wrapping_sub(params.addend as u64);
                add_u32(&mut window[12..], offset);
                Ok(RelocationModifier::SkipNextRelocation)
            }
            _ => bail!(
                "unexpected R_X86_64_TLSGD instruction sequence at 0x{:x}",
                params.place
            ),
        }
    }

    fn relax_local_dynamic(
        data: &mut [u8],
        offset: usize,
        params: &RelocationParams,
    ) -> Result<RelocationModifier> {
        match offset
            .checked_sub(3)
            .and_then(|start| data.get_mut(start..start + 12))
        {
            Some(window) if *window == TLSLD_SEQUENCE => {
                window.copy_from_slice(&TLSLD_REPLACEMENT);
                Ok(RelocationModifier::SkipNextRelocation)
            }
            _ => bail!(
                "unexpected R_X86_64_TLSLD instruction sequence at 0x{:x}",
                params.place
            ),
        }
    }
}

impl Relocator for X86_64Relocator {
    fn apply(
        &mut self,
        data: &mut [u8],
        offset: usize,
        params: &RelocationParams,
    ) -> Result<RelocationModifier> {
        match params.r_type {
            object::elf::R_X86_64_TLSGD => {
                return Self::relax_general_dynamic(data, offset, params);
            }
            object::elf::R_X86_64_TLSLD => {
                return Self::relax_local_dynamic(data, offset, params);
            }
            _ => {}
        }

        let bytes = &mut data[offset..];
        let value = params.value;
        let place = params.place;
        match params.r_type {
            object::elf::R_X86_64_NONE
            | object::elf::R_X86_64_COPY
            | object::elf::R_X86_64_RELATIVE => {}

            object::elf::R_X86_64_64 => add_u64(bytes, value),
            object::elf::R_X86_64_32 | object::elf::R_X86_64_32S => add_u32(bytes, value),

            object::elf::R_X86_64_PC32 | object::elf::R_X86_64_PLT32 => {
                let diff = value.wrapping_sub(place);
                if !diff.fits_signed(32) {
                    bail!(
                        "relocation at 0x{place:x} overflows: target is 0x{value:x}, \
                         out of 32 bit signed range"
                    );
                }
                add_u32(bytes, diff);
            }
            object::elf::R_X86_64_PC64 => add_u64(bytes, value.wrapping_sub(place)),

            object::elf::R_X86_64_PLTOFF64 => {
                add_u64(
                    bytes,
                    value
                        .wrapping_sub(params.got_address)
                        .wrapping_add(params.addend as u64),
                );
            }

            object::elf::R_X86_64_GLOB_DAT | object::elf::R_X86_64_JUMP_SLOT => {
                write_u64(bytes, value.wrapping_sub(params.addend as u64));
            }

            object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX => {
                let got_entry = params
                    .got_entry_address
                    .context("GOT relocation against a symbol with no GOT slot")?;
                add_u32(bytes, got_entry.wrapping_sub(place).wrapping_sub(4));
            }
            object::elf::R_X86_64_GOTPC32 => {
                add_u32(
                    bytes,
                    params
                        .got_address
                        .wrapping_sub(place)
                        .wrapping_add(params.addend as u64),
                );
            }
            object::elf::R_X86_64_GOTPC64 => {
                add_u64(
                    bytes,
                    params
                        .got_address
                        .wrapping_sub(place)
                        .wrapping_add(params.addend as u64),
                );
            }
            object::elf::R_X86_64_GOT32 => {
                let got_entry = params
                    .got_entry_address
                    .context("GOT relocation against a symbol with no GOT slot")?;
                add_u32(bytes, got_entry.wrapping_sub(params.got_address));
            }
            object::elf::R_X86_64_GOT64 => {
                let got_entry = params
                    .got_entry_address
                    .context("GOT relocation against a symbol with no GOT slot")?;
                add_u64(bytes, got_entry.wrapping_sub(params.got_address));
            }
            object::elf::R_X86_64_GOTOFF64 => {
                add_u64(bytes, value.wrapping_sub(params.got_address));
            }
            object::elf::R_X86_64_GOTTPOFF => {
                add_u32(bytes, value.wrapping_sub(params.got_address));
            }

            object::elf::R_X86_64_TPOFF32 | object::elf::R_X86_64_DTPOFF32 => {
                let offset = Self::thread_offset(params)?;
                add_u32(bytes, offset);
            }
            object::elf::R_X86_64_TPOFF64 | object::elf::R_X86_64_DTPOFF64 => {
                let offset = Self::thread_offset(params)?;
                add_u64(bytes, offset);
            }

            _ => bail!(
                "Unsupported relocation type {} at 0x{place:x}",
                X86_64::rel_type_to_string(params.r_type)
            ),
        }
        Ok(RelocationModifier::Normal)
    }
}
