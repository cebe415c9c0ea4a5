//! AArch64 relocation application and PLT generation.
//!
//! Page-relative addressing splits an address across an `adrp` and a low-12
//! instruction pair; both halves are recomputed from the final value, so no
//! state needs to be carried between them.

use crate::arch::Arch;
use crate::arch::GotPltPolicy;
use crate::arch::RelocationModifier;
use crate::arch::RelocationParams;
use crate::arch::Relocator;
use crate::bail;
use crate::error::Result;
use anyhow::Context as _;
use lode_utils::bit_misc::BitExtraction as _;
use lode_utils::elf::aarch64_rel_type_to_string;
use lode_utils::utils::add_u32;
use lode_utils::utils::add_u64;
use lode_utils::utils::read_u32;
use lode_utils::utils::write_u32;
use lode_utils::utils::write_u64;

pub(crate) struct AArch64;

const PLT_HEADER: &[u32] = &[
    0xa9bf_7bf0, // stp x16, x30, [sp, #-16]!
    0x9000_0010, // adrp x16, GOT page
    0xf940_0211, // ldr x17, [x16]
    0x9100_0210, // add x16, x16, #0
    0xd61f_0220, // br x17
    0xd503_201f, // nop
    0xd503_201f, // nop
    0xd503_201f, // nop
];

impl Arch for AArch64 {
    type Relocator = AArch64Relocator;

    const ELF_HEADER_ARCH_MAGIC: u16 = object::elf::EM_AARCH64;
    const LOAD_ADDRESS: u64 = 0x40_0000;
    const PAGE_SIZE: u64 = 0x20_0000;
    const PLT_HEADER_SIZE: u64 = 32;
    const PLT_ENTRY_SIZE: u64 = 16;
    const GLOB_DAT: u32 = object::elf::R_AARCH64_GLOB_DAT;
    const JUMP_SLOT: u32 = object::elf::R_AARCH64_JUMP_SLOT;

    fn got_plt_policy(r_type: u32) -> Result<GotPltPolicy> {
        let policy = match r_type {
            object::elf::R_AARCH64_NONE
            | object::elf::R_AARCH64_PREL32
            | object::elf::R_AARCH64_MOVW_UABS_G0_NC
            | object::elf::R_AARCH64_MOVW_UABS_G1_NC
            | object::elf::R_AARCH64_MOVW_UABS_G2_NC
            | object::elf::R_AARCH64_MOVW_UABS_G3
            | object::elf::R_AARCH64_ADR_PREL_PG_HI21
            | object::elf::R_AARCH64_ADD_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST8_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST16_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST32_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST64_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST128_ABS_LO12_NC
            | object::elf::R_AARCH64_GLOB_DAT
            | object::elf::R_AARCH64_JUMP_SLOT
            | object::elf::R_AARCH64_RELATIVE
            | object::elf::R_AARCH64_COPY => GotPltPolicy::None,

            object::elf::R_AARCH64_ABS32
            | object::elf::R_AARCH64_ABS64
            | object::elf::R_AARCH64_JUMP26
            | object::elf::R_AARCH64_CALL26 => GotPltPolicy::IfUndefined,

            object::elf::R_AARCH64_ADR_GOT_PAGE | object::elf::R_AARCH64_LD64_GOT_LO12_NC => {
                GotPltPolicy::Always
            }

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
            object::elf::R_AARCH64_JUMP26
                | object::elf::R_AARCH64_CALL26
                | object::elf::R_AARCH64_JUMP_SLOT
        ))
    }

    fn is_exempt_relocation(r_type: u32) -> bool {
        r_type == object::elf::R_AARCH64_NONE
    }

    fn write_plt_header(plt: &mut Vec<u8>) {
        for insn in PLT_HEADER {
            plt.extend_from_slice(&insn.to_le_bytes());
        }
    }

    fn write_plt_entry(plt: &mut Vec<u8>, _got_offset: u64) {
        // adrp x16, page; ldr x17, [x16]; add x16, x16, #0; br x17.
        // The address fields are filled in by fixup once layout is done.
        for insn in [0x9000_0010u32, 0xf940_0211, 0x9100_0210, 0xd61f_0220] {
            plt.extend_from_slice(&insn.to_le_bytes());
        }
    }

    fn fixup_plt_entry(entry: &mut [u8], got_entry_address: u64, plt_entry_address: u64) {
        let page_off = (got_entry_address >> 12).wrapping_sub(plt_entry_address >> 12);
        let adrp = 0x9000_0010u64 | ((page_off & 3) << 29) | ((page_off & 0x1f_fffc) << 3);
        let ldr = 0xf940_0211u64 | ((got_entry_address & 0xff8) << 7);
        let add = 0x9100_0210u64 | ((got_entry_address & 0xfff) << 10);
        write_u32(entry, adrp as u32);
        write_u32(&mut entry[4..], ldr as u32);
        write_u32(&mut entry[8..], add as u32);
        write_u32(&mut entry[12..], 0xd61f_0220);
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        aarch64_rel_type_to_string(r_type)
    }

    fn new_relocator() -> AArch64Relocator {
        AArch64Relocator
    }
}

pub(crate) struct AArch64Relocator;

fn check_page_offset(off: u64, place: u64) -> Result {
    if !off.fits_signed(21) {
        bail!("adrp at 0x{place:x} overflows: page offset out of 21 bit range");
    }
    Ok(())
}

fn splice_adrp(insn: u32, off: u64) -> u32 {
    (u64::from(insn) & 0x9f00_001f | ((off & 0x1f_fffc) << 3) | ((off & 3) << 29)) as u32
}

impl Relocator for AArch64Relocator {
    fn apply(
        &mut self,
        data: &mut [u8],
        offset: usize,
        params: &RelocationParams,
    ) -> Result<RelocationModifier> {
        let bytes = &mut data[offset..];
        let value = params.value;
        let place = params.place;
        let got_entry = || {
            params
                .got_entry_address
                .context("GOT relocation against a symbol with no GOT slot")
        };
        match params.r_type {
            object::elf::R_AARCH64_NONE
            | object::elf::R_AARCH64_COPY
            | object::elf::R_AARCH64_RELATIVE => {}

            object::elf::R_AARCH64_ABS64 => add_u64(bytes, value),
            object::elf::R_AARCH64_ABS32 => add_u32(bytes, value),
            object::elf::R_AARCH64_PREL32 => add_u32(bytes, value.wrapping_sub(place)),

            object::elf::R_AARCH64_MOVW_UABS_G0_NC => splice_movw(bytes, value),
            object::elf::R_AARCH64_MOVW_UABS_G1_NC => splice_movw(bytes, value >> 16),
            object::elf::R_AARCH64_MOVW_UABS_G2_NC => splice_movw(bytes, value >> 32),
            object::elf::R_AARCH64_MOVW_UABS_G3 => splice_movw(bytes, value >> 48),

            object::elf::R_AARCH64_ADR_PREL_PG_HI21 => {
                let off = (value >> 12).wrapping_sub(place >> 12);
                check_page_offset(off, place)?;
                let insn = splice_adrp(read_u32(bytes), off);
                write_u32(bytes, insn);
            }
            object::elf::R_AARCH64_ADD_ABS_LO12_NC
            | object::elf::R_AARCH64_LDST8_ABS_LO12_NC => {
                splice_low12(bytes, (value & 0xfff) << 10);
            }
            object::elf::R_AARCH64_LDST16_ABS_LO12_NC => splice_low12(bytes, (value & 0xffe) << 9),
            object::elf::R_AARCH64_LDST32_ABS_LO12_NC => splice_low12(bytes, (value & 0xffc) << 8),
            object::elf::R_AARCH64_LDST64_ABS_LO12_NC => splice_low12(bytes, (value & 0xff8) << 7),
            object::elf::R_AARCH64_LDST128_ABS_LO12_NC => splice_low12(bytes, (value & 0xff0) << 6),

            object::elf::R_AARCH64_JUMP26 | object::elf::R_AARCH64_CALL26 => {
                let off = value.wrapping_sub(place);
                if !off.fits_signed(28) || off & 3 != 0 {
                    bail!(
                        "branch at 0x{place:x} cannot reach 0x{value:x}: \
                         out of 28 bit range"
                    );
                }
                let is_call = params.r_type == object::elf::R_AARCH64_CALL26;
                let insn = 0x1400_0000u32
                    | (u32::from(is_call) << 31)
                    | ((off >> 2) & 0x3ff_ffff) as u32;
                write_u32(bytes, insn);
            }

            object::elf::R_AARCH64_ADR_GOT_PAGE => {
                let off = (got_entry()? >> 12).wrapping_sub(place >> 12);
                check_page_offset(off, place)?;
                let insn = splice_adrp(read_u32(bytes), off);
                write_u32(bytes, insn);
            }
            object::elf::R_AARCH64_LD64_GOT_LO12_NC => {
                splice_low12(bytes, (got_entry()? & 0xff8) << 7);
            }

            object::elf::R_AARCH64_GLOB_DAT | object::elf::R_AARCH64_JUMP_SLOT => {
                write_u64(bytes, value.wrapping_sub(params.addend as u64));
            }

            _ => bail!(
                "Unsupported relocation type {} at 0x{place:x}",
                AArch64::rel_type_to_string(params.r_type)
            ),
        }
        Ok(RelocationModifier::Normal)
    }
}

fn splice_movw(bytes: &mut [u8], value: u64) {
    let insn = u64::from(read_u32(bytes)) & 0xffe0_001f | (value.low_bits(16) << 5);
    write_u32(bytes, insn as u32);
}

fn splice_low12(bytes: &mut [u8], bits: u64) {
    let insn = u64::from(read_u32(bytes)) & 0xffc0_03ff | bits;
    write_u32(bytes, insn as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(r_type: u32, bytes: &mut [u8], place: u64, value: u64) -> Result {
        AArch64::new_relocator()
            .apply(
                bytes,
                0,
                &RelocationParams {
                    r_type,
                    place,
                    value,
                    addend: 0,
                    got_address: 0,
                    got_entry_address: None,
                    symbol_section_extent: None,
                    text_address: 0,
                },
            )
            .map(|_| ())
    }

    #[test]
    fn adrp_add_pair_addresses_a_page() {
        // adrp x0, sym; add x0, x0, :lo12:sym
        let mut adrp = 0x9000_0000u32.to_le_bytes();
        let mut add = 0x9100_0000u32.to_le_bytes();
        let place = 0x40_1000;
        let value = 0x40_5123;
        apply(object::elf::R_AARCH64_ADR_PREL_PG_HI21, &mut adrp, place, value).unwrap();
        apply(object::elf::R_AARCH64_ADD_ABS_LO12_NC, &mut add, place + 4, value).unwrap();

        // Four pages forward: immlo (bits 29-30) is 0, immhi (bits 5-23) is 1.
        assert_eq!(u32::from_le_bytes(adrp), 0x9000_0000 | (1 << 5));
        assert_eq!(u32::from_le_bytes(add), 0x9100_0000 | (0x123 << 10));
    }

    #[test]
    fn call26_encodes_the_word_offset() {
        let mut bytes = 0x9400_0000u32.to_le_bytes();
        apply(object::elf::R_AARCH64_CALL26, &mut bytes, 0x40_1000, 0x40_1010).unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 0x9400_0004);

        let mut bytes = 0x9400_0000u32.to_le_bytes();
        // A backward branch by 16 bytes is -4 words: low 26 bits 0x3fffffc.
        apply(object::elf::R_AARCH64_JUMP26, &mut bytes, 0x40_1010, 0x40_1000).unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 0x1400_0000 | 0x3ff_fffc);
    }

    #[test]
    fn branches_out_of_range_fail() {
        let mut bytes = [0u8; 4];
        assert!(apply(object::elf::R_AARCH64_CALL26, &mut bytes, 0, 1 << 40).is_err());
        assert!(
            apply(object::elf::R_AARCH64_ADR_PREL_PG_HI21, &mut bytes, 0, 1 << 40).is_err()
        );
    }

    #[test]
    fn movw_sequence_builds_a_64_bit_constant() {
        let value = 0x1234_5678_9abc_def0;
        let mut g0 = 0xf280_0001u32.to_le_bytes();
        let mut g3 = 0xf2e0_0001u32.to_le_bytes();
        apply(object::elf::R_AARCH64_MOVW_UABS_G0_NC, &mut g0, 0, value).unwrap();
        apply(object::elf::R_AARCH64_MOVW_UABS_G3, &mut g3, 0, value).unwrap();
        assert_eq!(u32::from_le_bytes(g0), 0xf280_0001 | (0xdef0 << 5));
        assert_eq!(u32::from_le_bytes(g3), 0xf2e0_0001 | (0x1234 << 5));
    }
}
