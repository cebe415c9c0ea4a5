//! RISC-V relocation application and PLT generation.
//!
//! `auipc`-based addressing is split across a PCREL_HI20 relocation and one
//! or more PCREL_LO12 relocations whose symbol points back at the `auipc`
//! instruction. The relocator remembers the most recent high half and
//! refuses a low half that doesn't reference it.

use crate::arch::Arch;
use crate::arch::GotPltPolicy;
use crate::arch::RelocationModifier;
use crate::arch::RelocationParams;
use crate::arch::Relocator;
use crate::bail;
use crate::error::Result;
use anyhow::Context as _;
use lode_utils::bit_misc::BitExtraction as _;
use lode_utils::elf::riscv64_rel_type_to_string;
use lode_utils::uleb::overwrite_uleb;
use lode_utils::uleb::read_uleb;
use lode_utils::utils::add_u16;
use lode_utils::utils::add_u32;
use lode_utils::utils::add_u64;
use lode_utils::utils::add_u8;
use lode_utils::utils::read_u16;
use lode_utils::utils::read_u32;
use lode_utils::utils::write_u16;
use lode_utils::utils::write_u32;
use lode_utils::utils::write_u64;

pub(crate) struct RiscV64;

const PLT_HEADER: &[u32] = &[
    0x0000_0397, // auipc t2, 0
    0x0003_b383, // ld t2, 0(t2)
    0x0000_0317, // auipc t1, 0
    0x0003_3303, // ld t1, 0(t1)
    0x0003_0067, // jr t1
    0x0000_0013, // nop
    0x0000_0013, // nop
    0x0000_0013, // nop
];

impl Arch for RiscV64 {
    type Relocator = RiscV64Relocator;

    const ELF_HEADER_ARCH_MAGIC: u16 = object::elf::EM_RISCV;
    const ELF_HEADER_FLAGS: u32 =
        object::elf::EF_RISCV_RVC | object::elf::EF_RISCV_FLOAT_ABI_DOUBLE;
    const LOAD_ADDRESS: u64 = 0x1_0000;
    const PAGE_SIZE: u64 = 0x1000;
    const PLT_HEADER_SIZE: u64 = 32;
    const PLT_ENTRY_SIZE: u64 = 16;
    // GOT slots for data references hold the absolute address, which a plain
    // 64-bit relocation produces.
    const GLOB_DAT: u32 = object::elf::R_RISCV_64;
    const JUMP_SLOT: u32 = object::elf::R_RISCV_JUMP_SLOT;

    fn got_plt_policy(r_type: u32) -> Result<GotPltPolicy> {
        let policy = match r_type {
            object::elf::R_RISCV_NONE
            | object::elf::R_RISCV_32
            | object::elf::R_RISCV_64
            | object::elf::R_RISCV_RELAX
            | object::elf::R_RISCV_ALIGN
            | object::elf::R_RISCV_RVC_BRANCH
            | object::elf::R_RISCV_RVC_JUMP
            | object::elf::R_RISCV_32_PCREL
            | object::elf::R_RISCV_HI20
            | object::elf::R_RISCV_LO12_I
            | object::elf::R_RISCV_LO12_S
            | object::elf::R_RISCV_PCREL_HI20
            | object::elf::R_RISCV_PCREL_LO12_I
            | object::elf::R_RISCV_PCREL_LO12_S
            | object::elf::R_RISCV_TPREL_HI20
            | object::elf::R_RISCV_TPREL_LO12_I
            | object::elf::R_RISCV_TPREL_LO12_S
            | object::elf::R_RISCV_TPREL_ADD
            | object::elf::R_RISCV_ADD8
            | object::elf::R_RISCV_ADD16
            | object::elf::R_RISCV_ADD32
            | object::elf::R_RISCV_ADD64
            | object::elf::R_RISCV_SUB6
            | object::elf::R_RISCV_SUB8
            | object::elf::R_RISCV_SUB16
            | object::elf::R_RISCV_SUB32
            | object::elf::R_RISCV_SUB64
            | object::elf::R_RISCV_SET6
            | object::elf::R_RISCV_SET8
            | object::elf::R_RISCV_SET16
            | object::elf::R_RISCV_SET_ULEB128
            | object::elf::R_RISCV_SUB_ULEB128
            | object::elf::R_RISCV_JUMP_SLOT
            | object::elf::R_RISCV_RELATIVE => GotPltPolicy::None,

            object::elf::R_RISCV_CALL
            | object::elf::R_RISCV_CALL_PLT
            | object::elf::R_RISCV_JAL
            | object::elf::R_RISCV_BRANCH => GotPltPolicy::IfUndefined,

            object::elf::R_RISCV_GOT_HI20
            | object::elf::R_RISCV_TLS_GOT_HI20
            | object::elf::R_RISCV_TLS_GD_HI20 => GotPltPolicy::Always,

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
            object::elf::R_RISCV_CALL
                | object::elf::R_RISCV_CALL_PLT
                | object::elf::R_RISCV_JAL
                | object::elf::R_RISCV_BRANCH
                | object::elf::R_RISCV_JUMP_SLOT
        ))
    }

    fn is_exempt_relocation(r_type: u32) -> bool {
        matches!(
            r_type,
            object::elf::R_RISCV_NONE | object::elf::R_RISCV_RELAX | object::elf::R_RISCV_ALIGN
        )
    }

    fn write_plt_header(plt: &mut Vec<u8>) {
        for insn in PLT_HEADER {
            plt.extend_from_slice(&insn.to_le_bytes());
        }
    }

    fn write_plt_entry(plt: &mut Vec<u8>, _got_offset: u64) {
        // auipc t2, hi; ld t2, lo(t2); jalr t2; nop. Offsets are filled in
        // by fixup once layout is done.
        for insn in [0x0000_0397u32, 0x0003_b383, 0x0003_80e7, 0x0000_0013] {
            plt.extend_from_slice(&insn.to_le_bytes());
        }
    }

    fn fixup_plt_entry(entry: &mut [u8], got_entry_address: u64, plt_entry_address: u64) {
        let off = got_entry_address.wrapping_sub(plt_entry_address);
        let auipc = 0x0000_0397 | (off.wrapping_add(0x800) as u32 & !0xfff);
        let ld = 0x0003_b383 | (((off & 0xfff) as u32) << 20);
        write_u32(entry, auipc);
        write_u32(&mut entry[4..], ld);
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        riscv64_rel_type_to_string(r_type)
    }

    fn new_relocator() -> RiscV64Relocator {
        RiscV64Relocator { hi: None }
    }
}

pub(crate) struct RiscV64Relocator {
    /// Address of the last PCREL_HI20 `auipc` and the target it resolved to.
    hi: Option<(u64, u64)>,
}

impl RiscV64Relocator {
    fn splice_hi20(bytes: &mut [u8], offset: u64) {
        let insn = read_u32(bytes) & 0xfff | (offset.wrapping_add(0x800) as u32 & !0xfff);
        write_u32(bytes, insn);
    }

    fn splice_lo12_i(bytes: &mut [u8], value: u64) {
        let insn = read_u32(bytes) & 0xf_ffff | ((value.low_bits(12) as u32) << 20);
        write_u32(bytes, insn);
    }

    fn splice_lo12_s(bytes: &mut [u8], value: u64) {
        // S-type splits the immediate: imm[4:0] -> bits 7-11, imm[11:5] ->
        // bits 25-31.
        let imm = (value.extract_bit_range(0..5) << 7 | value.extract_bit_range(5..12) << 25) as u32;
        let insn = read_u32(bytes) & 0x01ff_f07f | imm;
        write_u32(bytes, insn);
    }

    fn thread_offset(params: &RelocationParams) -> Result<u64> {
        let (base, _) = params
            .symbol_section_extent
            .context("TLS relocation against a symbol with no section")?;
        Ok(params.value.wrapping_sub(base))
    }

    /// The offset the pending high half resolved to, checked against the low
    /// half's symbol which must point at the `auipc` instruction.
    fn paired_offset(&mut self, value: u64, place: u64) -> Result<u64> {
        let Some((hi_place, target)) = self.hi.take() else {
            bail!("PCREL_LO12 at 0x{place:x} has no preceding PCREL_HI20");
        };
        if value != hi_place {
            bail!(
                "PCREL_LO12 at 0x{place:x} references 0x{value:x}, but the \
                 preceding PCREL_HI20 is at 0x{hi_place:x}"
            );
        }
        Ok(target.wrapping_sub(hi_place))
    }
}

impl Relocator for RiscV64Relocator {
    fn apply(
        &mut self,
        data: &mut [u8],
        offset: usize,
        params: &RelocationParams,
    ) -> Result<RelocationModifier> {
        let bytes = &mut data[offset..];
        let value = params.value;
        let place = params.place;
        match params.r_type {
            object::elf::R_RISCV_NONE
            | object::elf::R_RISCV_RELAX
            | object::elf::R_RISCV_ALIGN
            | object::elf::R_RISCV_TPREL_ADD => {}

            object::elf::R_RISCV_64 => add_u64(bytes, value),
            object::elf::R_RISCV_32 => add_u32(bytes, value),

            object::elf::R_RISCV_HI20 => Self::splice_hi20(bytes, value),
            object::elf::R_RISCV_LO12_I => Self::splice_lo12_i(bytes, value),

            // `tp` points at the start of the TLS block, which for us is the
            // start of the defining section.
            object::elf::R_RISCV_TPREL_HI20 => {
                Self::splice_hi20(bytes, Self::thread_offset(params)?);
            }
            object::elf::R_RISCV_TPREL_LO12_I => {
                Self::splice_lo12_i(bytes, Self::thread_offset(params)?);
            }
            object::elf::R_RISCV_TPREL_LO12_S => {
                Self::splice_lo12_s(bytes, Self::thread_offset(params)?);
            }
            object::elf::R_RISCV_LO12_S => Self::splice_lo12_s(bytes, value),

            object::elf::R_RISCV_PCREL_HI20 => {
                Self::splice_hi20(bytes, value.wrapping_sub(place));
                self.hi = Some((place, value));
            }
            object::elf::R_RISCV_GOT_HI20 => {
                let got_entry = params
                    .got_entry_address
                    .context("GOT relocation against a symbol with no GOT slot")?;
                Self::splice_hi20(bytes, got_entry.wrapping_sub(place));
                self.hi = Some((place, got_entry));
            }
            object::elf::R_RISCV_PCREL_LO12_I => {
                let offset = self.paired_offset(value, place)?;
                Self::splice_lo12_i(bytes, offset);
            }
            object::elf::R_RISCV_PCREL_LO12_S => {
                let offset = self.paired_offset(value, place)?;
                Self::splice_lo12_s(bytes, offset);
            }

            object::elf::R_RISCV_CALL | object::elf::R_RISCV_CALL_PLT => {
                let off = value.wrapping_sub(place);
                if !off.fits_signed(32) {
                    bail!(
                        "call at 0x{place:x} cannot reach 0x{value:x}: \
                         out of 32 bit range"
                    );
                }
                Self::splice_hi20(bytes, off);
                Self::splice_lo12_i(&mut bytes[4..], off);
            }
            object::elf::R_RISCV_JAL => {
                let off = value.wrapping_sub(place);
                if !off.fits_signed(21) {
                    bail!(
                        "jump at 0x{place:x} cannot reach 0x{value:x}: \
                         out of 21 bit range"
                    );
                }
                // J-type scatters offset[20|10:1|11|19:12] into bits 31:12.
                let jal_imm = (off.extract_bit_range(20..21) << 31
                    | off.extract_bit_range(1..11) << 21
                    | off.extract_bit_range(11..12) << 20
                    | off.extract_bit_range(12..20) << 12) as u32;
                write_u32(bytes, read_u32(bytes) & 0xfff | jal_imm);
            }
            object::elf::R_RISCV_BRANCH => {
                let off = value.wrapping_sub(place);
                if !off.fits_signed(13) {
                    bail!(
                        "branch at 0x{place:x} cannot reach 0x{value:x}: \
                         out of 13 bit range"
                    );
                }
                // B-type scatters offset[12|10:5] into bits 31:25 and
                // offset[4:1|11] into bits 11:7.
                let branch_imm = (off.extract_bit_range(12..13) << 31
                    | off.extract_bit_range(5..11) << 25
                    | off.extract_bit_range(1..5) << 8
                    | off.extract_bit_range(11..12) << 7) as u32;
                write_u32(bytes, read_u32(bytes) & 0x01ff_f07f | branch_imm);
            }
            object::elf::R_RISCV_RVC_BRANCH => {
                let off = value.wrapping_sub(place);
                if !off.fits_signed(9) {
                    bail!(
                        "compressed branch at 0x{place:x} cannot reach 0x{value:x}: \
                         out of 9 bit range"
                    );
                }
                // CB-type: offset[8|4:3] -> bits 12:10, offset[7:6|2:1|5] ->
                // bits 6:2.
                let branch_imm = (off.extract_bit_range(8..9) << 12
                    | off.extract_bit_range(3..5) << 10
                    | off.extract_bit_range(6..8) << 5
                    | off.extract_bit_range(1..3) << 3
                    | off.extract_bit_range(5..6) << 2) as u16;
                write_u16(bytes, read_u16(bytes) & 0xe383 | branch_imm);
            }
            object::elf::R_RISCV_RVC_JUMP => {
                let off = value.wrapping_sub(place);
                if !off.fits_signed(12) {
                    bail!(
                        "compressed jump at 0x{place:x} cannot reach 0x{value:x}: \
                         out of 12 bit range"
                    );
                }
                // CJ-type: offset[11|4|9:8|10|6|7|3:1|5] -> bits 12:2.
                let jump_imm = (off.extract_bit_range(11..12) << 12
                    | off.extract_bit_range(4..5) << 11
                    | off.extract_bit_range(8..10) << 9
                    | off.extract_bit_range(10..11) << 8
                    | off.extract_bit_range(6..7) << 7
                    | off.extract_bit_range(7..8) << 6
                    | off.extract_bit_range(1..4) << 3
                    | off.extract_bit_range(5..6) << 2) as u16;
                write_u16(bytes, read_u16(bytes) & 0xe003 | jump_imm);
            }

            object::elf::R_RISCV_32_PCREL => write_u32(bytes, value.wrapping_sub(place) as u32),

            object::elf::R_RISCV_JUMP_SLOT => {
                write_u64(bytes, value.wrapping_sub(params.addend as u64));
            }
            object::elf::R_RISCV_RELATIVE => {
                write_u64(
                    bytes,
                    params.text_address.wrapping_add(params.addend as u64),
                );
            }

            object::elf::R_RISCV_ADD8 => add_u8(bytes, value),
            object::elf::R_RISCV_ADD16 => add_u16(bytes, value),
            object::elf::R_RISCV_ADD32 => add_u32(bytes, value),
            object::elf::R_RISCV_ADD64 => add_u64(bytes, value),
            object::elf::R_RISCV_SUB8 => add_u8(bytes, value.wrapping_neg()),
            object::elf::R_RISCV_SUB16 => add_u16(bytes, value.wrapping_neg()),
            object::elf::R_RISCV_SUB32 => add_u32(bytes, value.wrapping_neg()),
            object::elf::R_RISCV_SUB64 => add_u64(bytes, value.wrapping_neg()),
            object::elf::R_RISCV_SUB6 => {
                let current = bytes[0];
                bytes[0] = current & 0xc0 | current.wrapping_sub(value as u8) & 0x3f;
            }
            object::elf::R_RISCV_SET6 => {
                bytes[0] = bytes[0] & 0xc0 | value as u8 & 0x3f;
            }
            object::elf::R_RISCV_SET8 => bytes[0] = value as u8,
            object::elf::R_RISCV_SET16 => write_u16(bytes, value as u16),

            object::elf::R_RISCV_SET_ULEB128 => {
                let (_, len) = read_uleb(bytes)?;
                overwrite_uleb(bytes, len, value)?;
            }
            object::elf::R_RISCV_SUB_ULEB128 => {
                let (current, len) = read_uleb(bytes)?;
                overwrite_uleb(bytes, len, current.wrapping_sub(value))?;
            }

            object::elf::R_RISCV_TLS_GOT_HI20 | object::elf::R_RISCV_TLS_GD_HI20 => {
                bail!(
                    "{} is not supported; compile with -ftls-model=local-exec",
                    RiscV64::rel_type_to_string(params.r_type)
                );
            }

            _ => bail!(
                "Unsupported relocation type {} at 0x{place:x}",
                RiscV64::rel_type_to_string(params.r_type)
            ),
        }
        Ok(RelocationModifier::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(r_type: u32, place: u64, value: u64) -> RelocationParams {
        RelocationParams {
            r_type,
            place,
            value,
            addend: 0,
            got_address: 0,
            got_entry_address: None,
            symbol_section_extent: None,
            text_address: 0,
        }
    }

    #[test]
    fn auipc_pair_splits_the_offset() {
        let mut relocator = RiscV64::new_relocator();
        let mut auipc = 0x0000_0517u32.to_le_bytes(); // auipc a0, 0
        let mut load = 0x0005_3503u32.to_le_bytes(); // ld a0, 0(a0)

        let hi_place = 0x1_1000;
        let target = 0x1_3804;
        relocator
            .apply(&mut auipc, 0, &params(object::elf::R_RISCV_PCREL_HI20, hi_place, target))
            .unwrap();
        // The low half's symbol is the auipc instruction itself.
        relocator
            .apply(
                &mut load,
                0,
                &params(object::elf::R_RISCV_PCREL_LO12_I, hi_place + 4, hi_place),
            )
            .unwrap();

        let offset = target - hi_place; // 0x2804
        assert_eq!(
            u32::from_le_bytes(auipc),
            0x0000_0517 | ((offset + 0x800) as u32 & !0xfff)
        );
        assert_eq!(
            u32::from_le_bytes(load),
            0x0005_3503 | (((offset & 0xfff) as u32) << 20)
        );
    }

    #[test]
    fn low_half_must_reference_its_high_half() {
        let mut relocator = RiscV64::new_relocator();
        let mut bytes = [0u8; 4];
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_PCREL_HI20, 0x1000, 0x2000))
            .unwrap();

        // Points at 0x1004 rather than the auipc at 0x1000.
        let err = relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_PCREL_LO12_I, 0x1008, 0x1004))
            .unwrap_err();
        assert!(err.to_string().contains("PCREL_HI20"));

        // And a low half with no high half at all is rejected.
        let err = relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_PCREL_LO12_I, 0x1008, 0x1000))
            .unwrap_err();
        assert!(err.to_string().contains("no preceding"));
    }

    #[test]
    fn jal_packs_the_immediate() {
        let mut relocator = RiscV64::new_relocator();
        let mut bytes = 0x0000_00efu32.to_le_bytes(); // jal ra, 0
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_JAL, 0x1_0000, 0x1_0008))
            .unwrap();
        // Offset 8: imm[10:1] = 4 lands at bit 21.
        assert_eq!(u32::from_le_bytes(bytes), 0x0000_00ef | (4 << 21));

        let mut bytes = [0u8; 4];
        let err = relocator.apply(
            &mut bytes,
            0,
            &params(object::elf::R_RISCV_JAL, 0, 1 << 24),
        );
        assert!(err.is_err());
    }

    #[test]
    fn uleb_pairs_compute_differences_in_place() {
        // A three-byte ULEB field holding 0x4000.
        let mut bytes = [0x80, 0x80, 0x01];
        let mut relocator = RiscV64::new_relocator();
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_SET_ULEB128, 0, 0x5000))
            .unwrap();
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_SUB_ULEB128, 0, 0x1100))
            .unwrap();
        assert_eq!(read_uleb(&bytes).unwrap(), (0x3f00, 3));
    }

    #[test]
    fn debug_section_arithmetic() {
        let mut relocator = RiscV64::new_relocator();
        let mut bytes = [10u8];
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_ADD8, 0, 5))
            .unwrap();
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_SUB8, 0, 3))
            .unwrap();
        assert_eq!(bytes[0], 12);

        let mut bytes = [0xff];
        relocator
            .apply(&mut bytes, 0, &params(object::elf::R_RISCV_SET6, 0, 0x15))
            .unwrap();
        assert_eq!(bytes[0], 0xd5);
    }
}
