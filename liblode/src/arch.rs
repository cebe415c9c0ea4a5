//! Abstraction over different CPU architectures.

use crate::error::Result;
use object::elf::EM_AARCH64;
use object::elf::EM_RISCV;
use object::elf::EM_X86_64;
use std::borrow::Cow;
use std::str::FromStr;

pub(crate) trait Arch {
    type Relocator: Relocator;

    /// The `e_machine` value for the architecture.
    const ELF_HEADER_ARCH_MAGIC: u16;

    /// The `e_flags` value we emit in output headers.
    const ELF_HEADER_FLAGS: u32 = 0;

    /// Base virtual address of the first loadable segment.
    const LOAD_ADDRESS: u64;

    /// Alignment of loadable segment boundaries.
    const PAGE_SIZE: u64;

    const PLT_HEADER_SIZE: u64;
    const PLT_ENTRY_SIZE: u64;

    /// Relocation type stored against GOT slots for data references.
    const GLOB_DAT: u32;

    /// Relocation type stored against GOT slots that back PLT stubs.
    const JUMP_SLOT: u32;

    /// How a relocation of the given type interacts with the GOT and PLT.
    fn got_plt_policy(r_type: u32) -> Result<GotPltPolicy>;

    /// Whether the relocation transfers control, in which case an undefined
    /// target gets a PLT stub rather than just a GOT slot.
    fn is_code_relocation(r_type: u32) -> Result<bool>;

    /// Relocation types which are allowed to reference a symbol we couldn't
    /// map, because applying them never reads the symbol.
    fn is_exempt_relocation(r_type: u32) -> bool;

    /// The relocation recorded against a GOT slot allocated for `r_type`.
    /// Slots normally hold the symbol's address; TLS slots hold its thread
    /// offset instead.
    fn got_slot_relocation(r_type: u32, is_code: bool) -> u32 {
        let _ = r_type;
        if is_code { Self::JUMP_SLOT } else { Self::GLOB_DAT }
    }

    /// If `r_type` is a call-via-PLT relocation that can target a defined
    /// symbol directly, returns the plain PC-relative type to rewrite it to.
    fn plt_relocation_to_direct(r_type: u32) -> Option<u32> {
        let _ = r_type;
        None
    }

    /// Append the PLT header to an empty `.plt` section.
    fn write_plt_header(plt: &mut Vec<u8>);

    /// Append a lazy-binding stub for the GOT slot at `got_offset`.
    fn write_plt_entry(plt: &mut Vec<u8>, got_offset: u64);

    /// Re-encode a stub once final addresses are known.
    fn fixup_plt_entry(entry: &mut [u8], got_entry_address: u64, plt_entry_address: u64);

    /// Get string representation of a relocation specific for the architecture.
    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    fn new_relocator() -> Self::Relocator;
}

/// Applies relocations to the bytes of one section. Stateful because some
/// architectures split a PC-relative offset across paired relocations.
///
/// `data` is the whole section and `offset` the relocation site; TLS
/// relaxation rewrites instruction bytes that precede the site.
pub(crate) trait Relocator {
    fn apply(
        &mut self,
        data: &mut [u8],
        offset: usize,
        params: &RelocationParams,
    ) -> Result<RelocationModifier>;
}

/// Tells the driver what to do after a relocation has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationModifier {
    Normal,

    /// The relocation rewrote the following instruction too, so the next
    /// relocation no longer applies.
    SkipNextRelocation,
}

/// Everything a single relocation application may need. Computed once per
/// relocation by the driver in `relocate.rs`.
pub(crate) struct RelocationParams {
    pub(crate) r_type: u32,

    /// Virtual address of the relocation site.
    pub(crate) place: u64,

    /// Resolved symbol value with the addend already applied.
    pub(crate) value: u64,

    pub(crate) addend: i64,

    /// Virtual address of the start of `.got`, or 0 if there isn't one.
    pub(crate) got_address: u64,

    /// Virtual address of the symbol's GOT slot, if it has one.
    pub(crate) got_entry_address: Option<u64>,

    /// Address and size of the section defining the symbol. TLS relocations
    /// compute offsets relative to the end of that section.
    pub(crate) symbol_section_extent: Option<(u64, u64)>,

    /// Virtual address of `.text`, or 0. Used by RELATIVE slots.
    pub(crate) text_address: u64,
}

/// How a relocation type interacts with the GOT and PLT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GotPltPolicy {
    /// Never builds an entry.
    None,

    /// Builds a GOT slot but never a PLT stub.
    GotOnly,

    /// Builds entries only when the target symbol is undefined.
    IfUndefined,

    /// Always builds entries.
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    AArch64,
    RiscV64,
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elf_x86_64" => Ok(Architecture::X86_64),
            "aarch64elf" | "aarch64linux" => Ok(Architecture::AArch64),
            "elf64lriscv" => Ok(Architecture::RiscV64),
            _ => anyhow::bail!("-m {s} is not yet supported"),
        }
    }
}

impl TryFrom<u16> for Architecture {
    type Error = anyhow::Error;

    fn try_from(arch: u16) -> Result<Self, Self::Error> {
        match arch {
            EM_X86_64 => Ok(Self::X86_64),
            EM_AARCH64 => Ok(Self::AArch64),
            EM_RISCV => Ok(Self::RiscV64),
            _ => anyhow::bail!("Unsupported architecture: 0x{:x}", arch),
        }
    }
}
