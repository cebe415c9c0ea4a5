//! A static ELF linker for x86-64, AArch64 and RISC-V 64.
//!
//! Linking proceeds in phases, each a function taking the shared
//! [`LinkerContext`]: inputs are mapped and loaded, common symbols are
//! allocated, GOT and PLT entries are built, sections are laid out, symbols
//! get their final addresses, relocations are applied and the output file is
//! written. `run` drives the phases in order.

pub(crate) mod aarch64;
pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod got_plt;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod loader;
pub(crate) mod relocate;
pub(crate) mod riscv64;
pub(crate) mod sections;
pub(crate) mod symbol_db;
pub(crate) mod x86_64;

pub(crate) use anyhow::bail;

use crate::arch::Arch;
use crate::arch::Architecture;
use crate::args::Args;
use crate::args::OutputKind;
use crate::error::Result;
use crate::got_plt::SymAttrTable;
use crate::input_data::InputData;
use crate::sections::SectionStore;
use crate::symbol_db::SymbolDb;
use anyhow::Context as _;

/// State shared by all link phases. The fields are separate so that phases
/// can borrow sections and symbols independently.
pub(crate) struct LinkerContext {
    pub(crate) sections: SectionStore,
    pub(crate) symbols: SymbolDb,
    pub(crate) sym_attrs: SymAttrTable,
}

impl LinkerContext {
    pub(crate) fn new() -> LinkerContext {
        LinkerContext {
            sections: SectionStore::new(),
            symbols: SymbolDb::new(),
            sym_attrs: SymAttrTable::new(),
        }
    }
}

pub fn run(args: &Args) -> Result {
    setup_tracing();
    match args.arch {
        Architecture::X86_64 => link::<x86_64::X86_64>(args),
        Architecture::AArch64 => link::<aarch64::AArch64>(args),
        Architecture::RiscV64 => link::<riscv64::RiscV64>(args),
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link<A: Arch>(args: &Args) -> Result {
    let input_data = InputData::from_args(args)?;
    let mut ctx = LinkerContext::new();
    loader::load_inputs::<A>(&mut ctx, &input_data)?;
    loader::resolve_common_symbols(&mut ctx)?;
    if args.output_kind == OutputKind::Executable {
        got_plt::build_got_entries::<A>(&mut ctx)?;
    }
    elf_writer::prepare_output_sections(&mut ctx, args.output_kind)?;
    let layout = layout::compute::<A>(&mut ctx, args.output_kind)?;
    if args.output_kind == OutputKind::Executable {
        relocate::finalise_symbol_addresses(&mut ctx)?;
        got_plt::fixup_plt_entries::<A>(&mut ctx)?;
        relocate::relocate_sections::<A>(&mut ctx)?;
    }
    let bytes = elf_writer::write::<A>(&mut ctx, &layout, args.output_kind, &args.entry)?;
    write_output_file(args, &bytes)
}

fn write_output_file(args: &Args, bytes: &[u8]) -> Result {
    std::fs::write(&args.output, bytes)
        .with_context(|| format!("Failed to write `{}`", args.output.display()))?;
    #[cfg(unix)]
    if args.output_kind == OutputKind::Executable {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&args.output, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to chmod `{}`", args.output.display()))?;
    }
    Ok(())
}

/// Tests link repeatedly within one process, so a subscriber may already be
/// installed; that's fine.
fn setup_tracing() {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
