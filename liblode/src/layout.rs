//! Assigns file offsets, virtual addresses and loadable segments.
//!
//! Sections are ordered by weight: read-only before writable, tables at the
//! end, NOBITS last within each group. Walking the ordered list once then
//! assigns offsets, starting addresses at the architecture's load base, and
//! opens a new PT_LOAD whenever the access flags change.

use crate::LinkerContext;
use crate::arch::Arch;
use crate::args::OutputKind;
use crate::elf;
use crate::error::Result;
use crate::sections::Section;
use crate::sections::SectionId;
use crate::sections::align_up;
use bitflags::bitflags;
use lode_utils::elf::shf;
use lode_utils::elf::sht;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SegmentFlags: u32 {
        const R = object::elf::PF_R;
        const W = object::elf::PF_W;
        const X = object::elf::PF_X;
    }
}

pub(crate) struct Segment {
    pub(crate) p_type: u32,
    pub(crate) flags: SegmentFlags,
    pub(crate) address: u64,
    pub(crate) file_offset: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) align: u64,
}

pub(crate) struct Layout {
    /// All sections in output order.
    pub(crate) ordered: Vec<SectionId>,
    pub(crate) segments: Vec<Segment>,

    /// File offset one past the last payload byte.
    pub(crate) file_end: u64,
}

const EHDR_SIZE: u64 = size_of::<elf::FileHeader>() as u64;
const PHDR_SIZE: u64 = size_of::<elf::ProgramHeader>() as u64;

#[tracing::instrument(skip_all, name = "Lay out sections")]
pub(crate) fn compute<A: Arch>(ctx: &mut LinkerContext, output_kind: OutputKind) -> Result<Layout> {
    match output_kind {
        OutputKind::Executable => compute_executable::<A>(ctx),
        OutputKind::Relocatable => Ok(compute_relocatable(ctx)),
    }
}

fn segment_flags(section: &Section) -> SegmentFlags {
    let mut flags = SegmentFlags::R;
    if section.flags.contains(shf::WRITE) {
        flags |= SegmentFlags::W;
    }
    if section.flags.contains(shf::EXECINSTR) {
        flags |= SegmentFlags::X;
    }
    flags
}

/// Sort key: the major class orders section groups; the minor key pins down
/// the well-known tables and pushes NOBITS to the end of its group, keeping
/// `.tdata`/`.tbss` adjacent for the TLS segment.
fn section_weight(section: &Section) -> u32 {
    let class: u32 = if matches!(section.section_type, sht::SYMTAB | sht::STRTAB) {
        3
    } else if !section.flags.is_alloc() {
        0
    } else if !section.flags.contains(shf::WRITE) {
        1
    } else {
        2
    };
    let minor: u32 = match section.section_type {
        sht::SYMTAB => 0,
        sht::STRTAB => 1,
        sht::HASH => 2,
        sht::RELA => 3,
        _ if section.name == ".got" => 4,
        _ if section.name == ".tdata" => 6,
        sht::NOBITS if section.flags.contains(shf::TLS) => 7,
        sht::NOBITS => 8,
        _ => 5,
    };
    class << 8 | minor
}

fn compute_executable<A: Arch>(ctx: &mut LinkerContext) -> Result<Layout> {
    let mut ordered: Vec<SectionId> = ctx.sections.ids().collect();
    ordered.sort_by_key(|&id| section_weight(&ctx.sections[id]));

    // One pass to size the program header table, which itself occupies file
    // space inside the first segment.
    let mut load_count = 0usize;
    let mut previous_flags = None;
    let mut has_tls = false;
    for &id in &ordered {
        let section = &ctx.sections[id];
        if !section.flags.is_alloc() || section.len == 0 {
            continue;
        }
        let flags = Some(segment_flags(section));
        if flags != previous_flags {
            load_count += 1;
            previous_flags = flags;
        }
        has_tls |= section.flags.contains(shf::TLS);
    }
    let phnum = load_count + usize::from(has_tls);

    let mut file_offset = EHDR_SIZE + phnum as u64 * PHDR_SIZE;
    let mut address = 0u64;
    let mut segments: Vec<Segment> = Vec::with_capacity(phnum);
    let mut current_flags = None;

    for &id in &ordered {
        let section = &mut ctx.sections[id];
        if !section.flags.is_alloc() {
            file_offset = align_up(file_offset, section.alignment);
            section.file_offset = file_offset;
            section.address = 0;
            if !section.is_nobits() {
                file_offset += section.len;
            }
            continue;
        }

        if section.len == 0 {
            // Empty sections get plausible positions but never open or
            // extend a segment.
            section.address = address.max(A::LOAD_ADDRESS);
            section.file_offset = file_offset;
            continue;
        }

        let flags = segment_flags(section);
        if current_flags != Some(flags) {
            if segments.is_empty() {
                // The first segment also maps the file and program headers.
                file_offset = align_up(file_offset, section.alignment);
                address = A::LOAD_ADDRESS + file_offset;
                segments.push(Segment {
                    p_type: object::elf::PT_LOAD,
                    flags,
                    address: A::LOAD_ADDRESS,
                    file_offset: 0,
                    file_size: 0,
                    mem_size: 0,
                    align: A::PAGE_SIZE,
                });
            } else {
                file_offset = align_up(file_offset, A::PAGE_SIZE);
                address = A::LOAD_ADDRESS + file_offset;
                segments.push(Segment {
                    p_type: object::elf::PT_LOAD,
                    flags,
                    address,
                    file_offset,
                    file_size: 0,
                    mem_size: 0,
                    align: A::PAGE_SIZE,
                });
            }
            current_flags = Some(flags);
        }

        if section.is_nobits() {
            address = align_up(address, section.alignment);
            section.address = address;
            section.file_offset = file_offset;
            address += section.len;
        } else {
            file_offset = align_up(file_offset, section.alignment);
            address = align_up(address, section.alignment);
            section.address = address;
            section.file_offset = file_offset;
            file_offset += section.len;
            address += section.len;
        }

        let segment = segments
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("section outside any segment"))?;
        segment.mem_size = section.address + section.len - segment.address;
        if !section.is_nobits() {
            segment.file_size = section.file_offset + section.len - segment.file_offset;
        }
    }

    if has_tls {
        segments.push(tls_segment(ctx, &ordered));
    }
    debug_assert_eq!(segments.len(), phnum);

    Ok(Layout {
        ordered,
        segments,
        file_end: file_offset,
    })
}

fn tls_segment(ctx: &LinkerContext, ordered: &[SectionId]) -> Segment {
    let mut segment = Segment {
        p_type: object::elf::PT_TLS,
        flags: SegmentFlags::R,
        address: 0,
        file_offset: 0,
        file_size: 0,
        mem_size: 0,
        align: 1,
    };
    let mut first = true;
    for &id in ordered {
        let section = &ctx.sections[id];
        if !section.flags.contains(shf::TLS) || !section.flags.is_alloc() {
            continue;
        }
        if first {
            segment.address = section.address;
            segment.file_offset = section.file_offset;
            first = false;
        }
        segment.mem_size = section.address + section.len - segment.address;
        if !section.is_nobits() {
            segment.file_size = section.address + section.len - segment.address;
        }
        segment.align = segment.align.max(section.alignment);
    }
    segment
}

/// `-r` output: no addresses, no segments, every section at the next
/// 16-byte boundary after the file header.
fn compute_relocatable(ctx: &mut LinkerContext) -> Layout {
    let ordered: Vec<SectionId> = ctx.sections.ids().collect();
    let mut file_offset = EHDR_SIZE;
    for &id in &ordered {
        let section = &mut ctx.sections[id];
        file_offset = align_up(file_offset, 16);
        section.file_offset = file_offset;
        section.address = 0;
        if !section.is_nobits() {
            file_offset += section.len;
        }
    }
    Layout {
        ordered,
        segments: Vec::new(),
        file_end: file_offset,
    }
}
