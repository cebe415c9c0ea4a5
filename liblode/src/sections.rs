//! Output sections and the relocations that still apply to them.
//!
//! Input sections are merged into named output sections as they're loaded.
//! Each output section owns its bytes, so symbol values and relocation
//! offsets are rebased exactly once, at load time.

use crate::bail;
use crate::error::Result;
use crate::symbol_db::SymbolId;
use foldhash::HashMap;
use lode_utils::elf::SectionFlags;
use lode_utils::elf::SectionType;
use lode_utils::elf::sht;
use std::ops::Index;
use std::ops::IndexMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SectionId(pub(crate) usize);

/// A relocation that has been rebased into an output section.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Relocation {
    /// Offset of the relocation site within the output section.
    pub(crate) offset: u64,
    pub(crate) symbol: SymbolId,
    pub(crate) r_type: u32,
    pub(crate) addend: i64,
}

pub(crate) struct Section {
    pub(crate) name: String,
    pub(crate) section_type: SectionType,
    pub(crate) flags: SectionFlags,
    pub(crate) data: Vec<u8>,

    /// Logical size. Equal to `data.len()` except for SHT_NOBITS sections,
    /// which occupy memory but no file bytes.
    pub(crate) len: u64,

    pub(crate) alignment: u64,
    pub(crate) entsize: u64,
    pub(crate) relocations: Vec<Relocation>,

    /// Assigned during layout. Zero until then.
    pub(crate) address: u64,
    pub(crate) file_offset: u64,
}

impl Section {
    fn new(name: String, section_type: SectionType, flags: SectionFlags) -> Section {
        Section {
            name,
            section_type,
            flags,
            data: Vec::new(),
            len: 0,
            alignment: 1,
            entsize: 0,
            relocations: Vec::new(),
            address: 0,
            file_offset: 0,
        }
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.section_type == sht::NOBITS
    }
}

pub(crate) struct SectionStore {
    sections: Vec<Section>,
    by_name: HashMap<String, SectionId>,
}

impl SectionStore {
    pub(crate) fn new() -> SectionStore {
        SectionStore {
            sections: Vec::new(),
            by_name: HashMap::default(),
        }
    }

    /// Returns the section named `name`, creating it if necessary. An
    /// existing section must agree on `section_type`; flags are merged.
    pub(crate) fn ensure(
        &mut self,
        name: &str,
        section_type: SectionType,
        flags: SectionFlags,
    ) -> Result<SectionId> {
        if let Some(&id) = self.by_name.get(name) {
            let section = &mut self.sections[id.0];
            if section.section_type != section_type {
                bail!(
                    "section `{name}` has conflicting types {:?} and {:?}",
                    section.section_type,
                    section_type
                );
            }
            section.flags = section.flags.with(flags);
            return Ok(id);
        }
        let id = SectionId(self.sections.len());
        self.sections
            .push(Section::new(name.to_owned(), section_type, flags));
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<SectionId> {
        self.by_name.get(name).copied()
    }

    /// Appends `bytes` to the section, first padding with zeros to `align`.
    /// Returns the offset at which the bytes were placed.
    pub(crate) fn append(&mut self, id: SectionId, bytes: &[u8], align: u64) -> u64 {
        let section = &mut self.sections[id.0];
        debug_assert!(!section.is_nobits());
        section.alignment = section.alignment.max(align);
        let offset = align_up(section.len, align);
        section.data.resize(offset as usize, 0);
        section.data.extend_from_slice(bytes);
        section.len = section.data.len() as u64;
        offset
    }

    /// Reserves `size` bytes of memory-only space in a SHT_NOBITS section.
    /// Returns the offset of the reserved range.
    pub(crate) fn reserve(&mut self, id: SectionId, size: u64, align: u64) -> u64 {
        let section = &mut self.sections[id.0];
        section.alignment = section.alignment.max(align);
        let offset = align_up(section.len, align);
        section.len = offset + size;
        offset
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = SectionId> + use<> {
        (0..self.sections.len()).map(SectionId)
    }

    pub(crate) fn len(&self) -> usize {
        self.sections.len()
    }
}

impl Index<SectionId> for SectionStore {
    type Output = Section;

    fn index(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }
}

impl IndexMut<SectionId> for SectionStore {
    fn index_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    value.next_multiple_of(align.max(1))
}

/// The output section an input section named `name` merges into.
///
/// Sections named `<well-known>.suffix` fold into their well-known base, so
/// `-ffunction-sections` output and `.rodata.str1.1` style names collapse.
/// Anything else keeps its name.
pub(crate) fn output_section_name(name: &str) -> &str {
    const WELL_KNOWN: &[&str] = &[
        ".text",
        ".data.rel.ro",
        ".data",
        ".rodata",
        ".bss",
        ".tdata",
        ".tbss",
        ".init_array",
        ".fini_array",
    ];
    for base in WELL_KNOWN {
        if let Some(rest) = name.strip_prefix(base)
            && (rest.is_empty() || rest.starts_with('.'))
        {
            return base;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_utils::elf::shf;

    #[test]
    fn append_preserves_arrival_order_and_alignment() {
        let mut store = SectionStore::new();
        let text = store.ensure(".text", sht::PROGBITS, shf::ALLOC).unwrap();

        let first = store.append(text, &[0x90; 3], 1);
        let second = store.append(text, &[0xcc; 4], 16);
        assert_eq!(first, 0);
        assert_eq!(second, 16);
        assert_eq!(store[text].len, 20);
        assert_eq!(&store[text].data[..3], &[0x90; 3]);
        assert_eq!(&store[text].data[3..16], &[0; 13]);
        assert_eq!(store[text].alignment, 16);

        // Merging in another chunk with the same name reuses the section.
        let again = store.ensure(".text", sht::PROGBITS, shf::EXECINSTR).unwrap();
        assert_eq!(again, text);
        assert!(store[text].flags.contains(shf::ALLOC));
        assert!(store[text].flags.contains(shf::EXECINSTR));
    }

    #[test]
    fn reserve_grows_without_bytes() {
        let mut store = SectionStore::new();
        let bss = store
            .ensure(".bss", sht::NOBITS, shf::ALLOC.with(shf::WRITE))
            .unwrap();
        assert_eq!(store.reserve(bss, 5, 4), 0);
        assert_eq!(store.reserve(bss, 8, 8), 8);
        assert_eq!(store[bss].len, 16);
        assert!(store[bss].data.is_empty());
    }

    #[test]
    fn conflicting_section_types_are_rejected() {
        let mut store = SectionStore::new();
        store
            .ensure(".data", sht::PROGBITS, SectionFlags::empty())
            .unwrap();
        assert!(
            store
                .ensure(".data", sht::NOBITS, SectionFlags::empty())
                .is_err()
        );
    }

    #[test]
    fn input_names_fold_into_well_known_sections() {
        assert_eq!(output_section_name(".text.main"), ".text");
        assert_eq!(output_section_name(".text"), ".text");
        assert_eq!(output_section_name(".rodata.str1.1"), ".rodata");
        assert_eq!(output_section_name(".data.rel.ro.local"), ".data.rel.ro");
        assert_eq!(output_section_name(".tbss.counter"), ".tbss");
        assert_eq!(output_section_name(".textual"), ".textual");
        assert_eq!(output_section_name(".mysection"), ".mysection");
    }
}
