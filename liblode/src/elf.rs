//! Type aliases and parsing for the 64-bit little-endian ELF structures we
//! work with. Using aliases keeps us honest about only supporting one class
//! and byte order while leaving the door open to widening that later.

use crate::bail;
use crate::error::Result;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SymtabEntry = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;
pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

/// A parsed input object. Borrows from the mapped file bytes.
pub(crate) struct File<'data> {
    pub(crate) e_machine: u16,
    pub(crate) sections: SectionTable<'data>,
    pub(crate) symbols: SymbolTable<'data>,
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<File<'data>> {
        let header = FileHeader::parse(data)?;
        let endian = header.endian()?;
        let sections = header.sections(endian, data)?;

        // Relocatable objects carry exactly one SHT_SYMTAB. Refusing anything
        // else up front means every later phase can assume a single table.
        let mut symbols = SymbolTable::default();
        let mut symtab_count = 0;
        for (section_index, section) in sections.enumerate() {
            if section.sh_type(endian) == object::elf::SHT_SYMTAB {
                symtab_count += 1;
                symbols = SymbolTable::parse(endian, data, &sections, section_index, section)?;
            }
        }
        if symtab_count != 1 {
            bail!("expected exactly one symbol table, found {symtab_count}");
        }

        Ok(File {
            e_machine: header.e_machine(endian),
            sections,
            symbols,
        })
    }
}
