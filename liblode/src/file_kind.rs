//! Code for identifying what sort of file we're dealing with based on the bytes of the file.

use crate::bail;
use crate::elf;
use crate::error::Result;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    Archive,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::archive::THIN_MAGIC) {
            bail!("Thin archives are not supported");
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            const HEADER_LEN: usize = size_of::<elf::FileHeader>();
            let Some(header_bytes) = bytes.get(..HEADER_LEN) else {
                bail!("Invalid ELF file");
            };
            let header: &elf::FileHeader = object::from_bytes(header_bytes)
                .map_err(|()| anyhow::anyhow!("Invalid ELF header"))?
                .0;
            if header.e_ident.class != object::elf::ELFCLASS64 {
                bail!("Only 64 bit ELF is currently supported");
            }
            if header.e_ident.data != object::elf::ELFDATA2LSB {
                bail!("Only little endian is currently supported");
            }

            match header.e_type.get(LittleEndian) {
                object::elf::ET_REL => Ok(FileKind::ElfObject),
                object::elf::ET_DYN => {
                    bail!("Shared objects are not supported; all inputs must be relocatable")
                }
                t => bail!("Unsupported ELF kind {t}"),
            }
        } else {
            bail!("Couldn't identify file type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(e_type: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; size_of::<elf::FileHeader>()];
        bytes[..4].copy_from_slice(&object::elf::ELFMAG);
        bytes[4] = object::elf::ELFCLASS64;
        bytes[5] = object::elf::ELFDATA2LSB;
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes
    }

    #[test]
    fn identifies_relocatable_objects_and_archives() {
        let object = minimal_header(object::elf::ET_REL);
        assert_eq!(
            FileKind::identify_bytes(&object).unwrap(),
            FileKind::ElfObject
        );

        let mut archive = object::archive::MAGIC.to_vec();
        archive.extend_from_slice(b"some members");
        assert_eq!(
            FileKind::identify_bytes(&archive).unwrap(),
            FileKind::Archive
        );
    }

    #[test]
    fn rejects_executables_and_shared_objects() {
        assert!(FileKind::identify_bytes(&minimal_header(object::elf::ET_EXEC)).is_err());
        assert!(FileKind::identify_bytes(&minimal_header(object::elf::ET_DYN)).is_err());
        assert!(FileKind::identify_bytes(b"not an object").is_err());
    }
}
