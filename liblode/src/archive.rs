//! Code to read ar files. We don't use the ar crate because it provides
//! access to data only via the Read trait and we want to borrow the data of
//! each entry. We do however use the ar crate as a dev dependency in our
//! tests so that we can verify consistency.
//!
//! Unlike the per-object symbol tables, the archive's own symbol index
//! matters to us: members are only pulled in when the index says they define
//! a symbol we still need.

use crate::bail;
use crate::error::Result;
use anyhow::Context as _;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) enum ArchiveEntry<'data> {
    Regular(ArchiveContent<'data>),
    SymbolIndex(SymbolIndex<'data>),
    Filenames(ExtendedFilenames<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,

    pub(crate) entry_data: &'data [u8],

    /// Offset of the entry's header within the archive file. This is the
    /// offset the symbol index refers to.
    pub(crate) header_offset: usize,
}

/// The `/` member written by `ar s` / ranlib: a big-endian count, that many
/// big-endian header offsets, then that many NUL-terminated symbol names.
#[derive(Clone, Copy)]
pub(crate) struct SymbolIndex<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    offset: usize,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const _ASSERTS: () = {
    assert!(size_of::<EntryHeader>() == 60);
};

const HEADER_SIZE: usize = size_of::<EntryHeader>();

impl<'data> ArchiveIterator<'data> {
    /// Create an iterator from the bytes of the whole archive, starting with
    /// the `!<arch>\n` magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let magic = object::archive::MAGIC;
        if let Some(data) = data.strip_prefix(&magic) {
            Ok(Self {
                data,
                offset: magic.len(),
            })
        } else {
            bail!("Missing archive header");
        }
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("Short entry header");
        }
        let header_offset = self.offset;
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        let size = parse_decimal(&header.size).context("Invalid entry size")?;
        self.data = rest;
        self.offset += HEADER_SIZE;

        let ident = std::str::from_utf8(&header.ident).context("archive ident is invalid UTF-8")?;
        let ident = ident.trim_end();
        if self.data.len() < size {
            bail!(
                "Entry size is {size}, but only {} bytes left",
                self.data.len()
            );
        }
        let entry_data = &self.data[..size];
        let entry = match ident {
            "/" => ArchiveEntry::SymbolIndex(SymbolIndex { data: entry_data }),
            "//" => ArchiveEntry::Filenames(ExtendedFilenames { data: entry_data }),
            _ => ArchiveEntry::Regular(ArchiveContent {
                ident,
                entry_data,
                header_offset,
            }),
        };
        let size_with_padding = size.next_multiple_of(2).min(self.data.len());
        self.data = &self.data[size_with_padding..];
        self.offset += size_with_padding;
        Ok(Some(entry))
    }
}

fn parse_decimal(bytes: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(bytes)?.trim_end();
    Ok(text.parse()?)
}

impl<'data> SymbolIndex<'data> {
    /// Returns `(symbol name, member header offset)` pairs.
    pub(crate) fn entries(&self) -> Result<Vec<(&'data str, usize)>> {
        let count = self
            .data
            .first_chunk::<4>()
            .map(|c| u32::from_be_bytes(*c) as usize)
            .context("Truncated archive symbol index")?;
        let offsets_end = 4 + count * 4;
        let Some(offset_bytes) = self.data.get(4..offsets_end) else {
            bail!("Truncated archive symbol index");
        };
        let mut names = self.data.get(offsets_end..).unwrap_or_default();
        let mut entries = Vec::with_capacity(count);
        for chunk in offset_bytes.chunks_exact(4) {
            let offset = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
            let end = names
                .iter()
                .position(|&b| b == 0)
                .context("Truncated archive symbol index")?;
            let name = std::str::from_utf8(&names[..end])?;
            names = &names[end + 1..];
            entries.push((name, offset));
        }
        Ok(entries)
    }
}

impl<'data> ArchiveContent<'data> {
    /// Returns the identifier (generally a filename) that identifies this
    /// entry. Long names live in the extended filenames entry.
    pub(crate) fn identifier(&self, extended_filenames: Option<ExtendedFilenames<'data>>) -> &'data [u8] {
        if let Some(filenames) = extended_filenames
            && let Some(rest) = self.ident.strip_prefix('/')
            && let Ok(offset) = rest.trim_end_matches('/').trim().parse::<usize>()
        {
            let data = &filenames.data[offset..];
            // Each filename in the extended filenames field ends with '/\n'.
            // Scanning for '/' to determine the filename end will not work
            // with paths that contain '/', so we scan for '\n' instead.
            let end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
            return &data[..end.saturating_sub(1)];
        }
        self.ident.trim_end_matches('/').as_bytes()
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    /// Builds a GNU-style archive with a symbol index, the way `ar rs` would.
    pub(crate) fn build_archive(members: &[(&str, &[u8], &[&str])]) -> Vec<u8> {
        let mut index_names = Vec::new();
        let mut symbol_count = 0usize;
        for (_, _, symbols) in members {
            for symbol in *symbols {
                index_names.extend_from_slice(symbol.as_bytes());
                index_names.push(0);
                symbol_count += 1;
            }
        }
        let index_len = 4 + symbol_count * 4 + index_names.len();

        // Member header offsets are known once we know the index size.
        let mut offsets = Vec::new();
        let mut next_offset = 8 + 60 + index_len.next_multiple_of(2);
        for (_, data, symbols) in members {
            for _ in *symbols {
                offsets.push(next_offset as u32);
            }
            next_offset += 60 + data.len().next_multiple_of(2);
        }

        let mut index = Vec::with_capacity(index_len);
        index.extend_from_slice(&(symbol_count as u32).to_be_bytes());
        for offset in offsets {
            index.extend_from_slice(&offset.to_be_bytes());
        }
        index.extend_from_slice(&index_names);

        let mut out = object::archive::MAGIC.to_vec();
        push_member(&mut out, "/", &index);
        for (ident, data, _) in members {
            push_member(&mut out, &format!("{ident}/"), data);
        }
        out
    }

    fn push_member(out: &mut Vec<u8>, ident: &str, data: &[u8]) {
        let mut header = [b' '; 60];
        header[..ident.len()].copy_from_slice(ident.as_bytes());
        header[16] = b'0';
        header[28] = b'0';
        header[34] = b'0';
        let mode = b"644";
        header[40..40 + mode.len()].copy_from_slice(mode);
        let size = data.len().to_string();
        header[48..48 + size.len()].copy_from_slice(size.as_bytes());
        header[58] = b'`';
        header[59] = b'\n';
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn iterates_members_and_index() {
        let bytes = test_utils::build_archive(&[
            ("first.o", b"first contents", &["alpha", "beta"]),
            ("second.o", b"second!", &["gamma"]),
        ]);

        let mut members = Vec::new();
        let mut index = None;
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Regular(content) => members.push(content),
                ArchiveEntry::SymbolIndex(symbols) => index = Some(symbols),
                ArchiveEntry::Filenames(_) => {}
            }
        }

        assert_eq!(members.len(), 2);
        assert_eq!(members[0].identifier(None), b"first.o");
        assert_eq!(members[0].entry_data, b"first contents");
        assert_eq!(members[1].entry_data, b"second!");

        let entries = index.unwrap().entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, "alpha");
        assert_eq!(entries[1], ("beta", members[0].header_offset));
        assert_eq!(entries[2], ("gamma", members[1].header_offset));
    }

    #[test]
    fn agrees_with_the_ar_crate() {
        let bytes = test_utils::build_archive(&[
            ("a.o", b"aaaa", &["sym_a"]),
            ("b.o", b"bbbbb", &["sym_b"]),
        ]);

        let mut ar_entries = Vec::new();
        let mut archive = ar::Archive::new(std::io::Cursor::new(&bytes));
        while let Some(entry) = archive.next_entry() {
            let mut entry = entry.unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            ar_entries.push((entry.header().identifier().to_owned(), data));
        }

        let ours: Vec<_> = ArchiveIterator::from_archive_bytes(&bytes)
            .unwrap()
            .filter_map(|entry| match entry.unwrap() {
                ArchiveEntry::Regular(content) => Some(content),
                _ => None,
            })
            .collect();

        assert_eq!(ar_entries.len(), ours.len());
        for (ar_entry, ours) in ar_entries.iter().zip(&ours) {
            assert_eq!(ar_entry.0, ours.identifier(None));
            assert_eq!(ar_entry.1, ours.entry_data);
        }
    }
}
