//! In-place ULEB128 patching.
//!
//! Some relocations target a ULEB128-encoded field whose length was fixed by
//! the assembler. We must re-encode the new value in exactly the same number
//! of bytes, padding with continuation bytes if the value is short.

use anyhow::Result;
use anyhow::bail;

/// Decode the ULEB128 value at the start of `bytes`, returning the value and
/// its encoded length.
pub fn read_uleb(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut reader = bytes;
    let value = leb128::read::unsigned(&mut reader)?;
    Ok((value, bytes.len() - reader.len()))
}

/// Encode `value` into exactly `len` bytes at the start of `dest`.
pub fn overwrite_uleb(dest: &mut [u8], len: usize, mut value: u64) -> Result<()> {
    for i in 0..len {
        let last = i + 1 == len;
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if !last {
            byte |= 0x80;
        }
        dest[i] = byte;
    }
    if value != 0 {
        bail!("ULEB128 value does not fit in {len} bytes");
    }
    Ok(())
}
