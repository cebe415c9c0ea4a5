//! Little-endian helpers for patching instruction and data bytes in place.

#[must_use]
pub fn read_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes(*data.first_chunk::<2>().unwrap())
}

#[must_use]
pub fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes(*data.first_chunk::<4>().unwrap())
}

#[must_use]
pub fn read_u64(data: &[u8]) -> u64 {
    u64::from_le_bytes(*data.first_chunk::<8>().unwrap())
}

pub fn write_u16(dest: &mut [u8], value: u16) {
    dest[..2].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u32(dest: &mut [u8], value: u32) {
    dest[..4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u64(dest: &mut [u8], value: u64) {
    dest[..8].copy_from_slice(&value.to_le_bytes());
}

/// Add `value` to the byte already stored at the site.
pub fn add_u8(dest: &mut [u8], value: u64) {
    dest[0] = dest[0].wrapping_add(value as u8);
}

/// Add `value` to the 16-bit little-endian word already stored at the site.
pub fn add_u16(dest: &mut [u8], value: u64) {
    write_u16(dest, read_u16(dest).wrapping_add(value as u16));
}

/// Add `value` to the 32-bit little-endian word already stored at the site.
pub fn add_u32(dest: &mut [u8], value: u64) {
    write_u32(dest, read_u32(dest).wrapping_add(value as u32));
}

/// Add `value` to the 64-bit little-endian word already stored at the site.
pub fn add_u64(dest: &mut [u8], value: u64) {
    write_u64(dest, read_u64(dest).wrapping_add(value));
}

/// OR `mask` into the 32-bit little-endian word already stored at the site.
pub fn or_u32(dest: &mut [u8], mask: u32) {
    write_u32(dest, read_u32(dest) | mask);
}
