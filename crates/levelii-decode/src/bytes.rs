//! Checked big-endian reads over untrusted byte buffers.
//!
//! All multi-byte fields in the Archive II format are big-endian. Every
//! structured access into archive bytes goes through these functions or
//! through [`check_block`]; there is no unchecked offset arithmetic
//! anywhere in the decoder.

/// Read a `u8` at `offset`.
#[inline]
pub fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

/// Read a big-endian `u16` at `offset`.
#[inline]
pub fn read_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian `u32` at `offset`.
#[inline]
pub fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a big-endian `i32` at `offset`.
#[inline]
pub fn read_i32_be(buf: &[u8], offset: usize) -> Option<i32> {
    read_u32_be(buf, offset).map(|v| v as i32)
}

/// Read a big-endian IEEE-754 `f32` at `offset`.
#[inline]
pub fn read_f32_be(buf: &[u8], offset: usize) -> Option<f32> {
    read_u32_be(buf, offset).map(f32::from_bits)
}

/// Validate a data-block pointer before dereferencing it.
///
/// Returns true iff `offset != 0` and `offset + required_size` fits in
/// the payload (overflow-safe). Offset zero is the format's null
/// pointer.
#[inline]
pub fn check_block(offset: usize, required_size: usize, payload_size: usize) -> bool {
    if offset == 0 || offset > payload_size {
        return false;
    }
    match offset.checked_add(required_size) {
        Some(end) => end <= payload_size,
        None => false,
    }
}
