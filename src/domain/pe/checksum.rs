//! Windows PE checksum.
//!
//! Sum of little-endian 16-bit words with end-around carry, the 4-byte
//! CheckSum field treated as zero, plus the file length. Matches the value
//! imagehlp's `CheckSumMappedFile` computes.

use crate::infra::error::{TagError, TagResult};

/// Compute the checksum of `data` with the checksum field at
/// `checksum_offset` treated as zero.
#[must_use]
pub fn calculate(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    let mut offset: usize = 0;
    let len = data.len();

    while offset + 1 < len {
        if offset != checksum_offset && offset != checksum_offset + 2 {
            let word = u32::from(u16::from_le_bytes([data[offset], data[offset + 1]]));
            sum = sum.wrapping_add(word);
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        offset += 2;
    }

    // A trailing odd byte is summed as a zero-extended word. Signed PE files
    // are 8-byte aligned here, but the fold must not depend on that.
    if offset < len && !(checksum_offset..checksum_offset + 4).contains(&offset) {
        sum = sum.wrapping_add(u32::from(data[offset]));
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum = (sum & 0xFFFF) + (sum >> 16);
    sum.wrapping_add(len as u32)
}

/// Recompute the checksum and store it at `checksum_offset`.
///
/// # Errors
/// `MalformedContainer` when the field does not fit in `data`.
pub fn update(data: &mut [u8], checksum_offset: usize) -> TagResult<()> {
    if checksum_offset + 4 > data.len() {
        return Err(TagError::MalformedContainer(
            "checksum offset exceeds file size".to_string(),
        ));
    }
    let new_checksum = calculate(data, checksum_offset);
    data[checksum_offset..checksum_offset + 4].copy_from_slice(&new_checksum.to_le_bytes());
    Ok(())
}
