//! Byte-level PE rewriting for tag operations.
//!
//! Every operation builds the complete output buffer, then repairs the
//! Certificate Table directory size and the optional-header checksum. The
//! checksum is recomputed only when the input carried a non-zero one; a
//! zero field stays zero so unsigned-checksum binaries round-trip.

use crate::domain::pe::layout::{align8, PeLayout};
use crate::domain::pe::{checksum, APPENDED_TAG_MAGIC};
use crate::infra::error::{TagError, TagResult};

/// Replace the PKCS#7 payload of the signed `WIN_CERTIFICATE`, keeping any
/// following entries and the appended region verbatim.
pub fn set_asn1_data(data: &[u8], layout: &PeLayout, new_der: &[u8]) -> TagResult<Vec<u8>> {
    let entry = layout.signed();
    let new_dw_length = align8(8 + new_der.len());
    let new_dw_length = u32::try_from(new_dw_length).map_err(|_| {
        TagError::MalformedContainer("replacement PKCS#7 too large for WIN_CERTIFICATE".to_string())
    })?;

    let mut out = Vec::with_capacity(data.len() + new_der.len());
    out.extend_from_slice(&data[..entry.offset]);
    out.extend_from_slice(&new_dw_length.to_le_bytes());
    out.extend_from_slice(&entry.revision.to_le_bytes());
    out.extend_from_slice(&entry.cert_type.to_le_bytes());
    out.extend_from_slice(new_der);
    out.resize(entry.offset + new_dw_length as usize, 0);
    out.extend_from_slice(&data[entry.end(data.len())..]);

    log::debug!(
        "rewrote WIN_CERTIFICATE: dwLength {} -> {new_dw_length}",
        entry.dw_length
    );
    finish(&mut out, data, layout)?;
    Ok(out)
}

/// Replace everything after the certificate entries with a fresh appended
/// tag: `Gact` magic, little-endian body length, body.
pub fn set_appended_tag(data: &[u8], layout: &PeLayout, tag_body: &[u8]) -> TagResult<Vec<u8>> {
    let body_len = u32::try_from(tag_body.len())
        .map_err(|_| TagError::Unsupported("appended tag body too large".to_string()))?;

    let mut out = Vec::with_capacity(layout.attr_certs_end + 8 + tag_body.len());
    out.extend_from_slice(&data[..layout.attr_certs_end]);
    out.extend_from_slice(&APPENDED_TAG_MAGIC);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(tag_body);

    finish(&mut out, data, layout)?;
    Ok(out)
}

/// Truncate the file at the end of the certificate entries, dropping the
/// appended region. Without one this reduces to a directory/checksum
/// refresh and returns the input bytes unchanged.
pub fn remove_appended_tag(data: &[u8], layout: &PeLayout) -> TagResult<Vec<u8>> {
    let mut out = data[..layout.attr_certs_end].to_vec();
    finish(&mut out, data, layout)?;
    Ok(out)
}

/// Repair the directory size and checksum after a rewrite. The table runs
/// to end-of-file, so its size is everything from the table offset on.
fn finish(out: &mut Vec<u8>, original: &[u8], layout: &PeLayout) -> TagResult<()> {
    let new_size = u32::try_from(out.len() - layout.cert_table_offset).map_err(|_| {
        TagError::MalformedContainer("certificate table size overflow".to_string())
    })?;
    out[layout.cert_dir_entry_offset + 4..layout.cert_dir_entry_offset + 8]
        .copy_from_slice(&new_size.to_le_bytes());

    let offset = layout.checksum_offset;
    let had_checksum = u32::from_le_bytes([
        original[offset],
        original[offset + 1],
        original[offset + 2],
        original[offset + 3],
    ]) != 0;
    if had_checksum {
        checksum::update(out, offset)?;
    }
    Ok(())
}
