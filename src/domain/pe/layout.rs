//! PE header walk and `WIN_CERTIFICATE` table parsing.
//!
//! goblin validates the overall image; every offset that feeds the byte
//! rewriter is computed by hand from the header bytes so writes stay exact.

use crate::domain::pe::APPENDED_TAG_MAGIC;
use crate::infra::error::{TagError, TagResult};
use goblin::pe::PE;
use std::ops::Range;

/// wCertificateType for a PKCS#7 SignedData blob.
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;

/// Accepted wRevision values for the signed entry.
pub const WIN_CERT_REVISION_1_0: u16 = 0x0100;
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;

/// Entries in the Attribute Certificate Table are 8-byte aligned.
#[must_use]
pub fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// One `WIN_CERTIFICATE` header and the location of its data.
#[derive(Debug, Clone)]
pub struct WinCertEntry {
    /// File offset of the 8-byte header.
    pub offset: usize,
    /// dwLength: header plus data (plus alignment, as signers emit it).
    pub dw_length: u32,
    /// wRevision.
    pub revision: u16,
    /// wCertificateType.
    pub cert_type: u16,
}

impl WinCertEntry {
    /// File offset just past this entry, 8-byte alignment applied and
    /// clamped to the file end for an unpadded final entry.
    #[must_use]
    pub fn end(&self, file_len: usize) -> usize {
        (self.offset + align8(self.dw_length as usize)).min(file_len)
    }
}

/// Offsets and sizes describing a signed PE image.
#[derive(Debug, Clone)]
pub struct PeLayout {
    /// Offset of the `PE\0\0` signature.
    pub pe_offset: usize,
    /// Optional-header magic was 0x20B.
    pub is_pe32_plus: bool,
    /// Offset of the optional-header CheckSum field.
    pub checksum_offset: usize,
    /// Offset of data directory entry 4 (Certificate Table).
    pub cert_dir_entry_offset: usize,
    /// Certificate Table file offset from the directory entry.
    pub cert_table_offset: usize,
    /// Certificate Table size from the directory entry.
    pub cert_table_size: usize,
    /// All parsed `WIN_CERTIFICATE` entries, in file order.
    pub entries: Vec<WinCertEntry>,
    /// Index into `entries` of the PKCS_SIGNED_DATA entry.
    pub signed_entry: usize,
    /// End of the last entry (aligned); the appended region starts here.
    pub attr_certs_end: usize,
    /// Body range of the appended tag, when present.
    pub appended_tag: Option<Range<usize>>,
}

impl PeLayout {
    /// The PKCS_SIGNED_DATA entry.
    #[must_use]
    pub fn signed(&self) -> &WinCertEntry {
        &self.entries[self.signed_entry]
    }

    /// File range of the PKCS#7 payload (dwLength minus the 8-byte header).
    #[must_use]
    pub fn asn1_range(&self) -> Range<usize> {
        let entry = self.signed();
        entry.offset + 8..entry.offset + entry.dw_length as usize
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parse a signed PE image into its layout descriptor.
///
/// # Errors
/// `MalformedContainer` for structural problems, `NoSignature` when the
/// Certificate Table is empty.
pub fn parse_layout(data: &[u8]) -> TagResult<PeLayout> {
    if data.len() < 0x40 {
        return Err(TagError::MalformedContainer(format!(
            "file too small for DOS header ({} bytes)",
            data.len()
        )));
    }
    if data[0..2] != *b"MZ" {
        return Err(TagError::MalformedContainer(
            "missing MZ signature".to_string(),
        ));
    }

    // Structural validation through goblin. Attribute certificate parsing is
    // disabled: the appended tag lives inside the directory's size range and
    // is not a WIN_CERTIFICATE entry.
    let mut opts = goblin::pe::options::ParseOptions::default();
    opts.parse_attribute_certificates = false;
    let pe = PE::parse_with_opts(data, &opts)
        .map_err(|e| TagError::MalformedContainer(format!("PE parse failed: {e}")))?;

    let pe_offset = read_u32(data, 0x3C) as usize;
    if pe_offset + 4 + 20 + 2 > data.len() {
        return Err(TagError::MalformedContainer(
            "PE header pointer out of range".to_string(),
        ));
    }
    if data[pe_offset..pe_offset + 4] != *b"PE\0\0" {
        return Err(TagError::MalformedContainer(
            "missing PE signature".to_string(),
        ));
    }

    // Optional header follows the 4-byte signature and 20-byte COFF header.
    let optional_header_offset = pe_offset + 24;
    let magic = read_u16(data, optional_header_offset);
    let is_pe32_plus = match magic {
        0x10B => false,
        0x20B => true,
        _ => {
            return Err(TagError::MalformedContainer(format!(
                "unknown optional header magic 0x{magic:04x}"
            )))
        }
    };
    if is_pe32_plus != pe.is_64 {
        return Err(TagError::MalformedContainer(
            "optional header magic disagrees with image class".to_string(),
        ));
    }

    let checksum_offset = optional_header_offset + 64;

    // Data directories: 96 bytes into the optional header for PE32, 112 for
    // PE32+ (BaseOfData omitted, widened 64-bit fields). The Certificate
    // Table is directory index 4, and unlike the others its first word is a
    // file offset, not an RVA.
    let data_directories_offset = optional_header_offset + if is_pe32_plus { 112 } else { 96 };
    let cert_dir_entry_offset = data_directories_offset + 4 * 8;
    if cert_dir_entry_offset + 8 > data.len() {
        return Err(TagError::MalformedContainer(
            "certificate directory entry out of bounds".to_string(),
        ));
    }

    let cert_table_offset = read_u32(data, cert_dir_entry_offset) as usize;
    let cert_table_size = read_u32(data, cert_dir_entry_offset + 4) as usize;
    if cert_table_offset == 0 || cert_table_size == 0 {
        return Err(TagError::NoSignature);
    }
    let table_end = cert_table_offset
        .checked_add(cert_table_size)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            TagError::MalformedContainer(
                "certificate table extends past end of file".to_string(),
            )
        })?;
    if !cert_table_offset.is_multiple_of(8) {
        log::warn!("certificate table starts at unaligned offset {cert_table_offset}");
    }

    let entries = parse_entries(data, cert_table_offset, table_end)?;
    let signed: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.cert_type == WIN_CERT_TYPE_PKCS_SIGNED_DATA)
        .map(|(i, _)| i)
        .collect();
    let signed_entry = match signed.as_slice() {
        [] => return Err(TagError::NoSignature),
        [index] => *index,
        _ => {
            return Err(TagError::MalformedContainer(format!(
                "{} PKCS_SIGNED_DATA certificate entries, expected exactly one",
                signed.len()
            )))
        }
    };
    let revision = entries[signed_entry].revision;
    if revision != WIN_CERT_REVISION_1_0 && revision != WIN_CERT_REVISION_2_0 {
        return Err(TagError::MalformedContainer(format!(
            "unsupported WIN_CERTIFICATE revision 0x{revision:04x}"
        )));
    }

    let attr_certs_end = entries
        .last()
        .map_or(table_end, |entry| entry.end(data.len()));
    let appended_tag = parse_appended_tag(data, attr_certs_end);

    Ok(PeLayout {
        pe_offset,
        is_pe32_plus,
        checksum_offset,
        cert_dir_entry_offset,
        cert_table_offset,
        cert_table_size,
        entries,
        signed_entry,
        attr_certs_end,
        appended_tag,
    })
}

fn parse_entries(
    data: &[u8],
    table_offset: usize,
    table_end: usize,
) -> TagResult<Vec<WinCertEntry>> {
    let mut entries = Vec::new();
    let mut pos = table_offset;
    while pos + 8 <= table_end {
        // The appended tag sits inside the directory's size range; its magic
        // marks the end of the real entries.
        if data[pos..pos + 4] == APPENDED_TAG_MAGIC {
            break;
        }
        let dw_length = read_u32(data, pos);
        let revision = read_u16(data, pos + 4);
        let cert_type = read_u16(data, pos + 6);
        if (dw_length as usize) < 8 || pos + dw_length as usize > table_end {
            return Err(TagError::MalformedContainer(format!(
                "WIN_CERTIFICATE at {pos} has inconsistent dwLength {dw_length}"
            )));
        }
        let entry = WinCertEntry {
            offset: pos,
            dw_length,
            revision,
            cert_type,
        };
        pos = entry.end(data.len());
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_appended_tag(data: &[u8], attr_certs_end: usize) -> Option<Range<usize>> {
    let region = &data[attr_certs_end..];
    if region.len() < 8 || region[0..4] != APPENDED_TAG_MAGIC {
        return None;
    }
    let body_len = read_u32(region, 4) as usize;
    if 8 + body_len != region.len() {
        log::warn!(
            "appended tag length {} disagrees with region size {}; ignoring tag",
            body_len,
            region.len() - 8
        );
        return None;
    }
    Some(attr_certs_end + 8..attr_certs_end + 8 + body_len)
}
