//! PE (Portable Executable) domain types and operations.
//!
//! The Attribute Certificate Table lives at the end of a signed PE and is
//! excluded from the Authenticode hash, which is what makes both tag
//! placements editable after signing:
//! - the PKCS#7 blob inside the single `WIN_CERTIFICATE` entry, and
//! - the appended tag region between that entry and end-of-file.

pub mod checksum;
pub mod layout;
pub mod write;

pub use layout::{parse_layout, PeLayout, WinCertEntry};

use crate::infra::error::TagResult;

/// Magic prefix of the appended-tag region: `Gact` plus a little-endian
/// length of the body that follows.
pub const APPENDED_TAG_MAGIC: [u8; 4] = *b"Gact";

/// Check if data starts with the DOS `MZ` magic.
#[must_use]
pub fn is_pe_file(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == *b"MZ"
}

/// A parsed signed PE image.
#[derive(Debug)]
pub struct PeBinary {
    contents: Vec<u8>,
    layout: PeLayout,
}

impl PeBinary {
    /// Parse a signed PE image.
    ///
    /// # Errors
    /// `NoSignature` when the Certificate Table directory entry is empty,
    /// `MalformedContainer` on structural problems.
    pub fn parse(contents: Vec<u8>) -> TagResult<Self> {
        let layout = layout::parse_layout(&contents)?;
        Ok(Self { contents, layout })
    }

    /// The raw file bytes.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// The container layout descriptor.
    #[must_use]
    pub fn layout(&self) -> &PeLayout {
        &self.layout
    }

    /// The PKCS#7 payload of the signed `WIN_CERTIFICATE` entry, trailing
    /// alignment zeros included.
    #[must_use]
    pub fn asn1_data(&self) -> &[u8] {
        &self.contents[self.layout.asn1_range()]
    }

    /// Absolute file offset of the PKCS#7 blob.
    #[must_use]
    pub fn certificate_offset(&self) -> usize {
        self.layout.asn1_range().start
    }

    /// The appended tag body, if one is present after the certificate
    /// entries.
    #[must_use]
    pub fn appended_tag(&self) -> Option<&[u8]> {
        self.layout
            .appended_tag
            .clone()
            .map(|range| &self.contents[range])
    }

    /// Replace the PKCS#7 blob, preserving any appended tag.
    pub fn set_asn1_data(&self, new_der: &[u8]) -> TagResult<Vec<u8>> {
        write::set_asn1_data(&self.contents, &self.layout, new_der)
    }

    /// Replace everything after the certificate entries with a fresh
    /// appended tag.
    pub fn set_appended_tag(&self, tag_body: &[u8]) -> TagResult<Vec<u8>> {
        write::set_appended_tag(&self.contents, &self.layout, tag_body)
    }

    /// Drop the appended tag region, restoring the bare certificate table.
    pub fn remove_appended_tag(&self) -> TagResult<Vec<u8>> {
        write::remove_appended_tag(&self.contents, &self.layout)
    }
}
