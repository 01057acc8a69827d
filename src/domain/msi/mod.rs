//! MSI (Windows Installer) domain types and operations.
//!
//! MSI files are OLE Compound Documents (MS-CFB). Unlike PE, where the
//! signature is appended to the image, the PKCS#7 blob lives in a stream
//! named `\x05DigitalSignature`. Tag rewriting patches that one stream and
//! leaves every other sector byte-identical, so the MSI hash computed over
//! the remaining streams still matches the signed digest.

pub mod parse;
pub mod rewrite;

pub use parse::{parse_layout, DirEntry, MsiLayout};

use crate::infra::error::{TagError, TagResult};
use std::io::Cursor;

/// MSI file magic bytes (OLE Compound Document signature)
pub const MSI_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Name of the digital signature stream in MSI files
pub const DIGITAL_SIGNATURE_STREAM: &str = "\u{0005}DigitalSignature";

/// Check if data starts with the MSI/OLE magic signature.
#[must_use]
pub fn is_msi_file(data: &[u8]) -> bool {
    data.len() >= 8 && data[..8] == MSI_MAGIC
}

/// A parsed signed MSI file.
#[derive(Debug)]
pub struct MsiBinary {
    contents: Vec<u8>,
    layout: MsiLayout,
    signature: Vec<u8>,
    signature_offset: usize,
}

impl MsiBinary {
    /// Parse an MSI file and extract its digital-signature stream.
    ///
    /// # Errors
    /// `MalformedContainer` when the CFB structure is broken, `NoSignature`
    /// when no `\x05DigitalSignature` stream exists.
    pub fn parse(contents: Vec<u8>) -> TagResult<Self> {
        // Structural validation through the cfb crate before the surgical
        // parser takes over.
        cfb::CompoundFile::open(Cursor::new(&contents))
            .map_err(|e| TagError::MalformedContainer(format!("CFB validation failed: {e}")))?;

        let layout = parse::parse_layout(&contents)?;
        if layout.signature_index.is_none() {
            return Err(TagError::NoSignature);
        }
        let signature = parse::read_signature_stream(&contents, &layout)?;
        let signature_offset = parse::signature_offset(&layout)?;
        Ok(Self {
            contents,
            layout,
            signature,
            signature_offset,
        })
    }

    /// The raw file bytes.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// The container layout descriptor.
    #[must_use]
    pub fn layout(&self) -> &MsiLayout {
        &self.layout
    }

    /// The PKCS#7 DER from the digital-signature stream.
    #[must_use]
    pub fn asn1_data(&self) -> &[u8] {
        &self.signature
    }

    /// Absolute file offset of the first byte of the signature stream.
    #[must_use]
    pub fn certificate_offset(&self) -> usize {
        self.signature_offset
    }

    /// Produce a new file with the digital-signature stream replaced by
    /// `new_der`. All other sectors round-trip byte-identical.
    pub fn set_asn1_data(&self, new_der: &[u8]) -> TagResult<Vec<u8>> {
        rewrite::set_signature_stream(&self.contents, &self.layout, new_der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_msi_magic() {
        let msi_header = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
        assert!(is_msi_file(&msi_header));

        let pe_header = [0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00];
        assert!(!is_msi_file(&pe_header));
    }

    #[test]
    fn parse_rejects_non_msi() {
        let not_msi = vec![0x4D, 0x5A, 0x00, 0x00];
        assert!(MsiBinary::parse(not_msi).is_err());
    }
}
