//! Container dispatch and the tag-operation facade.
//!
//! `Binary` detects the container by leading magic and routes each
//! operation to the PE or MSI implementation. Every write produces a fresh
//! byte buffer; the parsed binary itself is never mutated.

use crate::domain::cert;
use crate::domain::locator;
use crate::domain::msi::{self, MsiBinary};
use crate::domain::pe::{self, PeBinary};
use crate::domain::pkcs7;
use crate::infra::error::{TagError, TagResult};

/// A parsed Authenticode-signed binary, PE or MSI.
#[derive(Debug)]
pub enum Binary {
    Pe(PeBinary),
    Msi(MsiBinary),
}

impl Binary {
    /// Parse a signed binary, dispatching on the leading magic bytes.
    ///
    /// # Errors
    /// `NotASupportedContainer` when the magic is neither `MZ` nor the
    /// MS-CFB signature; container-specific errors otherwise.
    pub fn parse(contents: Vec<u8>) -> TagResult<Self> {
        // The CFB signature is longer and more specific, so it goes first.
        if msi::is_msi_file(&contents) {
            log::debug!("detected MSI container");
            return Ok(Binary::Msi(MsiBinary::parse(contents)?));
        }
        if pe::is_pe_file(&contents) {
            log::debug!("detected PE container");
            return Ok(Binary::Pe(PeBinary::parse(contents)?));
        }
        Err(TagError::NotASupportedContainer(
            "leading bytes are neither MZ nor an OLE compound document".to_string(),
        ))
    }

    /// The raw bytes the binary was parsed from.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        match self {
            Binary::Pe(pe) => pe.contents(),
            Binary::Msi(msi) => msi.contents(),
        }
    }

    /// The PKCS#7 blob of the signature.
    #[must_use]
    pub fn asn1_data(&self) -> &[u8] {
        match self {
            Binary::Pe(pe) => pe.asn1_data(),
            Binary::Msi(msi) => msi.asn1_data(),
        }
    }

    /// Absolute file offset of the PKCS#7 blob.
    #[must_use]
    pub fn certificate_offset(&self) -> usize {
        match self {
            Binary::Pe(pe) => pe.certificate_offset(),
            Binary::Msi(msi) => msi.certificate_offset(),
        }
    }

    /// The appended tag body, when present. MSI containers never carry one.
    #[must_use]
    pub fn appended_tag(&self) -> Option<&[u8]> {
        match self {
            Binary::Pe(pe) => pe.appended_tag(),
            Binary::Msi(_) => None,
        }
    }

    /// Replace the appended tag. PE only.
    ///
    /// # Errors
    /// `Unsupported` for MSI containers.
    pub fn set_appended_tag(&self, tag_body: &[u8]) -> TagResult<Vec<u8>> {
        match self {
            Binary::Pe(pe) => pe.set_appended_tag(tag_body),
            Binary::Msi(_) => Err(TagError::Unsupported(
                "appended tags are not supported for MSI files".to_string(),
            )),
        }
    }

    /// Remove the appended tag. PE only.
    ///
    /// # Errors
    /// `Unsupported` for MSI containers.
    pub fn remove_appended_tag(&self) -> TagResult<Vec<u8>> {
        match self {
            Binary::Pe(pe) => pe.remove_appended_tag(),
            Binary::Msi(_) => Err(TagError::Unsupported(
                "appended tags are not supported for MSI files".to_string(),
            )),
        }
    }

    /// Embed `payload` in a superfluous certificate, replacing any
    /// previously injected one, and re-emit the container.
    ///
    /// # Errors
    /// `Unsupported` for payload lengths outside [256, 65535];
    /// `MarkerNotFound` when the produced bytes do not contain exactly one
    /// marker.
    pub fn set_superfluous_cert_tag(&self, payload: &[u8]) -> TagResult<Vec<u8>> {
        let new_cert = cert::build_superfluous_cert(payload)?;
        let new_pkcs7 = pkcs7::set_superfluous_cert(self.asn1_data(), &new_cert)?;
        let out = match self {
            Binary::Pe(pe) => pe.set_asn1_data(&new_pkcs7)?,
            Binary::Msi(msi) => msi.set_asn1_data(&new_pkcs7)?,
        };

        // The marker must be findable, and findable exactly once, in the
        // bytes we are about to hand back.
        let (offset, length) = locator::find_tag(&out, self.certificate_offset())?;
        log::debug!("superfluous cert tag written at {offset} ({length} bytes)");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_magic_is_not_a_supported_container() {
        let err = Binary::parse(vec![0x7F, b'E', b'L', b'F', 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, TagError::NotASupportedContainer(_)));
    }

    #[test]
    fn empty_input_is_not_a_supported_container() {
        let err = Binary::parse(Vec::new()).unwrap_err();
        assert!(matches!(err, TagError::NotASupportedContainer(_)));
    }
}
