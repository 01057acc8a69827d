//! PKCS#7 `SignedData` surgery.
//!
//! Signers emit DER with encoding choices a re-encode would not reproduce,
//! and third-party verifiers can be sensitive to the exact bytes. The
//! rewriter therefore parses only the wrappers on the path to the
//! `certificates [0] IMPLICIT` SET and copies every other field verbatim;
//! the wrapper length prefixes are the only bytes it recomputes.

use crate::domain::asn1::{self, Tlv};
use crate::domain::cert;
use crate::infra::error::{TagError, TagResult};
use der::Tag;

/// DER body of the signedData content type OID 1.2.840.113549.1.7.2.
const SIGNED_DATA_OID_BODY: [u8; 9] = [0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];

/// Borrowed view of the fields of `ContentInfo { signedData }`.
///
/// Every slice is the complete TLV (header included) taken from the input
/// buffer, except `certificates`, which is the *body* of the `[0] IMPLICIT`
/// SET so its elements can be enumerated directly.
#[derive(Debug)]
struct SignedDataView<'a> {
    content_type: &'a [u8],
    version: &'a [u8],
    digest_algorithms: &'a [u8],
    content_info: &'a [u8],
    certificates: Option<&'a [u8]>,
    crls: Option<&'a [u8]>,
    signer_infos: &'a [u8],
}

fn parse_signed_data(pkcs7: &[u8]) -> TagResult<SignedDataView<'_>> {
    // Outer ContentInfo SEQUENCE. Containers pad the blob with zeros, so
    // trailing data after the value is tolerated.
    let outer = Tlv::parse(pkcs7)?;
    outer.expect_tag(Tag::Sequence, "ContentInfo")?;

    let content_type = Tlv::parse(outer.body)?;
    content_type.expect_tag(Tag::ObjectIdentifier, "contentType")?;
    if content_type.body != SIGNED_DATA_OID_BODY {
        return Err(TagError::MalformedPkcs7(
            "contentType is not signedData (1.2.840.113549.1.7.2)".to_string(),
        ));
    }

    let rest = &outer.body[content_type.total_len()..];
    let explicit = Tlv::parse(rest)?;
    if !explicit.is_context(0) {
        return Err(TagError::MalformedPkcs7(format!(
            "expected [0] EXPLICIT content, found {}",
            explicit.tag
        )));
    }

    let signed_data = Tlv::parse(explicit.body)?;
    signed_data.expect_tag(Tag::Sequence, "SignedData")?;

    let mut cursor = signed_data.body;
    let version = Tlv::parse(cursor)?;
    version.expect_tag(Tag::Integer, "SignedData.version")?;
    let version_raw = version.raw(cursor);
    cursor = &cursor[version.total_len()..];

    let digest_algorithms = Tlv::parse(cursor)?;
    digest_algorithms.expect_tag(Tag::Set, "digestAlgorithms")?;
    let digest_algorithms_raw = digest_algorithms.raw(cursor);
    cursor = &cursor[digest_algorithms.total_len()..];

    let content_info = Tlv::parse(cursor)?;
    content_info.expect_tag(Tag::Sequence, "encapContentInfo")?;
    let content_info_raw = content_info.raw(cursor);
    cursor = &cursor[content_info.total_len()..];

    let mut certificates = None;
    let mut crls = None;

    let mut next = Tlv::parse(cursor)?;
    if next.is_context(0) {
        certificates = Some(next.body);
        cursor = &cursor[next.total_len()..];
        next = Tlv::parse(cursor)?;
    }
    if next.is_context(1) {
        crls = Some(next.raw(cursor));
        cursor = &cursor[next.total_len()..];
        next = Tlv::parse(cursor)?;
    }

    next.expect_tag(Tag::Set, "signerInfos")?;
    let signer_infos_raw = next.raw(cursor);
    let trailing = &cursor[next.total_len()..];
    if !trailing.is_empty() {
        return Err(TagError::MalformedPkcs7(format!(
            "{} unexpected bytes after signerInfos",
            trailing.len()
        )));
    }

    Ok(SignedDataView {
        content_type: content_type.raw(outer.body),
        version: version_raw,
        digest_algorithms: digest_algorithms_raw,
        content_info: content_info_raw,
        certificates,
        crls,
        signer_infos: signer_infos_raw,
    })
}

/// Enumerate the certificates of a PKCS#7 blob without decoding them.
/// Each returned slice is one complete Certificate TLV.
pub fn extract_certificates(pkcs7: &[u8]) -> TagResult<Vec<&[u8]>> {
    let view = parse_signed_data(pkcs7)?;
    let Some(body) = view.certificates else {
        return Ok(Vec::new());
    };
    split_certificates(body)
}

fn split_certificates(mut body: &[u8]) -> TagResult<Vec<&[u8]>> {
    let mut certs = Vec::new();
    while !body.is_empty() {
        let tlv = Tlv::parse(body)?;
        tlv.expect_tag(Tag::Sequence, "certificates element")?;
        certs.push(tlv.raw(body));
        body = &body[tlv.total_len()..];
    }
    Ok(certs)
}

/// Produce a new PKCS#7 blob with `new_cert_der` as the first element of the
/// certificates SET. Certificates carrying the tag marker are dropped, so
/// repeated application replaces rather than accumulates; all remaining
/// certificates keep their original order and bytes. A missing certificates
/// SET is created with its `[0] IMPLICIT` tag.
pub fn set_superfluous_cert(pkcs7: &[u8], new_cert_der: &[u8]) -> TagResult<Vec<u8>> {
    let view = parse_signed_data(pkcs7)?;

    let existing = match view.certificates {
        Some(body) => split_certificates(body)?,
        None => Vec::new(),
    };
    let kept: Vec<&[u8]> = existing
        .iter()
        .copied()
        .filter(|c| !cert::contains_marker(c))
        .collect();
    if kept.len() != existing.len() {
        log::debug!(
            "replacing {} previously injected certificate(s)",
            existing.len() - kept.len()
        );
    }

    let mut certs_body =
        Vec::with_capacity(new_cert_der.len() + kept.iter().map(|c| c.len()).sum::<usize>());
    certs_body.extend_from_slice(new_cert_der);
    for c in &kept {
        certs_body.extend_from_slice(c);
    }
    let certificates = asn1::context(0, &certs_body)?;

    let mut sd_body = Vec::with_capacity(
        view.version.len()
            + view.digest_algorithms.len()
            + view.content_info.len()
            + certificates.len()
            + view.crls.map_or(0, <[u8]>::len)
            + view.signer_infos.len(),
    );
    sd_body.extend_from_slice(view.version);
    sd_body.extend_from_slice(view.digest_algorithms);
    sd_body.extend_from_slice(view.content_info);
    sd_body.extend_from_slice(&certificates);
    if let Some(crls) = view.crls {
        sd_body.extend_from_slice(crls);
    }
    sd_body.extend_from_slice(view.signer_infos);

    let signed_data = asn1::sequence(&sd_body)?;
    let explicit = asn1::context(0, &signed_data)?;

    let mut ci_body = Vec::with_capacity(view.content_type.len() + explicit.len());
    ci_body.extend_from_slice(view.content_type);
    ci_body.extend_from_slice(&explicit);
    asn1::sequence(&ci_body)
}
