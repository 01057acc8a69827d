//! Superfluous certificate construction.
//!
//! The tag payload travels inside a dummy X.509 certificate prepended to the
//! PKCS#7 `certificates` SET. The certificate is syntactically valid DER and
//! is never chain-validated, so every field except the payload-carrying
//! extension is a fixed constant. The extension encodes the marker OID
//! immediately followed by an OCTET STRING whose two-byte length doubles as
//! the tag length, giving the locator a constant-size search pattern.

use crate::domain::asn1;
use crate::infra::error::{TagError, TagResult};
use der::Tag;

/// Inclusive payload bounds. The lower bound forces the OCTET STRING length
/// into the two-byte long form, which keeps the search pattern fixed-size.
pub const MIN_TAG_LEN: usize = 0x100;
pub const MAX_TAG_LEN: usize = 0xFFFF;

/// DER encoding of the marker OID 1.3.6.1.4.1.11129.2.1.9999, header
/// included.
pub const MARKER_OID_DER: [u8; 13] = [
    0x06, 0x0B, 0x2B, 0x06, 0x01, 0x04, 0x01, 0xD6, 0x79, 0x02, 0x01, 0xCE, 0x0F,
];

/// The byte pattern the locator scans for: marker OID followed by an OCTET
/// STRING header forced into two-byte length form. The two length bytes and
/// the payload follow directly.
pub const MARKER_PATTERN: [u8; 15] = [
    0x06, 0x0B, 0x2B, 0x06, 0x01, 0x04, 0x01, 0xD6, 0x79, 0x02, 0x01, 0xCE, 0x0F, 0x04, 0x82,
];

/// version [0] EXPLICIT INTEGER 2 (v3)
const VERSION_V3: [u8; 5] = [0xA0, 0x03, 0x02, 0x01, 0x02];

/// serialNumber INTEGER 1
const SERIAL_ONE: [u8; 3] = [0x02, 0x01, 0x01];

/// AlgorithmIdentifier sha256WithRSAEncryption (1.2.840.113549.1.1.11, NULL)
const ALG_SHA256_RSA: [u8; 15] = [
    0x30, 0x0D, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B, 0x05, 0x00,
];

/// Fixed validity window, long expired: 2013-01-01 to 2013-04-01 UTC.
const VALIDITY: [u8; 32] = [
    0x30, 0x1E, // SEQUENCE
    0x17, 0x0D, b'1', b'3', b'0', b'1', b'0', b'1', b'0', b'0', b'0', b'0', b'0', b'0', b'Z',
    0x17, 0x0D, b'1', b'3', b'0', b'4', b'0', b'1', b'0', b'0', b'0', b'0', b'0', b'0', b'Z',
];

/// subjectPublicKeyInfo: rsaEncryption with a 3-bit-equivalent toy key.
/// Verifiers never evaluate it; it only has to parse.
const DUMMY_SPKI: [u8; 28] = [
    0x30, 0x1A, // SEQUENCE
    0x30, 0x0D, // AlgorithmIdentifier
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01, // rsaEncryption
    0x05, 0x00, // NULL
    0x03, 0x09, 0x00, // BIT STRING, no unused bits
    0x30, 0x06, 0x02, 0x01, 0x00, 0x02, 0x01, 0x03, // RSAPublicKey { 0, 3 }
];

/// signatureValue BIT STRING: eight zero bytes.
const DUMMY_SIGNATURE: [u8; 11] = [
    0x03, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Does this certificate carry the marker extension? Used to strip
/// previously injected certificates before inserting a fresh one.
#[must_use]
pub fn contains_marker(cert_der: &[u8]) -> bool {
    cert_der
        .windows(MARKER_OID_DER.len())
        .any(|w| w == MARKER_OID_DER)
}

/// Build the dummy certificate carrying `payload` in its marker extension.
///
/// The payload length must be in `[MIN_TAG_LEN, MAX_TAG_LEN]` so the OCTET
/// STRING length encodes as exactly `0x82 hi lo`.
///
/// # Errors
/// `Unsupported` for out-of-range payloads.
pub fn build_superfluous_cert(payload: &[u8]) -> TagResult<Vec<u8>> {
    if payload.len() < MIN_TAG_LEN || payload.len() > MAX_TAG_LEN {
        return Err(TagError::Unsupported(format!(
            "tag payload length must be in [{MIN_TAG_LEN}, {MAX_TAG_LEN}], got {}",
            payload.len()
        )));
    }

    let name = dummy_name()?;

    // Extension ::= SEQUENCE { extnID, extnValue }. No `critical` field, so
    // the OCTET STRING header follows the OID bytes directly and the marker
    // pattern is contiguous.
    let mut extension_body = Vec::with_capacity(MARKER_OID_DER.len() + payload.len() + 4);
    extension_body.extend_from_slice(&MARKER_OID_DER);
    asn1::emit_into(&mut extension_body, Tag::OctetString, payload)?;
    let extension = asn1::sequence(&extension_body)?;
    let extensions = asn1::context(3, &asn1::sequence(&extension)?)?;

    let mut tbs_body = Vec::with_capacity(extensions.len() + 128);
    tbs_body.extend_from_slice(&VERSION_V3);
    tbs_body.extend_from_slice(&SERIAL_ONE);
    tbs_body.extend_from_slice(&ALG_SHA256_RSA);
    tbs_body.extend_from_slice(&name); // issuer
    tbs_body.extend_from_slice(&VALIDITY);
    tbs_body.extend_from_slice(&name); // subject
    tbs_body.extend_from_slice(&DUMMY_SPKI);
    tbs_body.extend_from_slice(&extensions);
    let tbs = asn1::sequence(&tbs_body)?;

    let mut cert_body = Vec::with_capacity(tbs.len() + ALG_SHA256_RSA.len() + DUMMY_SIGNATURE.len());
    cert_body.extend_from_slice(&tbs);
    cert_body.extend_from_slice(&ALG_SHA256_RSA);
    cert_body.extend_from_slice(&DUMMY_SIGNATURE);
    asn1::sequence(&cert_body)
}

/// RDNSequence with a single CN. Shared by issuer and subject.
fn dummy_name() -> TagResult<Vec<u8>> {
    // AttributeTypeAndValue { 2.5.4.3 (commonName), PrintableString }
    let mut atv_body = vec![0x06, 0x03, 0x55, 0x04, 0x03];
    asn1::emit_into(&mut atv_body, Tag::PrintableString, b"Dummy certificate")?;
    let atv = asn1::sequence(&atv_body)?;
    let rdn = asn1::set(&atv)?;
    asn1::sequence(&rdn)
}
