//! Minimal DER read/write layer.
//!
//! The PKCS#7 rewriter must not re-encode structures it does not touch, so
//! this module parses only TLV headers and keeps every body as an opaque
//! byte slice. Re-emitted wrappers always use canonical definite lengths
//! (short form up to 127, otherwise minimal long form), which the `der`
//! crate guarantees. Indefinite (BER) lengths are rejected.

use crate::infra::error::{TagError, TagResult};
use der::{Decode, Encode, Header, Length, Reader, SliceReader, Tag, TagNumber};

/// A parsed TLV: the decoded tag, the header size and the body slice.
/// The bytes following the TLV are not part of it; use [`Tlv::total_len`]
/// to step over it.
#[derive(Debug, Clone, Copy)]
pub struct Tlv<'a> {
    pub tag: Tag,
    pub header_len: usize,
    pub body: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Parse one TLV starting at `bytes[0]`. Trailing data after the value
    /// is permitted and ignored.
    pub fn parse(bytes: &'a [u8]) -> TagResult<Self> {
        let mut reader = SliceReader::new(bytes)?;
        let header = Header::decode(&mut reader)?;
        let header_len = u32::from(reader.position()) as usize;
        let body_len = u32::from(header.length) as usize;
        let end = header_len
            .checked_add(body_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                TagError::MalformedPkcs7(format!(
                    "TLV body ({body_len} bytes) extends past available data ({} bytes)",
                    bytes.len()
                ))
            })?;
        Ok(Tlv {
            tag: header.tag,
            header_len,
            body: &bytes[header_len..end],
        })
    }

    /// Total encoded size: header plus body.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.header_len + self.body.len()
    }

    /// The raw bytes of this TLV within `bytes`, header included.
    /// `bytes` must be the slice this TLV was parsed from.
    #[must_use]
    pub fn raw<'b>(&self, bytes: &'b [u8]) -> &'b [u8] {
        &bytes[..self.total_len()]
    }

    /// True if this is a constructed context-specific tag with number `n`.
    #[must_use]
    pub fn is_context(&self, n: u8) -> bool {
        matches!(
            self.tag,
            Tag::ContextSpecific { number, .. } if number == TagNumber::new(n)
        )
    }

    /// Require a specific tag, or fail with `MalformedPkcs7`.
    pub fn expect_tag(&self, expected: Tag, what: &str) -> TagResult<()> {
        if self.tag == expected {
            Ok(())
        } else {
            Err(TagError::MalformedPkcs7(format!(
                "expected {expected} for {what}, found {}",
                self.tag
            )))
        }
    }
}

/// Append one TLV with the given tag and body to `out`, using a canonical
/// length encoding.
pub fn emit_into(out: &mut Vec<u8>, tag: Tag, body: &[u8]) -> TagResult<()> {
    tag.encode_to_vec(out)?;
    Length::try_from(body.len())?.encode_to_vec(out)?;
    out.extend_from_slice(body);
    Ok(())
}

/// Emit one TLV with the given tag and body.
pub fn emit(tag: Tag, body: &[u8]) -> TagResult<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() + 8);
    emit_into(&mut out, tag, body)?;
    Ok(out)
}

/// Emit a SEQUENCE.
pub fn sequence(body: &[u8]) -> TagResult<Vec<u8>> {
    emit(Tag::Sequence, body)
}

/// Emit a SET.
pub fn set(body: &[u8]) -> TagResult<Vec<u8>> {
    emit(Tag::Set, body)
}

/// Emit an OCTET STRING.
pub fn octet_string(body: &[u8]) -> TagResult<Vec<u8>> {
    emit(Tag::OctetString, body)
}

/// Emit a constructed context-specific tag `[n]`.
pub fn context(n: u8, body: &[u8]) -> TagResult<Vec<u8>> {
    emit(
        Tag::ContextSpecific {
            constructed: true,
            number: TagNumber::new(n),
        },
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_short_form() {
        let bytes = [0x30, 0x03, 0x02, 0x01, 0x05, 0xFF];
        let tlv = Tlv::parse(&bytes).unwrap();
        assert_eq!(tlv.tag, Tag::Sequence);
        assert_eq!(tlv.header_len, 2);
        assert_eq!(tlv.body, &[0x02, 0x01, 0x05]);
        assert_eq!(tlv.total_len(), 5);
    }

    #[test]
    fn parse_long_form() {
        let mut bytes = vec![0x04, 0x82, 0x01, 0x00];
        bytes.extend_from_slice(&[0xAA; 256]);
        let tlv = Tlv::parse(&bytes).unwrap();
        assert_eq!(tlv.tag, Tag::OctetString);
        assert_eq!(tlv.header_len, 4);
        assert_eq!(tlv.body.len(), 256);
    }

    #[test]
    fn rejects_indefinite_length() {
        let bytes = [0x30, 0x80, 0x02, 0x01, 0x05, 0x00, 0x00];
        let err = Tlv::parse(&bytes).unwrap_err();
        assert!(matches!(err, TagError::MalformedPkcs7(_)));
    }

    #[test]
    fn rejects_truncated_body() {
        let bytes = [0x30, 0x10, 0x02, 0x01];
        let err = Tlv::parse(&bytes).unwrap_err();
        assert!(matches!(err, TagError::MalformedPkcs7(_)));
    }

    #[test]
    fn emit_picks_canonical_lengths() {
        assert_eq!(octet_string(&[0u8; 3]).unwrap()[..2], [0x04, 0x03]);
        assert_eq!(octet_string(&[0u8; 127]).unwrap()[..2], [0x04, 0x7F]);
        assert_eq!(octet_string(&[0u8; 128]).unwrap()[..3], [0x04, 0x81, 0x80]);
        assert_eq!(
            octet_string(&[0u8; 256]).unwrap()[..4],
            [0x04, 0x82, 0x01, 0x00]
        );
    }

    #[test]
    fn context_tag_octets() {
        let ctx0 = context(0, &[0x05, 0x00]).unwrap();
        assert_eq!(ctx0, vec![0xA0, 0x02, 0x05, 0x00]);
        let ctx1 = context(1, &[]).unwrap();
        assert_eq!(ctx1, vec![0xA1, 0x00]);
    }

    #[test]
    fn emit_parse_round_trip() {
        let body = vec![0x13u8; 200];
        let enc = sequence(&body).unwrap();
        let tlv = Tlv::parse(&enc).unwrap();
        assert_eq!(tlv.tag, Tag::Sequence);
        assert_eq!(tlv.body, &body[..]);
        assert_eq!(tlv.total_len(), enc.len());
    }
}
