//! Locate an injected superfluous-cert payload in produced file bytes.

use crate::domain::cert::MARKER_PATTERN;
use crate::infra::error::{TagError, TagResult};

/// Scan `contents` from `start` (the PKCS#7 blob offset) for the marker
/// pattern and return the absolute offset of the first payload byte and the
/// payload length taken from the two length bytes after the pattern.
///
/// # Errors
/// `MarkerNotFound` unless exactly one match exists; `MalformedContainer`
/// when the advertised payload extends past the end of the buffer.
pub fn find_tag(contents: &[u8], start: usize) -> TagResult<(usize, usize)> {
    if start > contents.len() {
        return Err(TagError::MalformedContainer(format!(
            "search start {start} is past the end of the file ({} bytes)",
            contents.len()
        )));
    }

    let haystack = &contents[start..];
    let mut matches = haystack
        .windows(MARKER_PATTERN.len())
        .enumerate()
        .filter(|(_, w)| *w == MARKER_PATTERN)
        .map(|(i, _)| i);

    let pos = match (matches.next(), matches.next()) {
        (None, _) => {
            return Err(TagError::MarkerNotFound(
                "no superfluous cert tag marker in file".to_string(),
            ))
        }
        (Some(_), Some(_)) => {
            return Err(TagError::MarkerNotFound(
                "multiple tag markers in file".to_string(),
            ))
        }
        (Some(pos), None) => pos,
    };

    let len_offset = start + pos + MARKER_PATTERN.len();
    let payload_offset = len_offset + 2;
    if payload_offset > contents.len() {
        return Err(TagError::MalformedContainer(
            "tag marker truncated before its length bytes".to_string(),
        ));
    }
    let length = 256 * usize::from(contents[len_offset]) + usize::from(contents[len_offset + 1]);
    if payload_offset + length > contents.len() {
        return Err(TagError::MalformedContainer(format!(
            "tag payload ({length} bytes at {payload_offset}) extends past end of file"
        )));
    }

    Ok((payload_offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_marker_at(prefix_len: usize, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x5Au8; prefix_len];
        buf.extend_from_slice(&MARKER_PATTERN);
        buf.push((payload.len() >> 8) as u8);
        buf.push((payload.len() & 0xFF) as u8);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn finds_single_marker() {
        let payload = vec![0xC3u8; 300];
        let buf = with_marker_at(64, &payload);
        let (offset, len) = find_tag(&buf, 0).unwrap();
        assert_eq!(len, 300);
        assert_eq!(&buf[offset..offset + len], &payload[..]);
    }

    #[test]
    fn respects_search_start() {
        let payload = vec![1u8; 256];
        let buf = with_marker_at(128, &payload);
        assert!(find_tag(&buf, 100).is_ok());
        assert!(matches!(
            find_tag(&buf, 200),
            Err(TagError::MarkerNotFound(_))
        ));
    }

    #[test]
    fn no_marker_is_an_error() {
        let buf = vec![0u8; 512];
        assert!(matches!(find_tag(&buf, 0), Err(TagError::MarkerNotFound(_))));
    }

    #[test]
    fn multiple_markers_are_an_error() {
        let mut buf = with_marker_at(16, &[0xAA; 256]);
        let second = with_marker_at(0, &[0xBB; 256]);
        buf.extend_from_slice(&second);
        assert!(matches!(find_tag(&buf, 0), Err(TagError::MarkerNotFound(_))));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut buf = with_marker_at(0, &[0xCC; 256]);
        buf.truncate(buf.len() - 10);
        assert!(matches!(
            find_tag(&buf, 0),
            Err(TagError::MalformedContainer(_))
        ));
    }

    #[test]
    fn start_past_end_is_malformed() {
        let buf = vec![0u8; 8];
        assert!(matches!(
            find_tag(&buf, 9),
            Err(TagError::MalformedContainer(_))
        ));
    }
}
