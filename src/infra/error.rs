//! Error types for tagging operations.
//! One crate-wide enum; every operation returns `TagResult`.

use thiserror::Error;

/// Result type for tagging operations
pub type TagResult<T> = Result<T, TagError>;

/// Error kinds surfaced by the container parsers, the PKCS#7 rewriter and
/// the tag locator.
#[derive(Error, Debug, miette::Diagnostic)]
pub enum TagError {
    #[error("not a supported container: {0}")]
    NotASupportedContainer(String),

    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("no Authenticode signature present")]
    NoSignature,

    #[error("malformed PKCS#7: {0}")]
    MalformedPkcs7(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("tag marker not found: {0}")]
    MarkerNotFound(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<der::Error> for TagError {
    fn from(error: der::Error) -> Self {
        TagError::MalformedPkcs7(error.to_string())
    }
}

impl From<goblin::error::Error> for TagError {
    fn from(error: goblin::error::Error) -> Self {
        TagError::MalformedContainer(error.to_string())
    }
}

impl From<std::io::Error> for TagError {
    fn from(error: std::io::Error) -> Self {
        TagError::IoError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TagError::NotASupportedContainer("bad magic".to_string());
        assert_eq!(error.to_string(), "not a supported container: bad magic");

        let error = TagError::NoSignature;
        assert_eq!(error.to_string(), "no Authenticode signature present");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let tag_err = TagError::from(io_err);
        match tag_err {
            TagError::IoError(msg) => assert!(msg.contains("missing")),
            other => panic!("expected IoError, got {other:?}"),
        }
    }
}
