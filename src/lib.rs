//! Certificate Tag
//!
//! Manipulates "tags" in Authenticode-signed Windows binaries (PE and MSI)
//! without invalidating their signatures. Two placements are supported:
//!
//! - an **appended tag** after the PKCS#7 blob inside the PE Attribute
//!   Certificate Table, outside the Authenticode hash, and
//! - a **superfluous certificate tag**: a dummy X.509 certificate carrying
//!   the payload, prepended to the PKCS#7 `certificates` SET, likewise
//!   outside the hash and immune to certificate-padding checks.
//!
//! The core is pure: each operation maps an input buffer (plus an optional
//! payload) to an output buffer. File I/O lives in the CLI binary.

pub mod domain;
pub mod infra;
pub mod services;

pub use domain::cert::{MAX_TAG_LEN, MIN_TAG_LEN};
pub use domain::locator::find_tag;
pub use infra::error::{TagError, TagResult};
pub use services::Binary;
