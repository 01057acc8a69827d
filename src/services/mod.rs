//! Service layer: the container-independent facade.

pub mod binary;

pub use binary::Binary;
