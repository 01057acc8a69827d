//! Infrastructure layer for cross-cutting concerns.
//!
//! Currently error handling and result types; the binary owns logging setup.

pub mod error;
