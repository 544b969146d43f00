//! KeySmith Common - Shared types for the KeySmith lock client
//!
//! This crate provides:
//! - Error taxonomy shared by every KeySmith component
//! - Lock and memoization key types with their store naming scheme
//! - Attempt identifier generation

pub mod error;
pub mod identifier;
pub mod key;

// Re-exports for convenience
pub use error::{KeySmithError, Result};
pub use identifier::{
    DEFAULT_IDENTIFIER_SIZE, IDENTIFIER_ALPHABET, IdentifierGenerator, generate_unique_key,
};
pub use key::{Channel, Key, MAX_EXPIRATION, MemoKey, is_error_channel};
