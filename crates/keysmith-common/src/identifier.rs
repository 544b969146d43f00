//! Attempt identifier generation
//!
//! Identifiers are drawn from a 64-symbol alphabet using the thread-local
//! CSPRNG. 256 is a multiple of 64, so reducing each random byte modulo the
//! alphabet length keeps the distribution uniform.

use rand::RngCore;

/// Alphabet used for identifiers (alphanumeric plus `-` and `_`)
pub const IDENTIFIER_ALPHABET: &[u8; 64] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890-_";

/// Default identifier length
pub const DEFAULT_IDENTIFIER_SIZE: usize = 16;

/// Generate a random identifier of `size` characters
///
/// # Examples
///
/// ```
/// use keysmith_common::generate_unique_key;
///
/// let id = generate_unique_key(12);
/// assert_eq!(id.len(), 12);
/// ```
pub fn generate_unique_key(size: usize) -> String {
    let mut data = vec![0u8; size];
    rand::rng().fill_bytes(&mut data);
    data.into_iter()
        .map(|b| IDENTIFIER_ALPHABET[b as usize % IDENTIFIER_ALPHABET.len()] as char)
        .collect()
}

/// Identifier source bound to a fixed length
#[derive(Clone, Copy, Debug)]
pub struct IdentifierGenerator {
    size: usize,
}

impl IdentifierGenerator {
    /// Size is clamped to at least one character.
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn generate(&self) -> String {
        generate_unique_key(self.size)
    }
}

impl Default for IdentifierGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFIER_SIZE)
    }
}
