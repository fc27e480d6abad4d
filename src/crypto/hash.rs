//! BLAKE3 hashing and key derivation
//!
//! Every derivation takes a context string. Contexts are globally unique
//! per purpose and carry the protocol version, so keys derived for one
//! purpose can never be replayed into another.

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Hashing and key derivation operations
pub struct Hash;

impl Hash {
    /// Compute hash of data
    pub fn hash(data: &[u8]) -> HashOutput {
        blake3::hash(data).into()
    }

    /// Keyed MAC over `data`
    pub fn mac(key: &[u8; 32], data: &[u8]) -> HashOutput {
        blake3::keyed_hash(key, data).into()
    }

    /// Derive a 32-byte key from `material` under `context`
    pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
        blake3::derive_key(context, material)
    }

    /// Hash a sequence of fields under a domain label.
    ///
    /// Each field is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
    /// never collide.
    pub fn hash_fields(domain: &str, fields: &[&[u8]]) -> HashOutput {
        let mut hasher = blake3::Hasher::new_derive_key(domain);
        for field in fields {
            hasher.update(&(field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hasher.finalize().into()
    }

    /// Verify a MAC in constant time
    pub fn verify_mac(key: &[u8; 32], data: &[u8], expected: &HashOutput) -> bool {
        constant_time_eq(&Self::mac(key, data), expected)
    }
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
