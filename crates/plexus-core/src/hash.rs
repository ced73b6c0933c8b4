//! The one hash function shared by snapshot checksums and RNG stream seeding.
//!
//! Both consumers must stay bit-identical across releases: a snapshot saved
//! by one build has to validate in the next, and a replayed command log has
//! to draw the same random numbers. Keep the algorithm here and nowhere else.

/// FNV-1a 32-bit offset basis.
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a 32-bit prime.
const FNV_PRIME: u32 = 0x0100_0193;

/// Hash `bytes` with 32-bit FNV-1a.
///
/// Order-sensitive and non-cryptographic.
///
/// ```
/// use plexus_core::hash::hash32;
///
/// assert_eq!(hash32(b""), 0x811c_9dc5);
/// assert_ne!(hash32(b"ab"), hash32(b"ba"));
/// ```
pub fn hash32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |acc, &byte| {
        (acc ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// [`hash32`] rendered as 8 lowercase, zero-padded hex characters.
pub fn hash32_hex(bytes: &[u8]) -> String {
    format!("{:08x}", hash32(bytes))
}
