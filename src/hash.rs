//! Stable checksum utilities for on-disk headers.
//!
//! Goals:
//! - Use a stable, explicit checksum (not std::DefaultHasher) so header
//!   validation is invariant across toolchains/platforms.
//! - Every fixed-size header carries fnv1a32 over its bytes with the
//!   checksum field zeroed.

/// FNV-1a 32-bit offset basis.
pub const FNV_OFFSET_BASIS: u32 = 2166136261;
/// FNV-1a 32-bit prime.
pub const FNV_PRIME: u32 = 16777619;

/// Compute the 32-bit FNV-1a checksum of a byte slice.
#[inline]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut h = FNV_OFFSET_BASIS;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Checksum of a header buffer with the checksum field (at `cksum_off`,
/// 4 bytes) treated as zero. The buffer itself is not modified.
pub fn fnv1a32_zeroed_field(buf: &[u8], cksum_off: usize) -> u32 {
    debug_assert!(cksum_off + 4 <= buf.len());
    let mut h = FNV_OFFSET_BASIS;
    for (i, &b) in buf.iter().enumerate() {
        let v = if i >= cksum_off && i < cksum_off + 4 {
            0
        } else {
            b
        };
        h ^= v as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
