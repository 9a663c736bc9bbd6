//! Little-endian CRC-32 as used by on-disk summaries and the superblock

use crc32fast::Hasher;

/// Raw CRC-32 (IEEE polynomial, reflected) seeded with `seed`, with no
/// pre- or post-inversion.
pub fn crc32_le(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new_with_initial(!seed);
    hasher.update(data);
    !hasher.finalize()
}
