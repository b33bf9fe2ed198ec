//! 32-bit Murmur3 hash used for L2 frame fingerprints
//!
//! With `network_order` set each 4-byte block is read big-endian, so a
//! fingerprint of wire data is the same on every host. Otherwise blocks are
//! read little-endian, matching the reference algorithm.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// Default seed for frame fingerprints
pub const FRAME_SEED: u32 = 0xDEAD_BEEF;

#[inline]
fn scramble(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

pub fn murmur3_32(key: &[u8], seed: u32, network_order: bool) -> u32 {
    let mut h = seed;

    let mut blocks = key.chunks_exact(4);
    for block in &mut blocks {
        let bytes = [block[0], block[1], block[2], block[3]];
        let k = if network_order { u32::from_be_bytes(bytes) } else { u32::from_le_bytes(bytes) };
        h ^= scramble(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        if network_order {
            for (i, byte) in tail.iter().enumerate() {
                k |= u32::from(*byte) << (24 - 8 * i);
            }
        } else {
            for (i, byte) in tail.iter().enumerate() {
                k |= u32::from(*byte) << (8 * i);
            }
        }
        h ^= scramble(k);
    }

    h ^= key.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
