// Copyright (c) 2020 Stu Small
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

// Vendored for the same reason the suspend/resume server carries it: this is a small
// non-cryptographic hash, and pulling a crate in for it is not worth the dependency.
// This variant hashes a byte slice, so it also consumes a trailing partial word.

const C1: u32 = 0x85eb_ca6b;
const C2: u32 = 0xc2b2_ae35;
const R1: u32 = 16;
const R2: u32 = 13;
const M: u32 = 5;
const N: u32 = 0xe654_6b64;

pub fn murmur3_32(source: &[u8], seed: u32) -> u32 {
    let mut state = seed;
    let mut chunks = source.chunks_exact(4);
    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        state ^= calc_k(k);
        state = state.rotate_left(R2);
        state = (state.wrapping_mul(M)).wrapping_add(N);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        state ^= calc_k(k);
    }
    finish(state, source.len() as u32)
}

fn finish(state: u32, processed: u32) -> u32 {
    let mut hash = state;
    hash ^= processed;
    hash ^= hash.wrapping_shr(R1);
    hash = hash.wrapping_mul(C1);
    hash ^= hash.wrapping_shr(R2);
    hash = hash.wrapping_mul(C2);
    hash ^= hash.wrapping_shr(R1);
    hash
}

fn calc_k(k: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;
    const R1: u32 = 15;
    k.wrapping_mul(C1).rotate_left(R1).wrapping_mul(C2)
}

#[cfg(test)]
mod tests {
    use super::*;
    struct Result {
        slice: &'static [u8],
        seed: u32,
        hash_32: u32,
    }

    #[test]
    fn test_static_slices() {
        let tests = [
            Result { slice: b"", seed: 0, hash_32: 0 },
            Result { slice: b"", seed: 1, hash_32: 0x514e_28b7 },
            Result { slice: b"1234", seed: 0, hash_32: 0x721c_5dc3 },
            Result { slice: b"12345678", seed: 0, hash_32: 0x91b3_13ce },
            Result { slice: b"Hello, world!", seed: 1234, hash_32: 0xfaf6_cdb3 },
            Result { slice: b"The quick brown fox jumps over the lazy dog", seed: 0, hash_32: 0x2e4f_f723 },
        ];

        for test in &tests {
            assert_eq!(
                murmur3_32(test.slice, test.seed),
                test.hash_32,
                "Failed on slice {:x?} seed {}",
                test.slice,
                test.seed
            );
        }
    }

    #[test]
    fn test_empty_reference_vector() {
        // MurmurHash3_x86_32("", seed = 0) is published as 0
        assert_eq!(murmur3_32(&[], 0), 0);
    }
}
