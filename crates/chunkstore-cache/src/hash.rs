//! FNV-1a 64-bit hashing of partition contents.

/// FNV-1a 64-bit offset basis.
const FNV1_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV1_64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental FNV-1a 64-bit hasher.
///
/// Feeding several slices gives the same result as hashing their
/// concatenation, so strided partitions hash without being gathered first.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64 {
    state: u64,
}

impl Fnv1a64 {
    pub fn new() -> Self {
        Self {
            state: FNV1_64_INIT,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(FNV1_64_PRIME);
        }
    }

    pub fn finish(&self) -> u64 {
        self.state
    }
}

impl Default for Fnv1a64 {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute FNV-1a 64-bit hash of a byte slice.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hasher = Fnv1a64::new();
    hasher.update(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = Fnv1a64::new();
        hasher.update(b"foo");
        hasher.update(b"");
        hasher.update(b"bar");
        assert_eq!(hasher.finish(), fnv1a_64(b"foobar"));
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(fnv1a_64(&[0u8; 2048]), fnv1a_64(&[1u8; 2048]));
    }
}
