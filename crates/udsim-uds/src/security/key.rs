//! Seed generation and key derivation
//!
//! The simulator's seed/key algorithm is a byte-wise XOR with `0xFF`. It is
//! simulator behaviour, not cryptography.

use rand::RngCore;
use udsim_core::SecurityLevel;

/// Length of an issued seed
pub const SEED_LEN: usize = 4;

/// Mask applied to every seed byte
pub const KEY_MASK: u8 = 0xFF;

/// Derive the key for a seed: `key[i] = seed[i] ^ 0xFF`
pub fn compute_key(seed: &[u8]) -> Vec<u8> {
    seed.iter().map(|b| b ^ KEY_MASK).collect()
}

/// Whether `key` is the derived key for `seed`
pub fn key_matches(seed: &[u8], key: &[u8]) -> bool {
    key.len() == seed.len() && seed.iter().zip(key).all(|(s, k)| s ^ KEY_MASK == *k)
}

/// Random 4-byte seed
///
/// An all-zero seed means "already unlocked" on the wire, so it is never issued.
pub fn generate_seed() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut seed = vec![0u8; SEED_LEN];
    loop {
        rng.fill_bytes(&mut seed);
        if seed.iter().any(|&b| b != 0) {
            return seed;
        }
    }
}

/// Level unlocked by a SecurityAccess sub-function
///
/// `0x01`/`0x02` unlock supplier, `0x03`/`0x04` unlock OEM; any other pair
/// is treated as supplier.
pub fn level_for_sub_function(sub_function: u8) -> SecurityLevel {
    match sub_function {
        0x03 | 0x04 => SecurityLevel::Oem,
        _ => SecurityLevel::Supplier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_key() {
        assert_eq!(
            compute_key(&[0x12, 0x34, 0x00, 0xFF]),
            vec![0xED, 0xCB, 0xFF, 0x00]
        );
    }

    #[test]
    fn test_key_matches_requires_same_length() {
        let seed = [0xA5, 0x5A, 0x01, 0x02];
        assert!(key_matches(&seed, &compute_key(&seed)));
        assert!(!key_matches(&seed, &compute_key(&seed[..3])));
        assert!(!key_matches(&seed, &seed));
    }

    #[test]
    fn test_generated_seed_is_never_zero() {
        for _ in 0..64 {
            let seed = generate_seed();
            assert_eq!(seed.len(), SEED_LEN);
            assert!(seed.iter().any(|&b| b != 0));
        }
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for_sub_function(0x01), SecurityLevel::Supplier);
        assert_eq!(level_for_sub_function(0x02), SecurityLevel::Supplier);
        assert_eq!(level_for_sub_function(0x03), SecurityLevel::Oem);
        assert_eq!(level_for_sub_function(0x04), SecurityLevel::Oem);
        assert_eq!(level_for_sub_function(0x11), SecurityLevel::Supplier);
    }
}
