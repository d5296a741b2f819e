//! Badge generation
//!
//! Badges are 63-bit values minted by the kernel: a monotone per-boot
//! counter in the low bits guarantees uniqueness, and a hash of the slot
//! location and type tag fills the high bits. This resists forgery only
//! because user code never observes kernel addresses or the counter; it is
//! not cryptographic.

use core::sync::atomic::{AtomicU64, Ordering};

use super::types::{CapRef, CapType};

/// Badges carry 63 significant bits; the top bit stays clear.
pub const BADGE_MASK: u64 = (1 << 63) - 1;

const COUNTER_BITS: u32 = 40;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

static BADGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh badge for the capability at `at`.
///
/// Unique within a boot as long as fewer than 2^40 badges are minted; the
/// counter occupies the low bits untouched, so two badges can only collide
/// by exhausting it.
pub fn generate(at: CapRef, ty: CapType) -> u64 {
    let n = BADGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let loc = (at.pack() as u64) << 8 | ty as u64;
    let mix = splitmix(loc ^ n);
    ((mix << COUNTER_BITS) | (n & COUNTER_MASK)) & BADGE_MASK
}

/// Compare two badges without a data-dependent branch.
pub fn constant_time_eq(a: u64, b: u64) -> bool {
    let diff = a ^ b;
    // Bit 63 of `diff | -diff` is set exactly when diff is nonzero.
    (diff | diff.wrapping_neg()) >> 63 == 0
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badges_are_distinct_and_63_bit() {
        let at = CapRef::new(0, 7);
        let mut seen = std::vec::Vec::new();
        for _ in 0..1000 {
            let b = generate(at, CapType::Endpoint);
            assert_eq!(b & !BADGE_MASK, 0);
            assert_ne!(b, 0);
            assert!(!seen.contains(&b));
            seen.push(b);
        }
    }

    #[test]
    fn same_counter_different_slots_differ() {
        let a = generate(CapRef::new(0, 1), CapType::Endpoint);
        let b = generate(CapRef::new(0, 2), CapType::Endpoint);
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_comparison_agrees_with_eq() {
        assert!(constant_time_eq(0, 0));
        assert!(constant_time_eq(0x42, 0x42));
        assert!(!constant_time_eq(0x42, 0x43));
        assert!(!constant_time_eq(u64::MAX, 0));
        assert!(constant_time_eq(BADGE_MASK, BADGE_MASK));
    }
}
