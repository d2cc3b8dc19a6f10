//! 256-bit binary ORB descriptors.

use serde::{Deserialize, Serialize};

/// A 256-bit binary descriptor (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    pub const ZERO: Descriptor = Descriptor([0u8; 32]);

    /// Hamming distance: the number of differing bits.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Test a single bit (0..256).
    #[inline]
    pub fn bit(&self, idx: usize) -> bool {
        (self.0[idx / 8] >> (idx % 8)) & 1 == 1
    }

    pub fn set_bit(&mut self, idx: usize, value: bool) {
        if value {
            self.0[idx / 8] |= 1 << (idx % 8);
        } else {
            self.0[idx / 8] &= !(1 << (idx % 8));
        }
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…)")
    }
}

/// Pick the median descriptor of a set: the one minimizing the median Hamming
/// distance to all others. Used as a landmark's representative descriptor.
pub fn median_descriptor(descriptors: &[Descriptor]) -> Option<Descriptor> {
    match descriptors.len() {
        0 => return None,
        1 => return Some(descriptors[0]),
        _ => {}
    }

    let n = descriptors.len();
    let mut best_idx = 0;
    let mut best_median = u32::MAX;
    for i in 0..n {
        let mut dists: Vec<u32> = (0..n)
            .filter(|&j| j != i)
            .map(|j| descriptors[i].distance(&descriptors[j]))
            .collect();
        dists.sort_unstable();
        let median = dists[dists.len() / 2];
        if median < best_median {
            best_median = median;
            best_idx = i;
        }
    }
    Some(descriptors[best_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_with_bits(bits: &[usize]) -> Descriptor {
        let mut d = Descriptor::ZERO;
        for &b in bits {
            d.set_bit(b, true);
        }
        d
    }

    #[test]
    fn test_hamming_distance() {
        let a = desc_with_bits(&[0, 5, 100, 255]);
        let b = desc_with_bits(&[0, 5]);
        assert_eq!(a.distance(&b), 2);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(Descriptor::ZERO.distance(&Descriptor([0xff; 32])), 256);
    }

    #[test]
    fn test_bit_access() {
        let mut d = Descriptor::ZERO;
        d.set_bit(13, true);
        assert!(d.bit(13));
        assert!(!d.bit(12));
        d.set_bit(13, false);
        assert!(!d.bit(13));
    }

    #[test]
    fn test_median_descriptor_picks_central() {
        // Two near-identical descriptors and one far outlier: the median must
        // come from the tight pair.
        let a = desc_with_bits(&[1, 2, 3]);
        let b = desc_with_bits(&[1, 2, 3, 4]);
        let outlier = Descriptor([0xff; 32]);
        let median = median_descriptor(&[a, outlier, b]).unwrap();
        assert!(median == a || median == b);
    }

    #[test]
    fn test_median_descriptor_empty() {
        assert!(median_descriptor(&[]).is_none());
    }
}
