//! Fixed-size bloom filter over normalized text.

use serde::{Deserialize, Serialize};

const MIN_HASHES: u32 = 3;

fn fnv1a64(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in key {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn djb2(key: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in key {
        hash = hash.wrapping_mul(33).wrapping_add(u64::from(b));
    }
    hash
}

fn sdbm(key: &[u8]) -> u64 {
    let mut hash: u64 = 0;
    for &b in key {
        hash = u64::from(b)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    hash
}

/// Probabilistic set of strings with no false negatives.
///
/// Bit positions come from three independent base hashes (FNV-1a, djb2,
/// sdbm) combined by enhanced double hashing, so any `k >= 3` can be served.
///
/// # Examples
///
/// ```
/// use kyro_resolve::BloomFilter;
///
/// let mut filter = BloomFilter::with_capacity(1_000, 0.01);
/// filter.insert("ronaldo");
/// assert!(filter.may_contain("ronaldo"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBloomFilter")]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
    insertions: usize,
}

/// Unchecked wire form of [`BloomFilter`].
#[derive(Deserialize)]
struct RawBloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
    insertions: usize,
}

impl TryFrom<RawBloomFilter> for BloomFilter {
    type Error = String;

    fn try_from(raw: RawBloomFilter) -> Result<Self, Self::Error> {
        if raw.num_bits == 0 {
            return Err("bloom filter has no bits".to_string());
        }
        if raw.num_hashes == 0 {
            return Err("bloom filter has no hash functions".to_string());
        }
        let words = raw.num_bits.div_ceil(64);
        if (raw.bits.len() as u64) < words {
            return Err(format!(
                "bloom filter declares {} bits but stores only {} words",
                raw.num_bits,
                raw.bits.len()
            ));
        }
        Ok(Self {
            bits: raw.bits,
            num_bits: raw.num_bits,
            num_hashes: raw.num_hashes,
            capacity: raw.capacity,
            insertions: raw.insertions,
        })
    }
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` at `false_positive_rate`.
    ///
    /// Uses `m = -n·ln p / (ln 2)²` bits (rounded up to a whole word) and
    /// `k = round(m/n · ln 2)` hashes, never fewer than three.
    #[must_use]
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = if false_positive_rate.is_finite() {
            false_positive_rate.clamp(1e-9, 0.5)
        } else {
            0.1
        };
        let ln2 = std::f64::consts::LN_2;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let raw_bits = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_bits = raw_bits.div_ceil(64) * 64;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let k = ((num_bits as f64 / n) * ln2).round() as u32;

        let mut filter = Self::with_size(num_bits, k);
        filter.capacity = expected_items.max(1);
        filter
    }

    /// Creates a filter with an explicit bit count and hash count.
    #[must_use]
    pub fn with_size(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(64).div_ceil(64) * 64;
        #[allow(clippy::cast_possible_truncation)]
        let words = (num_bits / 64) as usize;
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes: num_hashes.max(MIN_HASHES),
            capacity: words * 64,
            insertions: 0,
        }
    }

    fn positions(&self, key: &str) -> impl Iterator<Item = u64> {
        let bytes = key.as_bytes();
        let h1 = fnv1a64(bytes);
        // Odd stride so successive positions never collapse onto one bit.
        let h2 = djb2(bytes) | 1;
        let h3 = sdbm(bytes);
        let m = self.num_bits;
        (0..u64::from(self.num_hashes)).map(move |i| {
            h1.wrapping_add(i.wrapping_mul(h2))
                .wrapping_add(i.wrapping_mul(i).wrapping_mul(h3))
                % m
        })
    }

    /// Inserts a key.
    pub fn insert(&mut self, key: &str) {
        let positions: Vec<u64> = self.positions(key).collect();
        for bit in positions {
            #[allow(clippy::cast_possible_truncation)]
            let word = (bit / 64) as usize;
            self.bits[word] |= 1u64 << (bit % 64);
        }
        self.insertions = self.insertions.saturating_add(1);
    }

    /// Returns `false` only if `key` was definitely never inserted.
    #[must_use]
    pub fn may_contain(&self, key: &str) -> bool {
        self.positions(key).all(|bit| {
            #[allow(clippy::cast_possible_truncation)]
            let word = (bit / 64) as usize;
            self.bits[word] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.insertions = 0;
    }

    /// Number of insert calls since creation or the last clear.
    #[must_use]
    pub const fn insertions(&self) -> usize {
        self.insertions
    }

    /// Design capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of the bit array.
    #[must_use]
    pub const fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of hash functions.
    #[must_use]
    pub const fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// True once more keys were inserted than the filter was sized for.
    ///
    /// A saturated filter still has no false negatives, but its
    /// false-positive rate drifts above target until it is rebuilt.
    #[must_use]
    pub const fn is_saturated(&self) -> bool {
        self.insertions > self.capacity
    }

    /// Expected false-positive rate at the current fill: `(1 - e^(-kn/m))^k`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = f64::from(self.num_hashes);
        let n = self.insertions as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}
