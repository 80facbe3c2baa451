use serde::{Deserialize, Serialize};

const BLOCK_BITS: u32 = u64::BITS;

/// Fixed-width bitset with checked single-bit operations and first-class
/// set algebra. Device and core masks throughout the ledger are instances
/// of this type; all size tolerance (e.g. after a reconfiguration changed
/// a node's device count) is handled by the callers comparing `len()`
/// explicitly, never by silent out-of-range access.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitSet {
    blocks: Vec<u64>,
    nbits: u32,
}

impl BitSet {
    pub fn new(nbits: u32) -> Self {
        BitSet {
            blocks: vec![0; nbits.div_ceil(BLOCK_BITS) as usize],
            nbits,
        }
    }

    /// All bits set.
    pub fn filled(nbits: u32) -> Self {
        let mut bs = Self::new(nbits);
        for block in &mut bs.blocks {
            *block = u64::MAX;
        }
        bs.mask_tail();
        bs
    }

    pub fn from_indices(nbits: u32, indices: &[u32]) -> Self {
        let mut bs = Self::new(nbits);
        for &i in indices {
            bs.set(i);
        }
        bs
    }

    /// Number of bits this set is sized to (not the number of set bits).
    #[inline]
    pub fn len(&self) -> u32 {
        self.nbits
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.blocks.iter().map(|b| b.count_ones() as u64).sum()
    }

    pub fn none(&self) -> bool {
        self.blocks.iter().all(|b| *b == 0)
    }

    /// Out-of-range bits read as unset.
    #[inline]
    pub fn test(&self, bit: u32) -> bool {
        if bit >= self.nbits {
            return false;
        }
        self.blocks[(bit / BLOCK_BITS) as usize] & (1 << (bit % BLOCK_BITS)) != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u32) {
        assert!(bit < self.nbits);
        self.blocks[(bit / BLOCK_BITS) as usize] |= 1 << (bit % BLOCK_BITS);
    }

    #[inline]
    pub fn clear(&mut self, bit: u32) {
        assert!(bit < self.nbits);
        self.blocks[(bit / BLOCK_BITS) as usize] &= !(1 << (bit % BLOCK_BITS));
    }

    pub fn clear_all(&mut self) {
        self.blocks.fill(0);
    }

    /// `self |= other`, over the common prefix of the two sets.
    pub fn union_with(&mut self, other: &BitSet) {
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a |= *b;
        }
        self.mask_tail();
    }

    /// `self &= other`; bits beyond `other`'s width are cleared.
    pub fn intersect_with(&mut self, other: &BitSet) {
        for (i, a) in self.blocks.iter_mut().enumerate() {
            *a &= other.blocks.get(i).copied().unwrap_or(0);
        }
    }

    /// `self &= !other`, over the common prefix of the two sets.
    pub fn difference_with(&mut self, other: &BitSet) {
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a &= !*b;
        }
    }

    pub fn overlaps(&self, other: &BitSet) -> bool {
        self.blocks
            .iter()
            .zip(&other.blocks)
            .any(|(a, b)| a & b != 0)
    }

    /// True when every set bit of `self` is also set in `other`.
    pub fn is_subset(&self, other: &BitSet) -> bool {
        self.blocks
            .iter()
            .enumerate()
            .all(|(i, a)| a & !other.blocks.get(i).copied().unwrap_or(0) == 0)
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().enumerate().flat_map(|(i, block)| {
            let mut block = *block;
            std::iter::from_fn(move || {
                if block == 0 {
                    return None;
                }
                let bit = block.trailing_zeros();
                block &= block - 1;
                Some(i as u32 * BLOCK_BITS + bit)
            })
        })
    }

    pub fn first_set(&self) -> Option<u32> {
        self.iter_ones().next()
    }

    /// Copy of `self` resized to `nbits`; extra bits come in unset.
    pub fn resized(&self, nbits: u32) -> BitSet {
        let mut bs = BitSet::new(nbits);
        for (a, b) in bs.blocks.iter_mut().zip(&self.blocks) {
            *a = *b;
        }
        bs.mask_tail();
        bs
    }

    fn mask_tail(&mut self) {
        let tail = self.nbits % BLOCK_BITS;
        if tail != 0 {
            if let Some(last) = self.blocks.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

impl std::fmt::Display for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, bit) in self.iter_ones().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{bit}")?;
        }
        write!(f, "}}")
    }
}
