/// Round-robin cursor over a node-selection bitmap. Advances to the next
/// set bit with wraparound relative to a starting offset and reports "no
/// further candidate" once it has come full circle, so that multi-node
/// budgets spread evenly instead of front-loading low offsets.
#[derive(Debug, Clone)]
pub struct RoundRobinCursor {
    start: u32,
    pos: u32,
    exhausted: bool,
}

impl RoundRobinCursor {
    pub fn new(start: u32) -> Self {
        RoundRobinCursor {
            start,
            pos: start,
            exhausted: false,
        }
    }

    pub fn reset(&mut self) {
        self.pos = self.start;
        self.exhausted = false;
    }

    /// Next set bit of `bits` at or after the cursor, wrapping around.
    /// Returns `None` when the walk has visited every set bit once.
    pub fn next(&mut self, bits: &crate::internal::common::bitset::BitSet) -> Option<u32> {
        if self.exhausted || bits.len() == 0 {
            return None;
        }
        let n = bits.len();
        let start = self.start % n.max(1);
        let mut pos = self.pos % n;
        loop {
            if bits.test(pos) {
                let found = pos;
                pos = (pos + 1) % n;
                if pos == start {
                    self.exhausted = true;
                }
                self.pos = pos;
                return Some(found);
            }
            pos = (pos + 1) % n;
            if pos == start {
                self.exhausted = true;
                return None;
            }
        }
    }
}
