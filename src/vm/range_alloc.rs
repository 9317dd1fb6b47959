// SPDX-License-Identifier: MPL-2.0

//! The per-address-space VA range allocator.
//!
//! Bound VMAs own non-overlapping nodes carved out of the space's
//! total range. Allocation is best-fit over a hole list, honoring
//! fixed-offset requests, zone restrictions (the 32-bit zone, the
//! mappable aperture) and alignment padding for huge-page
//! opportunities.

use align_ext::AlignExt;

use crate::{mm::Vaddr, prelude::*};

/// An allocated VA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaNode {
    pub start: Vaddr,
    pub size: usize,
}

impl VaNode {
    pub fn range(&self) -> Range<Vaddr> {
        self.start..self.start + self.size
    }
}

/// Best-fit allocator over one VA range.
#[derive(Debug)]
pub struct RangeAllocator {
    total: Range<Vaddr>,
    /// Free holes, keyed by start.
    holes: BTreeMap<Vaddr, usize>,
    /// Allocated nodes, keyed by start.
    nodes: BTreeMap<Vaddr, usize>,
}

impl RangeAllocator {
    pub fn new(total: Range<Vaddr>) -> Self {
        let mut holes = BTreeMap::new();
        if !total.is_empty() {
            holes.insert(total.start, total.len());
        }
        Self {
            total,
            holes,
            nodes: BTreeMap::new(),
        }
    }

    pub fn total(&self) -> Range<Vaddr> {
        self.total.clone()
    }

    /// Allocates `size` bytes at an alignment, restricted to `zone`.
    ///
    /// Picks the smallest hole that fits (best-fit keeps large holes
    /// intact for large objects).
    pub fn insert(&mut self, size: usize, align: usize, zone: Range<Vaddr>) -> Result<VaNode> {
        debug_assert!(align.is_power_of_two());
        if size == 0 || size % crate::mm::PAGE_SIZE != 0 {
            return_errno_with_message!(Errno::EINVAL, "bad allocation size");
        }

        let mut best: Option<(usize, Vaddr)> = None;
        for (&start, &len) in self.holes.iter() {
            let lo = start.max(zone.start).align_up(align);
            let hole_end = start + len;
            let hi = hole_end.min(zone.end);
            if lo >= hi || hi - lo < size {
                continue;
            }
            match best {
                Some((best_len, _)) if best_len <= len => (),
                _ => best = Some((len, lo)),
            }
        }
        let Some((_, at)) = best else {
            return_errno!(Errno::ENOSPC);
        };
        self.take(at, size);
        Ok(VaNode { start: at, size })
    }

    /// Allocates exactly `[start, start + size)`.
    pub fn insert_fixed(&mut self, start: Vaddr, size: usize) -> Result<VaNode> {
        if start % crate::mm::PAGE_SIZE != 0 || size == 0 || size % crate::mm::PAGE_SIZE != 0 {
            return_errno_with_message!(Errno::EINVAL, "bad fixed range");
        }
        if start < self.total.start || start + size > self.total.end {
            return_errno_with_message!(Errno::EINVAL, "fixed range outside the address space");
        }
        let covering = self
            .holes
            .range(..=start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        match covering {
            Some((s, l)) if s <= start && start + size <= s + l => {
                self.take(start, size);
                Ok(VaNode { start, size })
            }
            _ => return_errno_with_message!(Errno::ENOSPC, "fixed range is occupied"),
        }
    }

    /// Releases a node, merging the hole with its neighbors.
    pub fn remove(&mut self, node: VaNode) {
        let removed = self.nodes.remove(&node.start);
        debug_assert_eq!(removed, Some(node.size));

        let mut start = node.start;
        let mut len = node.size;
        if let Some((&prev_start, &prev_len)) = self.holes.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.holes.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.holes.get(&(start + len)) {
            self.holes.remove(&(start + len));
            len += next_len;
        }
        self.holes.insert(start, len);
    }

    /// Largest free contiguous extent, the eviction heuristic input.
    pub fn largest_hole(&self) -> usize {
        self.holes.values().copied().max().unwrap_or(0)
    }

    pub fn nr_allocated(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `range` overlaps any allocated node.
    pub fn is_free(&self, range: &Range<Vaddr>) -> bool {
        for (&s, &l) in self.nodes.range(..range.end) {
            if s + l > range.start {
                return false;
            }
        }
        true
    }

    fn take(&mut self, at: Vaddr, size: usize) {
        let (&hole_start, &hole_len) = self
            .holes
            .range(..=at)
            .next_back()
            .expect("taking from a nonexistent hole");
        debug_assert!(hole_start <= at && at + size <= hole_start + hole_len);
        self.holes.remove(&hole_start);
        if at > hole_start {
            self.holes.insert(hole_start, at - hole_start);
        }
        let tail = (hole_start + hole_len) - (at + size);
        if tail > 0 {
            self.holes.insert(at + size, tail);
        }
        self.nodes.insert(at, size);
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;
    use crate::mm::{PAGE_SIZE, SZ_2M};

    const TOTAL: Range<Vaddr> = 0..(1 << 30);

    fn zone_all() -> Range<Vaddr> {
        TOTAL
    }

    #[test]
    fn best_fit_prefers_the_smallest_hole() {
        let mut mm = RangeAllocator::new(TOTAL);
        // Carve [small hole][node][rest]: free a small node to create
        // a snug hole, then check a fitting request lands in it.
        let a = mm.insert_fixed(0, 4 * PAGE_SIZE).unwrap();
        let _b = mm.insert_fixed(4 * PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        mm.remove(a);

        let c = mm.insert(4 * PAGE_SIZE, PAGE_SIZE, zone_all()).unwrap();
        assert_eq!(c.start, 0);
    }

    #[test]
    fn fixed_conflicts_are_enospc() {
        let mut mm = RangeAllocator::new(TOTAL);
        let _a = mm.insert_fixed(SZ_2M, SZ_2M).unwrap();
        assert_eq!(
            mm.insert_fixed(SZ_2M, PAGE_SIZE).unwrap_err().error(),
            Errno::ENOSPC
        );
        assert_eq!(
            mm.insert_fixed(SZ_2M + PAGE_SIZE, PAGE_SIZE).unwrap_err().error(),
            Errno::ENOSPC
        );
        // Outside the managed range entirely.
        assert_eq!(
            mm.insert_fixed(TOTAL.end, PAGE_SIZE).unwrap_err().error(),
            Errno::EINVAL
        );
    }

    #[test]
    fn zone_restriction_is_honored() {
        let mut mm = RangeAllocator::new(TOTAL);
        let zone = 0..(16 * PAGE_SIZE);
        let mut got = Vec::new();
        for _ in 0..16 {
            got.push(mm.insert(PAGE_SIZE, PAGE_SIZE, zone.clone()).unwrap());
        }
        for n in &got {
            assert!(n.start + n.size <= zone.end);
        }
        assert_eq!(
            mm.insert(PAGE_SIZE, PAGE_SIZE, zone).unwrap_err().error(),
            Errno::ENOSPC
        );
        // The rest of the space is still usable.
        assert!(mm.insert(PAGE_SIZE, PAGE_SIZE, zone_all()).is_ok());
    }

    #[test]
    fn alignment_padding() {
        let mut mm = RangeAllocator::new(TOTAL);
        let _pad = mm.insert_fixed(0, PAGE_SIZE).unwrap();
        let n = mm.insert(SZ_2M, SZ_2M, zone_all()).unwrap();
        assert_eq!(n.start % SZ_2M, 0);
    }

    /// Randomized disjointness: prime-sized allocations inserted and
    /// removed in random order never overlap and always merge back.
    #[test]
    fn randomized_disjointness() {
        let mut mm = RangeAllocator::new(TOTAL);
        let mut rng = SmallRng::seed_from_u64(0x9e3779b97f4a7c15);
        let primes = [3usize, 5, 7, 11, 13, 17, 19, 23];
        let mut live: Vec<VaNode> = Vec::new();

        for round in 0..2000 {
            if live.is_empty() || (rng.random_range(0..3) != 0 && live.len() < 64) {
                let size = primes[round % primes.len()] * PAGE_SIZE;
                let n = mm.insert(size, PAGE_SIZE, zone_all()).unwrap();
                // No overlap with anything live.
                for other in &live {
                    assert!(
                        n.start + n.size <= other.start || other.start + other.size <= n.start,
                        "overlap: {:?} vs {:?}",
                        n,
                        other
                    );
                }
                live.push(n);
            } else {
                let idx = rng.random_range(0..live.len());
                mm.remove(live.swap_remove(idx));
            }
        }
        for n in live.drain(..) {
            mm.remove(n);
        }
        assert_eq!(mm.nr_allocated(), 0);
        assert_eq!(mm.largest_hole(), TOTAL.len());
    }
}
