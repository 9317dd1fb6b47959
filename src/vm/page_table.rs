// SPDX-License-Identifier: MPL-2.0

//! The multi-level page-table tree of a PPGTT.
//!
//! Nodes live in a per-tree arena addressed by index; a page-directory
//! slot publishes its child's index with a compare-and-swap, so two
//! binders racing to populate the same slot resolve without a lock:
//! the first publisher wins and the loser frees its speculative node.
//! Every node carries a `used` counter equal to the number of present
//! entries (children plus mapped PTEs); a node is released only when
//! `used` drains to zero. Released nodes go onto a batched free list
//! and from there back to the per-GT node cache.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use super::codec::PteCodec;
use crate::{
    mm::{
        level_for_page_size, page_prop::PageProperty, page_size_at, pte_index, sg::ScatterList,
        DeviceAddr, PageSizes, PagingLevel, Vaddr, COMPACT_SHIFT, NR_PTES_PER_NODE, SZ_4K, SZ_64K,
    },
    prelude::*,
};

/// Sentinel child index: no node.
const NO_NODE: u32 = u32::MAX;

/// Leaf encoding modes.
const MODE_NONE: u8 = 0;
const MODE_4K: u8 = 1;
const MODE_64K: u8 = 2;
const MODE_COMPACT: u8 = 3;

/// One page of translation state: a leaf page table or a page
/// directory.
pub(crate) struct PtNode {
    level: PagingLevel,
    /// Number of present entries. Exactly the non-scratch PTE count
    /// for leaves, children plus huge entries for directories.
    used: AtomicU32,
    /// Leaf encoding mode; [`MODE_NONE`] until the first entry decides.
    mode: AtomicU8,
    ptes: Vec<AtomicU64>,
    /// Child node indices; empty for leaf nodes.
    children: Vec<AtomicU32>,
}

impl PtNode {
    fn new(level: PagingLevel) -> Self {
        let children = if level > 1 {
            (0..NR_PTES_PER_NODE).map(|_| AtomicU32::new(NO_NODE)).collect()
        } else {
            Vec::new()
        };
        Self {
            level,
            used: AtomicU32::new(0),
            mode: AtomicU8::new(MODE_NONE),
            ptes: (0..NR_PTES_PER_NODE).map(|_| AtomicU64::new(0)).collect(),
            children,
        }
    }

    /// Reinitializes a recycled node for a new level.
    fn reinit(&mut self, level: PagingLevel) {
        self.level = level;
        *self.used.get_mut() = 0;
        *self.mode.get_mut() = MODE_NONE;
        for pte in &mut self.ptes {
            *pte.get_mut() = 0;
        }
        if level > 1 {
            if self.children.is_empty() {
                self.children = (0..NR_PTES_PER_NODE).map(|_| AtomicU32::new(NO_NODE)).collect();
            } else {
                for c in &mut self.children {
                    *c.get_mut() = NO_NODE;
                }
            }
        } else {
            self.children = Vec::new();
        }
    }

    fn child(&self, idx: usize) -> u32 {
        if self.children.is_empty() {
            NO_NODE
        } else {
            self.children[idx].load(Ordering::Acquire)
        }
    }

    fn pte(&self, idx: usize) -> u64 {
        self.ptes[idx].load(Ordering::Acquire)
    }

    pub(crate) fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// Commits the leaf to an encoding mode, first writer decides.
    fn set_mode(&self, mode: u8) -> Result<()> {
        match self
            .mode
            .compare_exchange(MODE_NONE, mode, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(cur) if cur == mode => Ok(()),
            Err(_) => {
                return_errno_with_message!(Errno::EINVAL, "mixed page sizes in one page table")
            }
        }
    }
}

/// The per-GT cache of recycled page-table nodes.
///
/// An explicit arena with an owned lifetime: `close()` stops pooling
/// and `drain()` releases everything, so teardown cannot race a late
/// free.
pub struct PtCache {
    pool: Mutex<Vec<PtNode>>,
    closed: AtomicBool,
    limit: usize,
}

impl PtCache {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            limit,
        }
    }

    fn take(&self, level: PagingLevel) -> PtNode {
        if let Some(mut n) = self.pool.lock().pop() {
            n.reinit(level);
            return n;
        }
        PtNode::new(level)
    }

    fn put(&self, node: PtNode) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut pool = self.pool.lock();
        if pool.len() < self.limit {
            pool.push(node);
        }
    }

    /// Stops pooling; subsequent frees drop their nodes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Releases all pooled nodes.
    pub fn drain(&self) {
        self.pool.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a translation lookup found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PteLookup {
    pub raw: u64,
    pub page_size: usize,
}

/// A multi-level radix page table.
pub(crate) struct PtTree {
    slots: RwLock<Vec<Option<PtNode>>>,
    free_ids: Mutex<Vec<u32>>,
    nr_nodes: AtomicUsize,
    root: u32,
    top_level: PagingLevel,
    cache: Arc<PtCache>,
}

impl PtTree {
    pub(crate) fn new(top_level: PagingLevel, cache: Arc<PtCache>) -> Self {
        debug_assert!((2..=5).contains(&top_level));
        let root_node = cache.take(top_level);
        Self {
            slots: RwLock::new(alloc::vec![Some(root_node)]),
            free_ids: Mutex::new(Vec::new()),
            nr_nodes: AtomicUsize::new(1),
            root: 0,
            top_level,
            cache,
        }
    }

    /// Number of live nodes, including the root.
    pub(crate) fn nr_nodes(&self) -> usize {
        self.nr_nodes.load(Ordering::Acquire)
    }

    /// The root's `used` counter.
    pub(crate) fn root_used(&self) -> u32 {
        let slots = self.slots.read();
        node(&slots, self.root).used()
    }

    /// Inserts PTEs covering `range` from the scatter cursor, choosing
    /// the largest aligned page size the VA, the run geometry and the
    /// platform allow at every position.
    ///
    /// On failure the already-written prefix is rolled back so the
    /// range is never left partially populated.
    pub(crate) fn insert(
        &self,
        range: Range<Vaddr>,
        sg: &ScatterList,
        prop: PageProperty,
        codec: &dyn PteCodec,
        sizes: PageSizes,
        compact_64k: bool,
        scratch_leaf: u64,
    ) -> Result<()> {
        debug_assert_eq!(range.start % SZ_4K, 0);
        debug_assert_eq!(range.len(), sg.len());

        let sizes = sizes & codec.supported_sizes();
        let mut cur = sg.cursor();
        let mut va = range.start;
        while va < range.end {
            let ps = select_page_size(va, range.end, cur.addr(), cur.contiguous_left(), sizes);
            if let Err(e) = self.map_one(va, ps, cur.addr(), prop, codec, compact_64k, scratch_leaf)
            {
                // Never leave a gap: roll the written prefix back.
                self.clear(range.start..va, 0);
                return Err(e);
            }
            cur.advance(ps);
            va += ps;
        }
        Ok(())
    }

    fn map_one(
        &self,
        va: Vaddr,
        ps: usize,
        addr: DeviceAddr,
        prop: PageProperty,
        codec: &dyn PteCodec,
        compact_64k: bool,
        scratch_leaf: u64,
    ) -> Result<()> {
        let level = level_for_page_size(ps);
        let id = self.descend_alloc(va, level)?;
        let slots = self.slots.read();
        let n = node(&slots, id);

        let idx = if level == 1 {
            match ps {
                SZ_4K => {
                    n.set_mode(MODE_4K)?;
                    pte_index(va, 1)
                }
                SZ_64K if compact_64k => {
                    n.set_mode(MODE_COMPACT)?;
                    pte_index(va, 1) / COMPACT_SHIFT
                }
                SZ_64K => {
                    n.set_mode(MODE_64K)?;
                    pte_index(va, 1)
                }
                _ => unreachable!(),
            }
        } else {
            let idx = pte_index(va, level);
            if n.child(idx) != NO_NODE {
                return_errno_with_message!(Errno::EINVAL, "huge entry over a live page table");
            }
            idx
        };

        let old = n.ptes[idx].swap(codec.encode(addr, ps, prop), Ordering::Release);
        if old == 0 || (scratch_leaf != 0 && old == scratch_leaf) {
            n.used.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    /// Walks down to `target_level`, allocating missing directories.
    fn descend_alloc(&self, va: Vaddr, target_level: PagingLevel) -> Result<u32> {
        let mut id = self.root;
        let mut level = self.top_level;
        while level > target_level {
            let idx = pte_index(va, level);
            let child = {
                let slots = self.slots.read();
                let n = node(&slots, id);
                if n.pte(idx) != 0 {
                    return_errno_with_message!(Errno::EINVAL, "descending through a huge entry");
                }
                n.child(idx)
            };
            id = if child == NO_NODE {
                self.publish_child(id, idx, level - 1)
            } else {
                child
            };
            level -= 1;
        }
        Ok(id)
    }

    /// Insert-or-get on a directory slot: first successful publisher
    /// wins, the loser frees its speculative node and adopts the
    /// winner's fully initialized one.
    fn publish_child(&self, parent: u32, idx: usize, child_level: PagingLevel) -> u32 {
        let fresh = self.cache.take(child_level);
        let new_id = self.arena_insert(fresh);
        let winner = {
            let slots = self.slots.read();
            let p = node(&slots, parent);
            match p.children[idx].compare_exchange(
                NO_NODE,
                new_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    p.used.fetch_add(1, Ordering::Release);
                    new_id
                }
                Err(existing) => existing,
            }
        };
        if winner != new_id {
            let n = self.arena_remove(new_id);
            self.cache.put(n);
        }
        winner
    }

    /// Clears `range`, writing `scratch_leaf` (or absent when zero)
    /// over covered leaf entries and pruning drained subtrees onto a
    /// batched free list.
    ///
    /// Returns the number of entries removed.
    pub(crate) fn clear(&self, range: Range<Vaddr>, scratch_leaf: u64) -> usize {
        if range.is_empty() {
            return 0;
        }
        let mut freed_nodes = Vec::new();
        let removed = {
            let slots = self.slots.read();
            self.clear_node(
                &slots,
                self.root,
                self.top_level,
                0,
                &range,
                scratch_leaf,
                &mut freed_nodes,
            )
        };
        // The batched free: recycle outside the walk.
        for id in freed_nodes {
            let n = self.arena_remove(id);
            self.cache.put(n);
        }
        removed
    }

    #[allow(clippy::too_many_arguments)]
    fn clear_node(
        &self,
        slots: &[Option<PtNode>],
        id: u32,
        level: PagingLevel,
        node_base: Vaddr,
        range: &Range<Vaddr>,
        scratch_leaf: u64,
        freed: &mut Vec<u32>,
    ) -> usize {
        let n = node(slots, id);
        let mut removed = 0;

        if level == 1 {
            return self.clear_leaf(n, node_base, range, scratch_leaf);
        }

        let slot_size = page_size_at(level);
        let start_idx = pte_index(range.start.max(node_base), level);
        let node_end = node_base + slot_size * NR_PTES_PER_NODE;
        let end_va = range.end.min(node_end);
        if end_va <= node_base {
            return 0;
        }
        let end_idx = pte_index(end_va - 1, level);

        for idx in start_idx..=end_idx {
            let slot_base = node_base + idx * slot_size;
            let slot_range = slot_base..slot_base + slot_size;
            let fully_covered = range.start <= slot_range.start && slot_range.end <= range.end;

            let child = n.child(idx);
            if child != NO_NODE {
                if fully_covered {
                    // Prune the whole subtree in one go.
                    n.children[idx].store(NO_NODE, Ordering::Release);
                    removed += self.count_entries(slots, child);
                    self.collect_subtree(slots, child, freed);
                    n.used.fetch_sub(1, Ordering::Release);
                } else {
                    removed += self.clear_node(
                        slots,
                        child,
                        level - 1,
                        slot_base,
                        range,
                        scratch_leaf,
                        freed,
                    );
                    let c = node(slots, child);
                    if c.used() == 0 {
                        n.children[idx].store(NO_NODE, Ordering::Release);
                        freed.push(child);
                        n.used.fetch_sub(1, Ordering::Release);
                    }
                }
                continue;
            }

            let pte = n.pte(idx);
            if pte != 0 {
                debug_assert!(fully_covered, "partial clear of a huge entry");
                n.ptes[idx].store(0, Ordering::Release);
                n.used.fetch_sub(1, Ordering::Release);
                removed += 1;
            }
        }
        removed
    }

    fn clear_leaf(
        &self,
        n: &PtNode,
        node_base: Vaddr,
        range: &Range<Vaddr>,
        scratch_leaf: u64,
    ) -> usize {
        let mode = n.mode.load(Ordering::Acquire);
        let (step, compact) = match mode {
            MODE_NONE => return 0,
            MODE_4K => (SZ_4K, false),
            MODE_64K => (SZ_64K, false),
            MODE_COMPACT => (SZ_64K, true),
            _ => unreachable!(),
        };

        let node_end = node_base + page_size_at(2);
        let mut va = range.start.max(node_base);
        debug_assert_eq!(va % step, 0, "partial clear of a 64K entry");
        va -= va % step;
        let end = range.end.min(node_end);

        let mut removed = 0;
        while va < end {
            let idx = if compact {
                pte_index(va, 1) / COMPACT_SHIFT
            } else {
                pte_index(va, 1)
            };
            let old = n.ptes[idx].swap(scratch_leaf, Ordering::Release);
            if old != 0 && old != scratch_leaf {
                n.used.fetch_sub(1, Ordering::Release);
                removed += 1;
            }
            va += step;
        }
        if n.used() == 0 {
            // Drained leaves forget their encoding mode and any
            // scratch fill so they can be reused for another geometry.
            n.mode.store(MODE_NONE, Ordering::Release);
            for pte in &n.ptes {
                pte.store(0, Ordering::Release);
            }
        }
        removed
    }

    fn count_entries(&self, slots: &[Option<PtNode>], id: u32) -> usize {
        let n = node(slots, id);
        let mut count = 0;
        if n.children.is_empty() {
            return n.used() as usize;
        }
        for idx in 0..NR_PTES_PER_NODE {
            let child = n.child(idx);
            if child != NO_NODE {
                count += self.count_entries(slots, child);
            } else if n.pte(idx) != 0 {
                count += 1;
            }
        }
        count
    }

    fn collect_subtree(&self, slots: &[Option<PtNode>], id: u32, freed: &mut Vec<u32>) {
        let n = node(slots, id);
        if !n.children.is_empty() {
            for idx in 0..NR_PTES_PER_NODE {
                let child = n.child(idx);
                if child != NO_NODE {
                    n.children[idx].store(NO_NODE, Ordering::Release);
                    self.collect_subtree(slots, child, freed);
                }
            }
        }
        freed.push(id);
    }

    /// Software walk: resolves `va` to its raw PTE and page size.
    pub(crate) fn query(&self, va: Vaddr) -> Option<PteLookup> {
        let slots = self.slots.read();
        let mut id = self.root;
        let mut level = self.top_level;
        loop {
            let n = node(&slots, id);
            if level == 1 {
                let mode = n.mode.load(Ordering::Acquire);
                let (idx, page_size) = match mode {
                    MODE_NONE => return None,
                    MODE_4K => (pte_index(va, 1), SZ_4K),
                    MODE_64K => (pte_index(va, 1) & !(COMPACT_SHIFT - 1), SZ_64K),
                    MODE_COMPACT => (pte_index(va, 1) / COMPACT_SHIFT, SZ_64K),
                    _ => unreachable!(),
                };
                let raw = n.pte(idx);
                return (raw != 0).then_some(PteLookup { raw, page_size });
            }
            let idx = pte_index(va, level);
            let child = n.child(idx);
            if child != NO_NODE {
                id = child;
                level -= 1;
                continue;
            }
            let raw = n.pte(idx);
            return (raw != 0).then_some(PteLookup {
                raw,
                page_size: page_size_at(level),
            });
        }
    }

    fn arena_insert(&self, n: PtNode) -> u32 {
        self.nr_nodes.fetch_add(1, Ordering::Release);
        let mut slots = self.slots.write();
        if let Some(id) = self.free_ids.lock().pop() {
            slots[id as usize] = Some(n);
            return id;
        }
        slots.push(Some(n));
        (slots.len() - 1) as u32
    }

    fn arena_remove(&self, id: u32) -> PtNode {
        self.nr_nodes.fetch_sub(1, Ordering::Release);
        let mut slots = self.slots.write();
        let n = slots[id as usize].take().expect("double free of a page-table node");
        self.free_ids.lock().push(id);
        n
    }
}

impl Drop for PtTree {
    fn drop(&mut self) {
        // The cache outlives trees; hand everything back.
        let slots = self.slots.get_mut();
        for slot in slots.drain(..) {
            if let Some(n) = slot {
                self.cache.put(n);
            }
        }
    }
}

fn node<'a>(slots: &'a [Option<PtNode>], id: u32) -> &'a PtNode {
    slots[id as usize]
        .as_ref()
        .expect("dangling page-table node index")
}

/// The largest supported page size usable at this position.
fn select_page_size(
    va: Vaddr,
    end: Vaddr,
    addr: DeviceAddr,
    contiguous: usize,
    sizes: PageSizes,
) -> usize {
    for ps in sizes.descending() {
        if va % ps != 0 || addr % ps as DeviceAddr != 0 || end - va < ps || contiguous < ps {
            continue;
        }
        // A leaf page table encodes one granularity. 64K entries are
        // only usable when the rest of this 2M window maps as 64K
        // too; a 4K tail would need a second encoding in the same
        // node.
        if ps == SZ_64K {
            let window_end = (va + crate::mm::SZ_2M) & !(crate::mm::SZ_2M - 1);
            let span = end.min(window_end) - va;
            if span % SZ_64K != 0 {
                continue;
            }
        }
        return ps;
    }
    // 4K always works: callers map whole minimum pages.
    SZ_4K
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        mm::{
            page_prop::{CachePolicy, PageFlags},
            SZ_1G, SZ_2M,
        },
        vm::codec::{FlatPteCodec, PteCodec},
    };

    fn prop() -> PageProperty {
        PageProperty::new(PageFlags::R | PageFlags::W, CachePolicy::Writeback, true)
    }

    fn all_sizes() -> PageSizes {
        PageSizes::SZ_4K | PageSizes::SZ_64K | PageSizes::SZ_2M | PageSizes::SZ_1G
    }

    fn tree() -> PtTree {
        PtTree::new(4, Arc::new(PtCache::new(64)))
    }

    fn sg_contig(addr: DeviceAddr, len: usize) -> ScatterList {
        let mut sg = ScatterList::new();
        sg.push(addr, len);
        sg
    }

    #[test]
    fn bind_unbind_round_trip_restores_counters() {
        let t = tree();
        let nodes_before = t.nr_nodes();
        let used_before = t.root_used();

        let sg = sg_contig(SZ_2M as u64, 8 * SZ_4K);
        t.insert(
            0x40_0000..0x40_0000 + 8 * SZ_4K,
            &sg,
            prop(),
            &FlatPteCodec,
            PageSizes::SZ_4K,
            false,
            0,
        )
        .unwrap();
        assert!(t.nr_nodes() > nodes_before);

        let removed = t.clear(0x40_0000..0x40_0000 + 8 * SZ_4K, 0);
        assert_eq!(removed, 8);
        assert_eq!(t.nr_nodes(), nodes_before);
        assert_eq!(t.root_used(), used_before);
    }

    #[test]
    fn largest_page_size_is_selected() {
        let t = tree();
        // 2M-aligned VA and device address, 2M + 8K long: one 2M entry
        // plus two 4K entries.
        let len = SZ_2M + 2 * SZ_4K;
        let sg = sg_contig(SZ_1G as u64, len);
        t.insert(
            SZ_2M..SZ_2M + len,
            &sg,
            prop(),
            &FlatPteCodec,
            all_sizes(),
            false,
            0,
        )
        .unwrap();

        let big = t.query(SZ_2M).unwrap();
        assert_eq!(big.page_size, SZ_2M);
        let small = t.query(2 * SZ_2M).unwrap();
        assert_eq!(small.page_size, SZ_4K);
        let small2 = t.query(2 * SZ_2M + SZ_4K).unwrap();
        assert_eq!(small2.page_size, SZ_4K);
        assert_eq!(t.query(2 * SZ_2M + 2 * SZ_4K), None);

        // PTE count: one 2M + two 4K.
        assert_eq!(t.clear(SZ_2M..SZ_2M + len, 0), 3);
    }

    #[test]
    fn gig_page_mapping() {
        let t = tree();
        let sg = sg_contig(SZ_1G as u64, SZ_1G);
        t.insert(
            SZ_1G..2 * SZ_1G,
            &sg,
            prop(),
            &FlatPteCodec,
            all_sizes(),
            false,
            0,
        )
        .unwrap();
        let l = t.query(SZ_1G + 123 * SZ_4K).unwrap();
        assert_eq!(l.page_size, SZ_1G);
        let f = FlatPteCodec.decode(l.raw).unwrap();
        assert_eq!(f.addr, SZ_1G as u64);
        assert!(f.huge);
    }

    #[test]
    fn compact_64k_leaf_indexing() {
        let t = tree();
        let sg = sg_contig(SZ_2M as u64, 4 * SZ_64K);
        t.insert(
            0..4 * SZ_64K,
            &sg,
            prop(),
            &FlatPteCodec,
            PageSizes::SZ_4K | PageSizes::SZ_64K,
            true,
            0,
        )
        .unwrap();
        // All four entries live in the first compacted slots.
        for i in 0..4 {
            let l = t.query(i * SZ_64K + SZ_4K).unwrap();
            assert_eq!(l.page_size, SZ_64K);
            let f = FlatPteCodec.decode(l.raw).unwrap();
            assert_eq!(f.addr, (SZ_2M + i * SZ_64K) as u64);
            assert!(f.ps64);
        }
        assert_eq!(t.clear(0..4 * SZ_64K, 0), 4);
        assert_eq!(t.query(SZ_4K), None);
    }

    #[test]
    fn subset_bind_frees_enclosing_directories() {
        let t = tree();
        let nodes_before = t.nr_nodes();

        // One 4K page inside an otherwise empty 2M directory range.
        let sg = sg_contig(0x80_0000, SZ_4K);
        t.insert(0..SZ_4K, &sg, prop(), &FlatPteCodec, PageSizes::SZ_4K, false, 0)
            .unwrap();
        // Top level + 2 intermediate directories + leaf were created.
        assert_eq!(t.nr_nodes(), nodes_before + 3);

        t.clear(0..SZ_4K, 0);
        assert_eq!(t.nr_nodes(), nodes_before);
        assert_eq!(t.root_used(), 0);
    }

    #[test]
    fn scratch_detach_keeps_entries_countable() {
        let t = tree();
        let scratch = FlatPteCodec.encode(0xdead_0000, SZ_4K, PageProperty::scratch());
        let sg = sg_contig(SZ_2M as u64, 2 * SZ_4K);
        t.insert(
            0..2 * SZ_4K,
            &sg,
            prop(),
            &FlatPteCodec,
            PageSizes::SZ_4K,
            false,
            scratch,
        )
        .unwrap();

        // Detach to scratch: entries become "absent" for accounting
        // but still resolve to the sentinel.
        let removed = t.clear(0..2 * SZ_4K, scratch);
        assert_eq!(removed, 2);
        // Node fully drained: mode reset, everything zeroed and freed.
        assert_eq!(t.query(0), None);

        // Rebind over the same range works and counts again.
        t.insert(
            0..2 * SZ_4K,
            &sg,
            prop(),
            &FlatPteCodec,
            PageSizes::SZ_4K,
            false,
            scratch,
        )
        .unwrap();
        assert_eq!(t.clear(0..2 * SZ_4K, 0), 2);
    }

    #[test]
    fn failed_insert_rolls_back() {
        let t = tree();
        let nodes_before = t.nr_nodes();

        // First map 4K pages over the second half of a 2M range...
        let sg = sg_contig(SZ_2M as u64, SZ_4K);
        t.insert(
            SZ_2M + 4 * SZ_4K..SZ_2M + 5 * SZ_4K,
            &sg,
            prop(),
            &FlatPteCodec,
            PageSizes::SZ_4K,
            false,
            0,
        )
        .unwrap();

        // ...then try a 2M huge mapping over the same directory slot.
        // The leaf is live, so the huge write must fail and roll back
        // everything it mapped before the conflict.
        let sg2 = sg_contig(SZ_1G as u64, 2 * SZ_2M);
        let err = t
            .insert(
                0..2 * SZ_2M,
                &sg2,
                prop(),
                &FlatPteCodec,
                all_sizes(),
                false,
                0,
            )
            .unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
        // The first 2M of the failed insert was rolled back.
        assert_eq!(t.query(0), None);
        // The pre-existing mapping is intact.
        assert!(t.query(SZ_2M + 4 * SZ_4K).is_some());

        t.clear(SZ_2M + 4 * SZ_4K..SZ_2M + 5 * SZ_4K, 0);
        assert_eq!(t.nr_nodes(), nodes_before);
    }

    #[test]
    fn node_cache_recycles_frees() {
        let cache = Arc::new(PtCache::new(64));
        let t = PtTree::new(4, cache.clone());
        let sg = sg_contig(SZ_2M as u64, SZ_4K);
        t.insert(0..SZ_4K, &sg, prop(), &FlatPteCodec, PageSizes::SZ_4K, false, 0)
            .unwrap();
        assert!(cache.is_empty());
        t.clear(0..SZ_4K, 0);
        // The three intermediate nodes went back to the pool.
        assert_eq!(cache.len(), 3);

        cache.close();
        cache.drain();
        t.insert(0..SZ_4K, &sg, prop(), &FlatPteCodec, PageSizes::SZ_4K, false, 0)
            .unwrap();
        t.clear(0..SZ_4K, 0);
        // Closed: freed nodes are dropped, not pooled.
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_inserts_on_disjoint_ranges() {
        use std::{sync::Arc as StdArc, thread};

        let t = StdArc::new(tree());
        let mut handles = std::vec::Vec::new();
        for i in 0..8usize {
            let t = t.clone();
            handles.push(thread::spawn(move || {
                let base = i * SZ_2M;
                let sg = sg_contig((SZ_1G + i * SZ_2M) as u64, SZ_2M);
                t.insert(
                    base..base + SZ_2M,
                    &sg,
                    prop(),
                    &FlatPteCodec,
                    PageSizes::SZ_4K,
                    false,
                    0,
                )
                .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8usize {
            let l = t.query(i * SZ_2M).unwrap();
            let f = FlatPteCodec.decode(l.raw).unwrap();
            assert_eq!(f.addr, (SZ_1G + i * SZ_2M) as u64);
        }
        let removed = t.clear(0..8 * SZ_2M, 0);
        assert_eq!(removed, 8 * 512);
        assert_eq!(t.root_used(), 0);
    }
}
