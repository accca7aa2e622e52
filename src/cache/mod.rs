//! Set-associative cache simulator: single level or an inclusive two-level
//! hierarchy, driven by a trace of reads and writes.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Lru,
    Fifo,
}

impl ReplacementPolicy {
    /// Any string other than `"lru"` is treated as FIFO, matching the
    /// reference trace generator this simulator reads traces from — there
    /// is no validation of unrecognized policy names.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("lru") {
            ReplacementPolicy::Lru
        } else {
            ReplacementPolicy::Fifo
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Line {
    valid: bool,
    tag: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
}

/// A single set-associative cache.
pub struct Cache {
    assoc: usize,
    block_bits: u32,
    index_bits: u32,
    sets: Vec<Vec<Line>>,
    /// Per-set recency/arrival order, most-recently-used or
    /// most-recently-inserted at the back depending on `policy`.
    order: Vec<VecDeque<usize>>,
    policy: ReplacementPolicy,
    stats: Stats,
}

impl Cache {
    pub fn new(size_bytes: usize, assoc: usize, block_size: usize, policy: ReplacementPolicy) -> Self {
        assert!(size_bytes % (assoc * block_size) == 0, "cache size must divide evenly into sets");
        let num_sets = size_bytes / (assoc * block_size);
        Cache {
            assoc,
            block_bits: block_size.trailing_zeros(),
            index_bits: num_sets.trailing_zeros(),
            sets: vec![vec![Line { valid: false, tag: 0 }; assoc]; num_sets],
            order: vec![VecDeque::new(); num_sets],
            policy,
            stats: Stats::default(),
        }
    }

    fn decompose(&self, addr: u64) -> (u64, usize) {
        let set_index = ((addr >> self.block_bits) & ((1u64 << self.index_bits) - 1)) as usize;
        let tag = addr >> (self.block_bits + self.index_bits);
        (tag, set_index)
    }

    fn find_line(&self, set_index: usize, tag: u64) -> Option<usize> {
        self.sets[set_index]
            .iter()
            .position(|l| l.valid && l.tag == tag)
    }

    fn touch_order(&mut self, set_index: usize, way: usize) {
        if self.policy == ReplacementPolicy::Lru {
            if let Some(pos) = self.order[set_index].iter().position(|&w| w == way) {
                self.order[set_index].remove(pos);
            }
            self.order[set_index].push_back(way);
        }
    }

    /// Probes `addr` without recording statistics or recency. Used by a
    /// two-level cache to check L2 before declaring an L1 miss final.
    fn probe(&self, addr: u64) -> bool {
        let (tag, set_index) = self.decompose(addr);
        self.find_line(set_index, tag).is_some()
    }

    /// Inserts `addr`'s block, evicting per `policy` if the set is full.
    /// Returns the evicted line's address, if any, so a caller (the
    /// two-level cache, refilling L2 from an L1 eviction) can insert it
    /// into a backing cache.
    fn insert(&mut self, addr: u64) -> Option<u64> {
        let (tag, set_index) = self.decompose(addr);
        let free_way = self.sets[set_index].iter().position(|l| !l.valid);
        if let Some(way) = free_way {
            self.sets[set_index][way] = Line { valid: true, tag };
            self.order[set_index].push_back(way);
            return None;
        }
        let victim_way = self.order[set_index]
            .pop_front()
            .unwrap_or(0);
        let victim = self.sets[set_index][victim_way];
        let evicted_addr = (victim.tag << (self.block_bits + self.index_bits))
            | ((set_index as u64) << self.block_bits);
        self.sets[set_index][victim_way] = Line { valid: true, tag };
        self.order[set_index].push_back(victim_way);
        Some(evicted_addr)
    }

    fn invalidate(&mut self, addr: u64) {
        let (tag, set_index) = self.decompose(addr);
        if let Some(way) = self.find_line(set_index, tag) {
            self.sets[set_index][way].valid = false;
            if let Some(pos) = self.order[set_index].iter().position(|&w| w == way) {
                self.order[set_index].remove(pos);
            }
        }
    }

    /// Accesses `addr` as a read (`is_write = false`) or write, updating
    /// stats and recency, and returns whether it hit.
    pub fn access(&mut self, addr: u64, is_write: bool) -> bool {
        self.access_and_evict(addr, is_write).0
    }

    /// Like `access`, but also reports the address evicted to make room,
    /// if the access missed and the set was full. Used by `TwoLevelCache`
    /// to refill the backing level from an L1 eviction.
    fn access_and_evict(&mut self, addr: u64, is_write: bool) -> (bool, Option<u64>) {
        if is_write {
            self.stats.writes += 1;
        } else {
            self.stats.reads += 1;
        }
        let (tag, set_index) = self.decompose(addr);
        match self.find_line(set_index, tag) {
            Some(way) => {
                self.stats.hits += 1;
                self.touch_order(set_index, way);
                (true, None)
            }
            None => {
                self.stats.misses += 1;
                let evicted = self.insert(addr);
                (false, evicted)
            }
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}

/// A strictly inclusive L1/L2 hierarchy. Every L1 miss probes L2; an L2
/// hit invalidates the L2 line (it is about to live in L1 instead) and
/// promotes the block into L1. A block evicted from L1 is inserted into
/// L2 at the evicted address's own L2 index/tag — not the address that
/// triggered the eviction.
pub struct TwoLevelCache {
    l1: Cache,
    l2: Cache,
}

impl TwoLevelCache {
    pub fn new(l1: Cache, l2: Cache) -> Self {
        TwoLevelCache { l1, l2 }
    }

    pub fn access(&mut self, addr: u64, is_write: bool) {
        let (hit, evicted) = self.l1.access_and_evict(addr, is_write);
        if hit {
            return;
        }
        // L1 missed: count the same access against L2, independent of
        // read/write so both levels track full traffic.
        if is_write {
            self.l2.stats.writes += 1;
        } else {
            self.l2.stats.reads += 1;
        }
        if self.l2.probe(addr) {
            self.l2.stats.hits += 1;
            self.l2.invalidate(addr);
        } else {
            self.l2.stats.misses += 1;
        }
        if let Some(evicted_addr) = evicted {
            self.l2.insert(evicted_addr);
        }
    }

    pub fn l1_stats(&self) -> Stats {
        self.l1.stats()
    }

    pub fn l2_stats(&self) -> Stats {
        self.l2.stats()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TraceOp {
    Read(u64),
    Write(u64),
}

/// Parses one trace line of the form `<R|W> <hex address>`. Malformed
/// lines are the caller's bug — this returns `None` for any line that
/// doesn't fit the format, and the driver binary decides what to do
/// with a `None` (skip vs. abort).
pub fn parse_trace_line(line: &str) -> Option<TraceOp> {
    let mut parts = line.split_whitespace();
    let op = parts.next()?;
    let addr_str = parts.next()?;
    let addr = u64::from_str_radix(addr_str.trim_start_matches("0x"), 16).ok()?;
    match op {
        "R" | "r" => Some(TraceOp::Read(addr)),
        "W" | "w" => Some(TraceOp::Write(addr)),
        _ => None,
    }
}

pub fn run_trace_single(cache: &mut Cache, trace: &str) {
    for line in trace.lines() {
        match parse_trace_line(line) {
            Some(TraceOp::Read(addr)) => {
                cache.access(addr, false);
            }
            Some(TraceOp::Write(addr)) => {
                cache.access(addr, true);
            }
            None => continue,
        }
    }
}

pub fn run_trace_two_level(cache: &mut TwoLevelCache, trace: &str) {
    for line in trace.lines() {
        match parse_trace_line(line) {
            Some(TraceOp::Read(addr)) => cache.access(addr, false),
            Some(TraceOp::Write(addr)) => cache.access(addr, true),
            None => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parse_falls_back_to_fifo_for_unknown_strings() {
        assert_eq!(ReplacementPolicy::parse("lru"), ReplacementPolicy::Lru);
        assert_eq!(ReplacementPolicy::parse("LRU"), ReplacementPolicy::Lru);
        assert_eq!(ReplacementPolicy::parse("fifo"), ReplacementPolicy::Fifo);
        assert_eq!(ReplacementPolicy::parse("random"), ReplacementPolicy::Fifo);
        assert_eq!(ReplacementPolicy::parse(""), ReplacementPolicy::Fifo);
    }

    #[test]
    fn repeated_access_to_same_block_hits() {
        let mut c = Cache::new(256, 2, 32, ReplacementPolicy::Lru);
        assert!(!c.access(0x0, false));
        assert!(c.access(0x0, false));
        assert!(c.access(0x4, false)); // same block (32B), still a hit
        assert_eq!(c.stats().hits, 2);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn lru_evicts_least_recently_used_way() {
        // 1 set, 2 ways, 32-byte blocks.
        let mut c = Cache::new(64, 2, 32, ReplacementPolicy::Lru);
        c.access(0x00, false); // way 0
        c.access(0x20, false); // way 1
        c.access(0x00, false); // hit, refreshes way 0 as MRU
        c.access(0x40, false); // miss, evicts way 1 (0x20)
        assert!(!c.access(0x20, false)); // confirms 0x20 was evicted
        assert!(c.access(0x00, false)); // 0x00 survived
    }

    #[test]
    fn fifo_evicts_in_arrival_order_regardless_of_hits() {
        let mut c = Cache::new(64, 2, 32, ReplacementPolicy::Fifo);
        c.access(0x00, false); // way 0, arrival order: [0]
        c.access(0x20, false); // way 1, arrival order: [0, 1]
        c.access(0x00, false); // hit, FIFO order unaffected
        c.access(0x40, false); // miss, evicts way 0 (0x00) despite the recent hit
        assert!(!c.access(0x00, false));
        assert!(c.access(0x20, false));
    }

    #[test]
    fn two_level_hit_in_l2_invalidates_and_promotes() {
        // l1: a single 1-way set, so 0x00 and 0x20 (distinct blocks)
        // fight over the same line and every other access evicts.
        let l1 = Cache::new(32, 1, 32, ReplacementPolicy::Lru);
        let l2 = Cache::new(128, 1, 32, ReplacementPolicy::Lru);
        let mut hier = TwoLevelCache::new(l1, l2);

        hier.access(0x00, false); // L1 + L2 miss, fills L1
        hier.access(0x20, false); // L1 miss, evicts 0x00 into L2
        // Re-access 0x00: L1 misses (currently holds 0x20), but finds it
        // in L2, which invalidates the L2 line and lets 0x00 re-enter L1.
        hier.access(0x00, false);
        assert_eq!(hier.l1_stats().misses, 3);
        assert_eq!(hier.l2_stats().hits, 1);
    }

    #[test]
    fn run_trace_single_parses_and_counts_read_write_mix() {
        let mut c = Cache::new(256, 4, 32, ReplacementPolicy::Lru);
        run_trace_single(&mut c, "R 0x0\nW 0x20\nR 0x0\n");
        let s = c.stats();
        assert_eq!(s.reads, 2);
        assert_eq!(s.writes, 1);
        assert_eq!(s.hits, 1);
        assert_eq!(s.misses, 2);
    }
}
