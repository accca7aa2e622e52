//! Software page-table MMU: a two-level page directory over a simulated
//! physical memory, backed by a direct-mapped TLB.
//!
//! Page directory and page table entries are stored as plain frame
//! numbers inside the simulated physical memory buffer and always
//! resolved through `frame_number * PGSIZE`, rather than being cast
//! back to host pointers — this also decouples the simulated address
//! width from the host's pointer width.

use std::sync::Mutex;

pub const PGSIZE: u32 = 4096;
pub const MEMSIZE: u64 = 8 * 1024 * 1024; // simulated physical memory
pub const NUM_PHYSICAL_PAGES: u32 = (MEMSIZE / PGSIZE as u64) as u32;
pub const NUM_VIRTUAL_PAGES: u32 = 1 << 16;
pub const PT_ENTRIES: u32 = 1024;
pub const TLB_ENTRIES: u32 = 512;

fn offset_bits() -> u32 {
    PGSIZE.trailing_zeros()
}

fn index_bits() -> u32 {
    PT_ENTRIES.trailing_zeros()
}

#[derive(Clone, Copy, Default)]
struct TlbEntry {
    tag: u32,
    pfn: u32, // 0 means empty
}

struct Bitmap {
    bits: Vec<u8>,
}

impl Bitmap {
    fn new(n_bits: u32) -> Self {
        Bitmap {
            bits: vec![0u8; ((n_bits + 7) / 8) as usize],
        }
    }

    fn get(&self, i: u32) -> bool {
        (self.bits[(i / 8) as usize] >> (i % 8)) & 1 != 0
    }

    fn set(&mut self, i: u32) {
        self.bits[(i / 8) as usize] |= 1 << (i % 8);
    }

    fn clear(&mut self, i: u32) {
        self.bits[(i / 8) as usize] &= !(1 << (i % 8));
    }

    fn range_all_clear(&self, start_bit: u32, count: u32) -> bool {
        (start_bit..start_bit + count).all(|i| !self.get(i))
    }
}

pub struct Translator {
    physical_mem: Vec<u8>,
    physical_bitmap: Bitmap,
    virtual_bitmap: Bitmap,
    tlb: Vec<TlbEntry>,
    tlb_lookups: u64,
    tlb_misses: u64,
    initialized: bool,
}

impl Translator {
    pub fn new() -> Self {
        Translator {
            physical_mem: Vec::new(),
            physical_bitmap: Bitmap::new(NUM_PHYSICAL_PAGES),
            virtual_bitmap: Bitmap::new(NUM_VIRTUAL_PAGES),
            tlb: vec![TlbEntry::default(); TLB_ENTRIES as usize],
            tlb_lookups: 0,
            tlb_misses: 0,
            initialized: false,
        }
    }

    fn ensure_init(&mut self) {
        if self.initialized {
            return;
        }
        self.physical_mem = vec![0u8; MEMSIZE as usize];
        // Frame 0 holds the page directory; claim it, and reserve VPN 0.
        self.physical_bitmap.set(0);
        self.virtual_bitmap.set(0);
        self.initialized = true;
    }

    fn pde(&self, pd_idx: u32) -> u32 {
        let off = pd_idx as usize * 4;
        u32::from_ne_bytes(self.physical_mem[off..off + 4].try_into().unwrap())
    }

    fn set_pde(&mut self, pd_idx: u32, frame: u32) {
        let off = pd_idx as usize * 4;
        self.physical_mem[off..off + 4].copy_from_slice(&frame.to_ne_bytes());
    }

    fn pte(&self, pt_frame: u32, pt_idx: u32) -> u32 {
        let off = pt_frame as usize * PGSIZE as usize + pt_idx as usize * 4;
        u32::from_ne_bytes(self.physical_mem[off..off + 4].try_into().unwrap())
    }

    fn set_pte(&mut self, pt_frame: u32, pt_idx: u32, pfn: u32) {
        let off = pt_frame as usize * PGSIZE as usize + pt_idx as usize * 4;
        self.physical_mem[off..off + 4].copy_from_slice(&pfn.to_ne_bytes());
    }

    fn decompose(va: u64) -> (u32, u32, u32) {
        let off_bits = offset_bits();
        let idx_bits = index_bits();
        let pd_idx = ((va >> (off_bits + idx_bits)) & ((1u64 << idx_bits) - 1)) as u32;
        let pt_idx = ((va >> off_bits) & ((1u64 << idx_bits) - 1)) as u32;
        let offset = (va & ((1u64 << off_bits) - 1)) as u32;
        (pd_idx, pt_idx, offset)
    }

    fn vpn_of(va: u64) -> u32 {
        (va >> offset_bits()) as u32
    }

    fn find_next_avail_frame(&self) -> Option<u32> {
        (0..NUM_PHYSICAL_PAGES).find(|&pfn| !self.physical_bitmap.get(pfn))
    }

    /// Find `num_pages` consecutive clear bits in the virtual bitmap by a
    /// sliding scan, mirroring `get_next_avail`'s skip-past-the-collision
    /// behavior (rather than a simple `start += 1` retry).
    fn find_next_avail_vpn_run(&self, num_pages: u32) -> Option<u32> {
        let mut start = 0u32;
        while start < NUM_VIRTUAL_PAGES {
            let mut i = 0u32;
            while i < num_pages {
                if self.virtual_bitmap.get(start + i) {
                    start += i + 1;
                    break;
                }
                i += 1;
            }
            if i == num_pages {
                return Some(start);
            }
        }
        None
    }

    fn add_tlb(&mut self, vpn: u32, pfn: u32) {
        let idx = (vpn % TLB_ENTRIES) as usize;
        self.tlb[idx] = TlbEntry { tag: vpn, pfn };
    }

    fn invalidate_tlb(&mut self, vpn: u32) {
        let idx = (vpn % TLB_ENTRIES) as usize;
        if self.tlb[idx].tag == vpn && self.tlb[idx].pfn != 0 {
            self.tlb[idx] = TlbEntry::default();
        }
    }

    fn check_tlb(&self, vpn: u32) -> Option<u32> {
        let idx = (vpn % TLB_ENTRIES) as usize;
        let e = self.tlb[idx];
        if e.tag == vpn && e.pfn != 0 {
            Some(e.pfn)
        } else {
            None
        }
    }

    /// Walk the directory for `va`; installs the result into the TLB on a
    /// successful miss. Returns the physical address, or `None` if
    /// unmapped.
    fn translate(&mut self, va: u64) -> Option<u64> {
        self.tlb_lookups += 1;
        let vpn = Self::vpn_of(va);
        let (_, _, offset) = Self::decompose(va);

        if let Some(pfn) = self.check_tlb(vpn) {
            return Some((pfn as u64) * PGSIZE as u64 + offset as u64);
        }
        self.tlb_misses += 1;

        let (pd_idx, pt_idx, _) = Self::decompose(va);
        let pt_frame = self.pde(pd_idx);
        if pt_frame == 0 {
            return None;
        }
        let pfn = self.pte(pt_frame, pt_idx);
        if pfn == 0 {
            return None;
        }
        self.add_tlb(vpn, pfn);
        Some((pfn as u64) * PGSIZE as u64 + offset as u64)
    }

    /// Install `va -> pa` in the page table, allocating no new page-table
    /// frames itself (callers must ensure the PDE is already populated).
    /// Fails if the slot is already mapped.
    fn page_map(&mut self, va: u64, pfn: u32) -> bool {
        let (pd_idx, pt_idx, _) = Self::decompose(va);
        let pt_frame = self.pde(pd_idx);
        if pt_frame == 0 {
            return false;
        }
        if self.pte(pt_frame, pt_idx) != 0 {
            return false;
        }
        self.set_pte(pt_frame, pt_idx, pfn);
        self.add_tlb(Self::vpn_of(va), pfn);
        true
    }

    fn highest_populated_pde(&self) -> u32 {
        (0..PT_ENTRIES).take_while(|&i| self.pde(i) != 0).count() as u32
    }

    /// Allocate `num_bytes`, page-rounded. Returns the base virtual
    /// address of the run, or `None` if physical memory or virtual
    /// address space is exhausted.
    pub fn t_malloc(&mut self, num_bytes: u32) -> Option<u64> {
        self.ensure_init();
        if num_bytes == 0 {
            return None;
        }
        let num_pages = (num_bytes + PGSIZE - 1) / PGSIZE;
        let start_vfn = self.find_next_avail_vpn_run(num_pages)?;
        let end_vfn = start_vfn + num_pages - 1;

        let mut len_pt = self.highest_populated_pde();
        if end_vfn >= len_pt * PT_ENTRIES {
            let num_pt_needed = (end_vfn + 1 - len_pt * PT_ENTRIES + PT_ENTRIES - 1) / PT_ENTRIES;
            for _ in 0..num_pt_needed {
                let frame = self.find_next_avail_frame()?;
                self.physical_bitmap.set(frame);
                self.set_pde(len_pt, frame);
                len_pt += 1;
            }
        }

        for i in 0..num_pages {
            let vfn = start_vfn + i;
            let va = (vfn as u64) * PGSIZE as u64;
            let frame = self.find_next_avail_frame()?;
            if self.page_map(va, frame) {
                self.physical_bitmap.set(frame);
                self.virtual_bitmap.set(vfn);
            }
        }

        Some((start_vfn as u64) * PGSIZE as u64)
    }

    /// Free `num_bytes` starting at `va` (must equal an earlier
    /// `t_malloc` extent). Refuses the whole operation if any covered
    /// page is not currently allocated.
    pub fn t_free(&mut self, va: u64, num_bytes: u32) {
        if num_bytes == 0 {
            return;
        }
        let num_pages = (num_bytes + PGSIZE - 1) / PGSIZE;
        let start_vfn = Self::vpn_of(va);

        for i in 0..num_pages {
            if !self.virtual_bitmap.get(start_vfn + i) {
                return;
            }
        }

        for i in 0..num_pages {
            let vfn = start_vfn + i;
            let curr_va = va + (i as u64) * PGSIZE as u64;
            let Some(pa) = self.translate(curr_va) else {
                continue;
            };
            let pfn = (pa / PGSIZE as u64) as u32;
            self.physical_bitmap.clear(pfn);
            self.virtual_bitmap.clear(vfn);

            let (pd_idx, pt_idx, _) = Self::decompose(curr_va);
            let pt_frame = self.pde(pd_idx);
            if pt_frame != 0 {
                self.set_pte(pt_frame, pt_idx, 0);
                if self
                    .virtual_bitmap
                    .range_all_clear(pd_idx * PT_ENTRIES, PT_ENTRIES)
                {
                    self.physical_bitmap.clear(pt_frame);
                    self.set_pde(pd_idx, 0);
                }
            }
            self.invalidate_tlb(Self::vpn_of(curr_va));
        }
    }

    /// Copy `src` into the pages backing `va..va+src.len()`. Fails (no
    /// partial write) if any covered page is unallocated.
    pub fn put_value(&mut self, va: u64, src: &[u8]) -> bool {
        let size = src.len() as u32;
        if size == 0 {
            return true;
        }
        let (_, _, offset0) = Self::decompose(va);
        let num_pages = (offset0 + size + PGSIZE - 1) / PGSIZE;
        let start_vfn = Self::vpn_of(va);
        for i in 0..num_pages {
            if !self.virtual_bitmap.get(start_vfn + i) {
                return false;
            }
        }

        let mut curr_va = va;
        let mut written = 0usize;
        let mut remaining = size;
        let mut offset = offset0;
        for _ in 0..num_pages {
            let chunk = remaining.min(PGSIZE - offset);
            let Some(pa) = self.translate(curr_va) else {
                return false;
            };
            let pa = pa as usize;
            self.physical_mem[pa..pa + chunk as usize]
                .copy_from_slice(&src[written..written + chunk as usize]);
            offset = 0;
            curr_va += chunk as u64;
            written += chunk as usize;
            remaining -= chunk;
        }
        true
    }

    /// Copy `dst.len()` bytes starting at `va` out of simulated physical
    /// memory. Every covered VPN is validated as allocated before any
    /// copy happens, so a call spanning an unmapped page fails closed
    /// instead of reading through a stale translation.
    pub fn get_value(&mut self, va: u64, dst: &mut [u8]) -> bool {
        let size = dst.len() as u32;
        if size == 0 {
            return true;
        }
        let (_, _, offset0) = Self::decompose(va);
        let num_pages = (offset0 + size + PGSIZE - 1) / PGSIZE;
        let start_vfn = Self::vpn_of(va);
        for i in 0..num_pages {
            if !self.virtual_bitmap.get(start_vfn + i) {
                return false;
            }
        }

        let mut curr_va = va;
        let mut read = 0usize;
        let mut remaining = size;
        let mut offset = offset0;
        for _ in 0..num_pages {
            let chunk = remaining.min(PGSIZE - offset);
            let Some(pa) = self.translate(curr_va) else {
                return false;
            };
            let pa = pa as usize;
            dst[read..read + chunk as usize]
                .copy_from_slice(&self.physical_mem[pa..pa + chunk as usize]);
            offset = 0;
            curr_va += chunk as u64;
            read += chunk as usize;
            remaining -= chunk;
        }
        true
    }

    /// `answer[i][j] = sum_k a[i][k] * b[k][j]`, over `n x n` matrices of
    /// `i32`, driven entirely through `get_value`/`put_value`.
    pub fn mat_mult(&mut self, va_a: u64, va_b: u64, n: u32, va_c: u64) {
        let elem = std::mem::size_of::<i32>() as u64;
        for i in 0..n {
            for j in 0..n {
                let mut c: i32 = 0;
                for k in 0..n {
                    let addr_a = va_a + (i as u64 * n as u64 + k as u64) * elem;
                    let addr_b = va_b + (k as u64 * n as u64 + j as u64) * elem;
                    let mut a_bytes = [0u8; 4];
                    let mut b_bytes = [0u8; 4];
                    self.get_value(addr_a, &mut a_bytes);
                    self.get_value(addr_b, &mut b_bytes);
                    c = c.wrapping_add(i32::from_ne_bytes(a_bytes).wrapping_mul(i32::from_ne_bytes(b_bytes)));
                }
                let addr_c = va_c + (i as u64 * n as u64 + j as u64) * elem;
                self.put_value(addr_c, &c.to_ne_bytes());
            }
        }
    }

    pub fn tlb_miss_rate(&self) -> f64 {
        if self.tlb_lookups == 0 {
            0.0
        } else {
            self.tlb_misses as f64 / self.tlb_lookups as f64
        }
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// Process-wide instance the CLI binaries talk to, covered by one
    /// coarse lock: every operation blocks while another is active and
    /// none suspends while holding it.
    pub static ref VM: Mutex<Translator> = Mutex::new(Translator::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_marks_consecutive_pages() {
        let mut t = Translator::new();
        let va = t.t_malloc(PGSIZE * 3).unwrap();
        assert_eq!(va % PGSIZE as u64, 0);
        let start_vfn = Translator::vpn_of(va);
        for i in 0..3 {
            assert!(t.virtual_bitmap.get(start_vfn + i));
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut t = Translator::new();
        let va = t.t_malloc(PGSIZE * 3).unwrap();
        let target = va + PGSIZE as u64;
        assert!(t.put_value(target, b"hi\0"));
        let mut buf = [0u8; 3];
        assert!(t.get_value(target, &mut buf));
        assert_eq!(&buf, b"hi\0");
    }

    #[test]
    fn free_restores_bitmaps_and_invalidates_tlb() {
        let mut t = Translator::new();
        let va = t.t_malloc(PGSIZE * 3).unwrap();
        let post_init_phys = t.physical_bitmap.bits.clone();
        let post_init_virt_popcount: u32 = (0..NUM_VIRTUAL_PAGES).filter(|&i| t.virtual_bitmap.get(i)).count() as u32;

        let _ = t.put_value(va, b"x");
        t.t_free(va, PGSIZE * 3);

        let vpn = Translator::vpn_of(va);
        assert!(t.check_tlb(vpn).is_none());
        let after_virt_popcount: u32 = (0..NUM_VIRTUAL_PAGES).filter(|&i| t.virtual_bitmap.get(i)).count() as u32;
        assert_eq!(after_virt_popcount, post_init_virt_popcount - 3);
        assert_ne!(t.physical_bitmap.bits, post_init_phys); // pages we freed differ from right-after-malloc snapshot
    }

    #[test]
    fn byte_allocation_rounds_up_to_one_page() {
        let mut t = Translator::new();
        let va = t.t_malloc(1).unwrap();
        assert_eq!(Translator::vpn_of(va + PGSIZE as u64 - 1), Translator::vpn_of(va));
    }

    #[test]
    fn crossing_page_table_boundary_grows_directory() {
        let mut t = Translator::new();
        let before = t.highest_populated_pde();
        let _ = t.t_malloc(PGSIZE * (PT_ENTRIES + 1)).unwrap();
        assert!(t.highest_populated_pde() > before);
    }

    #[test]
    fn freeing_last_vpn_of_a_page_table_reclaims_its_frame() {
        let mut t = Translator::new();
        // VPN 0 is permanently reserved by `ensure_init`, so pd_idx 0's
        // page table can never go fully clear and its frame is never
        // reclaimable. Fill the rest of pd_idx 0 (the remaining 1023
        // slots) first, so the next allocation lands as the lone
        // occupant of pd_idx 1 and reclaiming it is a clean test of the
        // general path rather than the permanently-pinned one.
        let _ = t.t_malloc(PGSIZE * (PT_ENTRIES - 1)).unwrap();
        let va = t.t_malloc(PGSIZE).unwrap();
        let pd_idx = Translator::vpn_of(va) / PT_ENTRIES;
        assert_eq!(pd_idx, 1);
        let pt_frame = t.pde(pd_idx);
        assert!(t.physical_bitmap.get(pt_frame));
        t.t_free(va, PGSIZE);
        assert!(!t.physical_bitmap.get(pt_frame));
        assert_eq!(t.pde(pd_idx), 0);
    }

    #[test]
    fn get_value_fails_closed_on_unallocated_vpn() {
        let mut t = Translator::new();
        let mut buf = [0u8; 4];
        assert!(!t.get_value(123 * PGSIZE as u64, &mut buf));
    }

    #[test]
    fn matrix_multiply_computes_expected_product() {
        let mut t = Translator::new();
        let n = 2u32;
        let bytes = (n * n * 4) as u32;
        let va_a = t.t_malloc(bytes).unwrap();
        let va_b = t.t_malloc(bytes).unwrap();
        let va_c = t.t_malloc(bytes).unwrap();

        let a = [1i32, 2, 3, 4];
        let b = [5i32, 6, 7, 8];
        for (i, v) in a.iter().enumerate() {
            t.put_value(va_a + (i as u64) * 4, &v.to_ne_bytes());
        }
        for (i, v) in b.iter().enumerate() {
            t.put_value(va_b + (i as u64) * 4, &v.to_ne_bytes());
        }

        t.mat_mult(va_a, va_b, n, va_c);

        let mut out = [0i32; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            let mut buf = [0u8; 4];
            t.get_value(va_c + (i as u64) * 4, &mut buf);
            *slot = i32::from_ne_bytes(buf);
        }
        assert_eq!(out, [19, 22, 43, 50]);
    }
}
