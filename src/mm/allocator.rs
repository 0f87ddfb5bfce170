//! Page allocator for the simulated physical arena.
//!
//! Bump allocation with a free list in front of it, so spans released by a
//! finished test are handed out again before the arena grows.

pub const PAGE_SIZE: u64 = 4096;

pub struct PageAllocator {
    next: u64,
    end: u64,
    allocated: u64,
    /// Freed spans as (address, pages), kept sorted by address.
    free: Vec<(u64, u64)>,
}

impl PageAllocator {
    pub fn new(start: u64, size: u64) -> Self {
        Self {
            next: start,
            end: start + size,
            allocated: 0,
            free: Vec::new(),
        }
    }

    pub fn alloc_page(&mut self) -> Option<u64> {
        self.alloc_pages(1, PAGE_SIZE)
    }

    /// Allocate `pages` contiguous pages whose base is a multiple of `align`.
    pub fn alloc_pages(&mut self, pages: u64, align: u64) -> Option<u64> {
        if pages == 0 || align == 0 || !align.is_power_of_two() {
            return None;
        }
        let size = pages * PAGE_SIZE;

        if let Some(addr) = self.take_free(size, align) {
            self.allocated += size;
            return Some(addr);
        }

        let aligned = (self.next + align - 1) & !(align - 1);
        let new_next = aligned.checked_add(size)?;

        if new_next > self.end {
            return None;
        }

        // Alignment padding is not lost, it goes back on the free list.
        if aligned > self.next {
            self.insert_free(self.next, (aligned - self.next) / PAGE_SIZE);
        }
        self.next = new_next;
        self.allocated += size;
        Some(aligned)
    }

    /// Return a span previously handed out by [`alloc_pages`](Self::alloc_pages).
    pub fn free_pages(&mut self, addr: u64, pages: u64) {
        let size = pages * PAGE_SIZE;
        self.allocated = self.allocated.saturating_sub(size);
        if addr + size == self.next {
            self.next = addr;
            // Pull the bump pointer back over any free tail as well.
            while let Some(&(a, p)) = self.free.last() {
                if a + p * PAGE_SIZE == self.next {
                    self.next = a;
                    self.free.pop();
                } else {
                    break;
                }
            }
        } else {
            self.insert_free(addr, pages);
        }
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.next + self.free.iter().map(|&(_, p)| p * PAGE_SIZE).sum::<u64>()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    fn take_free(&mut self, size: u64, align: u64) -> Option<u64> {
        let idx = self.free.iter().position(|&(a, p)| {
            let aligned = (a + align - 1) & !(align - 1);
            aligned + size <= a + p * PAGE_SIZE
        })?;
        let (a, p) = self.free.remove(idx);
        let aligned = (a + align - 1) & !(align - 1);
        let end = a + p * PAGE_SIZE;
        if aligned > a {
            self.insert_free(a, (aligned - a) / PAGE_SIZE);
        }
        if aligned + size < end {
            self.insert_free(aligned + size, (end - aligned - size) / PAGE_SIZE);
        }
        Some(aligned)
    }

    fn insert_free(&mut self, addr: u64, pages: u64) {
        if pages == 0 {
            return;
        }
        let idx = self.free.partition_point(|&(a, _)| a < addr);
        self.free.insert(idx, (addr, pages));

        // Coalesce with the following span, then the preceding one.
        if idx + 1 < self.free.len() {
            let (a, p) = self.free[idx];
            let (na, np) = self.free[idx + 1];
            if a + p * PAGE_SIZE == na {
                self.free[idx].1 = p + np;
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (pa, pp) = self.free[idx - 1];
            let (a, p) = self.free[idx];
            if pa + pp * PAGE_SIZE == a {
                self.free[idx - 1].1 = pp + p;
                self.free.remove(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_aligned_and_reuse() {
        let mut a = PageAllocator::new(0x1000_0000, 64 * PAGE_SIZE);
        let p0 = a.alloc_page().unwrap();
        assert_eq!(p0, 0x1000_0000);
        let p1 = a.alloc_pages(2, 4 * PAGE_SIZE).unwrap();
        assert_eq!(p1 % (4 * PAGE_SIZE), 0);
        assert_eq!(a.allocated(), 3 * PAGE_SIZE);

        // Padding between p0 and p1 is reusable.
        let p2 = a.alloc_page().unwrap();
        assert!(p2 > p0 && p2 < p1);

        a.free_pages(p1, 2);
        a.free_pages(p2, 1);
        a.free_pages(p0, 1);
        assert_eq!(a.allocated(), 0);
        assert_eq!(a.remaining(), 64 * PAGE_SIZE);
    }

    #[test]
    fn test_exhaustion() {
        let mut a = PageAllocator::new(0, 2 * PAGE_SIZE);
        assert!(a.alloc_pages(3, PAGE_SIZE).is_none());
        assert!(a.alloc_pages(2, PAGE_SIZE).is_some());
        assert!(a.alloc_page().is_none());
        assert!(a.alloc_pages(0, PAGE_SIZE).is_none());
    }
}
