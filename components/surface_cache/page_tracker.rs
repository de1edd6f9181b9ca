/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-page reference counts of cached surfaces. Transitions between
//! zero and one drive the memory system's write trapping: a page with at
//! least one cached surface over it must fault guest writes so the cache
//! hears about them.

use gpu_traits::{GuestMemory, NUM_TRACKED_PAGES, PAGE_BITS, PAGE_SIZE, PAddr};
use log::error;

pub struct PageCountTracker {
    cached_pages: Vec<u16>,
}

impl Default for PageCountTracker {
    fn default() -> PageCountTracker {
        PageCountTracker::new()
    }
}

impl PageCountTracker {
    pub fn new() -> PageCountTracker {
        PageCountTracker { cached_pages: vec![0; NUM_TRACKED_PAGES] }
    }

    #[cfg(test)]
    pub fn count_for(&self, addr: PAddr) -> u16 {
        self.cached_pages[(addr >> PAGE_BITS) as usize]
    }

    pub fn all_zero(&self) -> bool {
        self.cached_pages.iter().all(|&count| count == 0)
    }

    /// Applies `delta` (±1) to every page touching `[addr, addr + size)`.
    /// Contiguous runs of pages crossing the 0↔1 boundary are reported to
    /// the memory system as single `mark_region_cached` calls.
    pub fn update_pages_cached_count(
        &mut self,
        memory: &dyn GuestMemory,
        addr: PAddr,
        size: u32,
        delta: i32,
    ) {
        debug_assert!(delta == 1 || delta == -1);
        if size == 0 {
            return;
        }

        let page_start = addr >> PAGE_BITS;
        let page_end = ((addr + size - 1) >> PAGE_BITS) + 1;

        let mut uncache_start_addr = 0;
        let mut cache_start_addr = 0;
        let mut uncache_bytes = 0;
        let mut cache_bytes = 0;

        for page in page_start..page_end {
            let Some(count) = self.cached_pages.get_mut(page as usize) else {
                error!("Surface page {page:#x} outside the tracked range");
                continue;
            };

            if delta > 0 {
                debug_assert!(*count < u16::MAX, "page count overflow");
            } else {
                debug_assert!(*count > 0, "page count underflow");
            }
            *count = count.wrapping_add_signed(delta as i16);

            if *count == 0 {
                if uncache_bytes == 0 {
                    uncache_start_addr = page << PAGE_BITS;
                }
                uncache_bytes += PAGE_SIZE;
            } else if uncache_bytes > 0 {
                memory.mark_region_cached(uncache_start_addr, uncache_bytes, false);
                uncache_bytes = 0;
            }

            if *count == 1 && delta > 0 {
                if cache_bytes == 0 {
                    cache_start_addr = page << PAGE_BITS;
                }
                cache_bytes += PAGE_SIZE;
            } else if cache_bytes > 0 {
                memory.mark_region_cached(cache_start_addr, cache_bytes, true);
                cache_bytes = 0;
            }
        }

        if uncache_bytes > 0 {
            memory.mark_region_cached(uncache_start_addr, uncache_bytes, false);
        }
        if cache_bytes > 0 {
            memory.mark_region_cached(cache_start_addr, cache_bytes, true);
        }
    }

    /// Releases every tracked page, untrapping any region still cached.
    pub fn clear_all(&mut self, memory: &dyn GuestMemory) {
        let mut uncache_start_addr = 0;
        let mut uncache_bytes = 0;

        for (page, count) in self.cached_pages.iter().enumerate() {
            if *count != 0 {
                if uncache_bytes == 0 {
                    uncache_start_addr = (page as u32) << PAGE_BITS;
                }
                uncache_bytes += PAGE_SIZE;
            } else if uncache_bytes > 0 {
                memory.mark_region_cached(uncache_start_addr, uncache_bytes, false);
                uncache_bytes = 0;
            }
        }
        if uncache_bytes > 0 {
            memory.mark_region_cached(uncache_start_addr, uncache_bytes, false);
        }

        self.cached_pages.fill(0);
    }
}
