/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

/// A guest physical address.
pub type PAddr = u32;

/// Write-protection granularity of the guest memory system.
pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;

/// Size of the page-count table: an 18-bit page index space on top of
/// 4 KiB pages covers the whole guest physical address range the GPU can
/// reference.
pub const NUM_TRACKED_PAGES: usize = 1 << 18;

/// Capability handed to the surface cache for reaching guest physical
/// memory. Implementations are externally synchronized; the cache only
/// calls in from the GPU command thread.
pub trait GuestMemory {
    /// Copies guest bytes starting at `addr` into `dest`, clamped to the
    /// size of the mapped region the address resolves into. Returns the
    /// number of bytes copied, or `None` when the address does not
    /// resolve at all.
    fn read_physical(&self, addr: PAddr, dest: &mut [u8]) -> Option<usize>;

    /// Copies `data` into guest memory at `addr`, clamped the same way as
    /// [`GuestMemory::read_physical`].
    fn write_physical(&self, addr: PAddr, data: &[u8]) -> Option<usize>;

    /// Asks the memory system to start (or stop) trapping guest writes to
    /// the given region so the rasterizer hears about them.
    fn mark_region_cached(&self, addr: PAddr, size: u32, cached: bool);
}
