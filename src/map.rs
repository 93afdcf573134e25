//! This module provides the guest virtual address space for the Linux
//! variant: one host-reserved arena plus [`VmMap`], the 4 KiB page
//! table tracking reservations, permission keys, backing fds, and the
//! program break.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::Error;

/// Guest page size.
pub const PAGE_SIZE: u64 = 4096;

/// Lowest address the break may take; `brk` requests below it are
/// ignored.
pub const MIN_BRK: u64 = 0x0001_0000;

/// Default guest arena reservation.
pub const DEFAULT_ARENA_SIZE: usize = 1 << 30;

bitflags! {
    /// Per-page permission key bits.
    pub struct PageKey: u8 {
        /// Page is present and user accessible.
        const U  = 1 << 0;
        /// Page is writable.
        const RW = 1 << 1;
        /// Execution disabled.
        const XD = 1 << 2;
    }
}

/// Translates guest PROT bits into a page key; `None` for undefined
/// bits.
pub fn prot_to_page(prot: i32) -> Option<PageKey> {
    const PROT_READ: i32 = 1;
    const PROT_WRITE: i32 = 2;
    const PROT_EXEC: i32 = 4;
    if prot & !(PROT_READ | PROT_WRITE | PROT_EXEC) != 0 {
        return None;
    }
    let mut key = PageKey::empty();
    if prot & PROT_READ != 0 {
        key |= PageKey::U;
    }
    if prot & PROT_WRITE != 0 {
        key |= PageKey::RW;
    }
    if prot & PROT_EXEC == 0 {
        key |= PageKey::XD;
    }
    Some(key)
}

/// Metadata for one reserved page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageEntry {
    pub key: PageKey,
    /// Backing host fd, or -1 for anonymous pages.
    pub fd: i32,
    pub shared: bool,
}

/// The page table and break. Every operation on it happens under the
/// System's single mmap lock.
pub struct VmMap {
    pages: BTreeMap<u64, PageEntry>,
    limit: u64,
    pub brk: u64,
}

impl VmMap {
    fn new(limit: u64, brk: u64) -> Self {
        Self {
            pages: BTreeMap::new(),
            limit,
            brk,
        }
    }

    /// Reserves `[virt, virt+size)` with the given key. Existing pages
    /// in the range are replaced, as a fixed mmap would.
    pub fn reserve(&mut self, virt: u64, size: u64, key: PageKey, fd: i32, shared: bool) -> bool {
        if virt % PAGE_SIZE != 0 || virt.checked_add(size).map_or(true, |end| end > self.limit) {
            return false;
        }
        let entry = PageEntry { key, fd, shared };
        let mut page = virt;
        while page < virt + size {
            self.pages.insert(page, entry.clone());
            page += PAGE_SIZE;
        }
        true
    }

    /// Releases every page in `[virt, virt+size)`.
    pub fn free(&mut self, virt: u64, size: u64) -> bool {
        if virt % PAGE_SIZE != 0 || virt.checked_add(size).is_none() {
            return false;
        }
        let mut page = virt;
        let end = round_up(virt + size);
        while page < end {
            self.pages.remove(&page);
            page += PAGE_SIZE;
        }
        true
    }

    /// Rewrites page keys over a range: `key = key & !clear | set`.
    pub fn protect(&mut self, virt: u64, size: u64, clear: PageKey, set: PageKey) {
        let end = round_up(virt + size);
        for (_, entry) in self.pages.range_mut(virt..end) {
            entry.key = entry.key & !clear | set;
        }
    }

    /// Whether every page of `[virt, virt+size)` is reserved.
    pub fn reserved(&self, virt: u64, size: u64) -> bool {
        if size == 0 {
            return virt < self.limit;
        }
        let start = round_down(virt);
        let end = match virt.checked_add(size) {
            Some(e) if e <= self.limit => round_up(e),
            _ => return false,
        };
        let mut page = start;
        while page < end {
            if !self.pages.contains_key(&page) {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    /// The entry covering `virt`, if reserved.
    pub fn entry(&self, virt: u64) -> Option<&PageEntry> {
        self.pages.get(&round_down(virt))
    }

    /// Finds `size` bytes of contiguous free pages at or above `hint`.
    pub fn find_virtual(&self, hint: u64, size: u64) -> Option<u64> {
        let size = round_up(size.max(1));
        let mut addr = round_up(hint).max(PAGE_SIZE);
        loop {
            if addr.checked_add(size).map_or(true, |end| end > self.limit) {
                return None;
            }
            match self.pages.range(addr..addr + size).next() {
                None => return Some(addr),
                Some((&page, _)) => addr = page + PAGE_SIZE,
            }
        }
    }
}

fn round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn round_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// The guest address space: a host anonymous reservation addressed by
/// guest linear addresses starting at zero, with the page table
/// deciding which parts the guest may actually touch.
pub struct AddressSpace {
    base: *mut u8,
    size: usize,
    map: Mutex<VmMap>,
}

// The raw arena pointer is only dereferenced through checked guest
// ranges; the page table carries its own lock.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    pub fn new(size: usize, brk: u64) -> Result<Self, Error> {
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_NORESERVE,
                -1,
                0,
            )?
        };
        Ok(Self {
            base: base as *mut u8,
            size,
            map: Mutex::new(VmMap::new(size as u64, brk)),
        })
    }

    /// Takes the mmap lock.
    pub fn lock(&self) -> MutexGuard<'_, VmMap> {
        self.map.lock().unwrap()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolves a guest linear address to a host pointer iff the whole
    /// access range is reserved.
    pub fn lookup(&self, virt: u64, len: u64) -> Option<*mut u8> {
        if !self.lock().reserved(virt, len) {
            return None;
        }
        Some(unsafe { self.base.add(virt as usize) })
    }

    /// Host view of a reserved guest range.
    pub fn guest_slice(&self, virt: u64, len: u64) -> Option<&mut [u8]> {
        let p = self.lookup(virt, len)?;
        Some(unsafe { std::slice::from_raw_parts_mut(p, len as usize) })
    }

    /// A naturally-aligned guest word as a host atomic, for futex words
    /// and ctid stores.
    pub fn atomic_u32(&self, virt: u64) -> Option<&AtomicU32> {
        if virt % 4 != 0 {
            return None;
        }
        let p = self.lookup(virt, 4)?;
        Some(unsafe { &*(p as *const AtomicU32) })
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base as *mut _, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> VmMap {
        VmMap::new(1 << 30, MIN_BRK)
    }

    #[test]
    fn reserve_makes_range_reserved() {
        let mut m = map();
        assert!(m.reserve(0x10000, 0x3000, PageKey::U | PageKey::RW, -1, false));
        assert!(m.reserved(0x10000, 0x3000));
        assert!(m.reserved(0x10fff, 1));
        assert!(!m.reserved(0x13000, 1));
        assert!(!m.reserved(0x0f000, 0x2000));
    }

    #[test]
    fn free_releases_pages() {
        let mut m = map();
        m.reserve(0x10000, 0x3000, PageKey::U, -1, false);
        assert!(m.free(0x11000, 0x1000));
        assert!(!m.reserved(0x11000, 1));
        assert!(m.reserved(0x10000, 0x1000));
        assert!(m.reserved(0x12000, 0x1000));
    }

    #[test]
    fn unaligned_reserve_fails() {
        let mut m = map();
        assert!(!m.reserve(0x10001, 0x1000, PageKey::U, -1, false));
    }

    #[test]
    fn protect_rewrites_keys() {
        let mut m = map();
        m.reserve(0x10000, 0x2000, PageKey::U | PageKey::RW, -1, false);
        m.protect(
            0x10000,
            0x1000,
            PageKey::U | PageKey::RW | PageKey::XD,
            PageKey::U | PageKey::XD,
        );
        assert_eq!(m.entry(0x10000).unwrap().key, PageKey::U | PageKey::XD);
        assert_eq!(m.entry(0x11000).unwrap().key, PageKey::U | PageKey::RW);
    }

    #[test]
    fn find_virtual_skips_reserved_holes() {
        let mut m = map();
        m.reserve(0x10000, 0x1000, PageKey::U, -1, false);
        m.reserve(0x12000, 0x1000, PageKey::U, -1, false);
        // A two-page request at 0x10000 must land past 0x12000.
        assert_eq!(m.find_virtual(0x10000, 0x2000), Some(0x13000));
        // A one-page request fits in the hole.
        assert_eq!(m.find_virtual(0x10000, 0x1000), Some(0x11000));
    }

    #[test]
    fn find_virtual_respects_limit() {
        let m = VmMap::new(0x20000, MIN_BRK);
        assert_eq!(m.find_virtual(0x1f000, 0x1000), Some(0x1f000));
        assert_eq!(m.find_virtual(0x1f000, 0x2000), None);
    }

    #[test]
    fn prot_translation() {
        assert_eq!(prot_to_page(0), Some(PageKey::XD));
        assert_eq!(prot_to_page(1), Some(PageKey::U | PageKey::XD));
        assert_eq!(prot_to_page(3), Some(PageKey::U | PageKey::RW | PageKey::XD));
        assert_eq!(prot_to_page(7), Some(PageKey::U | PageKey::RW));
        assert_eq!(prot_to_page(0x10), None);
    }

    #[test]
    fn arena_lookup_requires_reservation() {
        let space = AddressSpace::new(1 << 20, MIN_BRK).unwrap();
        assert!(space.lookup(0x1000, 8).is_none());
        space
            .lock()
            .reserve(0x1000, 0x1000, PageKey::U | PageKey::RW, -1, false);
        let p = space.lookup(0x1000, 8).unwrap();
        unsafe {
            *p = 0x5a;
        }
        assert_eq!(space.guest_slice(0x1000, 1).unwrap()[0], 0x5a);
        // Crossing past the reservation fails.
        assert!(space.lookup(0x1ffc, 8).is_none());
    }
}
