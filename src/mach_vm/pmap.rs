//! Physical Map (pmap) - Translation Table Management
//!
//! Based on Mach4 vm/pmap.h/c
//!
//! The pmap module provides an architecture-independent interface for
//! managing translations. This one keeps a software table from virtual page
//! to resident page; an architecture layer mirrors it into hardware page
//! tables.
//!
//! ## Key Operations
//!
//! - `enter`: Install a mapping from virtual to physical
//! - `remove`: Remove a mapping
//! - `extract`: Get the resident page for a virtual address
//! - `prefault`: Opportunistically map idle neighbours after a fault
//! - `pageable`: Tell the translation layer whether a range may fault

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::mach_vm::vm_map::{VmMapEntry, VmProt};
use crate::mach_vm::vm_object::{ObjectManager, ObjectType};
use crate::mach_vm::vm_page::{
    atop, trunc_page, PageFlags, PageId, PageManager, PageQueueType, PAGE_SIZE,
};

// ============================================================================
// Pmap Statistics
// ============================================================================

/// Statistics for a pmap
#[derive(Debug, Default)]
pub struct PmapStats {
    /// Number of resident pages
    pub resident_count: AtomicU32,
    /// Number of wired pages
    pub wired_count: AtomicU32,
}

impl PmapStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident(&self) -> u32 {
        self.resident_count.load(Ordering::Relaxed)
    }

    pub fn wired(&self) -> u32 {
        self.wired_count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Physical Map
// ============================================================================

/// One installed translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapEntry {
    pub page: PageId,
    pub prot: VmProt,
    pub wired: bool,
}

/// Physical map for one address space
#[derive(Debug, Default)]
pub struct Pmap {
    /// Virtual page -> translation
    mappings: Mutex<BTreeMap<u64, PmapEntry>>,
    /// Virtual pages that must not fault
    nonpageable: Mutex<BTreeSet<u64>>,
    pub stats: PmapStats,
}

impl Pmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the translation for `va`
    pub fn enter(&self, va: u64, page: PageId, prot: VmProt, wired: bool) {
        let va = trunc_page(va);
        let new = PmapEntry { page, prot, wired };
        let old = self.mappings.lock().insert(va, new);
        match old {
            None => {
                self.stats.resident_count.fetch_add(1, Ordering::Relaxed);
                if wired {
                    self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(old) if old.wired != wired => {
                if wired {
                    self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
            Some(_) => {}
        }
        log::trace!("pmap_enter: va={:#x} page={:?} prot={:?}", va, page, prot);
    }

    /// Remove the translation for `va`
    pub fn remove(&self, va: u64) -> Option<PmapEntry> {
        let old = self.mappings.lock().remove(&trunc_page(va));
        if let Some(old) = old {
            self.stats.resident_count.fetch_sub(1, Ordering::Relaxed);
            if old.wired {
                self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        old
    }

    /// Remove every translation of `page` in this map
    pub fn remove_page(&self, page: PageId) {
        let vas: Vec<u64> = self
            .mappings
            .lock()
            .iter()
            .filter(|(_, e)| e.page == page)
            .map(|(&va, _)| va)
            .collect();
        for va in vas {
            self.remove(va);
        }
    }

    /// Resident page mapped at `va`
    pub fn extract(&self, va: u64) -> Option<PageId> {
        self.lookup(va).map(|e| e.page)
    }

    /// Full translation at `va`
    pub fn lookup(&self, va: u64) -> Option<PmapEntry> {
        self.mappings.lock().get(&trunc_page(va)).copied()
    }

    /// Protection installed at `va`
    pub fn protection(&self, va: u64) -> Option<VmProt> {
        self.lookup(va).map(|e| e.prot)
    }

    /// Change the wired attribute of an existing translation
    pub fn change_wiring(&self, va: u64, wired: bool) {
        if let Some(entry) = self.mappings.lock().get_mut(&trunc_page(va)) {
            if entry.wired != wired {
                entry.wired = wired;
                if wired {
                    self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Mark `[start, end)` as allowed (or not) to take faults
    pub fn pageable(&self, start: u64, end: u64, pageable: bool) {
        let mut nonpageable = self.nonpageable.lock();
        let mut va = trunc_page(start);
        while va < end {
            if pageable {
                nonpageable.remove(&va);
            } else {
                nonpageable.insert(va);
            }
            va += PAGE_SIZE as u64;
        }
    }

    pub fn is_pageable(&self, va: u64) -> bool {
        !self.nonpageable.lock().contains(&trunc_page(va))
    }

    /// Map idle, fully valid neighbours of `va` read-only
    ///
    /// Probes alternately behind and ahead of the fault, up to `behind`
    /// and `ahead` pages, inside `entry`. Stops at the first neighbour with
    /// no resident page anywhere along the shadow chain.
    pub fn prefault(
        &self,
        va: u64,
        entry: &VmMapEntry,
        behind: usize,
        ahead: usize,
        objects: &ObjectManager,
        pages: &PageManager,
    ) {
        let Some(object) = entry.object.as_ref() else {
            return;
        };
        let step = PAGE_SIZE as i64;
        let order = (1..=behind.max(ahead) as i64).flat_map(|i| [-i * step, i * step]);

        for delta in order {
            if (delta < 0 && (-delta / step) as usize > behind)
                || (delta > 0 && (delta / step) as usize > ahead)
            {
                continue;
            }
            let addr = va as i64 + delta;
            if addr < entry.start as i64 || addr >= entry.end as i64 {
                continue;
            }
            let addr = addr as u64;
            if self.extract(addr).is_some() {
                continue;
            }

            let mut pindex = atop(addr - entry.start + entry.offset);
            let mut lobject = object.clone();
            let found = loop {
                if let Some(id) = pages.lookup(lobject.id, pindex) {
                    break Some(id);
                }
                if lobject.kind != ObjectType::Default {
                    break None;
                }
                match lobject
                    .backing()
                    .and_then(|(id, off)| objects.lookup(id).map(|b| (b, off)))
                {
                    Some((backing, off)) => {
                        pindex += atop(off);
                        lobject = backing;
                    }
                    None => break None,
                }
            };
            let Some(id) = found else {
                break;
            };

            let page = pages.page(id);
            if !page.is_fully_valid()
                || page.io_count() != 0
                || page.has_flags(PageFlags::FICTITIOUS)
            {
                continue;
            }
            if page.queue() == PageQueueType::Cache {
                pages.deactivate(id);
            }
            if !pages.try_busy(id) {
                continue;
            }
            self.enter(addr, id, VmProt::READ | VmProt::EXECUTE, false);
            page.set_flags(PageFlags::MAPPED);
            pages.wakeup(id);
        }
    }

    pub fn resident_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_extract_remove() {
        let pmap = Pmap::new();
        pmap.enter(0x5123, PageId(7), VmProt::READ, false);
        assert_eq!(pmap.extract(0x5000), Some(PageId(7)));
        assert_eq!(pmap.protection(0x5fff), Some(VmProt::READ));
        assert_eq!(pmap.stats.resident(), 1);

        assert!(pmap.remove(0x5000).is_some());
        assert_eq!(pmap.extract(0x5000), None);
        assert_eq!(pmap.stats.resident(), 0);
    }

    #[test]
    fn test_change_wiring_stats() {
        let pmap = Pmap::new();
        pmap.enter(0x1000, PageId(1), VmProt::READ, true);
        assert_eq!(pmap.stats.wired(), 1);
        pmap.change_wiring(0x1000, false);
        assert_eq!(pmap.stats.wired(), 0);
        assert!(!pmap.lookup(0x1000).unwrap().wired);
    }

    #[test]
    fn test_pageable_ranges() {
        let pmap = Pmap::new();
        pmap.pageable(0x1000, 0x4000, false);
        assert!(!pmap.is_pageable(0x2000));
        assert!(pmap.is_pageable(0x4000));
        pmap.pageable(0x2000, 0x3000, true);
        assert!(pmap.is_pageable(0x2000));
        assert!(!pmap.is_pageable(0x3000));
    }

    #[test]
    fn test_remove_page() {
        let pmap = Pmap::new();
        pmap.enter(0x1000, PageId(1), VmProt::READ, false);
        pmap.enter(0x2000, PageId(1), VmProt::READ, false);
        pmap.enter(0x3000, PageId(2), VmProt::READ, false);
        pmap.remove_page(PageId(1));
        assert_eq!(pmap.resident_count(), 1);
        assert_eq!(pmap.extract(0x3000), Some(PageId(2)));
    }
}
