//! VM Fault - Page Fault Handling
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Resolves a fault at a virtual address by finding or creating the page
//! that belongs there and installing it in the physical map.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: Anonymous pages get zero-filled on first access
//! - **Page-in**: Pages read from the object's pager, together with a
//!   cluster of neighbours
//! - **Copy-on-write**: A page found in a backing object is copied (or
//!   moved) into the top-level object on write access
//!
//! ## Protocol
//!
//! 1. Translate the address through the map, holding the map lock
//! 2. Walk the shadow chain from the top-level object until a resident,
//!    valid page turns up, asking each pager-backed object for the page
//! 3. Push the page up to the top-level object on a write
//! 4. Revalidate the translation if the map was dropped for I/O
//! 5. Enter the page in the pmap and update wiring, queues and accounting
//!
//! Any step that has to wait (busy page, memory shortage, changed map) gives
//! up every lock and reference it holds and starts over from step 1.

use alloc::sync::Arc;

use crate::kern::counters::{FaultKind, MachCounter};
use crate::mach_vm::vm_cluster::{VM_FAULT_READ_AHEAD, VM_FAULT_READ_BEHIND};
use crate::mach_vm::vm_map::{EntryFlags, MapError, MapGuard, MapLookup, VmMap, VmMapEntry, VmProt};
use crate::mach_vm::vm_object::{ObjectBehavior, ObjectFlags, ObjectType, VmObject, VnodeGuard};
use crate::mach_vm::vm_page::{
    atop, trunc_page, AllocError, AllocRequest, PageFlags, PageId, PageLookup, PageQueueType,
    VM_PAGE_BITS_ALL,
};
use crate::mach_vm::vm_pager::PagerStatus;
use crate::mach_vm::VmSystem;

// ============================================================================
// Fault Result
// ============================================================================

/// Ways a fault can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// No mapping at the address
    #[error("invalid address")]
    InvalidAddress,
    /// Access not permitted, or the backing store has no such page
    #[error("protection failure")]
    ProtectionFailure,
    /// The pager reported an I/O error
    #[error("pager failure")]
    Failure,
}

impl From<MapError> for FaultError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::ProtectionFailure => FaultError::ProtectionFailure,
            MapError::InvalidAddress | MapError::InvalidRange | MapError::NoSpace => {
                FaultError::InvalidAddress
            }
        }
    }
}

/// Result of a page fault operation
pub type FaultResult = Result<(), FaultError>;

/// Fault flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultFlags(u32);

impl FaultFlags {
    /// Ordinary fault
    pub const NORMAL: Self = Self(0);
    /// Fault taken to change the wiring of the page
    pub const CHANGE_WIRING: Self = Self(0x01);
    /// Fault taken to wire the page on behalf of a user request
    pub const USER_WIRE: Self = Self(0x02);
    /// Either wiring flag
    pub const WIRE_MASK: Self = Self(0x03);
    /// Leave the page held on return
    pub const HOLD: Self = Self(0x04);
    /// Mark the page fully dirty on a write
    pub const DIRTY: Self = Self(0x08);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The wiring flags alone
    pub const fn wiring(self) -> Self {
        Self(self.0 & Self::WIRE_MASK.0)
    }
}

impl core::ops::BitOr for FaultFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
#[derive(Debug)]
pub struct FaultStats {
    /// Total faults
    pub faults: MachCounter,
    /// Copy-on-write faults
    pub cow_faults: MachCounter,
    /// Copy-on-write faults resolved by moving the page
    pub cow_optim: MachCounter,
    /// Zero-fill faults
    pub zfod: MachCounter,
    /// Zero-fills that had to clear the frame
    pub ozfod: MachCounter,
    /// Waits for a page in transit
    pub intrans: MachCounter,
    /// Restarts of the fault
    pub retries: MachCounter,
    /// Successful pager reads
    pub pageins: MachCounter,
    /// Pages pulled back off the cache queue
    pub reactivated: MachCounter,
    /// Failed faults
    pub failures: MachCounter,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            faults: MachCounter::new("vm_faults"),
            cow_faults: MachCounter::new("vm_cow_faults"),
            cow_optim: MachCounter::new("vm_cow_optim"),
            zfod: MachCounter::new("vm_zfod"),
            ozfod: MachCounter::new("vm_ozfod"),
            intrans: MachCounter::new("vm_intrans"),
            retries: MachCounter::new("vm_fault_retries"),
            pageins: MachCounter::new("vm_pageins"),
            reactivated: MachCounter::new("vm_reactivated"),
            failures: MachCounter::new("vm_fault_failures"),
        }
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Fault State
// ============================================================================

/// Why an attempt gave up and started over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Slept on a page another thread owned
    PageBusy,
    /// Waited for the page daemon
    MemoryShortage,
    /// Translation changed while the map was unlocked
    MapChanged,
    /// The pager returned without leaving the page resident
    PageVanished,
    /// Someone tabled a page at the index first
    AllocRace,
}

/// How a fault attempt ended, if not with an installed page
#[derive(Debug)]
enum Outcome {
    Retry(Retry),
    Failed(FaultError),
}

impl From<Retry> for Outcome {
    fn from(retry: Retry) -> Self {
        Outcome::Retry(retry)
    }
}

impl From<FaultError> for Outcome {
    fn from(err: FaultError) -> Self {
        Outcome::Failed(err)
    }
}

impl From<MapError> for Outcome {
    fn from(err: MapError) -> Self {
        Outcome::Failed(err.into())
    }
}

/// Everything one fault attempt holds
///
/// The attempt holds one reference on `first_object`, one
/// paging-in-progress count on `first_object` and one on `object` (a single
/// count when they are the same), and while `lookup` is set the map lock.
/// [`FaultState::unlock_things`] gives all of that back and consumes the
/// state, so it happens once per attempt.
struct FaultState<'a> {
    sys: &'a VmSystem,
    map: &'a VmMap,
    /// Held map lock; `None` once the map has been dropped
    lookup: Option<MapGuard<'a>>,
    entry: VmMapEntry,
    first_object: Arc<VmObject>,
    first_pindex: u64,
    /// Busy placeholder in the top-level object
    first_m: Option<PageId>,
    object: Arc<VmObject>,
    pindex: u64,
    m: Option<PageId>,
    vnode: Option<VnodeGuard>,
}

impl FaultState<'_> {
    fn is_first(&self) -> bool {
        self.object.id == self.first_object.id
    }

    fn unlock_map(&mut self) {
        self.lookup = None;
    }

    /// Retake the map lock without blocking
    fn relock_map(&mut self) -> bool {
        if self.lookup.is_some() {
            return true;
        }
        match self.map.try_lock_write() {
            Some(guard) => {
                self.lookup = Some(MapGuard::Exclusive(guard));
                true
            }
            None => false,
        }
    }

    /// Give up the page at hand
    fn release_page(&mut self) {
        if let Some(m) = self.m.take() {
            self.sys.pages.wakeup(m);
            self.sys.pages.deactivate(m);
        }
    }

    /// Drop the paging counts, the placeholder, the map and the vnode; with
    /// `deallocate`, the reference on the top-level object too
    ///
    /// Returns the top-level object so a caller that keeps the reference can
    /// drop it later.
    fn unlock_things(mut self, deallocate: bool) -> Arc<VmObject> {
        let sys = self.sys;
        sys.objects.pip_wakeup(&self.object, &sys.pages);
        if !self.is_first() {
            if let Some(first_m) = self.first_m.take() {
                sys.pages.free(first_m);
            }
            sys.objects.pip_wakeup(&self.first_object, &sys.pages);
        }
        if deallocate {
            sys.objects.deallocate(&self.first_object, &sys.pages);
        }
        self.unlock_map();
        self.vnode = None;
        self.first_object
    }
}

// ============================================================================
// Page Fault Handling
// ============================================================================

impl VmSystem {
    /// Handle a page fault at `vaddr` in `map`
    ///
    /// `fault_type` is the access that faulted. With a wiring flag set the
    /// page is wired (or unwired) instead of being put on the paging queues.
    pub fn vm_fault(
        &self,
        map: &VmMap,
        vaddr: u64,
        fault_type: VmProt,
        flags: FaultFlags,
    ) -> FaultResult {
        self.stats.faults.inc();
        let vaddr = trunc_page(vaddr);

        loop {
            match self.fault_attempt(map, vaddr, fault_type, flags) {
                Ok(()) => return Ok(()),
                Err(Outcome::Retry(reason)) => {
                    self.stats.retries.inc();
                    log::trace!("vm_fault: retry at {:#x}: {:?}", vaddr, reason);
                }
                Err(Outcome::Failed(err)) => {
                    self.stats.failures.inc();
                    log::debug!("vm_fault: {:#x} {:?}: {}", vaddr, fault_type, err);
                    return Err(err);
                }
            }
        }
    }

    fn fault_attempt<'a>(
        &'a self,
        map: &'a VmMap,
        vaddr: u64,
        fault_type: VmProt,
        flags: FaultFlags,
    ) -> Result<(), Outcome> {
        let pages = &self.pages;

        let lookup = match map.lookup(&self.objects, vaddr, fault_type) {
            Ok(lookup) => lookup,
            Err(MapError::ProtectionFailure) if flags.wiring() == FaultFlags::USER_WIRE => {
                // Wiring may force a private copy of a region that could be
                // made writable, but never of a permanently read-only one
                let access = VmProt::READ | VmProt::WRITE | VmProt::OVERRIDE_WRITE;
                let mut lookup = map.lookup(&self.objects, vaddr, access)?;
                lookup.restrict_max_protection();
                lookup
            }
            Err(err) => return Err(err.into()),
        };
        let map_generation = map.timestamp();

        if lookup.entry.flags.contains(EntryFlags::NOFAULT) {
            panic!("vm_fault: fault on nofault entry, addr: {:#x}", vaddr);
        }

        let MapLookup {
            guard,
            entry,
            object: first_object,
            pindex: first_pindex,
            prot,
            wired,
        } = lookup;

        self.objects.reference(&first_object);
        self.objects.pip_add(&first_object);
        let vnode = first_object.lock_vnode();
        if fault_type.contains(VmProt::WRITE) && first_object.kind == ObjectType::Vnode {
            first_object.freeze_copy_opts(first_pindex, first_pindex + 1);
        }
        let fault_type = if wired { prot } else { fault_type };

        let fs = FaultState {
            sys: self,
            map,
            lookup: Some(guard),
            entry,
            object: Arc::clone(&first_object),
            first_object,
            first_pindex,
            first_m: None,
            pindex: first_pindex,
            m: None,
            vnode,
        };

        let (mut fs, hardfault) = self.find_page(fs, vaddr, flags, wired)?;
        let Some(m) = fs.m else {
            panic!("vm_fault: no page at {:#x} after main loop", vaddr);
        };
        if !pages.page(m).is_busy() {
            panic!("vm_fault: not busy after main loop");
        }

        let mut prot = prot;
        if !fs.is_first() {
            if fault_type.contains(VmProt::WRITE) {
                self.push_page_up(&mut fs, m, map_generation);
            } else {
                // Map the backing page read-only; a later write copies it
                prot = prot.difference(VmProt::WRITE);
            }
        }

        if fs.lookup.is_none() && map.timestamp() != map_generation {
            let access = fault_type.difference(VmProt::WRITE);
            match map.lookup(&self.objects, vaddr, access) {
                Err(err) => {
                    fs.release_page();
                    fs.unlock_things(true);
                    return Err(err.into());
                }
                Ok(relookup) => {
                    if relookup.object.id != fs.first_object.id
                        || relookup.pindex != fs.first_pindex
                    {
                        drop(relookup);
                        fs.release_page();
                        fs.unlock_things(true);
                        return Err(Retry::MapChanged.into());
                    }
                    // Write permission may have been revoked meanwhile
                    prot &= relookup.prot;
                    fs.entry = relookup.entry;
                    fs.lookup = Some(relookup.guard);
                }
            }
        }

        let Some(m) = fs.m else {
            panic!("vm_fault: lost page at {:#x}", vaddr);
        };
        self.install_page(fs, m, vaddr, prot, flags, wired, hardfault);
        Ok(())
    }

    /// Walk the shadow chain until a page for the fault is found or created
    ///
    /// On success the page is busy and `fs` points at the object holding
    /// it. The flag is true when a pager read was needed.
    fn find_page<'a>(
        &'a self,
        mut fs: FaultState<'a>,
        vaddr: u64,
        flags: FaultFlags,
        wired: bool,
    ) -> Result<(FaultState<'a>, bool), Outcome> {
        let pages = &self.pages;
        // Wiring an unwired entry must not read anything in
        let wiring_only = !flags.wiring().is_empty() && !wired;
        let mut hardfault = false;

        loop {
            if fs.object.is_dead() {
                fs.unlock_things(true);
                return Err(FaultError::ProtectionFailure.into());
            }

            match pages.lookup_and_busy(fs.object.id, fs.pindex) {
                PageLookup::Busy(id) => {
                    let first_object = fs.unlock_things(false);
                    if pages.sleep_on(id) {
                        self.stats.intrans.inc();
                    }
                    self.objects.deallocate(&first_object, pages);
                    return Err(Retry::PageBusy.into());
                }
                PageLookup::Acquired { page, queue } => {
                    fs.m = Some(page);
                    if queue == PageQueueType::Cache {
                        self.stats.reactivated.inc();
                        if pages.free_plus_cache() < self.config.free_min {
                            pages.activate(page);
                            pages.wakeup(page);
                            fs.m = None;
                            fs.unlock_things(true);
                            self.vm_wait();
                            return Err(Retry::MemoryShortage.into());
                        }
                    }
                    if pages.page(page).is_fully_valid() || fs.object.is_kernel() {
                        break;
                    }
                }
                PageLookup::Absent => {
                    // The top-level placeholder lives on in `first_m`
                    fs.m = None;
                    if (fs.object.kind != ObjectType::Default && !wiring_only) || fs.is_first() {
                        if fs.pindex >= fs.object.size() {
                            fs.unlock_things(true);
                            return Err(FaultError::ProtectionFailure.into());
                        }
                        let request = if fs.vnode.is_some() || fs.object.backing().is_some() {
                            AllocRequest::Normal
                        } else {
                            AllocRequest::Zero
                        };
                        match pages.alloc(fs.object.id, fs.pindex, request) {
                            Ok(id) => fs.m = Some(id),
                            Err(AllocError::NoMemory) => {
                                fs.unlock_things(true);
                                self.vm_wait();
                                return Err(Retry::MemoryShortage.into());
                            }
                            Err(AllocError::Exists) => {
                                fs.unlock_things(true);
                                return Err(Retry::AllocRace.into());
                            }
                        }
                    }
                }
            }

            // The page is missing or not fully valid here
            if fs.object.kind != ObjectType::Default && !wiring_only {
                if let Some(m) = fs.m {
                    match self.page_in(&mut fs, m, vaddr) {
                        PagerStatus::Ok => {
                            self.stats.pageins.inc();
                            hardfault = true;
                            // The pager may have replaced the page
                            match pages.lookup(fs.object.id, fs.pindex) {
                                Some(id) => {
                                    fs.m = Some(id);
                                    break;
                                }
                                None => {
                                    fs.m = None;
                                    fs.unlock_things(true);
                                    return Err(Retry::PageVanished.into());
                                }
                            }
                        }
                        status => {
                            if status == PagerStatus::Error {
                                log::warn!(
                                    "vm_fault: pager read error, thread {:?}",
                                    self.scheduler().current_thread()
                                );
                            }
                            let fatal = match status {
                                PagerStatus::Bad => Some(FaultError::ProtectionFailure),
                                PagerStatus::Error if !fs.map.is_kernel() => {
                                    Some(FaultError::Failure)
                                }
                                _ => None,
                            };
                            if let Some(err) = fatal {
                                pages.free(m);
                                fs.m = None;
                                fs.unlock_things(true);
                                return Err(err.into());
                            }
                            // Keep the top-level page as the placeholder
                            if !fs.is_first() {
                                pages.free(m);
                                fs.m = None;
                            }
                        }
                    }
                }
            }

            if fs.is_first() {
                fs.first_m = fs.m;
            } else {
                fs.release_page();
            }

            let backing = fs
                .object
                .backing()
                .and_then(|(id, offset)| self.objects.lookup(id).map(|obj| (obj, offset)));
            match backing {
                None => {
                    // Bottom of the chain: zero-fill the top-level page
                    if !fs.is_first() {
                        self.objects.pip_wakeup(&fs.object, pages);
                        fs.object = Arc::clone(&fs.first_object);
                        fs.pindex = fs.first_pindex;
                        fs.m = fs.first_m;
                    }
                    fs.first_m = None;
                    let Some(m) = fs.m else {
                        panic!("vm_fault: no placeholder to zero-fill at {:#x}", vaddr);
                    };
                    if !pages.page(m).has_flags(PageFlags::ZERO) {
                        pages.zero_fill(m);
                        self.stats.ozfod.inc();
                    }
                    self.stats.zfod.inc();
                    break;
                }
                Some((next, offset)) => {
                    fs.pindex += atop(offset);
                    if !fs.is_first() {
                        self.objects.pip_wakeup(&fs.object, pages);
                    }
                    self.objects.pip_add(&next);
                    fs.object = next;
                }
            }
        }

        Ok((fs, hardfault))
    }

    /// Read `m` (and a cluster around it) from the current object's pager
    ///
    /// Drops the map lock for the I/O.
    fn page_in(&self, fs: &mut FaultState<'_>, m: PageId, vaddr: u64) -> PagerStatus {
        let (mut behind, mut ahead) = if fs.first_object.behavior() == ObjectBehavior::Random {
            (0, 0)
        } else {
            let behind = (atop(vaddr - fs.entry.start) as usize).min(VM_FAULT_READ_BEHIND);
            let ahead = (atop(fs.entry.end - vaddr) as usize)
                .saturating_sub(1)
                .min(VM_FAULT_READ_AHEAD);
            (behind, ahead)
        };

        if fs.first_object.kind != ObjectType::Device
            && fs.first_object.behavior() == ObjectBehavior::Sequential
        {
            self.evict_behind(fs);
            ahead += behind;
            behind = 0;
        }

        let cluster = self.vm_fault_cluster(&fs.object, m, fs.pindex, behind, ahead);
        fs.unlock_map();

        match (cluster, fs.object.pager.as_ref()) {
            (Some(cluster), Some(pager)) => {
                pager.get_pages(&fs.object, &self.pages, &cluster.pages, cluster.reqpage)
            }
            _ => PagerStatus::Fail,
        }
    }

    /// Under sequential access, push the pages just behind the fault out of
    /// the top-level object: dirty ones to the inactive queue, clean ones
    /// to the cache
    fn evict_behind(&self, fs: &FaultState<'_>) {
        let pages = &self.pages;
        let span = (2 * (VM_FAULT_READ_BEHIND + VM_FAULT_READ_AHEAD + 1)) as u64;
        let first = fs.first_pindex.saturating_sub(span);

        let mut pindex = fs.first_pindex;
        while pindex > first {
            pindex -= 1;
            let Some(id) = pages.lookup(fs.first_object.id, pindex) else {
                break;
            };
            let page = pages.page(id);
            if !page.is_fully_valid() {
                break;
            }
            if page.io_count() > 0
                || page.get_flags().intersects(PageFlags::BUSY | PageFlags::FICTITIOUS)
                || page.hold_count() > 0
                || page.wire_count() > 0
            {
                continue;
            }
            if page.dirty() == 0 {
                pages.test_dirty(id);
            }
            fs.map.pmap.remove_page(id);
            if page.dirty() != 0 {
                pages.deactivate(id);
            } else {
                pages.cache(id);
            }
        }
    }

    /// Copy-on-write: give the top-level object its own copy of `m`, found
    /// further down the chain
    ///
    /// If the backing object is private to the top-level object the page is
    /// moved instead of copied.
    fn push_page_up(&self, fs: &mut FaultState<'_>, m: PageId, map_generation: u64) {
        let pages = &self.pages;
        let Some(first_m) = fs.first_m else {
            panic!("vm_fault: copy-on-write without a placeholder");
        };

        let movable = fs.map.timestamp() == map_generation
            && fs.object.shadow_count() == 1
            && fs.object.ref_count() == 1
            && fs.object.handle.is_none()
            && matches!(fs.object.kind, ObjectType::Default | ObjectType::Swap)
            && fs.first_object.backing().map(|(id, _)| id) == Some(fs.object.id);

        // A submap entry is never relocked once dropped
        let movable = movable
            && (fs.lookup.is_some()
                || (!fs.entry.flags.contains(EntryFlags::IS_A_MAP) && fs.relock_map()));

        if movable {
            fs.map.pmap.remove_page(first_m);
            pages.free(first_m);
            pages.rename(m, fs.first_object.id, fs.first_pindex);
            pages.page(m).set_dirty(VM_PAGE_BITS_ALL);
            fs.first_m = Some(m);
            fs.m = None;
            self.stats.cow_optim.inc();
        } else {
            pages.copy(m, first_m);
            fs.release_page();
        }

        self.objects.pip_wakeup(&fs.object, pages);
        self.stats.cow_faults.inc();
        fs.m = fs.first_m;
        fs.object = Arc::clone(&fs.first_object);
        fs.pindex = fs.first_pindex;
    }

    /// Enter the busy page `m` and finish the fault
    #[allow(clippy::too_many_arguments)]
    fn install_page(
        &self,
        fs: FaultState<'_>,
        m: PageId,
        vaddr: u64,
        prot: VmProt,
        flags: FaultFlags,
        wired: bool,
        hardfault: bool,
    ) {
        let pages = &self.pages;
        let page = pages.page(m);
        let map = fs.map;

        if prot.contains(VmProt::WRITE) {
            page.set_flags(PageFlags::WRITEABLE);
            fs.object
                .set_flags(ObjectFlags::WRITEABLE | ObjectFlags::MIGHTBEDIRTY);
            if flags.contains(FaultFlags::DIRTY) {
                page.set_dirty(VM_PAGE_BITS_ALL);
            }
        }

        let entry = fs.entry.clone();
        let first_object = fs.unlock_things(false);

        page.set_valid(VM_PAGE_BITS_ALL);
        page.clear_flags(PageFlags::ZERO);

        map.pmap.enter(vaddr, m, prot, wired);
        if flags.wiring().is_empty() && !wired {
            map.pmap.prefault(
                vaddr,
                &entry,
                self.config.prefault_behind,
                self.config.prefault_ahead,
                &self.objects,
                pages,
            );
        }

        page.set_flags(PageFlags::MAPPED | PageFlags::REFERENCED);
        if flags.contains(FaultFlags::HOLD) {
            pages.hold(m);
        }

        if !flags.wiring().is_empty() {
            if wired {
                pages.wire(m);
            } else {
                pages.unwire(m);
            }
        } else {
            pages.activate(m);
        }

        let kind = if hardfault {
            FaultKind::Major
        } else {
            FaultKind::Minor
        };
        self.accounting.account(self.scheduler().current_thread(), kind);

        pages.wakeup(m);
        self.objects.deallocate(&first_object, pages);
    }
}
