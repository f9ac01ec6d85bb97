//! VM Page Management - Physical Page Abstraction
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! Resident page frames, the (object, index) residency table, and the
//! free/active/inactive/cache queues. The `BUSY` flag is the exclusion
//! unit for a page: whoever sets it owns the page's identity and content
//! until `wakeup` clears it.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::Mutex;

use crate::kern::sched_prim::{Scheduler, WaitEvent};
use crate::mach_vm::vm_object::VmObjectId;
use crate::mach_vm::VmConfig;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Validity/dirty bitmap with every 512-byte block set
pub const VM_PAGE_BITS_ALL: u8 = 0xff;

/// Bytes covered by one validity bit
pub const DEV_BSIZE: usize = PAGE_SIZE / 8;

// ============================================================================
// Page Identity and Flags
// ============================================================================

/// Index of a page frame in the page manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

/// Page state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Page is busy (owned by one operation)
    pub const BUSY: Self = Self(0x0001);
    /// Someone sleeps waiting for BUSY to clear
    pub const WANTED: Self = Self(0x0002);
    /// Page was referenced recently
    pub const REFERENCED: Self = Self(0x0004);
    /// Page may be mapped writable somewhere
    pub const WRITEABLE: Self = Self(0x0008);
    /// Page is entered in at least one physical map
    pub const MAPPED: Self = Self(0x0010);
    /// Page content is known to be zero
    pub const ZERO: Self = Self(0x0020);
    /// Page is fictitious (not backed by real memory)
    pub const FICTITIOUS: Self = Self(0x0040);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits)
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the flags are set
    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Page Queue Type
// ============================================================================

/// Page queue type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageQueueType {
    /// Not on any queue (busy, wired or in transit)
    None = 0,
    /// Free page queue
    Free = 1,
    /// Active page queue
    Active = 2,
    /// Inactive page queue
    Inactive = 3,
    /// Clean pages that can be reclaimed without I/O
    Cache = 4,
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// Virtual Memory Page
///
/// Represents a single physical page of memory.
/// Based on Mach4 vm_page structure.
#[derive(Debug)]
pub struct VmPage {
    /// Physical address of this page
    pub phys_addr: u64,

    /// Owning (object, page index), if tabled
    owner: Mutex<Option<(VmObjectId, u64)>>,

    /// Which queue this page is on
    queue: Mutex<PageQueueType>,

    /// Page flags
    flags: AtomicU32,

    /// Valid 512-byte blocks
    valid: AtomicU8,

    /// Dirty 512-byte blocks
    dirty: AtomicU8,

    /// Wire count (reference count for wiring)
    wire_count: AtomicU32,

    /// Hold count (temporary pin)
    hold_count: AtomicU32,

    /// Soft-busy count (I/O in flight against the page)
    io_count: AtomicU32,

    /// Frame content
    data: Mutex<Box<[u8]>>,
}

impl VmPage {
    /// Create a new VM page
    pub fn new(phys_addr: u64) -> Self {
        Self {
            phys_addr,
            owner: Mutex::new(None),
            queue: Mutex::new(PageQueueType::None),
            flags: AtomicU32::new(PageFlags::ZERO.bits()),
            valid: AtomicU8::new(0),
            dirty: AtomicU8::new(0),
            wire_count: AtomicU32::new(0),
            hold_count: AtomicU32::new(0),
            io_count: AtomicU32::new(0),
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    /// Get page flags
    pub fn get_flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set page flags
    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear page flags
    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Check if page has specific flags
    pub fn has_flags(&self, flags: PageFlags) -> bool {
        self.get_flags().contains(flags)
    }

    pub fn is_busy(&self) -> bool {
        self.has_flags(PageFlags::BUSY)
    }

    pub fn valid(&self) -> u8 {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn set_valid(&self, bits: u8) {
        self.valid.store(bits, Ordering::SeqCst);
    }

    pub fn is_fully_valid(&self) -> bool {
        self.valid() == VM_PAGE_BITS_ALL
    }

    pub fn dirty(&self) -> u8 {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_dirty(&self, bits: u8) {
        self.dirty.store(bits, Ordering::SeqCst);
    }

    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::SeqCst)
    }

    pub fn hold_count(&self) -> u32 {
        self.hold_count.load(Ordering::SeqCst)
    }

    /// Number of I/O operations in flight against the page
    pub fn io_count(&self) -> u32 {
        self.io_count.load(Ordering::SeqCst)
    }

    pub fn io_start(&self) {
        self.io_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn io_finish(&self) {
        self.io_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn queue(&self) -> PageQueueType {
        *self.queue.lock()
    }

    /// Get the (object, index) this page belongs to
    pub fn owner(&self) -> Option<(VmObjectId, u64)> {
        *self.owner.lock()
    }

    /// Copy out frame bytes starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy bytes into the frame starting at `offset`
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// True when the page is busy, or has I/O in flight and is not yet
    /// completely valid
    fn in_transit(&self) -> bool {
        self.is_busy() || (self.io_count() > 0 && !self.is_fully_valid())
    }
}

// ============================================================================
// Page Queue
// ============================================================================

/// A queue of pages
#[derive(Debug)]
pub struct PageQueue {
    pages: VecDeque<PageId>,
    queue_type: PageQueueType,
}

impl PageQueue {
    /// Create a new page queue
    pub fn new(queue_type: PageQueueType) -> Self {
        Self {
            pages: VecDeque::new(),
            queue_type,
        }
    }

    /// Add a page to the queue
    pub fn enqueue(&mut self, page: PageId) {
        self.pages.push_back(page);
    }

    /// Remove a page from the front of the queue
    pub fn dequeue(&mut self) -> Option<PageId> {
        self.pages.pop_front()
    }

    /// Remove a specific page from the queue
    pub fn remove(&mut self, page: PageId) -> bool {
        if let Some(pos) = self.pages.iter().position(|&p| p == page) {
            self.pages.remove(pos);
            true
        } else {
            false
        }
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Get queue type
    pub fn queue_type(&self) -> PageQueueType {
        self.queue_type
    }
}

// ============================================================================
// Page Manager
// ============================================================================

/// How a page allocation may dip into the free pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRequest {
    /// Ordinary allocation, honors the reserve
    Normal,
    /// Ordinary allocation that prefers a pre-zeroed frame
    Zero,
    /// May take the reserved pages
    System,
}

/// Page allocation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("a page is already resident at this index")]
    Exists,
    #[error("out of free pages")]
    NoMemory,
}

/// Result of a combined lookup and busy attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLookup {
    /// Nothing resident at the index
    Absent,
    /// Resident but owned by another operation
    Busy(PageId),
    /// Now busy for the caller and off its queue
    Acquired {
        page: PageId,
        /// Queue the page was taken from
        queue: PageQueueType,
    },
}

struct PageTables {
    resident: BTreeMap<(VmObjectId, u64), PageId>,
    free: PageQueue,
    active: PageQueue,
    inactive: PageQueue,
    cache: PageQueue,
}

impl PageTables {
    fn queue_mut(&mut self, queue: PageQueueType) -> Option<&mut PageQueue> {
        match queue {
            PageQueueType::None => None,
            PageQueueType::Free => Some(&mut self.free),
            PageQueueType::Active => Some(&mut self.active),
            PageQueueType::Inactive => Some(&mut self.inactive),
            PageQueueType::Cache => Some(&mut self.cache),
        }
    }
}

/// Page manager state
pub struct PageManager {
    /// All pages in the system (indexed by page id)
    pages: Vec<VmPage>,

    /// Residency table and page queues
    tables: Mutex<PageTables>,

    /// Pages only `AllocRequest::System` may take
    free_reserved: usize,

    /// Low-water mark for free + cache pages
    free_min: usize,

    sched: Arc<dyn Scheduler>,

    /// Allocations left before `alloc` reports `NoMemory`
    #[cfg(test)]
    alloc_limit: core::sync::atomic::AtomicUsize,
}

impl core::fmt::Debug for PageManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageManager")
            .field("pages", &self.pages.len())
            .field("free", &self.free_count())
            .field("cache", &self.cache_count())
            .finish()
    }
}

impl PageManager {
    /// Create a page manager owning `config.page_count` frames, all free
    pub fn new(config: &VmConfig, sched: Arc<dyn Scheduler>) -> Self {
        let mut pages = Vec::with_capacity(config.page_count);
        let mut free = PageQueue::new(PageQueueType::Free);
        for i in 0..config.page_count {
            let page = VmPage::new((i * PAGE_SIZE) as u64);
            *page.queue.lock() = PageQueueType::Free;
            pages.push(page);
            free.enqueue(PageId(i as u32));
        }

        Self {
            pages,
            tables: Mutex::new(PageTables {
                resident: BTreeMap::new(),
                free,
                active: PageQueue::new(PageQueueType::Active),
                inactive: PageQueue::new(PageQueueType::Inactive),
                cache: PageQueue::new(PageQueueType::Cache),
            }),
            free_reserved: config.free_reserved,
            free_min: config.free_min,
            sched,
            #[cfg(test)]
            alloc_limit: core::sync::atomic::AtomicUsize::new(usize::MAX),
        }
    }

    /// Get a page by id
    pub fn page(&self, id: PageId) -> &VmPage {
        &self.pages[id.0 as usize]
    }

    pub fn free_count(&self) -> usize {
        self.tables.lock().free.len()
    }

    pub fn cache_count(&self) -> usize {
        self.tables.lock().cache.len()
    }

    /// Pages available without writing anything back
    pub fn free_plus_cache(&self) -> usize {
        let tables = self.tables.lock();
        tables.free.len() + tables.cache.len()
    }

    pub fn free_reserved(&self) -> usize {
        self.free_reserved
    }

    /// Find the page resident at (object, pindex)
    pub fn lookup(&self, object: VmObjectId, pindex: u64) -> Option<PageId> {
        self.tables.lock().resident.get(&(object, pindex)).copied()
    }

    /// Look up (object, pindex) and, if the page is idle, mark it busy and
    /// take it off its queue in one step
    pub fn lookup_and_busy(&self, object: VmObjectId, pindex: u64) -> PageLookup {
        let mut tables = self.tables.lock();
        let id = match tables.resident.get(&(object, pindex)) {
            Some(&id) => id,
            None => return PageLookup::Absent,
        };
        let page = self.page(id);
        if page.in_transit() {
            return PageLookup::Busy(id);
        }
        let queue = Self::unqueue_locked(&mut tables, page, id);
        page.set_flags(PageFlags::BUSY);
        PageLookup::Acquired { page: id, queue }
    }

    /// Try to mark an idle page busy
    pub fn try_busy(&self, id: PageId) -> bool {
        let old = self.page(id).flags.fetch_or(PageFlags::BUSY.bits(), Ordering::SeqCst);
        old & PageFlags::BUSY.bits() == 0
    }

    /// Allocate a frame and table it at (object, pindex)
    ///
    /// The returned page is busy, invalid, clean and on no queue. Clean
    /// cache pages are reclaimed when the free queue runs into the reserve.
    pub fn alloc(
        &self,
        object: VmObjectId,
        pindex: u64,
        request: AllocRequest,
    ) -> Result<PageId, AllocError> {
        let mut tables = self.tables.lock();
        if tables.resident.contains_key(&(object, pindex)) {
            return Err(AllocError::Exists);
        }
        #[cfg(test)]
        if self
            .alloc_limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(AllocError::NoMemory);
        }

        let reserve = match request {
            AllocRequest::System => 0,
            AllocRequest::Normal | AllocRequest::Zero => self.free_reserved,
        };
        let id = if tables.free.len() > reserve {
            tables.free.dequeue()
        } else if let Some(id) = tables.cache.dequeue() {
            if let Some(key) = self.page(id).owner.lock().take() {
                tables.resident.remove(&key);
            }
            self.page(id).clear_flags(PageFlags::ZERO);
            Some(id)
        } else {
            None
        };
        let id = id.ok_or(AllocError::NoMemory)?;

        let page = self.page(id);
        let zero = request == AllocRequest::Zero && page.has_flags(PageFlags::ZERO);
        let flags = if zero {
            PageFlags::BUSY | PageFlags::ZERO
        } else {
            PageFlags::BUSY
        };
        page.flags.store(flags.bits(), Ordering::SeqCst);
        page.set_valid(0);
        page.set_dirty(0);
        page.wire_count.store(0, Ordering::SeqCst);
        page.hold_count.store(0, Ordering::SeqCst);
        page.io_count.store(0, Ordering::SeqCst);
        *page.queue.lock() = PageQueueType::None;
        *page.owner.lock() = Some((object, pindex));
        tables.resident.insert((object, pindex), id);

        Ok(id)
    }

    /// Return a page to the free queue, waking anyone who wanted it
    pub fn free(&self, id: PageId) {
        let page = self.page(id);
        let wanted = {
            let mut tables = self.tables.lock();
            Self::unqueue_locked(&mut tables, page, id);
            if let Some(key) = page.owner.lock().take() {
                tables.resident.remove(&key);
            }
            let old = page.flags.swap(0, Ordering::SeqCst);
            page.set_valid(0);
            page.set_dirty(0);
            page.wire_count.store(0, Ordering::SeqCst);
            page.hold_count.store(0, Ordering::SeqCst);
            *page.queue.lock() = PageQueueType::Free;
            tables.free.enqueue(id);
            old & PageFlags::WANTED.bits() != 0
        };

        if wanted {
            self.sched.wakeup(WaitEvent::Page(id));
        }
        if self.free_plus_cache() >= self.free_min {
            self.sched.wakeup(WaitEvent::FreeMemory);
        }
    }

    /// Move a page to a new (object, index); the caller has freed any page
    /// previously resident there
    pub fn rename(&self, id: PageId, object: VmObjectId, pindex: u64) {
        let page = self.page(id);
        {
            let mut tables = self.tables.lock();
            if let Some(key) = page.owner.lock().take() {
                tables.resident.remove(&key);
            }
            tables.resident.insert((object, pindex), id);
            *page.owner.lock() = Some((object, pindex));
        }
        if page.queue() == PageQueueType::Cache {
            self.deactivate(id);
        }
    }

    /// Copy frame content from `src` to `dst`, making `dst` fully valid
    pub fn copy(&self, src: PageId, dst: PageId) {
        let src_data = self.page(src).data.lock();
        self.page(dst).data.lock().copy_from_slice(&src_data);
        self.page(dst).set_valid(VM_PAGE_BITS_ALL);
    }

    pub fn zero_fill(&self, id: PageId) {
        self.page(id).data.lock().fill(0);
    }

    /// Put a page on the active queue (unless wired)
    ///
    /// Returns true if the page was pulled back from the cache queue.
    pub fn activate(&self, id: PageId) -> bool {
        let page = self.page(id);
        let mut tables = self.tables.lock();
        let old = Self::unqueue_locked(&mut tables, page, id);
        if page.wire_count() == 0 {
            tables.active.enqueue(id);
            *page.queue.lock() = PageQueueType::Active;
        }
        old == PageQueueType::Cache
    }

    /// Put a page on the inactive queue (unless wired)
    pub fn deactivate(&self, id: PageId) {
        let page = self.page(id);
        let mut tables = self.tables.lock();
        if page.queue() == PageQueueType::Inactive {
            return;
        }
        Self::unqueue_locked(&mut tables, page, id);
        if page.wire_count() == 0 {
            page.clear_flags(PageFlags::REFERENCED);
            tables.inactive.enqueue(id);
            *page.queue.lock() = PageQueueType::Inactive;
        }
    }

    /// Move a clean, idle page to the cache queue
    pub fn cache(&self, id: PageId) {
        let page = self.page(id);
        if page.is_busy() || page.wire_count() > 0 || page.hold_count() > 0 || page.dirty() != 0 {
            return;
        }
        let mut tables = self.tables.lock();
        Self::unqueue_locked(&mut tables, page, id);
        page.clear_flags(PageFlags::MAPPED | PageFlags::WRITEABLE);
        tables.cache.enqueue(id);
        *page.queue.lock() = PageQueueType::Cache;
    }

    /// Increment the wire count, taking the page off the paging queues
    pub fn wire(&self, id: PageId) {
        let page = self.page(id);
        if page.wire_count() == 0 {
            let mut tables = self.tables.lock();
            Self::unqueue_locked(&mut tables, page, id);
        }
        page.wire_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the wire count; a page that becomes unwired goes active
    pub fn unwire(&self, id: PageId) {
        let page = self.page(id);
        let old = page
            .wire_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if old == Ok(1) {
            let mut tables = self.tables.lock();
            Self::unqueue_locked(&mut tables, page, id);
            tables.active.enqueue(id);
            *page.queue.lock() = PageQueueType::Active;
        }
    }

    pub fn hold(&self, id: PageId) {
        self.page(id).hold_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a hold taken by a `HOLD` fault
    pub fn unhold(&self, id: PageId) {
        let prev = self.page(id).hold_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "hold_count underflow");
    }

    /// Fold hardware modification state into the dirty bitmap
    pub fn test_dirty(&self, id: PageId) {
        let page = self.page(id);
        if page.dirty() != VM_PAGE_BITS_ALL && page.has_flags(PageFlags::WRITEABLE) {
            page.set_dirty(VM_PAGE_BITS_ALL);
        }
    }

    /// Clear BUSY and wake any thread that wanted the page
    pub fn wakeup(&self, id: PageId) {
        let old = self.page(id).flags.fetch_and(
            !(PageFlags::BUSY.bits() | PageFlags::WANTED.bits()),
            Ordering::SeqCst,
        );
        if old & PageFlags::WANTED.bits() != 0 {
            self.sched.wakeup(WaitEvent::Page(id));
        }
    }

    /// Block until the page is out of transit
    ///
    /// Returns false without sleeping if it already was.
    pub fn sleep_on(&self, id: PageId) -> bool {
        let page = self.page(id);
        page.set_flags(PageFlags::WANTED | PageFlags::REFERENCED);
        if !page.in_transit() {
            return false;
        }
        self.sched.sleep(WaitEvent::Page(id), &|| page.in_transit());
        true
    }

    /// Pages currently resident in `object`, in index order
    pub fn object_pages(&self, object: VmObjectId) -> Vec<(u64, PageId)> {
        let tables = self.tables.lock();
        tables
            .resident
            .range((object, 0)..=(object, u64::MAX))
            .map(|(&(_, pindex), &id)| (pindex, id))
            .collect()
    }

    pub fn resident_count(&self, object: VmObjectId) -> usize {
        self.object_pages(object).len()
    }

    /// Free every page of a terminated object
    pub fn free_object_pages(&self, object: VmObjectId) {
        for (_, id) in self.object_pages(object) {
            self.free(id);
        }
    }

    /// Make allocations fail once `n` more have succeeded
    #[cfg(test)]
    pub(crate) fn fail_allocs_after(&self, n: usize) {
        self.alloc_limit.store(n, Ordering::SeqCst);
    }

    fn unqueue_locked(tables: &mut PageTables, page: &VmPage, id: PageId) -> PageQueueType {
        let mut queue = page.queue.lock();
        let old = *queue;
        if let Some(q) = tables.queue_mut(old) {
            q.remove(id);
        }
        *queue = PageQueueType::None;
        old
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Byte offset to page index
pub const fn atop(offset: u64) -> u64 {
    offset >> PAGE_SHIFT
}

/// Page index to byte offset
pub const fn ptoa(pindex: u64) -> u64 {
    pindex << PAGE_SHIFT
}
