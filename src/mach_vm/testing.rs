//! Test fixtures: an in-memory pager, a recording scheduler and accounting
//! sink, and helpers for building mappings

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::kern::counters::{FaultAccounting, FaultKind};
use crate::kern::sched_prim::{Scheduler, ThreadId, WaitEvent};
use crate::mach_vm::vm_map::{EntryFlags, VmMap, VmMapEntry, VmProt};
use crate::mach_vm::vm_object::{ObjectType, VmObject};
use crate::mach_vm::vm_page::{ptoa, PageId, PageManager, PAGE_SIZE, VM_PAGE_BITS_ALL};
use crate::mach_vm::vm_pager::{finish_readahead, Pager, PagerStatus};
use crate::mach_vm::{VmConfig, VmSystem};

/// Start of the test mappings
pub const BASE: u64 = 0x10000;

// ============================================================================
// Scheduler
// ============================================================================

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD: u64 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
}

/// Scheduler that yields real threads and records what it was asked to do
#[derive(Default)]
pub struct TestScheduler {
    sleeps: AtomicUsize,
    wakeups: Mutex<Vec<WaitEvent>>,
    memory_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TestScheduler {
    /// Number of sleeps entered
    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }

    pub fn wakeups(&self) -> Vec<WaitEvent> {
        self.wakeups.lock().clone()
    }

    /// Run `hook` whenever a thread starts waiting for free memory, in
    /// place of the page daemon
    pub fn on_memory_wait(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.memory_hook.lock() = Some(Box::new(hook));
    }
}

impl Scheduler for TestScheduler {
    fn current_thread(&self) -> ThreadId {
        ThreadId(THREAD.with(|t| *t))
    }

    fn sleep(&self, event: WaitEvent, still_blocked: &dyn Fn() -> bool) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        if event == WaitEvent::FreeMemory {
            if let Some(hook) = self.memory_hook.lock().as_ref() {
                hook();
            }
        }
        while still_blocked() {
            std::thread::yield_now();
        }
    }

    fn wakeup(&self, event: WaitEvent) {
        self.wakeups.lock().push(event);
    }
}

// ============================================================================
// Accounting
// ============================================================================

/// Accounting sink that keeps every charge
#[derive(Debug, Default)]
pub struct RecordingAccounting {
    events: Mutex<Vec<(ThreadId, FaultKind)>>,
}

impl RecordingAccounting {
    pub fn events(&self) -> Vec<(ThreadId, FaultKind)> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: FaultKind) -> usize {
        self.events.lock().iter().filter(|e| e.1 == kind).count()
    }
}

impl FaultAccounting for RecordingAccounting {
    fn account(&self, thread: ThreadId, kind: FaultKind) {
        self.events.lock().push((thread, kind));
    }
}

// ============================================================================
// Pager
// ============================================================================

/// Byte every page at `pindex` of a [`MemPager::filled`] store holds
pub fn pattern(pindex: u64) -> u8 {
    (pindex % 251) as u8 + 1
}

/// Pager over an in-memory store of uniformly filled pages
pub struct MemPager {
    size: u64,
    contents: Mutex<BTreeMap<u64, u8>>,
    /// Upper bounds on what `has_page` reports
    contiguous: Mutex<(usize, usize)>,
    /// Status to fail every read with
    status: Mutex<Option<PagerStatus>>,
    gate_closed: AtomicBool,
    in_flight: AtomicUsize,
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    reads: AtomicUsize,
    pages_read: AtomicUsize,
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl MemPager {
    /// Store holding data for every index below `size`
    pub fn filled(size: u64) -> Self {
        Self {
            size,
            contents: Mutex::new((0..size).map(|i| (i, pattern(i))).collect()),
            contiguous: Mutex::new((usize::MAX, usize::MAX)),
            status: Mutex::new(None),
            gate_closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            hook: Mutex::new(None),
            reads: AtomicUsize::new(0),
            pages_read: AtomicUsize::new(0),
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        }
    }

    pub fn set_contiguous(&self, behind: usize, ahead: usize) {
        *self.contiguous.lock() = (behind, ahead);
    }

    /// Drop the data for `pindex`
    pub fn forget(&self, pindex: u64) {
        self.contents.lock().remove(&pindex);
    }

    pub fn set_status(&self, status: Option<PagerStatus>) {
        *self.status.lock() = status;
    }

    /// Hold every read until `open_gate`
    pub fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
    }

    /// Reads currently inside `get_pages`
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `hook` once, inside the next read
    pub fn on_read(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Calls to `get_pages`
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Pages filled across all reads
    pub fn pages_read(&self) -> usize {
        self.pages_read.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }

    fn fill(&self, pages: &PageManager, id: PageId) -> bool {
        let Some((_, pindex)) = pages.page(id).owner() else {
            return false;
        };
        let Some(&byte) = self.contents.lock().get(&pindex) else {
            return false;
        };
        pages.page(id).write(0, &vec![byte; PAGE_SIZE]);
        pages.page(id).set_valid(VM_PAGE_BITS_ALL);
        self.pages_read.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn read_batch(&self, pages: &PageManager, batch: &[PageId], reqpage: usize) -> PagerStatus {
        if let Some(status) = *self.status.lock() {
            finish_readahead(pages, batch, reqpage, false);
            return status;
        }
        for (i, &id) in batch.iter().enumerate() {
            if i == reqpage {
                continue;
            }
            if self.fill(pages, id) {
                pages.deactivate(id);
                pages.wakeup(id);
            } else {
                pages.free(id);
            }
        }
        if self.fill(pages, batch[reqpage]) {
            PagerStatus::Ok
        } else {
            PagerStatus::Fail
        }
    }
}

impl Pager for MemPager {
    fn has_page(&self, _object: &VmObject, pindex: u64) -> Option<(usize, usize)> {
        let contents = self.contents.lock();
        if !contents.contains_key(&pindex) {
            return None;
        }
        let (max_behind, max_ahead) = *self.contiguous.lock();
        let behind = (1..=pindex)
            .take_while(|d| contents.contains_key(&(pindex - d)))
            .count()
            .min(max_behind);
        let ahead = (pindex + 1..self.size)
            .take_while(|i| contents.contains_key(i))
            .count()
            .min(max_ahead);
        Some((behind, ahead))
    }

    fn get_pages(
        &self,
        _object: &VmObject,
        pages: &PageManager,
        batch: &[PageId],
        reqpage: usize,
    ) -> PagerStatus {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        while self.gate_closed.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        let status = self.read_batch(pages, batch, reqpage);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        status
    }

    fn lock_handle(&self, _object: &VmObject) {
        self.locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock_handle(&self, _object: &VmObject) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// VM system over `pages` frames with recording services
pub fn system(pages: usize) -> VmSystem {
    VmSystem::new(
        VmConfig::for_pages(pages),
        Arc::new(TestScheduler::default()),
        Arc::new(RecordingAccounting::default()),
    )
}

/// Shared VM system together with its scheduler and accounting sink
pub struct Harness {
    pub sys: Arc<VmSystem>,
    pub sched: Arc<TestScheduler>,
    pub accounting: Arc<RecordingAccounting>,
}

pub fn harness(pages: usize) -> Harness {
    let sched = Arc::new(TestScheduler::default());
    let accounting = Arc::new(RecordingAccounting::default());
    let sys = VmSystem::new(
        VmConfig::for_pages(pages),
        sched.clone(),
        accounting.clone(),
    );
    Harness {
        sys: Arc::new(sys),
        sched,
        accounting,
    }
}

/// File-backed object of `size` pages over a filled [`MemPager`]
pub fn vnode_object(sys: &VmSystem, size: u64) -> (Arc<VmObject>, Arc<MemPager>) {
    let pager = Arc::new(MemPager::filled(size));
    let obj = sys
        .objects
        .allocate_with_pager(ObjectType::Vnode, size, pager.clone(), Some(1));
    (obj, pager)
}

/// Map all of `object` at `start`; the entry takes the caller's reference
pub fn map_object(
    map: &VmMap,
    start: u64,
    object: Arc<VmObject>,
    prot: VmProt,
    flags: EntryFlags,
) {
    let end = start + ptoa(object.size());
    let mut entry = VmMapEntry::new(start, end, Some(object), 0);
    entry.protection = prot;
    entry.flags = flags;
    map.enter(entry)
        .unwrap_or_else(|err| panic!("map_object: {:#x}: {}", start, err));
}

/// First byte of the page mapped at `va`
pub fn byte_at(sys: &VmSystem, map: &VmMap, va: u64) -> u8 {
    let id = map
        .pmap
        .extract(va)
        .unwrap_or_else(|| panic!("byte_at: nothing mapped at {:#x}", va));
    let mut buf = [0u8; 1];
    sys.pages.page(id).read(0, &mut buf);
    buf[0]
}
