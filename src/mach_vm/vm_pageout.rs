//! Page Daemon (Pageout) Signalling
//!
//! Based on Mach4 vm/vm_pageout.h/c by Avadis Tevanian, Jr. (1986)
//!
//! Page replacement itself belongs to the pageout daemon, which runs outside
//! this crate. The fault path only needs to poke the daemon and, when it
//! cannot get a page, to wait until the daemon has made progress.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::kern::sched_prim::{Scheduler, WaitEvent};
use crate::mach_vm::vm_page::PageManager;

/// Wakeup channel to the pageout daemon
#[derive(Debug, Default)]
pub struct PageoutSignal {
    wakeups: AtomicU64,
    needed: AtomicBool,
}

impl PageoutSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake up the daemon
    pub fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.needed.store(true, Ordering::Release);
    }

    /// Called by the daemon: consume a pending request
    pub fn take_request(&self) -> bool {
        self.needed.swap(false, Ordering::AcqRel)
    }

    /// Total wakeups issued
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

/// Wake the daemon and block until free + cache pages reach `free_min`
pub fn vm_wait(signal: &PageoutSignal, pages: &PageManager, sched: &dyn Scheduler, free_min: usize) {
    signal.wakeup();
    log::trace!("vm_wait: free+cache={} min={}", pages.free_plus_cache(), free_min);
    sched.sleep(WaitEvent::FreeMemory, &|| pages.free_plus_cache() < free_min);
}
