//! Scheduling Primitives
//!
//! Based on Mach4 kern/sched_prim.c
//!
//! The VM fault path blocks in exactly two places: on a busy page and on a
//! shortage of free memory. Both go through the [`Scheduler`] trait so the
//! embedding kernel decides what "block" means. The contract is the classic
//! `assert_wait` / `thread_block` pair folded into one call: `sleep` must
//! not return while `still_blocked()` holds, and a `wakeup` for the same
//! event is what gives the sleeper a reason to re-check.

use crate::mach_vm::vm_page::PageId;

/// Identifier of the execution context that takes a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub const KERNEL: Self = Self(0);
}

/// Events a thread can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitEvent {
    /// A busy page has been released (`PG_WANTED` was set)
    Page(PageId),
    /// The pageout daemon freed memory
    FreeMemory,
}

/// Wait/wakeup service consumed by the VM system
pub trait Scheduler: Send + Sync {
    /// Thread on whose behalf the caller is running
    fn current_thread(&self) -> ThreadId;

    /// Block until `still_blocked` returns false
    ///
    /// Implementations may return only after re-checking `still_blocked`;
    /// spurious returns are not allowed.
    fn sleep(&self, event: WaitEvent, still_blocked: &dyn Fn() -> bool);

    /// Wake all threads sleeping on `event`
    fn wakeup(&self, event: WaitEvent);
}

/// Busy-waiting scheduler for single address space configurations
/// with no real thread switch available
#[derive(Debug, Default)]
pub struct SpinScheduler;

impl Scheduler for SpinScheduler {
    fn current_thread(&self) -> ThreadId {
        ThreadId::KERNEL
    }

    fn sleep(&self, _event: WaitEvent, still_blocked: &dyn Fn() -> bool) {
        while still_blocked() {
            core::hint::spin_loop();
        }
    }

    fn wakeup(&self, _event: WaitEvent) {}
}
