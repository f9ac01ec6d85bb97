//! Mach_R VM fault handling
//!
//! Demand-paging fault resolution for the Mach VM subsystem: the fault
//! state machine, page clustering for pager reads, range wiring, and
//! copying of wired map entries, together with the minimal VM records
//! (objects, pages, maps, physical maps) they operate on.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Page counts and byte offsets are converted explicitly throughout
#![allow(clippy::unnecessary_cast)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod kern;
pub mod mach_vm;

pub use mach_vm::{FaultError, FaultFlags, FaultResult, VmConfig, VmSystem};
