//! Wiring of Address Ranges
//!
//! Based on Mach4 vm/vm_fault.c (vm_fault_wire, vm_fault_unwire)
//!
//! Wiring faults every page of a range in and pins it, so later accesses
//! never fault. The entries of the range carry the wiring count; each page
//! carries its own.

use crate::mach_vm::vm_fault::{FaultFlags, FaultResult};
use crate::mach_vm::vm_map::{VmMap, VmProt};
use crate::mach_vm::vm_page::{round_page, trunc_page, PAGE_SIZE};
use crate::mach_vm::VmSystem;

impl VmSystem {
    /// Wire `[start, end)` of `map` for the kernel
    ///
    /// On failure nothing in the range is left wired.
    pub fn vm_fault_wire(&self, map: &VmMap, start: u64, end: u64) -> FaultResult {
        self.wire_range(
            map,
            start,
            end,
            VmProt::READ | VmProt::WRITE,
            FaultFlags::CHANGE_WIRING,
        )
    }

    /// Wire `[start, end)` of `map` on behalf of a user request
    ///
    /// Faults for read access only. A region whose maximum protection
    /// permits writing may get a private copy; a permanently read-only one
    /// is refused.
    pub fn vm_fault_user_wire(&self, map: &VmMap, start: u64, end: u64) -> FaultResult {
        self.wire_range(map, start, end, VmProt::READ, FaultFlags::USER_WIRE)
    }

    /// Unwire `[start, end)` of `map`
    pub fn vm_fault_unwire(&self, map: &VmMap, start: u64, end: u64) {
        let (start, end) = (trunc_page(start), round_page(end));
        self.unwire_pages(map, start, end);
        map.unwire_range(start, end);
    }

    fn wire_range(
        &self,
        map: &VmMap,
        start: u64,
        end: u64,
        access: VmProt,
        flags: FaultFlags,
    ) -> FaultResult {
        let (start, end) = (trunc_page(start), round_page(end));
        map.wire_range(start, end)?;
        map.pmap.pageable(start, end, false);

        let mut va = start;
        while va < end {
            if let Err(err) = self.vm_fault(map, va, access, flags) {
                log::debug!("vm_fault_wire: {:#x} failed: {}", va, err);
                self.unwire_pages(map, start, va);
                map.pmap.pageable(va, end, true);
                map.unwire_range(start, end);
                return Err(err);
            }
            va += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Unwire the resident pages mapped in `[start, end)` and let the range
    /// fault again
    fn unwire_pages(&self, map: &VmMap, start: u64, end: u64) {
        let mut va = start;
        while va < end {
            if let Some(id) = map.pmap.extract(va) {
                map.pmap.change_wiring(va, false);
                self.pages.unwire(id);
            }
            va += PAGE_SIZE as u64;
        }
        map.pmap.pageable(start, end, true);
    }
}
