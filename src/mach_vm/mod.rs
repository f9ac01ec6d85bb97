//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem.
//! Provides demand paging for Mach address spaces:
//! - vm_fault: Page fault resolution
//! - vm_cluster: Read-ahead/behind clustering for pager reads
//! - vm_wire: Wiring and unwiring of address ranges
//! - vm_copy: Copying of wired map entries
//! - vm_page: Physical page management
//! - vm_object: Memory objects (backing store abstraction)
//! - vm_pager: Backing store interface
//! - vm_map: Address space management
//! - pmap: Physical map (translation table management)
//! - vm_pageout: Signalling to the page daemon
//!
//! Everything hangs off one [`VmSystem`] value.

pub mod pmap;
pub mod vm_cluster;
pub mod vm_copy;
pub mod vm_fault;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;
pub mod vm_pageout;
pub mod vm_pager;
pub mod vm_wire;

#[cfg(test)]
pub(crate) mod testing;

use alloc::sync::Arc;

use crate::kern::counters::{FaultAccounting, FaultTotals};
use crate::kern::sched_prim::{Scheduler, SpinScheduler};

pub use pmap::{Pmap, PmapEntry};
pub use vm_cluster::{FaultCluster, FAULT_CLUSTER_MAX};
pub use vm_fault::{FaultError, FaultFlags, FaultResult, FaultStats};
pub use vm_map::{EntryFlags, MapError, VmMap, VmMapEntry, VmMapId, VmProt};
pub use vm_object::{ObjectBehavior, ObjectFlags, ObjectManager, ObjectType, VmObject, VmObjectId};
pub use vm_page::{PageFlags, PageId, PageManager, VmPage, PAGE_SIZE};
pub use vm_pageout::PageoutSignal;
pub use vm_pager::{Pager, PagerStatus};

// ============================================================================
// Configuration
// ============================================================================

/// VM system tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical pages managed
    pub page_count: usize,
    /// Below this many free + cache pages, faults wait for the daemon
    pub free_min: usize,
    /// Pages kept back for system allocations
    pub free_reserved: usize,
    /// Free pages the daemon aims for
    pub free_target: usize,
    /// Neighbours behind a fault to prefault
    pub prefault_behind: usize,
    /// Neighbours ahead of a fault to prefault
    pub prefault_ahead: usize,
}

impl VmConfig {
    /// Derive thresholds from the amount of physical memory
    pub fn for_pages(page_count: usize) -> Self {
        // Minimum 2% free (critical)
        let free_min = (page_count / 50).max(2);
        // Target 5% free
        let free_target = (page_count / 20).max(free_min + 1);
        Self {
            page_count,
            free_min,
            free_reserved: (free_min / 2).max(1),
            free_target,
            prefault_behind: 4,
            prefault_ahead: 4,
        }
    }
}

// ============================================================================
// VM System
// ============================================================================

/// The VM system: object arena, page store and the services the fault path
/// runs against
pub struct VmSystem {
    pub objects: ObjectManager,
    pub pages: PageManager,
    pub pageout: PageoutSignal,
    pub stats: FaultStats,
    pub config: VmConfig,
    sched: Arc<dyn Scheduler>,
    accounting: Arc<dyn FaultAccounting>,
}

impl core::fmt::Debug for VmSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSystem")
            .field("config", &self.config)
            .field("objects", &self.objects)
            .field("pages", &self.pages)
            .finish()
    }
}

impl VmSystem {
    pub fn new(
        config: VmConfig,
        sched: Arc<dyn Scheduler>,
        accounting: Arc<dyn FaultAccounting>,
    ) -> Self {
        Self {
            objects: ObjectManager::new(),
            pages: PageManager::new(&config, Arc::clone(&sched)),
            pageout: PageoutSignal::new(),
            stats: FaultStats::new(),
            config,
            sched,
            accounting,
        }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.sched
    }

    /// Wake the page daemon and wait for free memory
    pub fn vm_wait(&self) {
        vm_pageout::vm_wait(&self.pageout, &self.pages, &*self.sched, self.config.free_min);
    }
}

// ============================================================================
// Global State
// ============================================================================

static VM_SYSTEM: spin::Once<VmSystem> = spin::Once::new();

/// Initialize the Mach VM subsystem
pub fn init(page_count: usize) -> &'static VmSystem {
    VM_SYSTEM.call_once(|| {
        log::debug!("mach_vm: {} pages", page_count);
        VmSystem::new(
            VmConfig::for_pages(page_count),
            Arc::new(SpinScheduler),
            Arc::new(FaultTotals::new()),
        )
    })
}

/// Get the VM system, if initialized
pub fn vm_system() -> Option<&'static VmSystem> {
    VM_SYSTEM.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_thresholds() {
        let small = VmConfig::for_pages(16);
        assert_eq!(small.free_min, 2);
        assert_eq!(small.free_reserved, 1);
        assert!(small.free_target > small.free_min);

        let large = VmConfig::for_pages(1000);
        assert_eq!(large.free_min, 20);
        assert_eq!(large.free_reserved, 10);
        assert_eq!(large.free_target, 50);
    }

    #[test]
    fn test_global_init_once() {
        let a = init(64) as *const VmSystem;
        let b = init(128) as *const VmSystem;
        assert_eq!(a, b);
        assert_eq!(vm_system().map(|s| s.config.page_count), Some(64));
    }
}
