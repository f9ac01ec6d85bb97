//! Fault Clustering
//!
//! Based on Mach4 vm/vm_fault.c (vm_fault_additional_pages)
//!
//! Decides which neighbouring pages are read from the pager together with
//! the faulting page. The neighbours get busy placeholder pages tabled in
//! the object; the pager fills or frees them.

use alloc::sync::Arc;

use crate::mach_vm::vm_object::{ObjectType, VmObject};
use crate::mach_vm::vm_page::{atop, AllocError, AllocRequest, PageId};
use crate::mach_vm::VmSystem;

/// Pages read behind the fault by default
pub const VM_FAULT_READ_BEHIND: usize = 7;

/// Pages read ahead of the fault by default
pub const VM_FAULT_READ_AHEAD: usize = 8;

/// Largest batch handed to a pager
pub const FAULT_CLUSTER_MAX: usize = VM_FAULT_READ_BEHIND + VM_FAULT_READ_AHEAD + 1;

/// Batch of busy pages for one pager read, in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultCluster {
    pub pages: heapless::Vec<PageId, FAULT_CLUSTER_MAX>,
    /// Position of the faulting page in `pages`
    pub reqpage: usize,
}

impl FaultCluster {
    /// Batch holding only the faulting page
    pub fn single(page: PageId) -> Self {
        let mut pages = heapless::Vec::new();
        // Capacity is at least one
        let _ = pages.push(page);
        Self { pages, reqpage: 0 }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl VmSystem {
    /// Build the pager read batch around `page`, resident and busy at
    /// `pindex` in `object`
    ///
    /// Returns `None` if the pager has no data for `pindex` at all.
    pub fn vm_fault_cluster(
        &self,
        object: &Arc<VmObject>,
        page: PageId,
        pindex: u64,
        behind: usize,
        ahead: usize,
    ) -> Option<FaultCluster> {
        // No fault-ahead for device pagers
        if object.kind == ObjectType::Device {
            return Some(FaultCluster::single(page));
        }

        let pager = object.pager.as_ref()?;
        let paging_base = atop(object.paging_offset.load(core::sync::atomic::Ordering::SeqCst));
        let (cbehind, cahead) = pager.has_page(object, paging_base + pindex)?;
        if cbehind == 0 && cahead == 0 {
            return Some(FaultCluster::single(page));
        }

        let behind = behind.min(cbehind).min(VM_FAULT_READ_BEHIND);
        let ahead = ahead
            .min(cahead)
            .min(FAULT_CLUSTER_MAX - 1 - behind);

        let budget = self
            .pages
            .free_plus_cache()
            .saturating_sub(self.pages.free_reserved());
        if behind + ahead > budget {
            self.pageout.wakeup();
            return Some(FaultCluster::single(page));
        }

        let mut cluster = FaultCluster {
            pages: heapless::Vec::new(),
            reqpage: 0,
        };

        // Read-behind: back to the first resident page or index 0
        let behind = behind.min(pindex as usize) as u64;
        let mut start = pindex - behind;
        for t in (start..pindex).rev() {
            if self.pages.lookup(object.id, t).is_some() {
                start = t + 1;
                break;
            }
        }
        for t in start..pindex {
            let pushed = match self.pages.alloc(object.id, t, AllocRequest::Normal) {
                Ok(id) => cluster.pages.push(id).map_err(|id| self.pages.free(id)).is_ok(),
                Err(_) => false,
            };
            if !pushed {
                return Some(self.abandon_cluster(cluster, page));
            }
        }

        cluster.reqpage = cluster.pages.len();
        if cluster.pages.push(page).is_err() {
            return Some(self.abandon_cluster(cluster, page));
        }

        // Read-ahead: up to the first resident page or the end of the object
        let end = (pindex + 1 + ahead as u64).min(object.size());
        for t in pindex + 1..end {
            if self.pages.lookup(object.id, t).is_some() {
                break;
            }
            match self.pages.alloc(object.id, t, AllocRequest::Normal) {
                Ok(id) => {
                    if let Err(id) = cluster.pages.push(id) {
                        self.pages.free(id);
                        return Some(self.abandon_cluster(cluster, page));
                    }
                }
                Err(AllocError::Exists) => break,
                Err(AllocError::NoMemory) => {
                    return Some(self.abandon_cluster(cluster, page));
                }
            }
        }

        log::trace!(
            "vm_fault_cluster: {:?} pindex={} batch={} reqpage={}",
            object.id,
            pindex,
            cluster.len(),
            cluster.reqpage
        );
        Some(cluster)
    }

    /// Free every placeholder of a partial batch and fall back to the
    /// faulting page alone
    fn abandon_cluster(&self, cluster: FaultCluster, page: PageId) -> FaultCluster {
        for &id in cluster.pages.iter().filter(|&&id| id != page) {
            self.pages.free(id);
        }
        FaultCluster::single(page)
    }
}
