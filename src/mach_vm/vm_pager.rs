//! VM Pager Interface
//!
//! Based on Mach4 vm/vm_pager.h
//!
//! Backing stores (vnode, swap, device) plug in behind [`Pager`]. The fault
//! path only ever asks two things of a pager: which neighbouring pages it
//! could supply in the same read, and to fill a batch of busy pages.

use crate::mach_vm::vm_object::VmObject;
use crate::mach_vm::vm_page::{PageId, PageManager};

/// Outcome of a pager read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerStatus {
    /// Requested page is now valid
    Ok,
    /// Index lies outside the backing store
    Bad,
    /// I/O error while reading
    Error,
    /// Pager has no data for the index
    Fail,
}

/// Backing store for a memory object
///
/// `get_pages` receives a batch of busy pages tabled in `object`; the page
/// at `reqpage` is the one the fault needs. Before returning, the pager
/// disposes of every other page in the batch (see [`finish_readahead`]);
/// the requested page stays busy and is made fully valid on `Ok`.
pub trait Pager: Send + Sync {
    /// Whether the pager holds data for `pindex`, and if so how many
    /// contiguous pages it could also supply before and after it
    fn has_page(&self, object: &VmObject, pindex: u64) -> Option<(usize, usize)>;

    /// Read the batch
    fn get_pages(
        &self,
        object: &VmObject,
        pages: &PageManager,
        batch: &[PageId],
        reqpage: usize,
    ) -> PagerStatus;

    /// Lock the backing handle (vnode) for the duration of a fault
    fn lock_handle(&self, _object: &VmObject) {}

    /// Release the lock taken by `lock_handle`
    fn unlock_handle(&self, _object: &VmObject) {}
}

/// Dispose of the read-ahead/behind pages of a batch
///
/// Pages that were filled become valid and idle on the inactive queue;
/// pages that were not are freed.
pub fn finish_readahead(pages: &PageManager, batch: &[PageId], reqpage: usize, filled: bool) {
    for (i, &id) in batch.iter().enumerate() {
        if i == reqpage {
            continue;
        }
        if filled {
            pages.deactivate(id);
            pages.wakeup(id);
        } else {
            pages.free(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::SpinScheduler;
    use crate::mach_vm::vm_object::VmObjectId;
    use crate::mach_vm::vm_page::{AllocRequest, PageQueueType};
    use crate::mach_vm::VmConfig;
    use alloc::sync::Arc;

    #[test]
    fn test_finish_readahead_keeps_requested_busy() {
        let pm = PageManager::new(&VmConfig::for_pages(16), Arc::new(SpinScheduler));
        let obj = VmObjectId(1);
        let batch: alloc::vec::Vec<PageId> = (0..3)
            .map(|i| pm.alloc(obj, i, AllocRequest::Normal).unwrap())
            .collect();

        finish_readahead(&pm, &batch, 1, true);
        assert!(!pm.page(batch[0]).is_busy());
        assert_eq!(pm.page(batch[0]).queue(), PageQueueType::Inactive);
        assert!(pm.page(batch[1]).is_busy());
        assert_eq!(pm.lookup(obj, 2), Some(batch[2]));
    }

    #[test]
    fn test_finish_readahead_frees_unfilled() {
        let pm = PageManager::new(&VmConfig::for_pages(16), Arc::new(SpinScheduler));
        let obj = VmObjectId(1);
        let batch: alloc::vec::Vec<PageId> = (0..3)
            .map(|i| pm.alloc(obj, i, AllocRequest::Normal).unwrap())
            .collect();

        finish_readahead(&pm, &batch, 0, false);
        assert_eq!(pm.lookup(obj, 0), Some(batch[0]));
        assert_eq!(pm.lookup(obj, 1), None);
        assert_eq!(pm.lookup(obj, 2), None);
    }
}
