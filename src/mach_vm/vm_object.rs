//! VM Object - Memory Object Abstraction
//!
//! Based on Mach4 vm/vm_object.h/c
//! VM objects represent backing store for virtual memory regions.
//! They can be backed by:
//! - Physical memory (anonymous memory)
//! - External pagers (files, swap, devices)
//! - Shadow chains (copy-on-write)
//!
//! Objects live in the [`ObjectManager`] arena and name their backing object
//! by id, so a shadow chain is walked by handle lookup rather than by
//! following owning pointers.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::mach_vm::vm_page::PageManager;
use crate::mach_vm::vm_pager::Pager;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);
}

/// Kind of backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// Anonymous memory, zero-filled on demand
    Default,
    /// Anonymous memory that has been paged to swap
    Swap,
    /// File-backed
    Vnode,
    /// Device memory
    Device,
}

/// Access pattern hint used for clustering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectBehavior {
    Normal,
    Random,
    Sequential,
}

// ============================================================================
// Object Flags
// ============================================================================

/// Object flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    /// Object is being torn down
    pub const DEAD: Self = Self(0x0001);
    /// Pages of the object may be mapped writable
    pub const WRITEABLE: Self = Self(0x0002);
    /// Object may contain dirty pages
    pub const MIGHTBEDIRTY: Self = Self(0x0004);
    /// Kernel object: pages are always resident
    pub const KERNEL: Self = Self(0x0008);
    /// Optimized copy bookkeeping is active
    pub const OPT: Self = Self(0x0010);
    /// Last reference dropped while paging was in progress
    pub const TERMINATE_PENDING: Self = Self(0x0020);

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

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for ObjectFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl Default for ObjectFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// VM Object Structure
// ============================================================================

/// VM Object - represents a unit of backing store
pub struct VmObject {
    /// Object ID
    pub id: VmObjectId,

    /// Backing store kind
    pub kind: ObjectType,

    /// Size in pages
    size: AtomicU64,

    /// Reference count
    ref_count: AtomicU32,

    /// Number of objects shadowing this one
    shadow_count: AtomicU32,

    /// Pending pager operations; termination waits for this to drain
    paging_in_progress: AtomicU32,

    /// Object flags
    flags: AtomicU32,

    /// Access pattern hint
    behavior: Mutex<ObjectBehavior>,

    /// Backing object and byte offset into it
    backing: Mutex<Option<(VmObjectId, u64)>>,

    /// External name by which the object can be looked up (vnode)
    pub handle: Option<u64>,

    /// Backing store
    pub pager: Option<Arc<dyn Pager>>,

    /// Byte offset of the object within its pager
    pub paging_offset: AtomicU64,

    /// Page ranges whose optimized-copy state has been frozen
    frozen: Mutex<Vec<(u64, u64)>>,
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("ref_count", &self.ref_count())
            .field("shadow_count", &self.shadow_count())
            .field("paging_in_progress", &self.paging_in_progress())
            .field("backing", &self.backing())
            .finish()
    }
}

impl VmObject {
    /// Create a new VM object with one reference
    pub fn new(id: VmObjectId, kind: ObjectType, size: u64) -> Self {
        Self {
            id,
            kind,
            size: AtomicU64::new(size),
            ref_count: AtomicU32::new(1),
            shadow_count: AtomicU32::new(0),
            paging_in_progress: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            behavior: Mutex::new(ObjectBehavior::Normal),
            backing: Mutex::new(None),
            handle: None,
            pager: None,
            paging_offset: AtomicU64::new(0),
            frozen: Mutex::new(Vec::new()),
        }
    }

    /// Get object size in pages
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Get object flags
    pub fn get_flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set object flags
    pub fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear object flags
    pub fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.get_flags().contains(ObjectFlags::DEAD)
    }

    pub fn is_kernel(&self) -> bool {
        self.get_flags().contains(ObjectFlags::KERNEL)
    }

    pub fn behavior(&self) -> ObjectBehavior {
        *self.behavior.lock()
    }

    pub fn set_behavior(&self, behavior: ObjectBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Get reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn shadow_count(&self) -> u32 {
        self.shadow_count.load(Ordering::SeqCst)
    }

    pub fn paging_in_progress(&self) -> u32 {
        self.paging_in_progress.load(Ordering::SeqCst)
    }

    /// Backing object id and byte offset
    pub fn backing(&self) -> Option<(VmObjectId, u64)> {
        *self.backing.lock()
    }

    /// Increment reference count
    pub fn reference(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement reference count, returns true if this was the last one
    fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Lock the vnode behind a file-backed object for the life of the guard
    pub fn lock_vnode(self: &Arc<Self>) -> Option<VnodeGuard> {
        if self.kind != ObjectType::Vnode {
            return None;
        }
        let pager = self.pager.as_ref()?;
        pager.lock_handle(self);
        Some(VnodeGuard {
            object: Arc::clone(self),
        })
    }

    /// Freeze optimized-copy state for pages `[start, end)`
    pub fn freeze_copy_opts(&self, start: u64, end: u64) {
        if !self.get_flags().contains(ObjectFlags::OPT) {
            return;
        }
        let mut frozen = self.frozen.lock();
        if !frozen.iter().any(|&(s, e)| s <= start && end <= e) {
            frozen.push((start, end));
        }
    }

    /// Whether page `pindex` has had its copy state frozen
    pub fn is_frozen(&self, pindex: u64) -> bool {
        self.frozen
            .lock()
            .iter()
            .any(|&(s, e)| s <= pindex && pindex < e)
    }
}

/// Held vnode lock; released on drop
#[derive(Debug)]
pub struct VnodeGuard {
    object: Arc<VmObject>,
}

impl Drop for VnodeGuard {
    fn drop(&mut self) {
        if let Some(pager) = self.object.pager.as_ref() {
            pager.unlock_handle(&self.object);
        }
    }
}

// ============================================================================
// Object Manager
// ============================================================================

/// VM Object manager
pub struct ObjectManager {
    /// All live objects
    objects: Mutex<BTreeMap<VmObjectId, Arc<VmObject>>>,
    /// Next object ID
    next_id: AtomicU64,
}

impl core::fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectManager")
            .field("objects", &self.objects.lock().len())
            .finish()
    }
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, obj: VmObject) -> Arc<VmObject> {
        let obj = Arc::new(obj);
        self.objects.lock().insert(obj.id, Arc::clone(&obj));
        obj
    }

    fn next_id(&self) -> VmObjectId {
        VmObjectId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Allocate a new object of `size` pages
    pub fn allocate(&self, kind: ObjectType, size: u64) -> Arc<VmObject> {
        self.insert(VmObject::new(self.next_id(), kind, size))
    }

    /// Allocate an object served by an external pager
    pub fn allocate_with_pager(
        &self,
        kind: ObjectType,
        size: u64,
        pager: Arc<dyn Pager>,
        handle: Option<u64>,
    ) -> Arc<VmObject> {
        let mut obj = VmObject::new(self.next_id(), kind, size);
        obj.pager = Some(pager);
        obj.handle = handle;
        self.insert(obj)
    }

    /// Allocate the kernel object, whose pages never need a pager fill
    pub fn allocate_kernel(&self, size: u64) -> Arc<VmObject> {
        let obj = self.allocate(ObjectType::Default, size);
        obj.set_flags(ObjectFlags::KERNEL);
        obj
    }

    /// Look up an object
    pub fn lookup(&self, id: VmObjectId) -> Option<Arc<VmObject>> {
        self.objects.lock().get(&id).cloned()
    }

    /// Add a reference
    pub fn reference(&self, object: &VmObject) {
        object.reference();
    }

    /// Create an anonymous object shadowing `source` at byte `offset`
    ///
    /// The caller's reference to `source` passes to the new object.
    pub fn shadow(&self, source: &Arc<VmObject>, offset: u64, size: u64) -> Arc<VmObject> {
        let obj = VmObject::new(self.next_id(), ObjectType::Default, size);
        *obj.backing.lock() = Some((source.id, offset));
        source.shadow_count.fetch_add(1, Ordering::SeqCst);
        self.insert(obj)
    }

    /// Add one paging-in-progress count
    pub fn pip_add(&self, object: &VmObject) {
        object.paging_in_progress.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one paging-in-progress count, finishing a deferred termination
    /// once it drains
    pub fn pip_wakeup(&self, object: &Arc<VmObject>, pages: &PageManager) {
        let prev = object.paging_in_progress.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "paging_in_progress underflow");
        if prev == 1 && object.get_flags().contains(ObjectFlags::TERMINATE_PENDING) {
            self.terminate(Arc::clone(object), pages);
        }
    }

    /// Drop a reference; the last one terminates the object, or marks it
    /// for termination when paging is still in progress
    pub fn deallocate(&self, object: &Arc<VmObject>, pages: &PageManager) {
        if object.release() {
            self.last_reference(Arc::clone(object), pages);
        }
    }

    fn last_reference(&self, object: Arc<VmObject>, pages: &PageManager) {
        if object.paging_in_progress() > 0 {
            object.set_flags(ObjectFlags::TERMINATE_PENDING);
        } else {
            self.terminate(object, pages);
        }
    }

    /// Tear down an object and, iteratively, any backing objects whose last
    /// reference it held
    fn terminate(&self, object: Arc<VmObject>, pages: &PageManager) {
        let mut next = Some(object);
        while let Some(obj) = next.take() {
            obj.set_flags(ObjectFlags::DEAD);
            obj.clear_flags(ObjectFlags::TERMINATE_PENDING);
            pages.free_object_pages(obj.id);
            self.objects.lock().remove(&obj.id);
            log::trace!("vm_object: terminated {:?}", obj.id);

            let backing = obj.backing.lock().take();
            if let Some(backing) = backing.and_then(|(id, _)| self.lookup(id)) {
                backing.shadow_count.fetch_sub(1, Ordering::SeqCst);
                if backing.release() {
                    if backing.paging_in_progress() > 0 {
                        backing.set_flags(ObjectFlags::TERMINATE_PENDING);
                    } else {
                        next = Some(backing);
                    }
                }
            }
        }
    }

    /// Number of live objects
    pub fn count(&self) -> usize {
        self.objects.lock().len()
    }
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::SpinScheduler;
    use crate::mach_vm::vm_page::AllocRequest;
    use crate::mach_vm::VmConfig;

    fn pages() -> PageManager {
        PageManager::new(&VmConfig::for_pages(32), Arc::new(SpinScheduler))
    }

    #[test]
    fn test_object_creation() {
        let om = ObjectManager::new();
        let obj = om.allocate(ObjectType::Default, 8);
        assert_eq!(obj.size(), 8);
        assert_eq!(obj.ref_count(), 1);
        assert!(!obj.is_dead());
        assert!(om.lookup(obj.id).is_some());
    }

    #[test]
    fn test_shadow_transfers_reference() {
        let om = ObjectManager::new();
        let pm = pages();
        let source = om.allocate(ObjectType::Default, 8);
        let shadow = om.shadow(&source, 2 * 4096, 4);

        assert_eq!(shadow.backing(), Some((source.id, 2 * 4096)));
        assert_eq!(source.shadow_count(), 1);
        assert_eq!(source.ref_count(), 1);

        om.deallocate(&shadow, &pm);
        assert!(shadow.is_dead());
        assert!(source.is_dead());
        assert_eq!(om.count(), 0);
    }

    #[test]
    fn test_terminate_frees_pages() {
        let om = ObjectManager::new();
        let pm = pages();
        let obj = om.allocate(ObjectType::Default, 8);
        let free_before = pm.free_count();
        pm.alloc(obj.id, 0, AllocRequest::Normal).unwrap();
        pm.alloc(obj.id, 1, AllocRequest::Normal).unwrap();

        om.deallocate(&obj, &pm);
        assert_eq!(pm.resident_count(obj.id), 0);
        assert_eq!(pm.free_count(), free_before);
    }

    #[test]
    fn test_termination_deferred_while_paging() {
        let om = ObjectManager::new();
        let pm = pages();
        let obj = om.allocate(ObjectType::Default, 8);
        om.pip_add(&obj);

        om.deallocate(&obj, &pm);
        assert!(!obj.is_dead());
        assert!(obj.get_flags().contains(ObjectFlags::TERMINATE_PENDING));

        om.pip_wakeup(&obj, &pm);
        assert!(obj.is_dead());
        assert!(om.lookup(obj.id).is_none());
    }

    #[test]
    fn test_shared_backing_survives() {
        let om = ObjectManager::new();
        let pm = pages();
        let source = om.allocate(ObjectType::Default, 8);
        source.reference();
        let a = om.shadow(&source, 0, 8);
        let b = om.shadow(&source, 0, 8);
        assert_eq!(source.shadow_count(), 2);

        om.deallocate(&a, &pm);
        assert!(!source.is_dead());
        assert_eq!(source.shadow_count(), 1);
        om.deallocate(&b, &pm);
        assert!(source.is_dead());
    }

    #[test]
    fn test_freeze_copy_opts() {
        let om = ObjectManager::new();
        let obj = om.allocate(ObjectType::Vnode, 8);
        obj.freeze_copy_opts(3, 4);
        assert!(!obj.is_frozen(3));

        obj.set_flags(ObjectFlags::OPT);
        obj.freeze_copy_opts(3, 4);
        obj.freeze_copy_opts(3, 4);
        assert!(obj.is_frozen(3));
        assert!(!obj.is_frozen(4));
    }
}
