//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//! VM maps represent the virtual address space of a task.
//! Each map contains a set of map entries that describe the mappings.
//!
//! The fault path uses a map through [`VmMap::lookup`], which hands back the
//! held entry-table lock together with everything the fault needs. Holding
//! the returned [`MapGuard`] is what keeps the lookup valid; dropping it
//! gives the map back, after which the map timestamp tells whether anything
//! changed in the meantime.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::mach_vm::pmap::Pmap;
use crate::mach_vm::vm_object::{ObjectManager, ObjectType, VmObject};
use crate::mach_vm::vm_page::{atop, trunc_page};

// ============================================================================
// VM Map Types
// ============================================================================

/// VM Map ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmMapId(pub u64);

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Check against the maximum protection of a copy-on-write entry
    pub const OVERRIDE_WRITE: Self = Self(8);
    /// All permissions
    pub const ALL: Self = Self(7); // READ | WRITE | EXECUTE

    /// Empty (no permissions)
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Protection with `other` removed
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitAnd for VmProt {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::BitAndAssign for VmProt {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::READ | Self::WRITE
    }
}

// ============================================================================
// Map Entry Flags
// ============================================================================

/// Map entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// Faults on this entry are a kernel bug
    pub const NOFAULT: Self = Self(0x0001);
    /// Entry refers to a nested map
    pub const IS_A_MAP: Self = Self(0x0002);
    /// Object must be shadowed before the first write
    pub const NEEDS_COPY: Self = Self(0x0004);
    /// Entry is copy-on-write
    pub const COW: Self = Self(0x0008);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Remove flags
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for EntryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// Map entry - describes one contiguous region
#[derive(Debug, Clone)]
pub struct VmMapEntry {
    /// Start address (inclusive)
    pub start: u64,
    /// End address (exclusive)
    pub end: u64,
    /// Backing object (the entry holds one object reference)
    pub object: Option<Arc<VmObject>>,
    /// Byte offset into the object
    pub offset: u64,
    /// Current protection
    pub protection: VmProt,
    /// Maximum protection
    pub max_protection: VmProt,
    /// Wiring count
    pub wired_count: u32,
    pub flags: EntryFlags,
}

impl VmMapEntry {
    /// Create a new map entry
    pub fn new(start: u64, end: u64, object: Option<Arc<VmObject>>, offset: u64) -> Self {
        Self {
            start,
            end,
            object,
            offset,
            protection: VmProt::default(),
            max_protection: VmProt::ALL,
            wired_count: 0,
            flags: EntryFlags::empty(),
        }
    }

    /// Get entry size
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if address is within entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub fn is_wired(&self) -> bool {
        self.wired_count > 0
    }
}

/// Entry table of a map, keyed by start address
pub type MapEntries = BTreeMap<u64, VmMapEntry>;

fn find_entry(entries: &MapEntries, addr: u64) -> Option<&VmMapEntry> {
    entries
        .range(..=addr)
        .next_back()
        .map(|(_, e)| e)
        .filter(|e| e.contains(addr))
}

fn find_entry_mut(entries: &mut MapEntries, addr: u64) -> Option<&mut VmMapEntry> {
    entries
        .range_mut(..=addr)
        .next_back()
        .map(|(_, e)| e)
        .filter(|e| e.contains(addr))
}

// ============================================================================
// Map Lookup
// ============================================================================

/// Held entry-table lock proving a lookup is still valid
pub enum MapGuard<'a> {
    Shared(RwLockReadGuard<'a, MapEntries>),
    Exclusive(RwLockWriteGuard<'a, MapEntries>),
}

impl MapGuard<'_> {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, MapGuard::Exclusive(_))
    }
}

impl core::fmt::Debug for MapGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapGuard::Shared(_) => f.write_str("MapGuard::Shared"),
            MapGuard::Exclusive(_) => f.write_str("MapGuard::Exclusive"),
        }
    }
}

/// Result of translating an address for a fault
#[derive(Debug)]
pub struct MapLookup<'a> {
    /// Lookup token
    pub guard: MapGuard<'a>,
    /// Entry as it was at lookup time
    pub entry: VmMapEntry,
    /// Top-level object
    pub object: Arc<VmObject>,
    /// Page index into `object`
    pub pindex: u64,
    /// Granted protection
    pub prot: VmProt,
    /// Entry is wired
    pub wired: bool,
}

impl MapLookup<'_> {
    /// Drop `WRITE` from the entry's maximum protection if its current
    /// protection lacks it. Needs an exclusive lookup.
    pub fn restrict_max_protection(&mut self) {
        if self.entry.protection.contains(VmProt::WRITE) {
            return;
        }
        if let MapGuard::Exclusive(entries) = &mut self.guard {
            if let Some(entry) = find_entry_mut(entries, self.entry.start) {
                entry.max_protection = entry.max_protection.difference(VmProt::WRITE);
                self.entry.max_protection = entry.max_protection;
            }
        }
    }
}

// ============================================================================
// VM Map Structure
// ============================================================================

/// VM Map - represents an address space
#[derive(Debug)]
pub struct VmMap {
    /// Map ID
    pub id: VmMapId,
    /// Map entries (sorted by start address)
    entries: RwLock<MapEntries>,
    /// Bumped by every modification made under the write lock
    timestamp: AtomicU64,
    /// Physical map
    pub pmap: Pmap,
    /// The kernel's own map
    is_kernel: bool,
}

impl VmMap {
    /// Create a new empty map
    pub fn new(id: VmMapId) -> Self {
        Self {
            id,
            entries: RwLock::new(BTreeMap::new()),
            timestamp: AtomicU64::new(0),
            pmap: Pmap::new(),
            is_kernel: false,
        }
    }

    /// Create the kernel map
    pub fn kernel(id: VmMapId) -> Self {
        let mut map = Self::new(id);
        map.is_kernel = true;
        map
    }

    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Current generation
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.timestamp.fetch_add(1, Ordering::SeqCst);
    }

    /// Take the map exclusively; the caller's changes count as a new
    /// generation
    pub fn lock_write(&self) -> RwLockWriteGuard<'_, MapEntries> {
        let guard = self.entries.write();
        self.bump();
        guard
    }

    /// Take the map exclusively without blocking, for a caller that will
    /// not change it
    pub fn try_lock_write(&self) -> Option<RwLockWriteGuard<'_, MapEntries>> {
        self.entries.try_write()
    }

    pub fn lock_read(&self) -> RwLockReadGuard<'_, MapEntries> {
        self.entries.read()
    }

    /// Snapshot of the entry containing `addr`
    pub fn entry(&self, addr: u64) -> Option<VmMapEntry> {
        find_entry(&self.entries.read(), addr).cloned()
    }

    /// Enter a new mapping
    pub fn enter(&self, mut entry: VmMapEntry) -> Result<(), MapError> {
        if entry.start >= entry.end || entry.start != trunc_page(entry.start) {
            return Err(MapError::InvalidRange);
        }
        let mut entries = self.lock_write();
        if entries.values().any(|e| e.overlaps(entry.start, entry.end)) {
            return Err(MapError::NoSpace);
        }
        entry.protection &= entry.max_protection;
        entries.insert(entry.start, entry);
        Ok(())
    }

    /// Change the current protection of the entries in `[start, end)`
    pub fn protect(&self, start: u64, end: u64, prot: VmProt) -> Result<(), MapError> {
        let mut entries = self.lock_write();
        let mut found = false;
        for entry in entries.values_mut().filter(|e| e.overlaps(start, end)) {
            if !entry.max_protection.contains(prot) {
                return Err(MapError::ProtectionFailure);
            }
            entry.protection = prot;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(MapError::InvalidAddress)
        }
    }

    /// Set flags on the entry containing `addr`
    pub fn set_entry_flags(&self, addr: u64, flags: EntryFlags) -> Result<(), MapError> {
        let mut entries = self.lock_write();
        let entry = find_entry_mut(&mut entries, addr).ok_or(MapError::InvalidAddress)?;
        entry.flags |= flags;
        Ok(())
    }

    /// Remove the entries lying entirely inside `[start, end)`
    ///
    /// The caller owns the object references of the returned entries.
    pub fn remove(&self, start: u64, end: u64) -> Vec<VmMapEntry> {
        let mut entries = self.lock_write();
        let keys: Vec<u64> = entries
            .values()
            .filter(|e| e.start >= start && e.end <= end)
            .map(|e| e.start)
            .collect();
        keys.iter().filter_map(|k| entries.remove(k)).collect()
    }

    /// Bump the wiring count of every entry overlapping `[start, end)`
    pub fn wire_range(&self, start: u64, end: u64) -> Result<(), MapError> {
        let mut entries = self.lock_write();
        let mut found = false;
        for entry in entries.values_mut().filter(|e| e.overlaps(start, end)) {
            entry.wired_count += 1;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(MapError::InvalidAddress)
        }
    }

    /// Drop the wiring count of every entry overlapping `[start, end)`
    pub fn unwire_range(&self, start: u64, end: u64) {
        let mut entries = self.lock_write();
        for entry in entries.values_mut().filter(|e| e.overlaps(start, end)) {
            entry.wired_count = entry.wired_count.saturating_sub(1);
        }
    }

    /// Translate `vaddr` for a fault of type `access`
    ///
    /// A write to a `NEEDS_COPY` entry shadows its object first, and an entry
    /// with no object gets an anonymous one. With `OVERRIDE_WRITE`, a
    /// copy-on-write entry that is not wired is checked against its maximum
    /// protection instead of its current one, and the lookup comes back
    /// exclusive so the caller may adjust the entry.
    pub fn lookup<'a>(
        &'a self,
        objects: &ObjectManager,
        vaddr: u64,
        access: VmProt,
    ) -> Result<MapLookup<'a>, MapError> {
        {
            let entries = self.entries.read();
            let entry = find_entry(&entries, vaddr).ok_or(MapError::InvalidAddress)?;
            let checked = check_access(entry, access)?;
            if !checked.needs_fixup && !checked.exclusive {
                return lookup_result(MapGuard::Shared(entries), vaddr, access);
            }
        }

        // The entry may have changed between the two locks
        let mut entries = self.entries.write();
        let entry = find_entry_mut(&mut entries, vaddr).ok_or(MapError::InvalidAddress)?;
        let exclusive = check_access(entry, access)?.exclusive;
        if fixup_entry(entry, objects, access) {
            self.bump();
        }

        let guard = if exclusive {
            MapGuard::Exclusive(entries)
        } else {
            MapGuard::Shared(entries.downgrade())
        };
        lookup_result(guard, vaddr, access)
    }
}

struct AccessCheck {
    needs_fixup: bool,
    exclusive: bool,
}

/// Access the fault must be satisfied for: a wired entry is faulted for
/// everything it allows
fn effective_access(entry: &VmMapEntry, access: VmProt) -> VmProt {
    if entry.is_wired() {
        entry.protection
    } else {
        access.difference(VmProt::OVERRIDE_WRITE)
    }
}

fn check_access(entry: &VmMapEntry, access: VmProt) -> Result<AccessCheck, MapError> {
    let override_write = access.contains(VmProt::OVERRIDE_WRITE);
    let allowed = if override_write {
        entry.max_protection
    } else {
        entry.protection
    };
    if !allowed.contains(access.difference(VmProt::OVERRIDE_WRITE)) {
        return Err(MapError::ProtectionFailure);
    }
    let needs_fixup = entry.object.is_none()
        || (entry.flags.contains(EntryFlags::NEEDS_COPY)
            && effective_access(entry, access).contains(VmProt::WRITE));
    Ok(AccessCheck {
        needs_fixup,
        exclusive: override_write,
    })
}

/// Perform deferred object setup; true if the entry changed
fn fixup_entry(entry: &mut VmMapEntry, objects: &ObjectManager, access: VmProt) -> bool {
    let mut changed = false;
    let size = atop(entry.size());
    if entry.flags.contains(EntryFlags::NEEDS_COPY)
        && effective_access(entry, access).contains(VmProt::WRITE)
    {
        if let Some(source) = entry.object.take() {
            entry.object = Some(objects.shadow(&source, entry.offset, size));
            entry.offset = 0;
        }
        entry.flags.remove(EntryFlags::NEEDS_COPY);
        changed = true;
    }
    if entry.object.is_none() {
        entry.object = Some(objects.allocate(ObjectType::Default, size));
        entry.offset = 0;
        changed = true;
    }
    changed
}

fn lookup_result(guard: MapGuard<'_>, vaddr: u64, access: VmProt) -> Result<MapLookup<'_>, MapError> {
    let entry = match &guard {
        MapGuard::Shared(entries) => find_entry(entries, vaddr),
        MapGuard::Exclusive(entries) => find_entry(entries, vaddr),
    }
    .cloned()
    .ok_or(MapError::InvalidAddress)?;
    let object = entry.object.clone().ok_or(MapError::InvalidAddress)?;

    let mut prot = if !entry.is_wired() && access.contains(VmProt::OVERRIDE_WRITE) {
        entry.max_protection
    } else {
        entry.protection
    };
    if entry.flags.contains(EntryFlags::NEEDS_COPY)
        && !effective_access(&entry, access).contains(VmProt::WRITE)
    {
        prot = prot.difference(VmProt::WRITE);
    }

    Ok(MapLookup {
        pindex: atop(trunc_page(vaddr) - entry.start + entry.offset),
        prot,
        wired: entry.is_wired(),
        object,
        entry,
        guard,
    })
}

// ============================================================================
// Map Errors
// ============================================================================

/// Map operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No entry covers the address
    #[error("address not mapped")]
    InvalidAddress,
    /// Entry does not permit the access
    #[error("protection failure")]
    ProtectionFailure,
    /// Range is malformed
    #[error("invalid range")]
    InvalidRange,
    /// Range overlaps an existing entry
    #[error("no space")]
    NoSpace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::vm_page::PAGE_SIZE;

    const P: u64 = PAGE_SIZE as u64;

    fn rw_entry(objects: &ObjectManager, start: u64, pages: u64) -> VmMapEntry {
        let obj = objects.allocate(ObjectType::Default, pages);
        VmMapEntry::new(start, start + pages * P, Some(obj), 0)
    }

    #[test]
    fn test_vm_prot() {
        let rw = VmProt::READ | VmProt::WRITE;
        assert!(rw.contains(VmProt::READ));
        assert!(!rw.contains(VmProt::EXECUTE));
        assert_eq!(rw.difference(VmProt::WRITE), VmProt::READ);
        assert_eq!(rw & VmProt::WRITE, VmProt::WRITE);
    }

    #[test]
    fn test_enter_rejects_overlap() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        map.enter(rw_entry(&objects, 0x10000, 4)).unwrap();
        assert_eq!(
            map.enter(rw_entry(&objects, 0x12000, 4)),
            Err(MapError::NoSpace)
        );
        assert_eq!(
            map.enter(rw_entry(&objects, 0x10001, 1)),
            Err(MapError::InvalidRange)
        );
    }

    #[test]
    fn test_lookup_translates_index() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        let mut entry = rw_entry(&objects, 0x10000, 4);
        entry.offset = 2 * P;
        let obj = entry.object.clone().unwrap();
        map.enter(entry).unwrap();

        let lookup = map.lookup(&objects, 0x11234, VmProt::READ).unwrap();
        assert_eq!(lookup.object.id, obj.id);
        assert_eq!(lookup.pindex, 3);
        assert!(!lookup.wired);
        assert!(!lookup.guard.is_exclusive());
    }

    #[test]
    fn test_lookup_errors() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        let mut entry = rw_entry(&objects, 0x10000, 1);
        entry.protection = VmProt::READ;
        map.enter(entry).unwrap();

        assert_eq!(
            map.lookup(&objects, 0x20000, VmProt::READ).err(),
            Some(MapError::InvalidAddress)
        );
        assert_eq!(
            map.lookup(&objects, 0x10000, VmProt::WRITE).err(),
            Some(MapError::ProtectionFailure)
        );
    }

    #[test]
    fn test_write_lookup_shadows_needs_copy() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        let mut entry = rw_entry(&objects, 0x10000, 2);
        entry.flags = EntryFlags::NEEDS_COPY | EntryFlags::COW;
        let source = entry.object.clone().unwrap();
        map.enter(entry).unwrap();

        let read = map.lookup(&objects, 0x10000, VmProt::READ).unwrap();
        assert_eq!(read.object.id, source.id);
        assert!(!read.prot.contains(VmProt::WRITE));
        drop(read);

        let before = map.timestamp();
        let write = map.lookup(&objects, 0x10000, VmProt::WRITE).unwrap();
        assert_ne!(write.object.id, source.id);
        assert_eq!(write.object.backing(), Some((source.id, 0)));
        assert!(write.prot.contains(VmProt::WRITE));
        drop(write);
        assert!(map.timestamp() > before);
        assert!(!map.entry(0x10000).unwrap().flags.contains(EntryFlags::NEEDS_COPY));
    }

    #[test]
    fn test_lookup_allocates_missing_object() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        map.enter(VmMapEntry::new(0x10000, 0x13000, None, 0)).unwrap();
        let lookup = map.lookup(&objects, 0x12000, VmProt::READ).unwrap();
        assert_eq!(lookup.object.kind, ObjectType::Default);
        assert_eq!(lookup.object.size(), 3);
        assert_eq!(lookup.pindex, 2);
    }

    #[test]
    fn test_override_write_uses_max_protection() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        let mut entry = rw_entry(&objects, 0x10000, 1);
        entry.protection = VmProt::READ;
        entry.max_protection = VmProt::READ | VmProt::WRITE;
        entry.flags = EntryFlags::COW | EntryFlags::NEEDS_COPY;
        map.enter(entry).unwrap();

        let access = VmProt::READ | VmProt::WRITE | VmProt::OVERRIDE_WRITE;
        let mut lookup = map.lookup(&objects, 0x10000, access).unwrap();
        assert!(lookup.guard.is_exclusive());
        assert!(lookup.object.backing().is_some());
        lookup.restrict_max_protection();
        drop(lookup);
        assert_eq!(map.entry(0x10000).unwrap().max_protection, VmProt::READ);
    }

    #[test]
    fn test_override_write_refused_for_read_only_max() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        let mut entry = rw_entry(&objects, 0x10000, 1);
        entry.protection = VmProt::READ;
        entry.max_protection = VmProt::READ;
        entry.flags = EntryFlags::COW;
        map.enter(entry).unwrap();

        let access = VmProt::READ | VmProt::WRITE | VmProt::OVERRIDE_WRITE;
        assert_eq!(
            map.lookup(&objects, 0x10000, access).err(),
            Some(MapError::ProtectionFailure)
        );
    }

    #[test]
    fn test_wired_entry_faulted_for_full_protection() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        let mut entry = rw_entry(&objects, 0x10000, 2);
        entry.flags = EntryFlags::NEEDS_COPY;
        let source = entry.object.clone().unwrap();
        map.enter(entry).unwrap();
        map.wire_range(0x10000, 0x12000).unwrap();

        let lookup = map.lookup(&objects, 0x10000, VmProt::READ).unwrap();
        assert!(lookup.wired);
        assert_ne!(lookup.object.id, source.id);
        assert!(lookup.prot.contains(VmProt::WRITE));
        drop(lookup);

        map.unwire_range(0x10000, 0x12000);
        assert_eq!(map.entry(0x10000).unwrap().wired_count, 0);
    }

    #[test]
    fn test_remove_entries() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        map.enter(rw_entry(&objects, 0x10000, 1)).unwrap();
        map.enter(rw_entry(&objects, 0x20000, 1)).unwrap();
        let removed = map.remove(0x10000, 0x11000);
        assert_eq!(removed.len(), 1);
        assert!(map.entry(0x10000).is_none());
        assert!(map.entry(0x20000).is_some());
    }

    #[test]
    fn test_protect_bumps_timestamp() {
        let objects = ObjectManager::new();
        let map = VmMap::new(VmMapId(1));
        map.enter(rw_entry(&objects, 0x10000, 1)).unwrap();
        let before = map.timestamp();
        map.protect(0x10000, 0x11000, VmProt::READ).unwrap();
        assert!(map.timestamp() > before);
        assert_eq!(map.entry(0x10000).unwrap().protection, VmProt::READ);
    }
}
