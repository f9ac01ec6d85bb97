//! Copying of Wired Map Entries
//!
//! Based on Mach4 vm/vm_fault.c (vm_fault_copy_entry)
//!
//! A wired source entry cannot be shared copy-on-write, so its pages are
//! copied eagerly into a fresh anonymous object for the destination.

use crate::mach_vm::vm_map::{VmMap, VmMapEntry};
use crate::mach_vm::vm_object::ObjectType;
use crate::mach_vm::vm_page::{atop, ptoa, AllocError, AllocRequest, PageFlags};
use crate::mach_vm::VmSystem;

impl VmSystem {
    /// Give `dst_entry` a private copy of the resident pages behind
    /// `src_entry`, mapped in `dst_map`
    ///
    /// Every source page must be resident (the source is wired). The
    /// destination pages are entered unwired at the entry's maximum
    /// protection.
    pub fn vm_fault_copy_entry(
        &self,
        dst_map: &VmMap,
        src_map: &VmMap,
        dst_entry: &mut VmMapEntry,
        src_entry: &VmMapEntry,
    ) {
        let pages = &self.pages;
        let Some(src_object) = src_entry.object.as_ref() else {
            panic!("vm_fault_copy_entry: source entry has no object");
        };
        let src_pindex = atop(src_entry.offset);

        if let Some(old) = dst_entry.object.take() {
            self.objects.deallocate(&old, pages);
        }
        let dst_object = self
            .objects
            .allocate(ObjectType::Default, atop(dst_entry.size()));
        dst_entry.object = Some(dst_object.clone());
        dst_entry.offset = 0;
        let prot = dst_entry.max_protection;

        log::debug!(
            "vm_fault_copy_entry: {:?}@{:#x} -> {:?}@{:#x}, {} pages",
            src_map.id,
            src_entry.start,
            dst_map.id,
            dst_entry.start,
            atop(dst_entry.size())
        );

        for i in 0..atop(dst_entry.size()) {
            let vaddr = dst_entry.start + ptoa(i);
            let dst_m = loop {
                match pages.alloc(dst_object.id, i, AllocRequest::Normal) {
                    Ok(id) => break id,
                    Err(AllocError::NoMemory) => self.vm_wait(),
                    Err(AllocError::Exists) => {
                        panic!("vm_fault_copy_entry: fresh object already has page {}", i)
                    }
                }
            };

            let Some(src_m) = pages.lookup(src_object.id, src_pindex + i) else {
                panic!("vm_fault_copy_entry: page missing at {:#x}", vaddr);
            };
            pages.copy(src_m, dst_m);
            pages.page(dst_m).clear_flags(PageFlags::ZERO);

            dst_map.pmap.enter(vaddr, dst_m, prot, false);
            pages
                .page(dst_m)
                .set_flags(PageFlags::WRITEABLE | PageFlags::MAPPED);
            pages.activate(dst_m);
            pages.wakeup(dst_m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::testing::{self, byte_at, map_object, BASE};
    use crate::mach_vm::vm_fault::FaultFlags;
    use crate::mach_vm::vm_map::{EntryFlags, VmMapId, VmProt};
    use crate::mach_vm::vm_page::PageQueueType;
    use alloc::sync::Arc;

    const RW: VmProt = VmProt::READ.union(VmProt::WRITE);
    const DST: u64 = 0x40000;

    #[test]
    fn test_copy_wired_entry() {
        let h = testing::harness(128);
        let src_map = VmMap::new(VmMapId(1));
        let dst_map = VmMap::new(VmMapId(2));
        let src_obj = h.sys.objects.allocate(ObjectType::Default, 3);
        map_object(&src_map, BASE, Arc::clone(&src_obj), RW, EntryFlags::empty());
        h.sys.vm_fault_wire(&src_map, BASE, BASE + ptoa(3)).unwrap();
        for i in 0..3 {
            let id = src_map.pmap.extract(BASE + ptoa(i)).unwrap();
            h.sys.pages.page(id).write(0, &[0x40 + i as u8]);
        }

        let src_entry = src_map.entry(BASE).unwrap();
        let mut dst_entry = VmMapEntry::new(DST, DST + ptoa(3), None, 0);
        dst_entry.max_protection = RW;
        h.sys
            .vm_fault_copy_entry(&dst_map, &src_map, &mut dst_entry, &src_entry);

        let dst_obj = dst_entry.object.clone().unwrap();
        assert_ne!(dst_obj.id, src_obj.id);
        assert_eq!(dst_obj.kind, ObjectType::Default);
        assert_eq!(dst_entry.offset, 0);
        for i in 0..3 {
            let va = DST + ptoa(i);
            let installed = dst_map.pmap.lookup(va).unwrap();
            assert_eq!(installed.prot, RW);
            assert!(!installed.wired);
            let page = h.sys.pages.page(installed.page);
            assert_eq!(page.owner(), Some((dst_obj.id, i)));
            assert!(page.has_flags(PageFlags::WRITEABLE | PageFlags::MAPPED));
            assert!(!page.is_busy());
            assert!(page.is_fully_valid());
            assert_eq!(page.queue(), PageQueueType::Active);
            assert_eq!(byte_at(&h.sys, &dst_map, va), 0x40 + i as u8);
        }
        // Source untouched
        assert_eq!(byte_at(&h.sys, &src_map, BASE), 0x40);
        assert_eq!(h.sys.pages.resident_count(src_obj.id), 3);

        // Writes through the copy stay private to it
        for i in 0..3 {
            let dst_m = dst_map.pmap.extract(DST + ptoa(i)).unwrap();
            h.sys.pages.page(dst_m).write(0, &[0xee]);
        }
        for i in 0..3 {
            assert_eq!(byte_at(&h.sys, &dst_map, DST + ptoa(i)), 0xee);
            assert_eq!(byte_at(&h.sys, &src_map, BASE + ptoa(i)), 0x40 + i as u8);
        }
    }

    #[test]
    fn test_copy_releases_previous_object() {
        let h = testing::harness(128);
        let src_map = VmMap::new(VmMapId(1));
        let dst_map = VmMap::new(VmMapId(2));
        let src_obj = h.sys.objects.allocate(ObjectType::Default, 1);
        map_object(&src_map, BASE, src_obj, RW, EntryFlags::empty());
        h.sys.vm_fault(&src_map, BASE, RW, FaultFlags::NORMAL).unwrap();

        let old = h.sys.objects.allocate(ObjectType::Default, 1);
        let mut dst_entry = VmMapEntry::new(DST, DST + ptoa(1), Some(Arc::clone(&old)), 0);
        let src_entry = src_map.entry(BASE).unwrap();
        h.sys
            .vm_fault_copy_entry(&dst_map, &src_map, &mut dst_entry, &src_entry);

        assert!(old.is_dead());
        assert!(h.sys.objects.lookup(old.id).is_none());
        assert_ne!(dst_entry.object.unwrap().id, old.id);
    }

    #[test]
    #[should_panic(expected = "page missing")]
    fn test_copy_missing_source_page_panics() {
        let h = testing::harness(64);
        let src_map = VmMap::new(VmMapId(1));
        let dst_map = VmMap::new(VmMapId(2));
        let src_obj = h.sys.objects.allocate(ObjectType::Default, 2);
        map_object(&src_map, BASE, src_obj, RW, EntryFlags::empty());

        let src_entry = src_map.entry(BASE).unwrap();
        let mut dst_entry = VmMapEntry::new(DST, DST + ptoa(2), None, 0);
        h.sys
            .vm_fault_copy_entry(&dst_map, &src_map, &mut dst_entry, &src_entry);
    }
}
