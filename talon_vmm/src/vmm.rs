//! Address spaces and allocation-validated virtual memory, built on top of
//! [`crate::pagetable`] and the PMM. Grounded on the teacher's
//! `kernel/src/mem/vmm.rs::vmm_init`/`map_page` pair, extended to multiple
//! address spaces and to the size-validation policy spec.md §4.C requires.

use crate::pagetable::{self, FrameSource, PageTableError, PteFlags};
use spin::Mutex;
use talon_log::{log, Level};

pub const PAGE_SIZE: u64 = pagetable::PAGE_SIZE;

const KERNEL_MULTI_PAGE_BASE: u64 = 1024 * 1024;
const KERNEL_SINGLE_PAGE_BASE: u64 = 2 * 1024 * 1024;
const MAX_SINGLE_ALLOC_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    ExceedsFreeMemory,
    ExceedsHalfTotal,
    ExceedsAbsoluteCap,
    MapFailed,
}

/// VMM-level flags; `READ` always implies `present`, `EXEC` absent implies
/// the no-execute bit per spec.md §4.C.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmmFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub user: bool,
}

impl VmmFlags {
    pub const fn kernel_rw() -> Self {
        VmmFlags { read: true, write: true, exec: false, user: false }
    }

    fn to_pte_flags(self) -> PteFlags {
        PteFlags {
            writable: self.write,
            user: self.user,
            large: false,
            no_execute: !self.exec,
        }
    }
}

struct PmmFrameSource;

impl FrameSource for PmmFrameSource {
    fn alloc_zeroed_frame(&mut self) -> Option<u64> {
        let frame = talon_pmm::alloc_pages(0)?;
        pagetable::PageTable::zero_at(frame);
        Some(frame)
    }
}

pub struct AddressSpace {
    root: u64,
    pub is_kernel: bool,
    next_multi_vaddr: u64,
    next_single_vaddr: u64,
}

impl AddressSpace {
    pub fn new(is_kernel: bool) -> Option<Self> {
        let root = talon_pmm::alloc_pages(0)?;
        pagetable::PageTable::zero_at(root);
        Some(AddressSpace {
            root,
            is_kernel,
            next_multi_vaddr: KERNEL_MULTI_PAGE_BASE,
            next_single_vaddr: KERNEL_SINGLE_PAGE_BASE,
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    fn reserve_region(&mut self, pages: u64) -> u64 {
        if pages > 1 {
            let base = self.next_multi_vaddr;
            self.next_multi_vaddr += pages * PAGE_SIZE;
            base
        } else {
            let base = self.next_single_vaddr;
            self.next_single_vaddr += PAGE_SIZE;
            base
        }
    }
}

fn validate_size(size: u64) -> Result<(), VmmError> {
    let stats = talon_pmm::stats();
    if size > stats.free_bytes {
        return Err(VmmError::ExceedsFreeMemory);
    }
    if size > stats.total_bytes / 2 {
        return Err(VmmError::ExceedsHalfTotal);
    }
    if size > MAX_SINGLE_ALLOC_BYTES {
        return Err(VmmError::ExceedsAbsoluteCap);
    }
    Ok(())
}

/// Allocates `ceil(size/PAGE_SIZE)` pages from the PMM and maps them into
/// `space` at a policy-chosen base. On any failure partway through, every
/// mapping made so far is undone and its backing frame freed.
pub fn alloc_memory(space: &mut AddressSpace, size: u64, flags: VmmFlags) -> Result<u64, VmmError> {
    if let Err(e) = validate_size(size) {
        log!(Level::Warning, "vmm", "rejected alloc_memory({} bytes): {:?}", size, e);
        return Err(e);
    }

    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let base_vaddr = space.reserve_region(pages);
    let mut frames = PmmFrameSource;

    for i in 0..pages {
        let vaddr = base_vaddr + i * PAGE_SIZE;
        let paddr = match talon_pmm::alloc_pages(0) {
            Some(p) => p,
            None => {
                rollback(space.root, base_vaddr, i);
                log!(Level::Warning, "vmm", "rejected alloc_memory: physical allocation failed mid-run");
                return Err(VmmError::MapFailed);
            }
        };

        if let Err(_) = pagetable::map(space.root, vaddr, paddr, flags.to_pte_flags(), &mut frames) {
            talon_pmm::free_pages(paddr, 0);
            rollback(space.root, base_vaddr, i);
            log!(Level::Warning, "vmm", "rejected alloc_memory: map step failed");
            return Err(VmmError::MapFailed);
        }
    }

    Ok(base_vaddr)
}

/// Undoes mappings `[0, mapped_pages)` relative to `base_vaddr`, freeing
/// each backing frame. Used both for mid-allocation rollback and for
/// ordinary `free_memory`.
fn rollback(root: u64, base_vaddr: u64, mapped_pages: u64) {
    for i in 0..mapped_pages {
        let vaddr = base_vaddr + i * PAGE_SIZE;
        if let Ok(paddr) = pagetable::unmap(root, vaddr) {
            talon_pmm::free_pages(paddr, 0);
        }
    }
}

pub fn free_memory(space: &mut AddressSpace, vaddr: u64, size: u64) {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    rollback(space.root, vaddr, pages);
}

pub fn map_page(space: &AddressSpace, vaddr: u64, paddr: u64, flags: VmmFlags) -> Result<(), PageTableError> {
    let mut frames = PmmFrameSource;
    pagetable::map(space.root, vaddr, paddr, flags.to_pte_flags(), &mut frames)
}

pub fn unmap_page(space: &AddressSpace, vaddr: u64) -> Result<u64, PageTableError> {
    pagetable::unmap(space.root, vaddr)
}

/// Installs `space`'s root table as the active one (writes CR3).
pub fn switch_to(space: &AddressSpace) {
    pagetable::switch_to(space.root);
}

lazy_static::lazy_static! {
    static ref KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);
}

/// Creates the process-wide kernel address space, once. Repeated calls
/// after the first are no-ops, matching §4.C's "created once during VMM
/// init" invariant.
pub fn init_kernel_space() {
    let mut guard = KERNEL_SPACE.lock();
    if guard.is_none() {
        *guard = AddressSpace::new(true);
        log!(Level::Info, "vmm", "kernel address space initialized");
    }
}

pub fn alloc_kernel_memory(size: u64) -> Option<u64> {
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut()?;
    alloc_memory(space, size, VmmFlags::kernel_rw()).ok()
}

pub fn free_kernel_memory(ptr: u64, size: u64) {
    let mut guard = KERNEL_SPACE.lock();
    if let Some(space) = guard.as_mut() {
        free_memory(space, ptr, size);
    }
}

/// Maps a single fixed `vaddr`->`paddr` page into the kernel address space,
/// bypassing the bump-pointer allocator. Used for MMIO regions (LAPIC,
/// IOAPIC) whose virtual address is chosen by the caller rather than by
/// `alloc_kernel_memory`'s region policy, mirroring the teacher's own
/// `VMM::map_page` call in its AHCI bring-up.
pub fn map_kernel_page(vaddr: u64, paddr: u64, flags: VmmFlags) -> Result<(), PageTableError> {
    let guard = KERNEL_SPACE.lock();
    let space = guard.as_ref().ok_or(PageTableError::NotMapped)?;
    map_page(space, vaddr, paddr, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_pmm(bytes: u64) {
        use std::alloc::{alloc_zeroed, Layout};
        let layout = Layout::from_size_align(bytes as usize, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        // leak intentionally: the arena must outlive the whole test process,
        // same lifetime a kernel's physical memory has relative to its boot.
        talon_pmm::set_memory_map(&[talon_pmm::MemoryRegion {
            base: ptr as usize as u64,
            length: bytes,
            kind: talon_pmm::MemoryRegionType::Available,
        }]);
    }

    #[test]
    fn scenario_2_oversized_alloc_rejected() {
        boot_pmm(64 * 1024 * 1024);
        let mut space = AddressSpace::new(false).unwrap();
        let err = alloc_memory(&mut space, 150 * 1024 * 1024, VmmFlags::kernel_rw()).unwrap_err();
        assert_eq!(err, VmmError::ExceedsFreeMemory);
    }

    #[test]
    fn alloc_then_translate_then_free() {
        boot_pmm(32 * 1024 * 1024);
        let mut space = AddressSpace::new(false).unwrap();
        let vaddr = alloc_memory(&mut space, 3 * PAGE_SIZE, VmmFlags::kernel_rw()).unwrap();
        for i in 0..3 {
            assert!(pagetable::translate(space.root, vaddr + i * PAGE_SIZE).is_some());
        }
        free_memory(&mut space, vaddr, 3 * PAGE_SIZE);
        for i in 0..3 {
            assert!(pagetable::translate(space.root, vaddr + i * PAGE_SIZE).is_none());
        }
    }

    #[test]
    fn single_vs_multi_page_regions_are_distinct() {
        boot_pmm(16 * 1024 * 1024);
        let mut space = AddressSpace::new(false).unwrap();
        let single = alloc_memory(&mut space, PAGE_SIZE, VmmFlags::kernel_rw()).unwrap();
        let multi = alloc_memory(&mut space, 4 * PAGE_SIZE, VmmFlags::kernel_rw()).unwrap();
        assert!(single >= KERNEL_SINGLE_PAGE_BASE);
        assert!(multi >= KERNEL_MULTI_PAGE_BASE);
        assert_ne!(single, multi);
    }
}
