//! Global heap allocator.
//!
//! The teacher's own `kernel/src/mem/mem.rs` rolled a bespoke linked-list
//! allocator directly over raw frames; here that job goes to
//! `linked_list_allocator`, already in the workspace's dependency table,
//! backed by virtual memory `talon_vmm::alloc_kernel_memory` carves out
//! of the kernel address space once `talon_pmm`/`talon_vmm` are up (spec.md
//! §2's startup order: PMM and VMM come up before anything allocates at
//! volume).

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Maps `initial_bytes` of kernel memory and hands it to the allocator.
/// Must run exactly once, after [`talon_vmm::init_kernel_space`].
pub fn init_heap(initial_bytes: u64) -> Result<(), &'static str> {
    let vaddr = talon_vmm::alloc_kernel_memory(initial_bytes)
        .ok_or("out of kernel virtual memory for initial heap")?;
    unsafe {
        ALLOCATOR.lock().init(vaddr as usize as *mut u8, initial_bytes as usize);
    }
    Ok(())
}

/// Grows the heap by `additional_bytes`. Relies on `talon_vmm`'s kernel
/// address space handing out multi-page regions from a monotonically
/// increasing bump pointer, so a region requested immediately after the
/// current heap's end is contiguous with it — true as long as nothing
/// else calls `alloc_kernel_memory` between heap-growth calls.
pub fn grow_heap(additional_bytes: u64) -> Result<(), &'static str> {
    talon_vmm::alloc_kernel_memory(additional_bytes)
        .ok_or("out of kernel virtual memory for heap growth")?;
    unsafe {
        ALLOCATOR.lock().extend(additional_bytes as usize);
    }
    Ok(())
}

#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
