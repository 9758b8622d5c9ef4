#![cfg_attr(not(test), no_std)]

pub mod pagetable;
pub mod vmm;

pub use pagetable::{is_canonical, map, translate, unmap, walk, PageTableError, PteFlags};
pub use vmm::{
    alloc_kernel_memory, alloc_memory, free_kernel_memory, free_memory, init_kernel_space,
    map_kernel_page, map_page, switch_to, unmap_page, AddressSpace, VmmError, VmmFlags,
};
