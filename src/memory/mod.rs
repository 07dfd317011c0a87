//! The memory management subsystem: a contiguous frame allocator (C1), a two-level page table
//! with demand paging (C2), and per-address-space virtual memory arenas (C3).

pub use self::frame::{release_frames, ContFramePool, FrameState, FRAME_SIZE};
pub use self::heap::KernelAllocator;
pub use self::page_table::PageTable;
pub use self::vm_pool::VMPool;

pub mod frame;
mod heap;
pub mod page_table;
pub mod vm_pool;

/// Bring up the kernel heap and paging, in the order the rest of the kernel depends on: a
/// bootstrap heap first (so the pools and the directory itself can be heap allocated), then the
/// kernel and process frame pools, then the page table, loaded and with paging enabled. Returns
/// the loaded table so callers can register VMPools and wire up the page-fault vector.
#[cfg(not(test))]
pub fn init(
    allocator: &mut KernelAllocator,
    kernel_mem_pool_size: usize,
    process_mem_pool_size: usize,
) -> &'static PageTable {
    heap::early::init(allocator);

    let kernel_pool_info_frame = 2;
    let kernel_pool = ContFramePool::new(2, kernel_mem_pool_size, 0, 0);

    let process_pool_info_frames = ContFramePool::needed_info_frames(process_mem_pool_size);
    let process_pool_base = kernel_pool_info_frame + kernel_mem_pool_size;
    let process_pool_info_frame = kernel_pool.get_frames(process_pool_info_frames);
    let process_pool = ContFramePool::new(
        process_pool_base,
        process_mem_pool_size,
        process_pool_info_frame,
        process_pool_info_frames,
    );

    PageTable::init_paging(kernel_pool, process_pool, page_table::SHARED_IDENTITY_SIZE);
    let table = PageTable::new();

    let regs = crate::collab::x86::X86ControlRegisters;
    table.load(&regs);
    PageTable::enable_paging(&regs);

    table
}

/// Extend the kernel heap into the real, demand-paged region beyond the bootstrap `.bss` heap.
///
/// Must run only after the page-fault vector is wired to this table's `handle_fault` (see
/// [`crate::interrupts::init`]): `smallheap`'s `extend` touches the start of the new region
/// immediately, and that touch is itself the first, legitimate fault this page table will see
/// outside of the identity map.
#[cfg(not(test))]
pub fn extend_heap(allocator: &mut KernelAllocator) {
    heap::init(
        allocator,
        page_table::KERNEL_HEAP_START as usize,
        page_table::KERNEL_HEAP_SIZE,
    );
}
