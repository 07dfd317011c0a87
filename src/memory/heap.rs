//! The kernel heap: a thin wrapper around `smallheap`, a no_std allocator.
//!
//! None of the five core subsystems below need a custom allocator design of their own. They are
//! ordinary `alloc::vec::Vec`/`alloc::boxed::Box` consumers once a heap exists.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::RefCell;

use smallheap::Allocator;

/// A wrapper around the heap allocator for use as the `global_allocator`.
pub struct KernelAllocator {
    heap: RefCell<Option<Allocator>>,
}

unsafe impl Sync for KernelAllocator {}

impl KernelAllocator {
    pub const fn new() -> Self {
        KernelAllocator {
            heap: RefCell::new(None),
        }
    }

    pub fn set_heap(&mut self, heap: Allocator) {
        *self.heap.borrow_mut() = Some(heap);
    }

    /// # Safety
    /// `start` must name `size` bytes of memory not otherwise in use, for the remaining lifetime
    /// of the kernel.
    pub unsafe fn extend(&mut self, start: *mut u8, size: usize) {
        self.heap.borrow_mut().as_mut().unwrap().extend(start, size)
    }

    pub fn size(&self) -> usize {
        self.heap.borrow().as_ref().unwrap().size()
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap
            .borrow_mut()
            .as_mut()
            .unwrap()
            .malloc(layout.size(), layout.align())
            .map(|p| p.as_ptr() as *mut u8)
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.heap
            .borrow_mut()
            .as_mut()
            .unwrap()
            .free(ptr as *mut u8, layout.size())
    }
}

/// Initialize the kernel heap from a pre-reserved region of physical memory.
pub fn init(allocator: &mut KernelAllocator, start: usize, size: usize) {
    unsafe {
        allocator.extend(start as *mut u8, size);
    }

    printk!(
        "\theap inited - start addr: 0x{:x}, end addr: 0x{:x}, {} bytes\n",
        start,
        start + size,
        allocator.size(),
    );
}

#[alloc_error_handler]
fn oom(_: Layout) -> ! {
    panic!("out of kernel heap memory");
}

/// A small bootstrap heap carved out of the kernel's own `.bss`, used before any `ContFramePool`
/// exists so that early initialization (building the pools themselves) has somewhere to allocate.
pub mod early {
    use smallheap::Allocator;

    use super::KernelAllocator;

    const INITIAL_KHEAP_SPACE_SIZE: usize = 4 << 12;

    #[repr(C, align(4096))]
    struct InitialHeapSpace([u8; INITIAL_KHEAP_SPACE_SIZE]);

    impl InitialHeapSpace {
        const fn empty() -> Self {
            InitialHeapSpace([0; INITIAL_KHEAP_SPACE_SIZE])
        }
    }

    static mut INITIAL_KHEAP_SPACE: InitialHeapSpace = InitialHeapSpace::empty();

    pub fn init(allocator: &mut KernelAllocator) {
        let init_heap_start =
            unsafe { (&raw mut INITIAL_KHEAP_SPACE) as *mut InitialHeapSpace }.cast();
        let heap = unsafe { Allocator::new(init_heap_start, INITIAL_KHEAP_SPACE_SIZE) };
        let free_size = heap.size();

        allocator.set_heap(heap);

        printk!(
            "\tearly heap inited - start addr: 0x{:x}, {} bytes\n",
            init_heap_start as usize,
            free_size,
        );
    }
}
