//! Bootstrap entry point: brings up the serial console, the kernel heap, the two physical frame
//! pools, a page table, and demand paging, in that order, then hands off to whatever cooperative
//! scheduler the final boot target supplies.
//!
//! No concrete scheduler ships in this crate (see `collab::Scheduler`'s doc comment), so there is
//! nothing left for `kernel_main` to do once paging is live except demonstrate that the five
//! subsystems it just built actually work, then halt. A real boot target would instead wire a
//! real `collab::Scheduler` in place of `NoScheduler` below and call into its `start()`.

#![no_std]
#![no_main]

extern crate alloc;
extern crate rlibc;

use bootloader_api::{entry_point, BootInfo};

use kernel::collab::x86::{X86ControlRegisters, X86PortIo};
use kernel::collab::{Scheduler, ThreadId};
use kernel::disk::{BlockingDisk, DiskId};
use kernel::fs::{Disk, FileSystem};
use kernel::memory::KernelAllocator;
use kernel::{interrupts, memory, printk};

/// How many frames the kernel pool and the process pool each manage. Chosen to be small enough
/// that a handful of demo allocations below don't exhaust either pool, and a multiple of 4 per
/// `ContFramePool::new`'s packing requirement.
const KERNEL_POOL_FRAMES: usize = 1024;
const PROCESS_POOL_FRAMES: usize = 1024;

/// The bitmap-allocated file system's declared size, in bytes.
const FS_SIZE: u32 = 16 * 1024 * 1024;

/// Stands in for a real cooperative scheduler: this boot target never actually drives a
/// `BlockingDisk` read/write (there is nothing runnable to suspend away from), so `preempt` is
/// never reached in practice. A real boot target replaces this with its own `collab::Scheduler`.
struct NoScheduler;

impl Scheduler for NoScheduler {
    fn current_thread(&self) -> ThreadId {
        ThreadId(0)
    }

    fn preempt(&self, _thread: ThreadId) {
        panic!("NoScheduler::preempt: no cooperative scheduler is wired up in this boot target");
    }

    fn resume_from_blocking(&self, _thread: ThreadId) {}

    fn yield_after_io(&self) {}

    fn dispatch_to(&self, _thread: ThreadId) {}
}

static NO_SCHEDULER: NoScheduler = NoScheduler;

/// The kernel heap.
#[global_allocator]
static mut ALLOCATOR: KernelAllocator = KernelAllocator::new();

entry_point!(kernel_main);

/// This is the entry point to the kernel. It is the first Rust code that runs.
fn kernel_main(_boot_info: &'static mut BootInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    kernel::console::init();
    printk!("\nYo Yo Yo! Made it to `kernel_main`!\n");

    printk!("Memory ...\n");
    let table = memory::init(
        unsafe { &mut ALLOCATOR },
        KERNEL_POOL_FRAMES,
        PROCESS_POOL_FRAMES,
    );
    printk!("Memory \u{2714}\n");

    printk!("Interrupts ...\n");
    interrupts::init(table);
    printk!("Interrupts \u{2714}\n");

    printk!("Heap extension ...\n");
    memory::extend_heap(unsafe { &mut ALLOCATOR });
    printk!("Heap extension \u{2714}\n");

    printk!("Disk + file system ...\n");
    let device = BlockingDisk::new(
        &X86PortIo,
        &X86ControlRegisters,
        &NO_SCHEDULER,
        0x1F0,
        DiskId::Master,
    );
    let disk = Disk::new(device);
    FileSystem::format(disk, FS_SIZE);
    let fs = FileSystem::mount(disk);
    fs.create_file(0);
    printk!("Disk + file system \u{2714}\n");

    printk!("Kernel bring-up complete; no scheduler wired up, halting.\n");

    x86_64::instructions::interrupts::enable();

    loop {
        x86_64::instructions::hlt();
    }
}
