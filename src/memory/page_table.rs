//! A two-level x86-style page table with demand-paged `handle_fault`.
//!
//! Directory and page-table *contents* are modeled as owned arrays keyed by frame number in
//! [`TABLE_STORE`], rather than literal MMU walks over raw pointers into physical memory. The
//! entry format (`(frame_no << 12) | flags`) and the two-level addressing math (bits 31:22 select
//! a directory slot, bits 21:12 a table slot) are otherwise exactly the x86 scheme.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::collab::ControlRegisters;
use crate::error::NO_FRAME;
use crate::memory::frame::{ContFramePool, FRAME_SIZE};
use crate::memory::vm_pool::VMPool;

pub const PAGE_SIZE: u64 = FRAME_SIZE as u64;
const ENTRIES_PER_TABLE: usize = 1024;

const PTE_PRESENT: u32 = 0x1;
const PTE_RW: u32 = 0x2;

/// The size, in bytes, of the flat identity map installed at construction time.
pub const SHARED_IDENTITY_SIZE: u64 = 4 * 1024 * 1024;

/// Where the kernel heap lives once real paging (demand faulting) is up. Deliberately outside
/// the identity-mapped region, so its first touch exercises `handle_fault` like any other page.
pub const KERNEL_HEAP_START: u64 = 8 * 1024 * 1024;
pub const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

type Table = [u32; ENTRIES_PER_TABLE];

static TABLE_STORE: Mutex<BTreeMap<usize, Table>> = Mutex::new(BTreeMap::new());

static KERNEL_POOL: Mutex<Option<&'static ContFramePool>> = Mutex::new(None);
static PROCESS_POOL: Mutex<Option<&'static ContFramePool>> = Mutex::new(None);
static SHARED_SIZE: Mutex<Option<u64>> = Mutex::new(None);
static CURRENT_PAGE_TABLE: Mutex<Option<&'static PageTable>> = Mutex::new(None);

fn read_entry(frame_no: usize, index: usize) -> u32 {
    TABLE_STORE
        .lock()
        .get(&frame_no)
        .map(|t| t[index])
        .unwrap_or(0)
}

fn write_entry(frame_no: usize, index: usize, value: u32) {
    TABLE_STORE
        .lock()
        .entry(frame_no)
        .or_insert([0u32; ENTRIES_PER_TABLE])[index] = value;
}

fn entry_frame(entry: u32) -> usize {
    (entry >> 12) as usize
}

fn entry_present(entry: u32) -> bool {
    entry & PTE_PRESENT != 0
}

fn dir_index(vaddr: u64) -> usize {
    ((vaddr >> 22) & 0x3FF) as usize
}

fn table_index(vaddr: u64) -> usize {
    ((vaddr >> 12) & 0x3FF) as usize
}

/// One page directory plus the page table frames it has caused to be allocated; one instance per
/// address space.
pub struct PageTable {
    directory_frame: usize,
    registered_pools: Mutex<Vec<&'static VMPool>>,
}

impl PageTable {
    /// Capture the kernel pool, the process pool, and the identity-mapped region size as
    /// process-globals. Must run once, before any `PageTable::new()`.
    pub fn init_paging(
        kernel_pool: &'static ContFramePool,
        process_pool: &'static ContFramePool,
        shared_size: u64,
    ) {
        *KERNEL_POOL.lock() = Some(kernel_pool);
        *PROCESS_POOL.lock() = Some(process_pool);
        *SHARED_SIZE.lock() = Some(shared_size);
    }

    fn kernel_pool() -> &'static ContFramePool {
        KERNEL_POOL
            .lock()
            .expect("PageTable: init_paging must run before constructing a PageTable")
    }

    fn process_pool() -> &'static ContFramePool {
        PROCESS_POOL
            .lock()
            .expect("PageTable: init_paging must run before constructing a PageTable")
    }

    fn shared_size() -> u64 {
        SHARED_SIZE
            .lock()
            .expect("PageTable: init_paging must run before constructing a PageTable")
    }

    /// Allocate a directory frame and a first page table, identity-mapping the first
    /// [`SHARED_IDENTITY_SIZE`] bytes of virtual memory into it with `present=1, rw=1`. Every
    /// other directory slot starts absent.
    pub fn new() -> &'static PageTable {
        let kernel_pool = Self::kernel_pool();

        let directory_frame = kernel_pool.get_frames(1);
        kernel_assert!(
            directory_frame != NO_FRAME,
            "PageTable::new: kernel pool exhausted allocating the directory"
        );

        let identity_table_frame = kernel_pool.get_frames(1);
        kernel_assert!(
            identity_table_frame != NO_FRAME,
            "PageTable::new: kernel pool exhausted allocating the identity page table"
        );

        let n_identity_pages =
            ((Self::shared_size() + PAGE_SIZE - 1) / PAGE_SIZE).min(ENTRIES_PER_TABLE as u64);
        for i in 0..n_identity_pages as usize {
            write_entry(
                identity_table_frame,
                i,
                ((i as u32) << 12) | PTE_PRESENT | PTE_RW,
            );
        }

        write_entry(
            directory_frame,
            0,
            ((identity_table_frame as u32) << 12) | PTE_PRESENT | PTE_RW,
        );
        for slot in 1..ENTRIES_PER_TABLE {
            write_entry(directory_frame, slot, 0);
        }

        Box::leak(Box::new(PageTable {
            directory_frame,
            registered_pools: Mutex::new(Vec::new()),
        }))
    }

    /// Write this table's directory's physical address into the MMU base register and make it
    /// the process-global "current page table".
    pub fn load(&'static self, regs: &dyn ControlRegisters) {
        regs.write_page_directory_base((self.directory_frame as u64) * PAGE_SIZE);
        *CURRENT_PAGE_TABLE.lock() = Some(self);
    }

    /// Set the paging-enable bit. One-way: {paging-disabled} -> {paging-enabled}.
    pub fn enable_paging(regs: &dyn ControlRegisters) {
        regs.enable_paging();
    }

    /// The address-space singleton currently loaded, if any.
    pub fn current() -> Option<&'static PageTable> {
        *CURRENT_PAGE_TABLE.lock()
    }

    /// Record a weak back-reference to a `VMPool` serving this address space, consulted by
    /// `handle_fault` to reject illegitimate addresses.
    pub fn register_pool(&self, pool: &'static VMPool) {
        self.registered_pools.lock().push(pool);
    }

    fn is_registered_legitimate(&self, vaddr: u64) -> bool {
        let pools = self.registered_pools.lock();
        if pools.is_empty() {
            // No arenas registered yet (e.g. identity-mapped/bootstrap faults): nothing to
            // refuse against, so let the fault through.
            return true;
        }
        pools.iter().any(|pool| pool.is_legitimate(vaddr))
    }

    /// Handle a not-present page fault: allocate a fresh kernel-pool frame for a new page table
    /// if the covering directory entry is absent, then allocate a process-pool frame for the
    /// faulting page itself. Protection faults (`present` already set) are fatal. This routine
    /// is only ever reached for not-present faults, by construction of the page-fault vector.
    pub fn handle_fault(&self, regs: &dyn ControlRegisters) {
        let vaddr = regs.read_fault_address();
        self.handle_fault_at(vaddr);
    }

    /// The logical core of `handle_fault`, independent of reading `cr2` through a collaborator.
    /// Split out so tests can drive it directly with raw addresses.
    pub fn handle_fault_at(&self, vaddr: u64) {
        kernel_assert!(
            self.is_registered_legitimate(vaddr),
            "PageTable::handle_fault: address {vaddr:#x} is not inside any registered arena"
        );

        let di = dir_index(vaddr);
        let ti = table_index(vaddr);

        let mut dir_entry = read_entry(self.directory_frame, di);
        if !entry_present(dir_entry) {
            let table_frame = Self::kernel_pool().get_frames(1);
            kernel_assert!(
                table_frame != NO_FRAME,
                "PageTable::handle_fault: kernel pool exhausted allocating a page table"
            );
            for slot in 0..ENTRIES_PER_TABLE {
                write_entry(table_frame, slot, 0);
            }
            dir_entry = ((table_frame as u32) << 12) | PTE_PRESENT | PTE_RW;
            write_entry(self.directory_frame, di, dir_entry);
        }

        let table_frame = entry_frame(dir_entry);
        let existing = read_entry(table_frame, ti);
        if entry_present(existing) {
            // Already mapped: a second fault on the same never-before-touched address should not
            // happen, but if it does (e.g. a benign race in a preemptive target), this is a no-op
            // rather than leaking a second process-pool frame.
            return;
        }

        let page_frame = Self::process_pool().get_frames(1);
        kernel_assert!(
            page_frame != NO_FRAME,
            "PageTable::handle_fault: process pool exhausted"
        );
        write_entry(
            table_frame,
            ti,
            ((page_frame as u32) << 12) | PTE_PRESENT | PTE_RW,
        );
    }

    /// Invalidate the mapping for the page containing `vaddr` and return the underlying frame to
    /// the process pool. A no-op if the page was never mapped.
    pub fn free_page(&self, vaddr: u64) {
        let di = dir_index(vaddr);
        let ti = table_index(vaddr);

        let dir_entry = read_entry(self.directory_frame, di);
        if !entry_present(dir_entry) {
            return;
        }

        let table_frame = entry_frame(dir_entry);
        let entry = read_entry(table_frame, ti);
        if !entry_present(entry) {
            return;
        }

        let frame_no = entry_frame(entry);
        write_entry(table_frame, ti, 0);
        crate::memory::frame::release_frames(frame_no);
    }

    /// Whether the page containing `vaddr` currently has a present mapping. Exposed for testing;
    /// not part of the fault-handling control flow.
    pub fn is_mapped(&self, vaddr: u64) -> bool {
        let dir_entry = read_entry(self.directory_frame, dir_index(vaddr));
        if !entry_present(dir_entry) {
            return false;
        }
        entry_present(read_entry(entry_frame(dir_entry), table_index(vaddr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::ContFramePool;
    use crate::memory::vm_pool::VMPool;

    struct FakeRegs {
        fault_addr: core::cell::Cell<u64>,
    }

    impl ControlRegisters for FakeRegs {
        fn read_fault_address(&self) -> u64 {
            self.fault_addr.get()
        }
        fn write_page_directory_base(&self, _phys_addr: u64) {}
        fn enable_paging(&self) {}
        fn disable_interrupts(&self) {}
        fn enable_interrupts(&self) {}
    }

    fn setup() -> &'static PageTable {
        let kernel_pool = ContFramePool::new(1, 1024, 0, 0);
        let process_pool = ContFramePool::new(2000, 1024, kernel_pool.get_frames(4), 4);
        PageTable::init_paging(kernel_pool, process_pool, SHARED_IDENTITY_SIZE);
        let table = PageTable::new();
        let regs = FakeRegs {
            fault_addr: core::cell::Cell::new(0),
        };
        table.load(&regs);
        table
    }

    #[test]
    fn identity_map_is_present_at_construction() {
        let table = setup();
        assert!(table.is_mapped(0));
        assert!(table.is_mapped(SHARED_IDENTITY_SIZE - PAGE_SIZE));
    }

    #[test]
    fn property6_page_fault_idempotence() {
        let table = setup();
        let process_pool = PageTable::process_pool();
        let vmpool = VMPool::new(0x0040_0000, 0x0040_0000, process_pool, table);
        table.register_pool(vmpool);

        let vaddr = 0x0040_1000u64;
        assert!(!table.is_mapped(vaddr));

        let free_before = process_pool.n_free_frames();
        table.handle_fault_at(vaddr);
        assert!(table.is_mapped(vaddr));
        let free_after_first = process_pool.n_free_frames();
        assert_eq!(free_before - free_after_first, 1);

        // A second "read" of the same address does not fault again (already mapped), so no
        // second frame is consumed.
        if table.is_mapped(vaddr) {
            // nothing to do: real hardware would not even raise a fault here.
        } else {
            table.handle_fault_at(vaddr);
        }
        assert_eq!(process_pool.n_free_frames(), free_after_first);
    }

    #[test]
    fn free_page_returns_frame_to_process_pool() {
        let table = setup();
        let process_pool = PageTable::process_pool();
        let vmpool = VMPool::new(0x0040_0000, 0x0040_0000, process_pool, table);
        table.register_pool(vmpool);

        let vaddr = 0x0040_1000u64;
        table.handle_fault_at(vaddr);
        assert!(table.is_mapped(vaddr));

        let free_before = process_pool.n_free_frames();
        table.free_page(vaddr);
        assert!(!table.is_mapped(vaddr));
        assert_eq!(process_pool.n_free_frames(), free_before + 1);
    }
}
