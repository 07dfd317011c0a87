//! The external-collaborator contracts of the crate: everything C1-C5 consume but do not own.
//!
//! Each trait here corresponds to one "(consumed)" interface: CPU port I/O, control registers, and
//! the cooperative scheduler plus its thread object. A real, minimal implementation is provided
//! for the ones a bare-metal boot needs (backed by the `x86_64` crate); the scheduler is consumed
//! only as a trait, since policy is out of scope here. The test suite drives C1-C5 with
//! [`TestScheduler`] instead.

use alloc::collections::VecDeque;

/// Raw port I/O, as used by the ATA disk driver.
pub trait PortIo {
    /// Read one byte from `port`.
    fn inb(&self, port: u16) -> u8;
    /// Read one 16-bit word from `port`.
    fn inw(&self, port: u16) -> u16;
    /// Write one byte to `port`.
    fn outb(&self, port: u16, val: u8);
    /// Write one 16-bit word to `port`.
    fn outw(&self, port: u16, val: u16);
}

/// CPU control-register and interrupt-masking access, as used to load/enable paging.
pub trait ControlRegisters {
    /// The faulting address recorded by the last page fault (`cr2` on x86).
    fn read_fault_address(&self) -> u64;
    /// Point the MMU at a new page directory's physical address (`cr3` on x86).
    fn write_page_directory_base(&self, phys_addr: u64);
    /// Set the paging-enable bit (`cr0.PG` on x86). One-way: there is no `disable_paging`.
    fn enable_paging(&self);
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);
}

/// Opaque handle to a thread, as seen by the disk driver's FIFOs. Intentionally has no fields
/// beyond what identifies a thread. The intrusive `next_bqueue`/`next_master_bqueue`/
/// `next_slave_bqueue` link fields are dropped in favor of externally owned queues (see
/// [`crate::disk`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// The cooperative scheduler the disk driver suspends into and is resumed from.
///
/// Policy (which thread runs next, fairness beyond FIFO-per-disk, timeslicing) is entirely out of
/// scope; this crate only needs the four suspension primitives the blocking disk uses.
pub trait Scheduler {
    /// The thread currently executing on this (single) processor.
    fn current_thread(&self) -> ThreadId;
    /// Mark `thread` non-runnable and switch away from it. Returns once the scheduler has
    /// re-dispatched `thread` (i.e. this call does not return until `thread` runs again).
    fn preempt(&self, thread: ThreadId);
    /// Return `thread` to the ready queue without switching to it immediately.
    fn resume_from_blocking(&self, thread: ThreadId);
    /// Give up the remainder of the current thread's slice, picking the next ready thread.
    fn yield_after_io(&self);
    /// Context-switch directly to `thread`, bypassing the ready queue.
    fn dispatch_to(&self, thread: ThreadId);
}

#[cfg(not(test))]
pub mod x86 {
    //! Real collaborator implementations for an actual x86_64 boot, backed by the `x86_64` crate.

    use x86_64::instructions::port::{Port, PortReadOnly, PortWriteOnly};
    use x86_64::registers::control::{Cr0, Cr0Flags, Cr2, Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    use super::{ControlRegisters, PortIo};

    pub struct X86PortIo;

    impl PortIo for X86PortIo {
        fn inb(&self, port: u16) -> u8 {
            unsafe { PortReadOnly::new(port).read() }
        }

        fn inw(&self, port: u16) -> u16 {
            unsafe { PortReadOnly::new(port).read() }
        }

        fn outb(&self, port: u16, val: u8) {
            unsafe { PortWriteOnly::new(port).write(val) }
        }

        fn outw(&self, port: u16, val: u16) {
            unsafe { PortWriteOnly::new(port).write(val) }
        }
    }

    // Silence unused-import warnings for the unsigned `Port` variant; `PortIo` only needs
    // read-only/write-only ports, but it is kept available for future bidirectional ports.
    #[allow(dead_code)]
    type _Unused = Port<u8>;

    pub struct X86ControlRegisters;

    impl ControlRegisters for X86ControlRegisters {
        fn read_fault_address(&self) -> u64 {
            Cr2::read_raw()
        }

        fn write_page_directory_base(&self, phys_addr: u64) {
            let frame = PhysFrame::containing_address(PhysAddr::new(phys_addr));
            unsafe {
                Cr3::write(frame, Cr3Flags::empty());
            }
        }

        fn enable_paging(&self) {
            unsafe {
                Cr0::update(|flags| *flags |= Cr0Flags::PAGING);
            }
        }

        fn disable_interrupts(&self) {
            x86_64::instructions::interrupts::disable();
        }

        fn enable_interrupts(&self) {
            x86_64::instructions::interrupts::enable();
        }
    }
}

/// A scheduler mock for tests, backed by real OS threads rather than a single-threaded log.
///
/// `disk`'s blocking protocol is only interesting to test under genuine concurrency: several
/// callers queued on the same disk, served in FIFO order, only released by an explicit
/// `dispatch_to_blocked`/`dispatch_to_master_blocked`/`dispatch_to_slave_blocked` call from an
/// orchestrating "interrupt handler" thread. Each test OS thread stands in for one kernel thread
/// and calls [`TestScheduler::bind_current_thread`] once before touching the disk; `preempt` then
/// blocks the calling OS thread on a condvar until a matching `dispatch_to` wakes it, which is
/// real suspension, not a recorded-and-ignored call.
#[cfg(test)]
pub struct TestScheduler {
    pub log: spin::Mutex<VecDeque<&'static str>>,
    ready: std::sync::Mutex<std::collections::BTreeMap<ThreadId, bool>>,
    cvar: std::sync::Condvar,
}

#[cfg(test)]
std::thread_local! {
    static CURRENT_THREAD: core::cell::Cell<ThreadId> = core::cell::Cell::new(ThreadId(0));
}

#[cfg(test)]
impl TestScheduler {
    pub fn new(initial: ThreadId) -> Self {
        CURRENT_THREAD.with(|c| c.set(initial));
        TestScheduler {
            log: spin::Mutex::new(VecDeque::new()),
            ready: std::sync::Mutex::new(std::collections::BTreeMap::new()),
            cvar: std::sync::Condvar::new(),
        }
    }

    /// Bind the calling OS thread's notion of "current thread" to `thread`. Every test thread
    /// standing in for a kernel thread calls this once, first.
    pub fn bind_current_thread(&self, thread: ThreadId) {
        CURRENT_THREAD.with(|c| c.set(thread));
        self.ready.lock().unwrap().entry(thread).or_insert(true);
    }
}

#[cfg(test)]
impl Scheduler for TestScheduler {
    fn current_thread(&self) -> ThreadId {
        CURRENT_THREAD.with(|c| c.get())
    }

    fn preempt(&self, thread: ThreadId) {
        self.log.lock().push_back("preempt");
        let guard = self.ready.lock().unwrap();
        let mut guard = guard;
        guard.insert(thread, false);
        let _ = self
            .cvar
            .wait_while(guard, |ready| !*ready.get(&thread).unwrap_or(&false))
            .unwrap();
    }

    fn resume_from_blocking(&self, thread: ThreadId) {
        self.log.lock().push_back("resume_from_blocking");
        let _ = thread;
    }

    fn yield_after_io(&self) {
        self.log.lock().push_back("yield_after_io");
    }

    fn dispatch_to(&self, thread: ThreadId) {
        self.log.lock().push_back("dispatch_to");
        self.ready.lock().unwrap().insert(thread, true);
        self.cvar.notify_all();
    }
}
