//! A blocking ATA-PIO disk driver (C4), plus a mirrored two-spindle variant.
//!
//! Implements the same command sequence to the controller's task-file registers, and the same
//! cooperative "issue, enqueue self, preempt, transfer, resume, yield" protocol, for both the
//! single-spindle and mirrored variants. Per-thread link fields on the thread object are dropped
//! in favor of queues the disk itself owns (`VecDeque<ThreadId>`). [`crate::collab::ThreadId`]
//! stays opaque, per that module's doc comment. Port access goes through the
//! [`crate::collab::PortIo`] collaborator rather than hand-written inline assembly.
//!
//! A mirrored read only ever enqueues on the master queue (see [`MirroredDisk`]'s doc comment for
//! why), so each queue entry is popped and woken at most once per operation. There is no
//! spurious-wake case to guard against.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use spin::Mutex;

use crate::collab::{ControlRegisters, PortIo, Scheduler, ThreadId};

bitflags::bitflags! {
    /// The ATA status register (task-file register 7), as read back from the controller.
    pub struct AtaStatus: u8 {
        const ERR = 0x01;
        const DRQ = 0x08;
        const SRV = 0x10;
        const DF  = 0x20;
        const RDY = 0x40;
        const BSY = 0x80;
    }
}

/// Which slot of a controller a disk answers to. Sent as part of the drive-select byte written to
/// task-file register 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskId {
    Master = 0,
    Slave = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskOperation {
    Read,
    Write,
}

impl DiskOperation {
    fn opcode(self) -> u8 {
        match self {
            DiskOperation::Read => 0x20,
            DiskOperation::Write => 0x30,
        }
    }
}

/// A disk that knows only how to read and write 512-byte blocks. `FileSystem` (C5) is written
/// against this trait, not against `BlockingDisk`/`MirroredDisk` directly.
pub trait SimpleDisk {
    fn read(&self, block_no: u32, buf: &mut [u8; 512]);
    fn write(&self, block_no: u32, buf: &[u8; 512]);
}

fn issue_operation(io: &dyn PortIo, base: u16, disk_id: DiskId, op: DiskOperation, block_no: u32) {
    io.outb(base + 1, 0x00);
    io.outb(base + 2, 0x01);
    io.outb(base + 3, block_no as u8);
    io.outb(base + 4, (block_no >> 8) as u8);
    io.outb(base + 5, (block_no >> 16) as u8);
    io.outb(
        base + 6,
        (((block_no >> 24) as u8) & 0x0F) | 0xE0 | ((disk_id as u8) << 4),
    );
    io.outb(base + 7, op.opcode());
}

fn status(io: &dyn PortIo, base: u16) -> AtaStatus {
    AtaStatus::from_bits_truncate(io.inb(base + 7))
}

fn read_sector(io: &dyn PortIo, base: u16, buf: &mut [u8; 512]) {
    for i in 0..256 {
        let word = io.inw(base);
        buf[i * 2] = word as u8;
        buf[i * 2 + 1] = (word >> 8) as u8;
    }
}

fn write_sector(io: &dyn PortIo, base: u16, buf: &[u8; 512]) {
    for i in 0..256 {
        let word = buf[2 * i] as u16 | ((buf[2 * i + 1] as u16) << 8);
        io.outw(base, word);
    }
}

/// A single-spindle ATA disk whose blocked callers are served strictly in the order they asked.
pub struct BlockingDisk {
    io: &'static dyn PortIo,
    regs: &'static dyn ControlRegisters,
    sched: &'static dyn Scheduler,
    base: u16,
    disk_id: DiskId,
    queue: Mutex<VecDeque<ThreadId>>,
}

static LAST_BLOCKING_DISK: Mutex<Option<&'static BlockingDisk>> = Mutex::new(None);

impl BlockingDisk {
    /// Build a disk connected to the `disk_id` slot of the controller at `base` (`0x1F0` for the
    /// primary ATA controller). Never freed, matching this crate's other singleton subsystems.
    pub fn new(
        io: &'static dyn PortIo,
        regs: &'static dyn ControlRegisters,
        sched: &'static dyn Scheduler,
        base: u16,
        disk_id: DiskId,
    ) -> &'static BlockingDisk {
        let disk = Box::leak(Box::new(BlockingDisk {
            io,
            regs,
            sched,
            base,
            disk_id,
            queue: Mutex::new(VecDeque::new()),
        }));
        *LAST_BLOCKING_DISK.lock() = Some(disk);
        disk
    }

    /// Number of threads currently queued waiting on this disk. Exposed for test orchestration and
    /// diagnostics; not used by the read/write protocol itself.
    pub fn waiting_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Dispatch to the thread at the head of this disk's queue, without removing it. The woken
    /// caller removes itself once its transfer finishes, matching `read`/`write` below exactly.
    pub fn dispatch_to_blocked(&self) {
        let head = self.queue.lock().front().copied();
        if let Some(thread) = head {
            self.sched.dispatch_to(thread);
        }
    }

    pub fn check_ready(&self) -> bool {
        status(self.io, self.base).contains(AtaStatus::DRQ)
    }
}

impl SimpleDisk for BlockingDisk {
    fn read(&self, block_no: u32, buf: &mut [u8; 512]) {
        issue_operation(self.io, self.base, self.disk_id, DiskOperation::Read, block_no);

        self.regs.disable_interrupts();
        let me = self.sched.current_thread();
        self.queue.lock().push_back(me);
        self.sched.preempt(me);

        read_sector(self.io, self.base, buf);

        self.sched.resume_from_blocking(me);
        self.queue.lock().pop_front();
        self.sched.yield_after_io();
    }

    fn write(&self, block_no: u32, buf: &[u8; 512]) {
        issue_operation(self.io, self.base, self.disk_id, DiskOperation::Write, block_no);

        self.regs.disable_interrupts();
        let me = self.sched.current_thread();
        self.queue.lock().push_back(me);
        self.sched.preempt(me);

        write_sector(self.io, self.base, buf);

        self.sched.resume_from_blocking(me);
        self.queue.lock().pop_front();
        self.sched.yield_after_io();
    }
}

/// Dispatch to the front of the most recently constructed [`BlockingDisk`]'s queue. A
/// static-singleton pattern (see also [`crate::interrupts`]'s `PAGE_FAULT_TABLE`) for call sites,
/// typically an interrupt handler, with no disk reference at hand.
pub fn dispatch_to_blocked() {
    if let Some(disk) = *LAST_BLOCKING_DISK.lock() {
        disk.dispatch_to_blocked();
    }
}

pub fn check_ready() -> bool {
    LAST_BLOCKING_DISK
        .lock()
        .map(|disk| disk.check_ready())
        .unwrap_or(false)
}

/// A disk mirrored across two ATA controllers (`base` and `base + 0x200`, i.e. `0x1F0`/`0x3F0` for
/// the primary/secondary pair). Every operation is issued to both spindles, but only the master's
/// data registers are ever transferred through. The slave spindle is write-only redundancy: it
/// persists a copy of every write but never supplies the bytes returned to a caller.
///
/// `read` enqueues and waits on the master queue only; it never touches the slave queue at all.
/// `write` enqueues on both queues and waits for each in turn, since both spindles must actually
/// persist the write. Because `master_q` and `slave_q` each pop (and wake) a thread at most once
/// per operation it was enqueued on, there is no spurious-wake case left to guard against here.
pub struct MirroredDisk {
    io: &'static dyn PortIo,
    regs: &'static dyn ControlRegisters,
    sched: &'static dyn Scheduler,
    master_base: u16,
    slave_base: u16,
    disk_id: DiskId,
    master_queue: Mutex<VecDeque<ThreadId>>,
    slave_queue: Mutex<VecDeque<ThreadId>>,
}

static LAST_MIRRORED_DISK: Mutex<Option<&'static MirroredDisk>> = Mutex::new(None);

impl MirroredDisk {
    pub fn new(
        io: &'static dyn PortIo,
        regs: &'static dyn ControlRegisters,
        sched: &'static dyn Scheduler,
        master_base: u16,
        slave_base: u16,
        disk_id: DiskId,
    ) -> &'static MirroredDisk {
        let disk = Box::leak(Box::new(MirroredDisk {
            io,
            regs,
            sched,
            master_base,
            slave_base,
            disk_id,
            master_queue: Mutex::new(VecDeque::new()),
            slave_queue: Mutex::new(VecDeque::new()),
        }));
        *LAST_MIRRORED_DISK.lock() = Some(disk);
        disk
    }

    pub fn master_waiting_count(&self) -> usize {
        self.master_queue.lock().len()
    }

    pub fn slave_waiting_count(&self) -> usize {
        self.slave_queue.lock().len()
    }

    fn issue(&self, op: DiskOperation, block_no: u32) {
        issue_operation(self.io, self.master_base, self.disk_id, op, block_no);
        issue_operation(self.io, self.slave_base, self.disk_id, op, block_no);
    }

    pub fn dispatch_to_master_blocked(&self) {
        let head = self.master_queue.lock().pop_front();
        if let Some(thread) = head {
            self.sched.dispatch_to(thread);
        }
    }

    pub fn dispatch_to_slave_blocked(&self) {
        let head = self.slave_queue.lock().pop_front();
        if let Some(thread) = head {
            self.sched.dispatch_to(thread);
        }
    }

    /// Reads the master controller's own status register.
    pub fn check_master_ready(&self) -> bool {
        status(self.io, self.master_base).contains(AtaStatus::DRQ)
    }

    /// Reads the *secondary* controller's own status register.
    pub fn check_slave_ready(&self) -> bool {
        status(self.io, self.slave_base).contains(AtaStatus::DRQ)
    }
}

impl SimpleDisk for MirroredDisk {
    fn read(&self, block_no: u32, buf: &mut [u8; 512]) {
        self.issue(DiskOperation::Read, block_no);

        self.regs.disable_interrupts();
        let me = self.sched.current_thread();
        self.master_queue.lock().push_back(me);

        self.sched.preempt(me);

        read_sector(self.io, self.master_base, buf);

        self.sched.resume_from_blocking(me);
        self.sched.yield_after_io();
    }

    fn write(&self, block_no: u32, buf: &[u8; 512]) {
        self.issue(DiskOperation::Write, block_no);

        self.regs.disable_interrupts();
        let me = self.sched.current_thread();
        self.master_queue.lock().push_back(me);
        self.slave_queue.lock().push_back(me);

        // One preempt per spindle: the first wake means one side has finished, the second means
        // both have.
        self.sched.preempt(me);
        self.sched.preempt(me);

        write_sector(self.io, self.master_base, buf);

        self.sched.resume_from_blocking(me);
        self.sched.yield_after_io();
    }
}

pub fn dispatch_to_master_blocked() {
    if let Some(disk) = *LAST_MIRRORED_DISK.lock() {
        disk.dispatch_to_master_blocked();
    }
}

pub fn dispatch_to_slave_blocked() {
    if let Some(disk) = *LAST_MIRRORED_DISK.lock() {
        disk.dispatch_to_slave_blocked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ControlRegisters, TestScheduler};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoopRegs;
    impl ControlRegisters for NoopRegs {
        fn read_fault_address(&self) -> u64 {
            0
        }
        fn write_page_directory_base(&self, _phys_addr: u64) {}
        fn enable_paging(&self) {}
        fn disable_interrupts(&self) {}
        fn enable_interrupts(&self) {}
    }

    /// A `PortIo` fake modelling one or more ATA controllers' task-file registers: `outb` to
    /// register 3/4/5/6 assembles a pending block number per base port, `outb` to register 7
    /// commits it, and `inw`/`outw` on the data register then walk a 256-word cursor through a
    /// backing 512-byte block store keyed by `(base, block_no)`.
    struct FakeAtaController {
        staged_block_no: Mutex<BTreeMap<u16, u32>>,
        pending: Mutex<BTreeMap<u16, (u32, usize)>>,
        blocks: Mutex<BTreeMap<(u16, u32), [u8; 512]>>,
        ready: Mutex<BTreeMap<u16, bool>>,
    }

    impl FakeAtaController {
        fn new() -> Self {
            FakeAtaController {
                staged_block_no: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(BTreeMap::new()),
                blocks: Mutex::new(BTreeMap::new()),
                ready: Mutex::new(BTreeMap::new()),
            }
        }

        fn set_ready(&self, base: u16, ready: bool) {
            self.ready.lock().insert(base, ready);
        }
    }

    impl PortIo for FakeAtaController {
        fn inb(&self, port: u16) -> u8 {
            let base = port - 7;
            if *self.ready.lock().get(&base).unwrap_or(&true) {
                AtaStatus::DRQ.bits()
            } else {
                0
            }
        }

        fn inw(&self, port: u16) -> u16 {
            let base = port;
            let mut pending = self.pending.lock();
            let (block_no, cursor) = pending.get_mut(&base).expect("read with no pending op");
            let blocks = self.blocks.lock();
            let block = blocks.get(&(base, *block_no)).copied().unwrap_or([0u8; 512]);
            let word = block[*cursor * 2] as u16 | ((block[*cursor * 2 + 1] as u16) << 8);
            *cursor += 1;
            word
        }

        fn outb(&self, port: u16, val: u8) {
            let reg = port & 0x7;
            let base = port - reg;
            match reg {
                3 => {
                    let mut staged = self.staged_block_no.lock();
                    let entry = staged.entry(base).or_insert(0);
                    *entry = (*entry & !0xFF) | val as u32;
                }
                4 => {
                    let mut staged = self.staged_block_no.lock();
                    let entry = staged.entry(base).or_insert(0);
                    *entry = (*entry & !0xFF00) | ((val as u32) << 8);
                }
                5 => {
                    let mut staged = self.staged_block_no.lock();
                    let entry = staged.entry(base).or_insert(0);
                    *entry = (*entry & !0xFF_0000) | ((val as u32) << 16);
                }
                6 => {
                    let mut staged = self.staged_block_no.lock();
                    let entry = staged.entry(base).or_insert(0);
                    *entry = (*entry & 0x00FF_FFFF) | (((val & 0x0F) as u32) << 24);
                }
                7 => {
                    let block_no = *self.staged_block_no.lock().get(&base).unwrap_or(&0);
                    self.pending.lock().insert(base, (block_no, 0));
                }
                _ => {}
            }
        }

        fn outw(&self, port: u16, val: u16) {
            let base = port;
            let mut pending = self.pending.lock();
            let (block_no, cursor) = pending.get_mut(&base).expect("write with no pending op");
            let mut blocks = self.blocks.lock();
            let block = blocks.entry((base, *block_no)).or_insert([0u8; 512]);
            block[*cursor * 2] = val as u8;
            block[*cursor * 2 + 1] = (val >> 8) as u8;
            *cursor += 1;
        }
    }

    /// A `PortIo` that answers every call with zero, for tests only interested in the
    /// queue/dispatch protocol, not in what travels over the wire.
    struct NoopIo;
    impl PortIo for NoopIo {
        fn inb(&self, _port: u16) -> u8 {
            0
        }
        fn inw(&self, _port: u16) -> u16 {
            0
        }
        fn outb(&self, _port: u16, _val: u8) {}
        fn outw(&self, _port: u16, _val: u16) {}
    }

    fn spin_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        panic!("condition never became true");
    }

    #[test]
    fn read_after_write_round_trips_through_the_protocol() {
        let io: &'static FakeAtaController = Box::leak(Box::new(FakeAtaController::new()));
        let regs: &'static NoopRegs = Box::leak(Box::new(NoopRegs));
        let sched: &'static TestScheduler = Box::leak(Box::new(TestScheduler::new(ThreadId(1))));
        let disk = BlockingDisk::new(io, regs, sched, 0x1F0, DiskId::Master);

        // No other thread is contending, so preempt()/dispatch_to_blocked() can run back to back
        // on the same OS thread.
        let writer = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 256) as u8;
            }
            disk.write(7, &buf);
        });
        spin_until(|| disk.waiting_count() == 1);
        disk.dispatch_to_blocked();
        writer.join().unwrap();

        let mut out = [0u8; 512];
        let reader_disk = disk;
        let reader = std::thread::spawn(move || {
            reader_disk.read(7, &mut out);
            out
        });
        spin_until(|| disk.waiting_count() == 1);
        disk.dispatch_to_blocked();
        let out = reader.join().unwrap();

        for (i, b) in out.iter().enumerate() {
            assert_eq!(*b, (i % 256) as u8);
        }
    }

    #[test]
    fn property7_blocked_threads_are_served_fifo() {
        let io: &'static NoopIo = Box::leak(Box::new(NoopIo));
        let regs: &'static NoopRegs = Box::leak(Box::new(NoopRegs));
        let sched: &'static TestScheduler = Box::leak(Box::new(TestScheduler::new(ThreadId(0))));
        let disk = BlockingDisk::new(io, regs, sched, 0x1F0, DiskId::Master);

        let order: &'static Mutex<alloc::vec::Vec<u64>> =
            Box::leak(Box::new(Mutex::new(alloc::vec::Vec::new())));

        let mut handles = alloc::vec::Vec::new();
        for id in 1..=3u64 {
            // Each thread is spawned only once the previous one has already reached the queue, so
            // enqueue order is deterministic despite these being real OS threads.
            handles.push(std::thread::spawn(move || {
                sched.bind_current_thread(ThreadId(id));
                let mut buf = [0u8; 512];
                disk.read(0, &mut buf);
                order.lock().push(id);
            }));
            spin_until(|| disk.waiting_count() == id as usize);
        }

        for _ in 0..3 {
            let before = order.lock().len();
            disk.dispatch_to_blocked();
            spin_until(|| order.lock().len() == before + 1);
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock(), alloc::vec![1, 2, 3]);
    }

    #[test]
    fn mirrored_read_waits_on_the_master_queue_only() {
        let io: &'static NoopIo = Box::leak(Box::new(NoopIo));
        let regs: &'static NoopRegs = Box::leak(Box::new(NoopRegs));
        let sched: &'static TestScheduler = Box::leak(Box::new(TestScheduler::new(ThreadId(1))));
        let disk = MirroredDisk::new(io, regs, sched, 0x1F0, 0x3F0, DiskId::Master);

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            disk.read(3, &mut buf);
        });
        spin_until(|| disk.master_waiting_count() == 1);

        // The read never registered on the slave queue at all: a slave "ready" interrupt arriving
        // for an unrelated reason has nothing to pop and dispatches nothing.
        assert_eq!(disk.slave_waiting_count(), 0);
        disk.dispatch_to_slave_blocked();

        disk.dispatch_to_master_blocked();
        handle.join().unwrap();
    }

    #[test]
    fn mirrored_write_waits_for_both_spindles() {
        let io: &'static NoopIo = Box::leak(Box::new(NoopIo));
        let regs: &'static NoopRegs = Box::leak(Box::new(NoopRegs));
        let sched: &'static TestScheduler = Box::leak(Box::new(TestScheduler::new(ThreadId(1))));
        let disk = MirroredDisk::new(io, regs, sched, 0x1F0, 0x3F0, DiskId::Master);

        let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let done_writer = done.clone();
        let handle = std::thread::spawn(move || {
            let buf = [0u8; 512];
            disk.write(3, &buf);
            done_writer.store(true, Ordering::SeqCst);
        });
        spin_until(|| disk.master_waiting_count() == 1 && disk.slave_waiting_count() == 1);

        disk.dispatch_to_master_blocked();
        std::thread::sleep(Duration::from_millis(10));
        assert!(!done.load(Ordering::SeqCst), "write must not finish after only one spindle");

        disk.dispatch_to_slave_blocked();
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn check_slave_ready_reads_the_secondary_controllers_own_port() {
        let io: &'static FakeAtaController = Box::leak(Box::new(FakeAtaController::new()));
        io.set_ready(0x1F0, true);
        io.set_ready(0x3F0, false);
        let regs: &'static NoopRegs = Box::leak(Box::new(NoopRegs));
        let sched: &'static TestScheduler = Box::leak(Box::new(TestScheduler::new(ThreadId(1))));
        let disk = MirroredDisk::new(io, regs, sched, 0x1F0, 0x3F0, DiskId::Master);

        assert!(disk.check_master_ready());
        assert!(!disk.check_slave_ready());
    }
}
