//! Interrupt handling, trimmed to what the memory subsystem needs: an IDT with a page-fault
//! handler wired to the loaded [`crate::memory::PageTable`], plus the handful of fault handlers a
//! kernel cannot safely leave unset (double fault, general protection fault). No PIC/PIT/GDT/TSS
//! setup remains; there is no device interrupt or ring-3 story in this build.

use spin::Mutex;

use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::collab::x86::X86ControlRegisters;
use crate::memory::PageTable;

/// Interrupt Descriptor Table, loaded once by [`init`] and never swapped out afterward.
static IDT: Mutex<Option<InterruptDescriptorTable>> = Mutex::new(None);

/// The address space `handle_page_fault` dispatches into. Set by [`init`]; read by the handler on
/// every fault. There is exactly one because this kernel never built the process-switching
/// machinery (out of scope) that would make "the currently loaded table" vary at interrupt time.
static PAGE_FAULT_TABLE: Mutex<Option<&'static PageTable>> = Mutex::new(None);

/// Build the IDT and load it, wiring `table`'s `handle_fault` to the page-fault vector.
pub fn init(table: &'static PageTable) {
    *PAGE_FAULT_TABLE.lock() = Some(table);

    let mut idt = InterruptDescriptorTable::new();
    idt.page_fault.set_handler_fn(handle_page_fault);
    idt.general_protection_fault.set_handler_fn(handle_gpf);
    idt.double_fault.set_handler_fn(handle_double_fault);

    *IDT.lock() = Some(idt);

    let idt_ref = unsafe { &*(IDT.lock().as_ref().unwrap() as *const InterruptDescriptorTable) };
    idt_ref.load();
}

extern "x86-interrupt" fn handle_page_fault(
    esf: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    if error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        panic!(
            "protection page fault\n{:#?}\nerror: {:?}",
            esf, error_code
        );
    }

    let table = PAGE_FAULT_TABLE
        .lock()
        .expect("page fault before interrupts::init ran");
    table.handle_fault(&X86ControlRegisters);
}

extern "x86-interrupt" fn handle_gpf(esf: InterruptStackFrame, error: u64) {
    panic!("general protection fault ({error:#x})\n{esf:#?}");
}

extern "x86-interrupt" fn handle_double_fault(esf: InterruptStackFrame, error: u64) -> ! {
    panic!("double fault ({error:#x})\n{esf:#?}");
}
