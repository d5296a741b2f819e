// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::PrivilegeLevel;

use super::{context, gdt, timer};
use crate::sched::{SCHEDULER, TCBS};

/// The periodic timer arrives on the first remapped PIC line.
pub const TIMER_VECTOR: u8 = 32;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

fn from_user(frame: &InterruptStackFrame) -> bool {
    frame.code_segment.rpl() == PrivilegeLevel::Ring3
}

/// A faulting user thread is unrecoverable: it leaves the scheduler and
/// its TCB returns to the pool. The processor moves on to whoever is next.
fn kill_current_thread(what: &str, frame: &InterruptStackFrame) -> ! {
    log::error!(
        "{} in user thread at {:?}, thread destroyed",
        what,
        frame.instruction_pointer
    );
    let switch = {
        let mut tcbs = TCBS.lock();
        let mut sched = SCHEDULER.lock();
        if let Some(current) = sched.current() {
            sched.remove_thread(&mut tcbs, current);
            tcbs.free(current);
        }
        sched.yield_now(&mut tcbs)
    };
    if let Some(switch) = switch {
        context::perform(switch);
    }
    super::halt();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", stack_frame.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    if from_user(&stack_frame) {
        kill_current_thread("invalid opcode", &stack_frame);
    }
    panic!("EXCEPTION: INVALID OPCODE\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    if from_user(&stack_frame) {
        log::error!(
            "page fault: address {:?}, error {:?}",
            Cr2::read(),
            error_code
        );
        kill_current_thread("page fault", &stack_frame);
    }
    panic!(
        "EXCEPTION: PAGE FAULT in kernel\nAddress: {:?}\nError: {:?}\n{:#?}",
        Cr2::read(),
        error_code,
        stack_frame
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    if from_user(&stack_frame) {
        kill_current_thread("general protection fault", &stack_frame);
    }
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT ({:#x})\n{:#?}",
        error_code, stack_frame
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Preemption: acknowledge the controller, then rotate the run queue. The
/// switch happens after the scheduler lock is released.
extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    timer::tick_and_eoi();
    let switch = {
        let mut tcbs = TCBS.lock();
        let mut sched = SCHEDULER.lock();
        sched.yield_now(&mut tcbs)
    };
    if let Some(switch) = switch {
        context::perform(switch);
    }
}
