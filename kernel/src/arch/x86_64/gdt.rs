// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const EMERGENCY_STACK_SIZE: usize = 4096 * 5;

#[repr(align(16))]
struct AlignedStack([u8; EMERGENCY_STACK_SIZE]);

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Ring 3 -> Ring 0 transitions land on this stack until the
        // scheduler installs the first thread's kernel stack. Must be
        // 16-byte aligned for the x86_64 ABI.
        tss.privilege_stack_table[0] = {
            static mut BOOT_KERNEL_STACK: AlignedStack = AlignedStack([0; EMERGENCY_STACK_SIZE]);
            let stack_ptr = &raw const BOOT_KERNEL_STACK;
            VirtAddr::from_ptr(stack_ptr) + EMERGENCY_STACK_SIZE as u64
        };

        // Double faults get their own known-good stack.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; EMERGENCY_STACK_SIZE]);
            let stack_ptr = &raw const DOUBLE_FAULT_STACK;
            VirtAddr::from_ptr(stack_ptr) + EMERGENCY_STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());     // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());     // 0x10
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));          // 0x18 (2 entries)
        let user_data_selector = gdt.append(Descriptor::user_data_segment());  // 0x28 (+ RPL 3 = 0x2B)
        let user_code_selector = gdt.append(Descriptor::user_code_segment());  // 0x30 (+ RPL 3 = 0x33)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: TSS (occupies 2 entries, 0x18-0x20)
/// - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
/// - 0x30: User code segment (Ring 3, selector 0x33 with RPL)
///
/// The user data/code order matches SYSRET expectations:
/// SYSRET computes SS = STAR[63:48]+8, CS = STAR[63:48]+16.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors come from the GDT loaded on the line above, so
    // every register ends up referencing a live descriptor.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Selectors for the syscall MSRs and the synthetic thread frames. Only
/// valid after `init()`.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Point RSP0 at the kernel stack of the thread about to run. Called on
/// every context switch with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: the TSS is a boot-time static; with interrupts off nothing
    // else reads the privilege stack entry while it changes.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
