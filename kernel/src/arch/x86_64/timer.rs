//! Periodic timer: legacy PIC pair plus PIT channel 0
//!
//! The PICs are remapped so IRQ0 lands on vector 32 and every other line
//! stays masked; the PIT runs as a rate generator at `TIMER_HZ`.

use core::sync::atomic::{AtomicU64, Ordering};

use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::config::TIMER_HZ;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const PIT_FREQUENCY: u32 = 1_193_182;

// SAFETY: the offsets do not overlap CPU exception vectors.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    // SAFETY: standard remap sequence on the legacy ports; only the timer
    // line is left unmasked.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0b1111_1110, 0b1111_1111);
    }

    let divisor = (PIT_FREQUENCY / TIMER_HZ) as u16;
    // SAFETY: PIT channel 0 programming over its dedicated I/O ports.
    unsafe {
        let mut command: Port<u8> = Port::new(0x43);
        let mut data: Port<u8> = Port::new(0x40);
        command.write(0x36); // channel 0, lobyte/hibyte, rate generator
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }

    log::info!("timer: PIT at {} Hz on vector {}", TIMER_HZ, PIC_1_OFFSET);
}

/// Count the tick and acknowledge the controller. Runs inside the timer
/// interrupt before the scheduler is consulted.
pub fn tick_and_eoi() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    // SAFETY: called from the IRQ0 handler, which is the only consumer of
    // this vector.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET);
    }
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}
