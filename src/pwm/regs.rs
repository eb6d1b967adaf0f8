//! Register layout of the D1 PWM controller
//!
//! Register fields are declared with `register_bitfields!` and register values are handled as
//! [`LocalRegisterCopy`]s, so a read-modify-write through [`modify`] only touches the fields it
//! names and leaves the rest of a shared register alone.

use tock_registers::fields::{Field, FieldValue};
use tock_registers::LocalRegisterCopy;
use tock_registers::RegisterLongName;

use super::timing::Timings;

/// 32-bit register access at byte offsets from the controller base.
pub trait RegisterAccess {
    /// Read the register at `offset`.
    fn read(&mut self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`.
    fn write(&mut self, offset: usize, value: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &mut T {
    fn read(&mut self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    fn write(&mut self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

#[inline(always)]
#[allow(unused_unsafe)]
fn barrier() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            cortex_m::asm::dmb();
        } else if #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))] {
            // `fence iorw, iorw`: orders device accesses as well as memory
            // SAFETY: a fence has no side effects besides ordering
            unsafe { riscv::asm::fence() };
        } else {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}

/// Memory-mapped controller
pub struct Mmio {
    base: *mut u32,
}

impl Mmio {
    /// Access the controller mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the address of the PWM register block, and nothing else may access the
    /// block while this value is alive.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base: base as *mut u32 }
    }
}

impl RegisterAccess for Mmio {
    fn read(&mut self, offset: usize) -> u32 {
        // SAFETY: offset stays inside the register block handed to `Mmio::new`
        let value = unsafe { core::ptr::read_volatile(self.base.byte_add(offset)) };
        barrier();
        value
    }

    fn write(&mut self, offset: usize, value: u32) {
        barrier();
        // SAFETY: offset stays inside the register block handed to `Mmio::new`
        unsafe { core::ptr::write_volatile(self.base.byte_add(offset), value) }
    }
}

/// Field definitions of the controller registers
#[allow(missing_docs)]
pub mod bitfields {
    use tock_registers::register_bitfields;

    register_bitfields![u32,
        /// Pair clock configuration, one per pair
        pub PCCR [
            /// Common divider exponent, the divider is `1 << DIV_M`
            DIV_M OFFSET(0) NUMBITS(4) [],
            /// Reference clock select
            CLK_SRC OFFSET(7) NUMBITS(2) []
        ],
        /// Clock gating, bit N passes the pair clock to channel N
        pub PCGR [
            CLK_GATE OFFSET(0) NUMBITS(16) [],
            CLK_BYPASS OFFSET(16) NUMBITS(16) []
        ],
        /// Channel enable, bit N enables channel N
        pub PER [
            PWM_EN OFFSET(0) NUMBITS(16) []
        ],
        /// Channel control
        pub PCR [
            /// Prescaler minus one
            PRESCAL_K OFFSET(0) NUMBITS(8) [],
            /// Set when the active state is high
            PWM_ACT_STA OFFSET(8) NUMBITS(1) []
        ],
        /// Channel period
        pub PPR [
            /// Active cycle count
            PWM_ACT_CYCLE OFFSET(0) NUMBITS(16) [],
            /// Entire cycle count minus one
            PWM_ENTIRE_CYCLE OFFSET(16) NUMBITS(16) []
        ]
    ];
}

pub use bitfields::{PCCR, PCGR, PCR, PER, PPR};

/// Pair clock configuration value
pub type Pccr = LocalRegisterCopy<u32, PCCR::Register>;
/// Clock gating value
pub type Pcgr = LocalRegisterCopy<u32, PCGR::Register>;
/// Channel enable value
pub type Per = LocalRegisterCopy<u32, PER::Register>;
/// Channel control value
pub type Pcr = LocalRegisterCopy<u32, PCR::Register>;
/// Channel period value
pub type Ppr = LocalRegisterCopy<u32, PPR::Register>;

/// Offset of PCGR.
pub const PCGR_OFFSET: usize = 0x40;
/// Offset of PER.
pub const PER_OFFSET: usize = 0x80;

/// Offset of the PCCR of `pair`.
pub const fn pccr_offset(pair: usize) -> usize {
    0x20 + pair * 4
}

/// Offset of the PCR of `channel`.
pub const fn pcr_offset(channel: usize) -> usize {
    0x100 + channel * 0x20
}

/// Offset of the PPR of `channel`.
pub const fn ppr_offset(channel: usize) -> usize {
    0x104 + channel * 0x20
}

/// Single-bit field for `channel` in a per-channel register (PCGR, PER).
pub fn channel_bit<R: RegisterLongName>(channel: usize) -> Field<u32, R> {
    Field::new(1, channel)
}

/// Read the register at `offset`, apply `fields` and write it back. Returns the written value.
pub fn modify<R: RegisterLongName>(
    regs: &mut impl RegisterAccess,
    offset: usize,
    fields: FieldValue<u32, R>,
) -> LocalRegisterCopy<u32, R> {
    let mut value = LocalRegisterCopy::new(regs.read(offset));
    value.modify(fields);
    regs.write(offset, value.get());
    value
}

/// Disable both channels of `pair` and gate their clock.
pub fn disable_pair(regs: &mut impl RegisterAccess, pair: usize) {
    let (ch0, ch1) = (pair * 2, pair * 2 + 1);

    let per: Per = modify(
        regs,
        PER_OFFSET,
        channel_bit(ch0).val(0) + channel_bit(ch1).val(0),
    );
    let pcgr: Pcgr = modify(
        regs,
        PCGR_OFFSET,
        channel_bit(ch0).val(0) + channel_bit(ch1).val(0),
    );

    debug!("pwm pair {}: disabled, PCGR {:#x}, PER {:#x}", pair, pcgr.get(), per.get());
}

/// Ungate the clock of `pair` and select its clock source and common divider.
///
/// `common_div` must be a power of two.
pub fn enable_pair(regs: &mut impl RegisterAccess, pair: usize, clock_id: usize, common_div: u32) {
    let (ch0, ch1) = (pair * 2, pair * 2 + 1);
    let div_m = common_div.trailing_zeros();

    let _: Pcgr = modify(
        regs,
        PCGR_OFFSET,
        channel_bit(ch0).val(1) + channel_bit(ch1).val(1),
    );
    let pccr = modify(
        regs,
        pccr_offset(pair),
        PCCR::CLK_SRC.val(clock_id as u32) + PCCR::DIV_M.val(div_m),
    );

    debug!(
        "pwm pair {}: clk_src {}, div_m {}, PCCR {:#x}",
        pair,
        clock_id,
        div_m,
        pccr.get()
    );
}

/// Program the prescaler, cycle counts and polarity of `channel`, then enable it.
pub fn enable_channel(regs: &mut impl RegisterAccess, channel: usize, timings: &Timings) {
    let pcr = modify(
        regs,
        pcr_offset(channel),
        PCR::PRESCAL_K.val(timings.prescale_k - 1) + PCR::PWM_ACT_STA.val(u32::from(!timings.inverted)),
    );
    let ppr = modify(
        regs,
        ppr_offset(channel),
        PPR::PWM_ENTIRE_CYCLE.val(timings.entire_cycles - 1) + PPR::PWM_ACT_CYCLE.val(timings.active_cycles),
    );
    let per: Per = modify(regs, PER_OFFSET, channel_bit(channel).val(1));

    debug!(
        "pwm channel {}: clock_id {}, period_ns {}, duty_ns {}, common_div {}, prescale_k {}, entire_cycles {}, active_cycles {}, inverted {}, PCR {:#x}, PPR {:#x}, PER {:#x}",
        channel,
        timings.clock_id,
        timings.period_ns,
        timings.duty_ns,
        timings.common_div,
        timings.prescale_k,
        timings.entire_cycles,
        timings.active_cycles,
        timings.inverted,
        pcr.get(),
        ppr.get(),
        per.get()
    );
}
