//! Paired-channel PWM driver for the Allwinner D1 PWM controller
// =====
// The D1's PWM channels are 16-bit counters grouped in pairs. Each channel is programmed with
//  - an entire cycle count (the period)
//  - an active cycle count (the duty cycle)
//  - an active state polarity
//
// Counts are stored zero based for the entire cycle and as-is for the active cycle. The counter
// wraps when it reaches the entire cycle count, and the output is active while
//
//   PCNTR > ENTIRE_CYCLE - ACT_CYCLE
//
// Both channels of a pair run off the same reference clock and common divider, only the
// prescaler is per channel:
//
//   CYCLE_NS = 1_000_000_000 / (CLOCK_HZ / COMMON_DIV / PRESCALE_K)
//
// so any change to one channel re-resolves its sibling as well. A pair is always disabled
// before it is reprogrammed and is left disabled if no timing fits.

mod error;
pub mod regs;
pub mod timing;

pub use error::Error;
pub use regs::{Mmio, RegisterAccess};
pub use timing::Timings;

use crate::clocks::ClockSource;

/// Largest channel count the controller registers can address.
pub const MAX_CHANNELS: usize = 16;

/// Number of selectable reference clocks per pair.
pub const MAX_CLOCK_SOURCES: usize = 4;

/// Requested output of one channel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelRequest {
    /// Requested period.
    pub period_ns: u32,
    /// Requested active time per period.
    pub duty_ns: u32,
    /// Output is active-low.
    pub inverted: bool,
    /// Channel output is enabled.
    pub enabled: bool,
    pub(crate) dirty: bool,
}

impl ChannelRequest {
    const fn new() -> Self {
        Self {
            period_ns: 0,
            duty_ns: 0,
            inverted: false,
            enabled: false,
            dirty: true,
        }
    }

    /// Whether the request changed since the hardware was last programmed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// PWM driver configuration
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Number of channels wired up, even and at most [`MAX_CHANNELS`].
    pub channels: usize,
}

impl Config {
    /// Configuration for a controller with `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { channels: 8 }
    }
}

/// PWM controller driver
pub struct Pwm<'d, R: RegisterAccess> {
    regs: R,
    clocks: &'d [&'d dyn ClockSource],
    channels: [ChannelRequest; MAX_CHANNELS],
    count: usize,
}

impl<'d, R: RegisterAccess> Pwm<'d, R> {
    /// Take over the controller behind `regs`, clocked by `clocks` in order of preference.
    ///
    /// Every pair is disabled and brought to a known state before returning.
    pub fn new(regs: R, clocks: &'d [&'d dyn ClockSource], config: Config) -> Result<Self, Error> {
        if config.channels == 0 || config.channels % 2 != 0 || config.channels > MAX_CHANNELS {
            error!("pwm: unsupported channel count {}", config.channels);
            return Err(Error::InvalidConfig);
        }

        if clocks.len() > MAX_CLOCK_SOURCES {
            error!("pwm: {} clock sources, at most {} selectable", clocks.len(), MAX_CLOCK_SOURCES);
            return Err(Error::InvalidConfig);
        }

        let mut pwm = Self {
            regs,
            clocks,
            channels: [ChannelRequest::new(); MAX_CHANNELS],
            count: config.channels,
        };
        pwm.update_all()?;

        Ok(pwm)
    }

    /// Number of configured channels.
    pub fn channel_count(&self) -> usize {
        self.count
    }

    /// Current request of `channel`.
    pub fn request(&self, channel: usize) -> Result<&ChannelRequest, Error> {
        self.channels[..self.count].get(channel).ok_or(Error::InvalidChannel)
    }

    fn request_mut(&mut self, channel: usize) -> Result<&mut ChannelRequest, Error> {
        self.channels[..self.count]
            .get_mut(channel)
            .ok_or(Error::InvalidChannel)
    }

    /// Set whether `channel` is active-low.
    pub fn set_polarity(&mut self, channel: usize, inverted: bool) -> Result<(), Error> {
        let request = self.request_mut(channel)?;
        request.dirty |= request.inverted != inverted;
        request.inverted = inverted;

        self.update_pair(channel / 2)
    }

    /// Set the period and duty of `channel`.
    pub fn set_config(&mut self, channel: usize, period_ns: u32, duty_ns: u32) -> Result<(), Error> {
        let request = self.request_mut(channel)?;
        request.dirty |= request.period_ns != period_ns || request.duty_ns != duty_ns;
        request.period_ns = period_ns;
        request.duty_ns = duty_ns;

        self.update_pair(channel / 2)
    }

    /// Enable or disable the output of `channel`.
    pub fn set_enable(&mut self, channel: usize, enabled: bool) -> Result<(), Error> {
        let request = self.request_mut(channel)?;
        request.dirty |= request.enabled != enabled;
        request.enabled = enabled;

        self.update_pair(channel / 2)
    }

    /// Bring every pair in line with its requests, stopping at the first pair that fails.
    pub fn update_all(&mut self) -> Result<(), Error> {
        for pair in 0..self.count / 2 {
            self.update_pair(pair)?;
        }

        Ok(())
    }

    /// Reprogram `pair` if either of its channels changed.
    fn update_pair(&mut self, pair: usize) -> Result<(), Error> {
        let (first, second) = (pair * 2, pair * 2 + 1);
        let ch0 = self.channels[first];
        let ch1 = self.channels[second];

        if !ch0.dirty && !ch1.dirty {
            trace!("pwm pair {}: clean", pair);
            return Ok(());
        }

        regs::disable_pair(&mut self.regs, pair);

        let timings = timing::resolve_pair_over_clocks(self.clocks, [&ch0, &ch1]).map_err(|e| {
            warn!("pwm pair {}: no timing fits, left disabled: {:?}", pair, e);
            e
        })?;

        if let Some(common_div) = timings.common_div() {
            regs::enable_pair(&mut self.regs, pair, timings.clock_id, common_div);
        }

        for (channel, t) in [first, second].into_iter().zip(timings.channels.iter()) {
            if let Some(t) = t {
                regs::enable_channel(&mut self.regs, channel, t);
            }
        }

        self.channels[first].dirty = false;
        self.channels[second].dirty = false;

        Ok(())
    }

    /// Borrow `channel` as an [`embedded_hal_1::pwm::SetDutyCycle`] output.
    pub fn channel(&mut self, channel: usize) -> Result<PwmChannel<'_, 'd, R>, Error> {
        self.request(channel)?;

        Ok(PwmChannel { pwm: self, channel })
    }

    /// Give back the register access.
    pub fn release(self) -> R {
        self.regs
    }
}

/// Single channel of a [`Pwm`]
pub struct PwmChannel<'a, 'd, R: RegisterAccess> {
    pwm: &'a mut Pwm<'d, R>,
    channel: usize,
}

impl<R: RegisterAccess> PwmChannel<'_, '_, R> {
    /// Set the period, keeping the current duty time.
    pub fn set_period(&mut self, period_ns: u32) -> Result<(), Error> {
        let duty_ns = self.pwm.channels[self.channel].duty_ns;
        self.pwm.set_config(self.channel, period_ns, duty_ns)
    }

    /// Enable the output.
    pub fn enable(&mut self) -> Result<(), Error> {
        self.pwm.set_enable(self.channel, true)
    }

    /// Disable the output.
    pub fn disable(&mut self) -> Result<(), Error> {
        self.pwm.set_enable(self.channel, false)
    }
}

impl<R: RegisterAccess> embedded_hal_1::pwm::ErrorType for PwmChannel<'_, '_, R> {
    type Error = Error;
}

impl<R: RegisterAccess> embedded_hal_1::pwm::SetDutyCycle for PwmChannel<'_, '_, R> {
    fn max_duty_cycle(&self) -> u16 {
        u16::MAX
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Self::Error> {
        let period_ns = self.pwm.channels[self.channel].period_ns;
        let duty_ns = (u64::from(period_ns) * u64::from(duty) / u64::from(u16::MAX)) as u32;

        self.pwm.set_config(self.channel, period_ns, duty_ns)
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal_1::pwm::SetDutyCycle;

    use super::regs::mock::MockRegisters;
    use super::regs::{
        channel_bit, pccr_offset, pcr_offset, ppr_offset, Pccr, Pcgr, Pcr, Per, Ppr, PCCR, PCGR_OFFSET, PCR,
        PER_OFFSET, PPR,
    };
    use super::*;
    use crate::clocks::{FixedClock, Hertz};

    fn enabled(pwm: &Pwm<'_, MockRegisters>, channel: usize) -> bool {
        Per::new(pwm.regs.get(PER_OFFSET)).is_set(channel_bit(channel))
    }

    fn gated(pwm: &Pwm<'_, MockRegisters>, channel: usize) -> bool {
        Pcgr::new(pwm.regs.get(PCGR_OFFSET)).is_set(channel_bit(channel))
    }

    fn pccr(pwm: &Pwm<'_, MockRegisters>, pair: usize) -> Pccr {
        Pccr::new(pwm.regs.get(pccr_offset(pair)))
    }

    fn pcr(pwm: &Pwm<'_, MockRegisters>, channel: usize) -> Pcr {
        Pcr::new(pwm.regs.get(pcr_offset(channel)))
    }

    fn ppr(pwm: &Pwm<'_, MockRegisters>, channel: usize) -> Ppr {
        Ppr::new(pwm.regs.get(ppr_offset(channel)))
    }

    #[test]
    fn new_leaves_every_pair_disabled() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut regs = MockRegisters::new();
        regs.set(PER_OFFSET, 0xff);
        regs.set(PCGR_OFFSET, 0xff);

        let pwm = Pwm::new(regs, &clocks, Config::default()).unwrap();

        assert_eq!(pwm.channel_count(), 8);
        assert_eq!(pwm.regs.get(PER_OFFSET), 0);
        assert_eq!(pwm.regs.get(PCGR_OFFSET), 0);
        for channel in 0..8 {
            assert!(!pwm.request(channel).unwrap().is_dirty());
        }
    }

    #[test]
    fn new_rejects_bad_config() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];

        for channels in [0, 3, 18] {
            assert!(matches!(
                Pwm::new(MockRegisters::new(), &clocks, Config::new(channels)),
                Err(Error::InvalidConfig)
            ));
        }

        let source: &dyn ClockSource = &hosc;
        let many = [source; 5];
        assert!(matches!(
            Pwm::new(MockRegisters::new(), &many, Config::default()),
            Err(Error::InvalidConfig)
        ));
    }

    #[test]
    fn new_fails_without_usable_clock() {
        let dead = FixedClock::new("dead", Hertz(0));
        let clocks: [&dyn ClockSource; 1] = [&dead];

        assert!(matches!(
            Pwm::new(MockRegisters::new(), &clocks, Config::default()),
            Err(Error::NoClockFits)
        ));
    }

    #[test]
    fn servo_output() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        assert!(!enabled(&pwm, 0));

        pwm.set_enable(0, true).unwrap();

        assert!(enabled(&pwm, 0));
        assert!(!enabled(&pwm, 1));
        assert!(gated(&pwm, 0) && gated(&pwm, 1));
        assert_eq!(pccr(&pwm, 0).read(PCCR::CLK_SRC), 0);
        assert_eq!(pccr(&pwm, 0).read(PCCR::DIV_M), 0);
        assert_eq!(pcr(&pwm, 0).read(PCR::PRESCAL_K), 7);
        assert!(pcr(&pwm, 0).is_set(PCR::PWM_ACT_STA));
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ENTIRE_CYCLE), 60_059);
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ACT_CYCLE), 4_504);
        assert!(!pwm.request(0).unwrap().is_dirty());
    }

    #[test]
    fn both_channels_share_divider() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 1_000_000, 500_000).unwrap();
        pwm.set_config(1, 1_000_000, 250_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        pwm.set_enable(1, true).unwrap();

        assert!(enabled(&pwm, 0) && enabled(&pwm, 1));
        assert_eq!(pccr(&pwm, 0).read(PCCR::DIV_M), 0);
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ENTIRE_CYCLE), 24_389);
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ACT_CYCLE), 12_195);
        assert_eq!(ppr(&pwm, 1).read(PPR::PWM_ACT_CYCLE), 6_097);
    }

    #[test]
    fn slow_sibling_raises_pair_divider() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 1_000_000, 500_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        assert_eq!(pccr(&pwm, 0).read(PCCR::DIV_M), 0);

        pwm.set_config(1, 1_000_000_000, 500_000_000).unwrap();
        pwm.set_enable(1, true).unwrap();

        assert_eq!(pccr(&pwm, 0).read(PCCR::DIV_M), 1);
        assert_eq!(pcr(&pwm, 0).read(PCR::PRESCAL_K), 0);
        assert_eq!(pcr(&pwm, 1).read(PCR::PRESCAL_K), 255);
        assert!(enabled(&pwm, 0) && enabled(&pwm, 1));
    }

    #[test]
    fn second_channel_alone_sets_pair_divider() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(1, 1_000_000_000, 500_000_000).unwrap();
        pwm.set_enable(1, true).unwrap();

        assert_eq!(pccr(&pwm, 0).read(PCCR::DIV_M), 1);
        assert!(!enabled(&pwm, 0));
        assert!(enabled(&pwm, 1));
    }

    #[test]
    fn unreachable_period_leaves_pair_disabled() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        assert!(enabled(&pwm, 0));

        assert_eq!(pwm.set_config(0, 10, 5), Err(Error::NoClockFits));

        assert!(!enabled(&pwm, 0));
        assert!(!gated(&pwm, 0) && !gated(&pwm, 1));
        let request = pwm.request(0).unwrap();
        assert_eq!(request.period_ns, 10);
        assert!(request.is_dirty());

        // corrected parameters recover the pair
        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        assert!(enabled(&pwm, 0));
        assert!(!pwm.request(0).unwrap().is_dirty());
    }

    #[test]
    fn unchanged_request_does_not_touch_hardware() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        let writes = pwm.regs.log.len();

        pwm.set_enable(0, true).unwrap();
        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_polarity(0, false).unwrap();
        pwm.set_enable(1, false).unwrap();

        assert_eq!(pwm.regs.log.len(), writes);
    }

    #[test]
    fn reprogramming_disables_before_writing_timings() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        pwm.regs.log.clear();

        pwm.set_config(0, 10_000_000, 1_000_000).unwrap();

        let log = &pwm.regs.log;
        let position = |offset: usize, bit0: bool| {
            log.iter()
                .position(|&(o, v)| o == offset && (v & 1 != 0) == bit0)
                .unwrap()
        };

        let per_clear = position(PER_OFFSET, false);
        let gate_clear = position(PCGR_OFFSET, false);
        let ppr_write = log.iter().position(|&(o, _)| o == ppr_offset(0)).unwrap();
        let pccr_write = log.iter().position(|&(o, _)| o == pccr_offset(0)).unwrap();

        assert!(per_clear < ppr_write);
        assert!(gate_clear < pccr_write);
        assert!(pccr_write < ppr_write);
        assert_eq!(log.last(), Some(&(PER_OFFSET, 1)));
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ENTIRE_CYCLE), 60_239);
    }

    #[test]
    fn polarity_change_reprograms_channel() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        pwm.set_polarity(0, true).unwrap();

        assert!(!pcr(&pwm, 0).is_set(PCR::PWM_ACT_STA));
        assert!(enabled(&pwm, 0));
    }

    #[test]
    fn pairs_are_independent() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_enable(0, true).unwrap();
        pwm.set_config(2, 1_000_000_000, 500_000_000).unwrap();
        pwm.set_enable(2, true).unwrap();

        assert!(enabled(&pwm, 0) && enabled(&pwm, 2));
        assert_eq!(pccr(&pwm, 0).read(PCCR::DIV_M), 0);
        assert_eq!(pccr(&pwm, 1).read(PCCR::DIV_M), 1);

        assert_eq!(pwm.set_config(2, 10, 5), Err(Error::NoClockFits));
        assert!(enabled(&pwm, 0));
        assert!(!enabled(&pwm, 2));
    }

    #[test]
    fn invalid_channel() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::new(4)).unwrap();

        assert_eq!(pwm.set_enable(4, true), Err(Error::InvalidChannel));
        assert_eq!(pwm.set_config(15, 1, 1), Err(Error::InvalidChannel));
        assert_eq!(pwm.set_polarity(usize::MAX, true), Err(Error::InvalidChannel));
        assert!(matches!(pwm.request(4), Err(Error::InvalidChannel)));
        assert!(pwm.channel(4).is_err());
    }

    #[test]
    fn falls_back_to_second_clock() {
        let dead = FixedClock::new("dead", Hertz(0));
        let apb0 = FixedClock::new("apb0", Hertz(100_000_000));
        let clocks: [&dyn ClockSource; 2] = [&dead, &apb0];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        pwm.set_config(0, 20_000_000, 1_500_000).unwrap();
        pwm.set_enable(0, true).unwrap();

        assert_eq!(pccr(&pwm, 0).read(PCCR::CLK_SRC), 1);
    }

    #[test]
    fn duty_cycle_through_embedded_hal() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let mut pwm = Pwm::new(MockRegisters::new(), &clocks, Config::default()).unwrap();

        {
            let mut channel = pwm.channel(0).unwrap();
            channel.set_period(20_000_000).unwrap();
            channel.enable().unwrap();
            channel.set_duty_cycle_fully_on().unwrap();
        }
        assert_eq!(pwm.request(0).unwrap().duty_ns, 20_000_000);
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ACT_CYCLE), 60_060);

        pwm.channel(0).unwrap().set_duty_cycle_fully_off().unwrap();
        assert_eq!(pwm.request(0).unwrap().duty_ns, 0);
        assert_eq!(ppr(&pwm, 0).read(PPR::PWM_ACT_CYCLE), 0);

        pwm.channel(0).unwrap().disable().unwrap();
        assert!(!enabled(&pwm, 0));
    }

    #[test]
    fn release_returns_registers() {
        let hosc = FixedClock::hosc();
        let clocks: [&dyn ClockSource; 1] = [&hosc];
        let pwm = Pwm::new(MockRegisters::new(), &clocks, Config::new(2)).unwrap();

        let regs = pwm.release();
        assert_eq!(regs.get(PER_OFFSET), 0);
        assert!(!regs.log.is_empty());
    }
}
