//! Divider and cycle-count search
//!
//! Each channel ticks at
//!
//! ```text
//! CYCLE_NS = 1_000_000_000 / (CLOCK_HZ / COMMON_DIV / PRESCALE_K)
//! ```
//!
//! where `COMMON_DIV` is shared by both channels of a pair and `PRESCALE_K` belongs to the
//! channel. Both dividers are powers of two in `1..=256`. The search always looks for the finest
//! tick that still lets the 16-bit counter span the whole period.

use super::{ChannelRequest, Error};
use crate::clocks::ClockSource;

/// Largest entire/active cycle count the 16-bit counter holds.
pub const MAX_CYCLES: u32 = 65535;
/// Largest common (pair) divider.
pub const MAX_COMMON_DIV: u32 = 256;
/// Largest per-channel prescaler.
pub const MAX_PRESCALE_K: u32 = 256;

const NS_PER_SEC: u32 = 1_000_000_000;

/// Divide a nanosecond value, rounding up when the quotient is small.
///
/// Quotients below 1000 are recomputed with ceiling division, and the result is never 0.
/// `div` must be nonzero.
#[must_use]
pub fn round_div(ns: u32, div: u32) -> u32 {
    let mut result = ns / div;

    if result < 1000 {
        result = ns.div_ceil(div);
    }

    result.max(1)
}

/// Whether `actual` lies within ±20% of `target`.
///
/// A target of 0 only accepts exactly 0.
#[must_use]
pub fn within_tolerance(actual: u32, target: u32) -> bool {
    if target == 0 {
        return actual == 0;
    }

    // keep actual * 100 in range
    let (mut actual, mut target) = (actual, target);
    while actual > 1000 {
        actual /= 100;
        target /= 100;
    }

    if target == 0 {
        return false;
    }

    let percent = (actual * 100) / target;
    (80..=120).contains(&percent)
}

/// Divider pair found for one channel
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dividers {
    /// Pair divider.
    pub common_div: u32,
    /// Channel prescaler.
    pub prescale_k: u32,
    /// Resulting tick length.
    pub cycle_ns: u32,
}

fn tick_ns(clock_hz: u32, common_div: u32, prescale_k: u32) -> Option<u32> {
    let tick_hz = (clock_hz / common_div) / prescale_k;

    if tick_hz == 0 {
        None
    } else {
        Some(NS_PER_SEC / tick_hz)
    }
}

/// Find the finest tick able to express `period_ns` in at most [`MAX_CYCLES`] ticks.
///
/// The prescaler is walked through every power of two before the common divider is doubled,
/// starting from `common_div_hint`, so a sibling's divider can be imposed on the search.
pub fn find_dividers(period_ns: u32, clock_hz: u32, common_div_hint: u32) -> Result<Dividers, Error> {
    if !common_div_hint.is_power_of_two() || common_div_hint > MAX_COMMON_DIV {
        return Err(Error::NoSolution);
    }

    let ideal_cycle_ns = round_div(period_ns, MAX_CYCLES);
    let mut common_div = common_div_hint;
    let mut prescale_k = 1;

    loop {
        let cycle_ns = tick_ns(clock_hz, common_div, prescale_k).ok_or(Error::NoSolution)?;
        // the truncated target can leave the period one count past the counter
        if cycle_ns >= ideal_cycle_ns && period_ns / cycle_ns <= MAX_CYCLES {
            return Ok(Dividers {
                common_div,
                prescale_k,
                cycle_ns,
            });
        }

        prescale_k *= 2;
        if prescale_k > MAX_PRESCALE_K {
            if common_div >= MAX_COMMON_DIV {
                return Err(Error::NoSolution);
            }
            prescale_k = 1;
            common_div *= 2;
        }
    }
}

/// Hardware timings resolved for one channel
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timings {
    /// Length of one counter tick.
    pub cycle_ns: u32,
    /// Achieved period.
    pub period_ns: u32,
    /// Achieved duty.
    pub duty_ns: u32,
    /// Index of the reference clock in the driver's clock list.
    pub clock_id: usize,
    /// Pair divider.
    pub common_div: u32,
    /// Channel prescaler.
    pub prescale_k: u32,
    /// Ticks per period, `1..=65535`.
    pub entire_cycles: u32,
    /// Active ticks per period.
    pub active_cycles: u32,
    /// Output is active-low.
    pub inverted: bool,
}

/// Resolve one channel's timings at `clock_hz`, starting the divider search at `common_div`.
///
/// Cycle counts are truncated, so the achieved period and duty never exceed the request.
pub(crate) fn resolve_channel(request: &ChannelRequest, clock_hz: u32, common_div: u32) -> Result<Timings, Error> {
    let dividers = find_dividers(request.period_ns, clock_hz, common_div)?;

    let entire_cycles = request.period_ns / dividers.cycle_ns;
    let active_cycles = request.duty_ns / dividers.cycle_ns;

    // a duty longer than the period can still overflow the active field
    if active_cycles > MAX_CYCLES {
        return Err(Error::NoSolution);
    }

    let timings = Timings {
        cycle_ns: dividers.cycle_ns,
        period_ns: entire_cycles * dividers.cycle_ns,
        duty_ns: active_cycles * dividers.cycle_ns,
        clock_id: 0,
        common_div: dividers.common_div,
        prescale_k: dividers.prescale_k,
        entire_cycles,
        active_cycles,
        inverted: request.inverted,
    };

    if entire_cycles == 0 || !within_tolerance(timings.period_ns, request.period_ns) {
        return Err(Error::ToleranceExceeded);
    }

    if request.duty_ns != 0 && !within_tolerance(timings.duty_ns, request.duty_ns) {
        return Err(Error::ToleranceExceeded);
    }

    Ok(timings)
}

/// Resolve both channels of a pair at `clock_hz` so that they share one common divider.
///
/// Disabled channels are not resolved and come back as `None`. Channel 0 picks its divider
/// freely; if channel 1 has to escalate past it, channel 0 is resolved again from its request
/// with channel 1's divider.
pub(crate) fn resolve_pair(requests: [&ChannelRequest; 2], clock_hz: u32) -> Result<[Option<Timings>; 2], Error> {
    let [ch0, ch1] = requests;

    let mut first = None;
    let mut common_div = 1;

    if ch0.enabled {
        let timings = resolve_channel(ch0, clock_hz, 1)?;
        common_div = timings.common_div;
        first = Some(timings);
    }

    let mut second = None;

    if ch1.enabled {
        let timings = resolve_channel(ch1, clock_hz, common_div)?;

        if let Some(prev) = first {
            if prev.common_div != timings.common_div {
                // A tick at (D, k) equals one at (d, k * D / d), so from D the search still meets
                // channel 0's first tick or a coarser one spanning its period. The retry never
                // escalates and this branch is unreachable.
                let retry = resolve_channel(ch0, clock_hz, timings.common_div)?;
                if retry.common_div != timings.common_div {
                    return Err(Error::IncompatibleDividers);
                }
                first = Some(retry);
            }
        }

        second = Some(timings);
    }

    Ok([first, second])
}

/// Timings for a pair together with the clock they were resolved against
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PairTimings {
    /// Index of the chosen reference clock.
    pub clock_id: usize,
    /// Per-channel timings, `None` for disabled channels.
    pub channels: [Option<Timings>; 2],
}

impl PairTimings {
    /// Common divider shared by the enabled channels, if any channel is enabled.
    pub fn common_div(&self) -> Option<u32> {
        self.channels.iter().flatten().map(|t| t.common_div).next()
    }
}

/// Resolve a pair against each clock in turn, returning the first clock that fits.
///
/// Clocks whose rate is 0 or cannot be read are skipped.
pub(crate) fn resolve_pair_over_clocks(
    clocks: &[&dyn ClockSource],
    requests: [&ChannelRequest; 2],
) -> Result<PairTimings, Error> {
    for (clock_id, clock) in clocks.iter().enumerate() {
        let clock_hz = match clock.rate().map(u32::from) {
            Ok(0) => {
                debug!("pwm: clock {} ({}) has no rate, skipping", clock_id, clock.name());
                continue;
            }
            Err(e) => {
                debug!("pwm: clock {} ({}) unreadable: {:?}", clock_id, clock.name(), e);
                continue;
            }
            Ok(hz) => hz,
        };

        match resolve_pair(requests, clock_hz) {
            Ok(mut channels) => {
                for timings in channels.iter_mut().flatten() {
                    timings.clock_id = clock_id;
                }
                return Ok(PairTimings { clock_id, channels });
            }
            Err(e) => {
                trace!("pwm: clock {} ({} Hz) rejected: {:?}", clock_id, clock_hz, e);
            }
        }
    }

    Err(Error::NoClockFits)
}
