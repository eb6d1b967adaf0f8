//! Reference clocks feeding the PWM controller

/// units per second
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Hertz(pub u32);

/// 24 MHz external crystal (`hosc`), clock source 0 of every PWM pair.
pub const HOSC_HZ: Hertz = Hertz(24_000_000);

/// Failure to query a reference clock
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ClockError {
    /// The clock has not been acquired or enabled.
    Unavailable,
    /// The clock tree reported a rate that cannot be represented.
    InvalidRate,
}

/// A reference clock selectable as a PWM pair's clock source.
pub trait ClockSource {
    /// Name used in log output, e.g. `"hosc"` or `"apb0"`.
    fn name(&self) -> &str;

    /// Current rate of the clock.
    fn rate(&self) -> Result<Hertz, ClockError>;
}

/// Clock source with a rate known up front.
#[derive(Copy, Clone, Debug)]
pub struct FixedClock {
    name: &'static str,
    rate: Hertz,
}

impl FixedClock {
    /// Create a named clock running at `rate`.
    pub const fn new(name: &'static str, rate: Hertz) -> Self {
        Self { name, rate }
    }

    /// The board crystal.
    pub const fn hosc() -> Self {
        Self::new("hosc", HOSC_HZ)
    }
}

impl ClockSource for FixedClock {
    fn name(&self) -> &str {
        self.name
    }

    fn rate(&self) -> Result<Hertz, ClockError> {
        Ok(self.rate)
    }
}

impl From<Hertz> for u32 {
    fn from(value: Hertz) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosc_is_24mhz() {
        let hosc = FixedClock::hosc();
        assert_eq!(hosc.name(), "hosc");
        assert_eq!(hosc.rate(), Ok(Hertz(24_000_000)));
        assert_eq!(u32::from(HOSC_HZ), 24_000_000);
    }
}
