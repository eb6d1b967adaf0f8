/// PWM driver error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Divider search ran past the largest common divider.
    NoSolution,
    /// Achieved period or duty is outside the ±20% band around the request.
    ToleranceExceeded,
    /// The two channels of a pair cannot agree on a common divider.
    IncompatibleDividers,
    /// No reference clock can satisfy the pair.
    NoClockFits,
    /// Channel index outside the configured range.
    InvalidChannel,
    /// Rejected driver configuration.
    InvalidConfig,
}

impl embedded_hal_1::pwm::Error for Error {
    fn kind(&self) -> embedded_hal_1::pwm::ErrorKind {
        match *self {
            Self::NoSolution
            | Self::ToleranceExceeded
            | Self::IncompatibleDividers
            | Self::NoClockFits
            | Self::InvalidChannel
            | Self::InvalidConfig => embedded_hal_1::pwm::ErrorKind::Other,
        }
    }
}
