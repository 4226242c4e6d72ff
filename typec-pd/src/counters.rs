//! Definition of counters, used for retry attempts, capability messages, hard resets and message IDs.

/// Errors that counters report.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The counter went past its maximum value, and wrapped around.
    #[error("counter exceeded its maximum value")]
    Exceeded,
}

/// A wrapping counter with a maximum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// Kinds of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// BUSY answers to a VDM request.
    Busy,
    /// Unacknowledged Source_Capabilities messages.
    Caps,
    /// Unanswered Discover Identity requests.
    DiscoverIdentity,
    /// Hard resets sent without a successful negotiation in between.
    HardReset,
    /// The 3 bit message ID.
    MessageId,
    /// Retransmissions of one message.
    Retry,
}

impl Counter {
    /// Create a counter at zero.
    pub fn new(counter_type: CounterType) -> Self {
        let max_value = match counter_type {
            CounterType::Busy => 5,
            CounterType::Caps => 50,
            CounterType::DiscoverIdentity => 20,
            CounterType::HardReset => 2,
            CounterType::MessageId => 7,
            CounterType::Retry => typec_tcpm::PD_RETRY_COUNT,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter at a given value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the value, wrapping it into the counter's range.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Count up by one. Fails when the counter wraps back to zero.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value + 1);

        if self.value == 0 {
            Err(Error::Exceeded)
        } else {
            Ok(())
        }
    }

    /// Whether the counter reached its maximum value.
    pub fn is_at_max(&self) -> bool {
        self.value == self.max_value
    }

    /// Set the value back to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}
