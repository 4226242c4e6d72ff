//! Timers that are used by the protocol layer and policy engine.
use core::future::Future;

/// The timer trait to implement by the user application.
pub trait Timer {
    /// Expire after the specified number of milliseconds.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;

    /// A monotonic time stamp in milliseconds, used for event logging.
    fn now_millis() -> u64;
}

/// Types of timers that are used for timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    /// Time that a CC termination has to be stable before it counts as attached.
    CcDebounce,
    /// Interval between CC line samples while nothing is attached.
    CcPoll,
    /// Time spent presenting Rd while toggling.
    DrpSnk,
    /// Time spent presenting Rp while toggling.
    DrpSrc,
    /// Time for the TCPC to report the completion of a transmission.
    TcpcTxTimeout,
    /// Time for the port partner to answer a request.
    SenderResponse,
    /// Time for a sink to wait for capabilities of a new source.
    SinkWaitCap,
    /// Interval between unacknowledged capability messages.
    SendSourceCap,
    /// Time for a source to bring VBUS to the requested level.
    PsTransition,
    /// Time for the new source to turn on, during a power role swap.
    PsSourceOn,
    /// Time for the old source to turn off, during a power role swap.
    PsSourceOff,
    /// Time between hard reset signaling and the source turning off VBUS.
    PsHardReset,
    /// Time a source waits after a hard reset, before turning VBUS back on.
    SrcRecover,
    /// Longest time a source may take to recover from a hard reset.
    SrcRecoverMax,
    /// Time for a source to turn on VBUS after recovery.
    SrcTurnOn,
    /// Time between sending Accept and changing the supply.
    SrcTransition,
    /// Time for VBUS to reach vSafe0V.
    SafeZeroV,
    /// Time for VCONN to turn on, during a VCONN swap.
    VconnSourceOn,
    /// Time for the port partner to answer a structured VDM.
    VdmSenderResponse,
    /// Time to wait before repeating a request that was answered with BUSY.
    VdmBusy,
}

impl TimerType {
    /// Duration of the timer in milliseconds.
    pub const fn millis(self) -> u64 {
        match self {
            TimerType::CcDebounce => 100,
            TimerType::CcPoll => 10,
            TimerType::DrpSnk => 40,
            TimerType::DrpSrc => 30,
            TimerType::TcpcTxTimeout => typec_tcpm::PD_T_TCPC_TX_TIMEOUT_MS,
            TimerType::SenderResponse => 30,
            TimerType::SinkWaitCap => 240,
            TimerType::SendSourceCap => 100,
            TimerType::PsTransition => 500,
            TimerType::PsSourceOn => 480,
            TimerType::PsSourceOff => 920,
            TimerType::PsHardReset => 25,
            TimerType::SrcRecover => 760,
            TimerType::SrcRecoverMax => 1000,
            TimerType::SrcTurnOn => 275,
            TimerType::SrcTransition => 25,
            TimerType::SafeZeroV => 650,
            TimerType::VconnSourceOn => 100,
            TimerType::VdmSenderResponse => 30,
            TimerType::VdmBusy => 50,
        }
    }

    /// Create a new timer for a given type.
    ///
    /// Times out after a duration that is given by the USB PD specification.
    pub fn new<TIMER: Timer>(timer_type: TimerType) -> impl Future<Output = ()> {
        TIMER::after_millis(timer_type.millis())
    }
}
