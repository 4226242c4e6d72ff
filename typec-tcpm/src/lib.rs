//! Type-C port manager (TCPM) traits and port controller drivers.
//!
//! Provides a driver trait that allows the USB PD state machine to run on top of
//! various Type-C port controllers (TCPCs), plus drivers for TCPCI-compliant chips
//! and the FUSB302, and a per-port dispatch table for boards that mix both.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

mod fmt;

pub mod dispatch;
pub mod fusb302;
pub mod registers;
pub mod tcpci;
pub mod types;

use core::future::Future;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::digital::Wait;
pub use types::*;

/// Errors reported by port controller drivers.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A register transaction failed on the bus.
    #[error("register transaction failed")]
    Bus,
    /// The port controller did not leave its uninitialized state in time.
    #[error("port controller did not become ready")]
    Timeout,
    /// The port controller cannot perform the operation.
    #[error("operation not supported by this port controller")]
    Unsupported,
    /// No port controller is configured for this port.
    #[error("no port controller configured for port {0}")]
    InvalidPort(usize),
    /// A frame exceeds the maximum message size.
    #[error("frame exceeds the maximum message size")]
    FrameTooLong,
}

/// Driver trait, through which the PD stack talks to a Type-C port controller.
///
/// All configuration methods are side-effecting register writes that report
/// failures of the underlying bus transaction as [`Error::Bus`].
pub trait TcpmDriver {
    /// If this is `true`, the hardware inserts the CRC, answers received messages
    /// with GoodCRC, and retries transmissions by itself. Otherwise, frames carry
    /// their CRC as the last data word and the protocol layer does all of that.
    const HAS_AUTO_GOOD_CRC: bool = false;

    /// Bring the port controller out of reset.
    fn init(&mut self) -> impl Future<Output = Result<(), Error>>;

    /// Classify the voltage on both CC lines.
    fn get_cc(&mut self) -> impl Future<Output = Result<(CcVoltageStatus, CcVoltageStatus), Error>>;

    /// Whether VBUS is present.
    fn get_vbus_level(&mut self) -> impl Future<Output = Result<bool, Error>>;

    /// Apply the local termination to both CC lines.
    fn set_cc(&mut self, pull: CcPull) -> impl Future<Output = Result<(), Error>>;

    /// Select the CC line used for communication.
    fn set_polarity(&mut self, polarity: Polarity) -> impl Future<Output = Result<(), Error>>;

    /// Source VCONN on the unused CC line.
    fn set_vconn(&mut self, enable: bool) -> impl Future<Output = Result<(), Error>>;

    /// Roles that the hardware places into automatically generated headers.
    fn set_msg_header(&mut self, power_role: PowerRole, data_role: DataRole)
    -> impl Future<Output = Result<(), Error>>;

    /// Enable or disable reception of messages.
    fn set_rx_enable(&mut self, enable: bool) -> impl Future<Output = Result<(), Error>>;

    /// Read the last received frame. Only valid after an alert reported a received message.
    fn get_message(&mut self) -> impl Future<Output = Result<Frame, Error>>;

    /// Start a transmission. Completion is reported through an alert.
    fn transmit(&mut self, tx_type: TransmitType, header: u16, data: &[u32])
    -> impl Future<Output = Result<(), Error>>;

    /// Wait for the alert line to signal pending events.
    fn wait_for_alert(&mut self) -> impl Future<Output = ()>;

    /// Read and acknowledge pending alerts.
    ///
    /// Acknowledged events are not reported again. Callers keep them until they are handled.
    fn alert(&mut self) -> impl Future<Output = Result<AlertEvents, Error>>;

    /// Route the high-speed signals of the port.
    fn set_mux(&mut self, _state: MuxState) -> impl Future<Output = Result<(), Error>> {
        async { Ok(()) }
    }
}

/// The interrupt line of a port controller.
pub trait AlertLine {
    /// Wait until the port controller requests attention.
    fn wait(&mut self) -> impl Future<Output = ()>;
}

/// An active-low alert pin.
pub struct AlertPin<PIN>(pub PIN);

impl<PIN: Wait> AlertLine for AlertPin<PIN> {
    async fn wait(&mut self) {
        if self.0.wait_for_low().await.is_err() {
            warn!("Alert pin read failed");
        }
    }
}

/// A signal raised from an interrupt handler.
impl<M: RawMutex> AlertLine for &Signal<M, ()> {
    async fn wait(&mut self) {
        Signal::wait(*self).await
    }
}
