//! Per-port selection of port controller drivers.
//!
//! A board describes each port by the bus and address of its TCPC, plus the driver family.
//! The table then hands out a [`Tcpc`] for a port index, which forwards every
//! [`TcpmDriver`] operation to the driver of that family.
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::fusb302::Fusb302;
use crate::tcpci::Tcpci;
use crate::{
    AlertEvents, AlertLine, CcPull, CcVoltageStatus, DataRole, Error, Frame, MuxState, Polarity, PowerRole,
    TcpmDriver, TransmitType,
};

/// The driver family of a port controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DriverKind {
    /// A TCPCI compliant chip.
    Tcpci,
    /// A Fairchild/onsemi FUSB302.
    Fusb302,
}

/// Where the port controller of one port lives, and how to talk to it.
pub struct TcpcConfig<'a, M: RawMutex, BUS> {
    /// The bus shared by the port controllers.
    pub bus: &'a Mutex<M, BUS>,
    /// 7 bit device address.
    pub address: u8,
    /// Driver family.
    pub driver: DriverKind,
}

impl<M: RawMutex, BUS> Clone for TcpcConfig<'_, M, BUS> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: RawMutex, BUS> Copy for TcpcConfig<'_, M, BUS> {}

/// The port controller of one port, of either family.
pub enum Tcpc<'a, M: RawMutex, BUS, ALERT, DELAY> {
    /// A TCPCI compliant chip.
    Tcpci(Tcpci<'a, M, BUS, ALERT, DELAY>),
    /// A FUSB302.
    Fusb302(Fusb302<'a, M, BUS, ALERT, DELAY>),
}

macro_rules! forward {
    ($self:ident, $driver:ident => $call:expr) => {
        match $self {
            Tcpc::Tcpci($driver) => $call.await,
            Tcpc::Fusb302($driver) => $call.await,
        }
    };
}

impl<M: RawMutex, BUS: I2c, ALERT: AlertLine, DELAY: DelayNs> TcpmDriver for Tcpc<'_, M, BUS, ALERT, DELAY> {
    // Both families handle GoodCRC in hardware.
    const HAS_AUTO_GOOD_CRC: bool = true;

    async fn init(&mut self) -> Result<(), Error> {
        forward!(self, driver => driver.init())
    }

    async fn get_cc(&mut self) -> Result<(CcVoltageStatus, CcVoltageStatus), Error> {
        forward!(self, driver => driver.get_cc())
    }

    async fn get_vbus_level(&mut self) -> Result<bool, Error> {
        forward!(self, driver => driver.get_vbus_level())
    }

    async fn set_cc(&mut self, pull: CcPull) -> Result<(), Error> {
        forward!(self, driver => driver.set_cc(pull))
    }

    async fn set_polarity(&mut self, polarity: Polarity) -> Result<(), Error> {
        forward!(self, driver => driver.set_polarity(polarity))
    }

    async fn set_vconn(&mut self, enable: bool) -> Result<(), Error> {
        forward!(self, driver => driver.set_vconn(enable))
    }

    async fn set_msg_header(&mut self, power_role: PowerRole, data_role: DataRole) -> Result<(), Error> {
        forward!(self, driver => driver.set_msg_header(power_role, data_role))
    }

    async fn set_rx_enable(&mut self, enable: bool) -> Result<(), Error> {
        forward!(self, driver => driver.set_rx_enable(enable))
    }

    async fn get_message(&mut self) -> Result<Frame, Error> {
        forward!(self, driver => driver.get_message())
    }

    async fn transmit(&mut self, tx_type: TransmitType, header: u16, data: &[u32]) -> Result<(), Error> {
        forward!(self, driver => driver.transmit(tx_type, header, data))
    }

    async fn wait_for_alert(&mut self) {
        forward!(self, driver => driver.wait_for_alert())
    }

    async fn alert(&mut self) -> Result<AlertEvents, Error> {
        forward!(self, driver => driver.alert())
    }

    async fn set_mux(&mut self, state: MuxState) -> Result<(), Error> {
        forward!(self, driver => driver.set_mux(state))
    }
}

/// The port controllers of a board, indexed by port.
pub struct TcpcTable<'a, M: RawMutex, BUS, const N: usize> {
    configs: [TcpcConfig<'a, M, BUS>; N],
}

impl<'a, M: RawMutex, BUS: I2c, const N: usize> TcpcTable<'a, M, BUS, N> {
    /// Create a table from one entry per port.
    pub const fn new(configs: [TcpcConfig<'a, M, BUS>; N]) -> Self {
        Self { configs }
    }

    /// Number of configured ports.
    pub const fn port_count(&self) -> usize {
        N
    }

    /// The configuration of a port.
    pub fn config(&self, port: usize) -> Result<&TcpcConfig<'a, M, BUS>, Error> {
        self.configs.get(port).ok_or(Error::InvalidPort(port))
    }

    /// Create the driver of a port.
    pub fn driver<ALERT: AlertLine, DELAY: DelayNs>(
        &self,
        port: usize,
        alert_line: ALERT,
        delay: DELAY,
    ) -> Result<Tcpc<'a, M, BUS, ALERT, DELAY>, Error> {
        let config = *self.config(port)?;

        debug!(
            "Port {}: {:?} at {:#x}",
            port, config.driver, config.address
        );

        Ok(match config.driver {
            DriverKind::Tcpci => Tcpc::Tcpci(Tcpci::new(config.bus, config.address, alert_line, delay)),
            DriverKind::Fusb302 => Tcpc::Fusb302(Fusb302::new(config.bus, config.address, alert_line, delay)),
        })
    }
}
