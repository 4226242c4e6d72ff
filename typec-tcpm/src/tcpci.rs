//! Driver for port controllers that implement the standard TCPCI register interface.
use byteorder::{ByteOrder, LittleEndian};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use proc_bitfield::bitfield;

use crate::registers::RegisterBus;
use crate::{
    AlertEvents, AlertLine, CcPull, CcVoltageStatus, DataRole, Error, Frame, MAX_DATA_OBJECTS, MuxState, Polarity,
    PowerRole, TcpmDriver, TransmitType, TxStatus,
};

const REG_ALERT: u8 = 0x10;
const REG_ALERT_MASK: u8 = 0x12;
const REG_POWER_STATUS_MASK: u8 = 0x14;
const REG_CONFIG_STD_OUTPUT: u8 = 0x18;
const REG_TCPC_CTRL: u8 = 0x19;
const REG_ROLE_CTRL: u8 = 0x1a;
const REG_POWER_CTRL: u8 = 0x1c;
const REG_CC_STATUS: u8 = 0x1d;
const REG_POWER_STATUS: u8 = 0x1e;
const REG_MSG_HDR_INFO: u8 = 0x2e;
const REG_RX_DETECT: u8 = 0x2f;
const REG_RX_BYTE_CNT: u8 = 0x30;
const REG_RX_HDR: u8 = 0x32;
const REG_RX_DATA: u8 = 0x34;
const REG_TRANSMIT: u8 = 0x50;
const REG_TX_BYTE_CNT: u8 = 0x51;
const REG_TX_HDR: u8 = 0x52;
const REG_TX_DATA: u8 = 0x54;

const CONFIG_STD_OUTPUT_MUX_MASK: u8 = 3 << 2;
const CONFIG_STD_OUTPUT_MUX_USB: u8 = 1 << 2;
const CONFIG_STD_OUTPUT_MUX_DP: u8 = 2 << 2;
const CONFIG_STD_OUTPUT_CONNECTOR_FLIPPED: u8 = 1 << 0;

const POWER_STATUS_UNINIT: u8 = 1 << 6;
const POWER_STATUS_VBUS_PRES: u8 = 1 << 2;
/// A TCPC that went through a reset reports all power status bits unmasked.
const POWER_STATUS_MASK_RESET: u8 = 0xff;

const POWER_CTRL_VCONN: u8 = 1 << 0;
const RX_DETECT_SOP_HRST: u8 = 0x21;
const MSG_HDR_INFO_REV20: u8 = 1;

/// Number of polls while waiting for the TCPC to leave its uninitialized state.
const INIT_TRIES: u8 = 30;
const INIT_RETRY_DELAY_MS: u32 = 10;

bitfield! {
    /// The TCPCI alert register, also used as the alert mask.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    struct Alert(pub u16): Debug, FromStorage, IntoStorage {
        pub cc_status: bool @ 0,
        pub power_status: bool @ 1,
        pub rx_status: bool @ 2,
        pub rx_hard_reset: bool @ 3,
        pub tx_failed: bool @ 4,
        pub tx_discarded: bool @ 5,
        pub tx_success: bool @ 6,
    }
}

impl Alert {
    fn tx_complete(&self) -> bool {
        self.tx_failed() || self.tx_discarded() || self.tx_success()
    }
}

bitfield! {
    /// The ROLE_CTRL register.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    struct RoleControl(pub u8): Debug, FromStorage, IntoStorage {
        pub cc2: u8 @ 2..=3,
        pub cc1: u8 @ 0..=1,
    }
}

bitfield! {
    /// The CC_STATUS register.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    struct CcStatus(pub u8): Debug, FromStorage, IntoStorage {
        /// Set when presenting Rd.
        pub termination: bool @ 4,
        pub cc2: u8 @ 2..=3,
        pub cc1: u8 @ 0..=1,
    }
}

impl CcStatus {
    fn classify(&self, raw: u8) -> CcVoltageStatus {
        if raw == 0 {
            CcVoltageStatus::Open
        } else {
            CcVoltageStatus::from_raw(raw | (u8::from(self.termination()) << 2))
        }
    }
}

/// A TCPCI compliant port controller.
pub struct Tcpci<'a, M: RawMutex, BUS, ALERT, DELAY> {
    registers: RegisterBus<'a, M, BUS>,
    alert_line: ALERT,
    delay: DELAY,
    vbus_present: bool,
}

impl<'a, M: RawMutex, BUS: I2c, ALERT: AlertLine, DELAY: DelayNs> Tcpci<'a, M, BUS, ALERT, DELAY> {
    /// Create a driver for the TCPC at `address` on a shared bus.
    pub fn new(bus: &'a Mutex<M, BUS>, address: u8, alert_line: ALERT, delay: DELAY) -> Self {
        Self {
            registers: RegisterBus::new(bus, address),
            alert_line,
            delay,
            vbus_present: false,
        }
    }

    async fn update_vbus(&mut self) -> Result<bool, Error> {
        let status = self.registers.read8(REG_POWER_STATUS).await?;
        self.vbus_present = status & POWER_STATUS_VBUS_PRES != 0;
        Ok(self.vbus_present)
    }
}

impl<M: RawMutex, BUS: I2c, ALERT: AlertLine, DELAY: DelayNs> TcpmDriver for Tcpci<'_, M, BUS, ALERT, DELAY> {
    const HAS_AUTO_GOOD_CRC: bool = true;

    async fn init(&mut self) -> Result<(), Error> {
        let mut tries = INIT_TRIES;

        loop {
            match self.registers.read8(REG_POWER_STATUS).await {
                Ok(status) if status & POWER_STATUS_UNINIT == 0 => break,
                Ok(_) | Err(_) => {
                    tries -= 1;
                    if tries == 0 {
                        error!("TCPC at {:#x} not ready", self.registers.address());
                        return Err(Error::Timeout);
                    }
                    self.delay.delay_ms(INIT_RETRY_DELAY_MS).await;
                }
            }
        }

        self.registers.write16(REG_ALERT, 0xffff).await?;
        self.registers
            .write8(REG_POWER_STATUS_MASK, POWER_STATUS_VBUS_PRES)
            .await?;
        self.update_vbus().await?;

        let mask = Alert::default()
            .with_tx_success(true)
            .with_tx_failed(true)
            .with_tx_discarded(true)
            .with_rx_status(true)
            .with_rx_hard_reset(true)
            .with_cc_status(true)
            .with_power_status(true);
        self.registers.write16(REG_ALERT_MASK, mask.0).await?;

        debug!("TCPC at {:#x} initialized", self.registers.address());
        Ok(())
    }

    async fn get_cc(&mut self) -> Result<(CcVoltageStatus, CcVoltageStatus), Error> {
        let status = CcStatus(self.registers.read8(REG_CC_STATUS).await?);
        Ok((status.classify(status.cc1()), status.classify(status.cc2())))
    }

    async fn get_vbus_level(&mut self) -> Result<bool, Error> {
        Ok(self.vbus_present)
    }

    async fn set_cc(&mut self, pull: CcPull) -> Result<(), Error> {
        let role = RoleControl::default().with_cc1(pull as u8).with_cc2(pull as u8);
        self.registers.write8(REG_ROLE_CTRL, role.0).await
    }

    async fn set_polarity(&mut self, polarity: Polarity) -> Result<(), Error> {
        self.registers
            .write8(REG_TCPC_CTRL, u8::from(polarity == Polarity::Cc2))
            .await
    }

    async fn set_vconn(&mut self, enable: bool) -> Result<(), Error> {
        self.registers
            .update8(REG_POWER_CTRL, |reg| match enable {
                true => reg | POWER_CTRL_VCONN,
                false => reg & !POWER_CTRL_VCONN,
            })
            .await
    }

    async fn set_msg_header(&mut self, power_role: PowerRole, data_role: DataRole) -> Result<(), Error> {
        let value = (u8::from(bool::from(data_role)) << 3) | (MSG_HDR_INFO_REV20 << 1) | u8::from(bool::from(power_role));
        self.registers.write8(REG_MSG_HDR_INFO, value).await
    }

    async fn set_rx_enable(&mut self, enable: bool) -> Result<(), Error> {
        let value = if enable { RX_DETECT_SOP_HRST } else { 0 };
        self.registers.write8(REG_RX_DETECT, value).await
    }

    async fn get_message(&mut self) -> Result<Frame, Error> {
        let count = usize::from(self.registers.read8(REG_RX_BYTE_CNT).await?).min(4 * MAX_DATA_OBJECTS);
        let header = self.registers.read16(REG_RX_HDR).await?;

        let mut buffer = [0u8; 4 * MAX_DATA_OBJECTS];
        let payload = &mut buffer[..count - count % 4];
        if !payload.is_empty() {
            self.registers.read_block(REG_RX_DATA, payload).await?;
        }

        let mut frame = Frame {
            header,
            ..Default::default()
        };
        for word in payload.chunks_exact(4) {
            frame.data.push(LittleEndian::read_u32(word)).map_err(|_| Error::FrameTooLong)?;
        }

        // Releases the receive buffer.
        self.registers
            .write16(REG_ALERT, Alert::default().with_rx_status(true).0)
            .await?;

        Ok(frame)
    }

    async fn transmit(&mut self, tx_type: TransmitType, header: u16, data: &[u32]) -> Result<(), Error> {
        if data.len() > MAX_DATA_OBJECTS {
            return Err(Error::FrameTooLong);
        }

        if !matches!(tx_type, TransmitType::HardReset | TransmitType::CableReset | TransmitType::BistMode2) {
            let mut buffer = [0u8; 4 * MAX_DATA_OBJECTS];
            for (chunk, word) in buffer.chunks_exact_mut(4).zip(data) {
                LittleEndian::write_u32(chunk, *word);
            }

            self.registers
                .write8(REG_TX_BYTE_CNT, (4 * data.len() + 2) as u8)
                .await?;
            self.registers.write16(REG_TX_HDR, header).await?;
            if !data.is_empty() {
                self.registers
                    .write_block(REG_TX_DATA, &buffer[..4 * data.len()])
                    .await?;
            }
        }

        let retries = crate::PD_RETRY_COUNT & 0x3;
        self.registers
            .write8(REG_TRANSMIT, (retries << 4) | tx_type as u8)
            .await
    }

    async fn wait_for_alert(&mut self) {
        self.alert_line.wait().await
    }

    async fn alert(&mut self) -> Result<AlertEvents, Error> {
        let status = Alert(self.registers.read16(REG_ALERT).await?);
        let mut events = AlertEvents::default();

        // The receive buffer is released after reading the message.
        let clear = status.with_rx_status(false);
        if clear.0 != 0 {
            self.registers.write16(REG_ALERT, clear.0).await?;
        }

        events.cc_changed = status.cc_status();

        if status.power_status() {
            let mask = self.registers.read8(REG_POWER_STATUS_MASK).await?;
            if mask == POWER_STATUS_MASK_RESET {
                warn!("TCPC at {:#x} was reset", self.registers.address());
                events.tcpc_reset = true;
            } else {
                events.vbus = Some(self.update_vbus().await?);
            }
        }

        events.rx_available = status.rx_status();
        events.hard_reset_received = status.rx_hard_reset();

        if status.tx_complete() {
            events.tx_complete = Some(if status.tx_success() {
                TxStatus::Success
            } else if status.tx_discarded() {
                TxStatus::Discarded
            } else {
                TxStatus::Failed
            });
        }

        trace!("TCPC alert {:#x}", status.0);
        Ok(events)
    }

    async fn set_mux(&mut self, state: MuxState) -> Result<(), Error> {
        self.registers
            .update8(REG_CONFIG_STD_OUTPUT, |reg| {
                let mut reg = reg & !(CONFIG_STD_OUTPUT_MUX_MASK | CONFIG_STD_OUTPUT_CONNECTOR_FLIPPED);
                if state.usb {
                    reg |= CONFIG_STD_OUTPUT_MUX_USB;
                }
                if state.dp {
                    reg |= CONFIG_STD_OUTPUT_MUX_DP;
                }
                if state.flipped {
                    reg |= CONFIG_STD_OUTPUT_CONNECTOR_FLIPPED;
                }
                reg
            })
            .await
    }
}
