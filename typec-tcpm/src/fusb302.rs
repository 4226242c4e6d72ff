//! Driver for the FUSB302 port controller.
//!
//! The FUSB302 has no TCPCI register set. Messages move through a token FIFO,
//! CC lines are classified by the driver with the comparator and the BC_LVL detector.
//! GoodCRC and retries are handled by the hardware.
use byteorder::{ByteOrder, LittleEndian};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use heapless::Vec;

use crate::registers::RegisterBus;
use crate::{
    AlertEvents, AlertLine, CcPull, CcVoltageStatus, DataRole, Error, Frame, MAX_DATA_OBJECTS, Polarity, PowerRole,
    TcpmDriver, TransmitType, TxStatus,
};

const REG_DEVICE_ID: u8 = 0x01;
const REG_SWITCHES0: u8 = 0x02;
const REG_SWITCHES1: u8 = 0x03;
const REG_MEASURE: u8 = 0x04;
const REG_CONTROL0: u8 = 0x06;
const REG_CONTROL1: u8 = 0x07;
const REG_CONTROL3: u8 = 0x09;
const REG_MASK: u8 = 0x0a;
const REG_POWER: u8 = 0x0b;
const REG_RESET: u8 = 0x0c;
const REG_MASKA: u8 = 0x0e;
const REG_MASKB: u8 = 0x0f;
const REG_INTERRUPTA: u8 = 0x3e;
const REG_INTERRUPTB: u8 = 0x3f;
const REG_STATUS0: u8 = 0x40;
const REG_INTERRUPT: u8 = 0x42;
const REG_FIFOS: u8 = 0x43;

const SWITCHES0_PU_EN2: u8 = 1 << 7;
const SWITCHES0_PU_EN1: u8 = 1 << 6;
const SWITCHES0_VCONN_CC2: u8 = 1 << 5;
const SWITCHES0_VCONN_CC1: u8 = 1 << 4;
const SWITCHES0_MEAS_CC2: u8 = 1 << 3;
const SWITCHES0_MEAS_CC1: u8 = 1 << 2;
const SWITCHES0_PDWN2: u8 = 1 << 1;
const SWITCHES0_PDWN1: u8 = 1 << 0;
const SWITCHES0_PULLS: u8 = SWITCHES0_PU_EN1 | SWITCHES0_PU_EN2 | SWITCHES0_PDWN1 | SWITCHES0_PDWN2;
const SWITCHES0_VCONN: u8 = SWITCHES0_VCONN_CC1 | SWITCHES0_VCONN_CC2;
const SWITCHES0_MEAS: u8 = SWITCHES0_MEAS_CC1 | SWITCHES0_MEAS_CC2;

const SWITCHES1_POWERROLE: u8 = 1 << 7;
const SWITCHES1_DATAROLE: u8 = 1 << 4;
const SWITCHES1_AUTO_CRC: u8 = 1 << 2;
const SWITCHES1_TXCC2: u8 = 1 << 1;
const SWITCHES1_TXCC1: u8 = 1 << 0;

const CONTROL0_TX_FLUSH: u8 = 1 << 6;
const CONTROL0_INT_MASK: u8 = 1 << 5;
const CONTROL1_BIST_MODE2: u8 = 1 << 4;
const CONTROL1_RX_FLUSH: u8 = 1 << 2;
const CONTROL3_SEND_HARDRESET: u8 = 1 << 6;
const CONTROL3_N_RETRIES_POS: u8 = 1;
const CONTROL3_AUTO_RETRY: u8 = 1 << 0;

const INTERRUPT_VBUSOK: u8 = 1 << 7;
const INTERRUPT_ALERT: u8 = 1 << 3;
const INTERRUPT_COLLISION: u8 = 1 << 1;
const INTERRUPT_BC_LVL: u8 = 1 << 0;
const INTERRUPTA_RETRYFAIL: u8 = 1 << 4;
const INTERRUPTA_HARDSENT: u8 = 1 << 3;
const INTERRUPTA_TX_SUCCESS: u8 = 1 << 2;
const INTERRUPTA_HARDRESET: u8 = 1 << 0;
const INTERRUPTB_GCRCSENT: u8 = 1 << 0;

const STATUS0_VBUSOK: u8 = 1 << 7;
const STATUS0_COMP: u8 = 1 << 5;
const STATUS0_BC_LVL: u8 = 0x03;

const POWER_ALL: u8 = 0x0f;
const RESET_PD: u8 = 1 << 1;
const RESET_SW: u8 = 1 << 0;

/// MDAC threshold for the open versus Rd/Ra comparison, about 1.6 V.
const MEASURE_MDAC_RD: u8 = 0x26;
const MEASURE_SETTLE_US: u32 = 250;

/// Chip versions in the upper nibble of the device ID.
const DEVICE_VERSION_A: u8 = 0x8;
const DEVICE_VERSION_B: u8 = 0x9;

const TOKEN_TXON: u8 = 0xa1;
const TOKEN_SYNC1: u8 = 0x12;
const TOKEN_SYNC2: u8 = 0x13;
const TOKEN_PACKSYM: u8 = 0x80;
const TOKEN_JAMCRC: u8 = 0xff;
const TOKEN_EOP: u8 = 0x14;
const TOKEN_TXOFF: u8 = 0xfe;

/// SOP tokens, packet header, payload, CRC, EOP, and the transmitter commands.
const TX_BURST: usize = 4 + 1 + 2 + 4 * MAX_DATA_OBJECTS + 4;

/// A FUSB302 port controller.
pub struct Fusb302<'a, M: RawMutex, BUS, ALERT, DELAY> {
    registers: RegisterBus<'a, M, BUS>,
    alert_line: ALERT,
    delay: DELAY,
    polarity: Polarity,
    vconn_enabled: bool,
    pulling_up: bool,
    rx_enabled: bool,
    hard_reset_requested: bool,
}

impl<'a, M: RawMutex, BUS: I2c, ALERT: AlertLine, DELAY: DelayNs> Fusb302<'a, M, BUS, ALERT, DELAY> {
    /// Create a driver for the FUSB302 at `address` on a shared bus.
    pub fn new(bus: &'a Mutex<M, BUS>, address: u8, alert_line: ALERT, delay: DELAY) -> Self {
        Self {
            registers: RegisterBus::new(bus, address),
            alert_line,
            delay,
            polarity: Polarity::Cc1,
            vconn_enabled: false,
            pulling_up: false,
            rx_enabled: false,
            hard_reset_requested: false,
        }
    }

    async fn flush_rx_fifo(&mut self) -> Result<(), Error> {
        self.registers.write8(REG_CONTROL1, CONTROL1_RX_FLUSH).await
    }

    /// Bring the PD logic out of reset after hard reset signaling.
    async fn pd_reset(&mut self) -> Result<(), Error> {
        self.registers.write8(REG_RESET, RESET_PD).await
    }

    /// Compare one CC line against the Rd threshold while pulling it up.
    async fn measure_source_cc(&mut self, polarity: Polarity) -> Result<CcVoltageStatus, Error> {
        let saved = self.registers.read8(REG_SWITCHES0).await?;

        let (pull_up, measure) = match polarity {
            Polarity::Cc1 => (SWITCHES0_PU_EN1, SWITCHES0_MEAS_CC1),
            Polarity::Cc2 => (SWITCHES0_PU_EN2, SWITCHES0_MEAS_CC2),
        };
        let switches = (saved & !SWITCHES0_MEAS) | pull_up | measure;
        self.registers.write8(REG_SWITCHES0, switches).await?;
        self.registers.write8(REG_MEASURE, MEASURE_MDAC_RD).await?;
        self.delay.delay_us(MEASURE_SETTLE_US).await;

        let status = self.registers.read8(REG_STATUS0).await?;
        self.registers.write8(REG_SWITCHES0, saved).await?;

        Ok(if status & STATUS0_COMP != 0 {
            CcVoltageStatus::Open
        } else if status & STATUS0_BC_LVL != 0 {
            CcVoltageStatus::Rd
        } else {
            // Below the lowest BC_LVL threshold, about 200 mV.
            CcVoltageStatus::Ra
        })
    }

    /// Read the Rp advertisement on one CC line while pulling down.
    async fn measure_sink_cc(&mut self, polarity: Polarity) -> Result<CcVoltageStatus, Error> {
        let measure = match polarity {
            Polarity::Cc1 => SWITCHES0_MEAS_CC1,
            Polarity::Cc2 => SWITCHES0_MEAS_CC2,
        };
        self.registers
            .update8(REG_SWITCHES0, |reg| (reg & !SWITCHES0_MEAS) | measure)
            .await?;
        self.delay.delay_us(MEASURE_SETTLE_US).await;

        let level = self.registers.read8(REG_STATUS0).await? & STATUS0_BC_LVL;
        Ok(match level {
            1 => CcVoltageStatus::SnkDefault,
            2 => CcVoltageStatus::Snk1A5,
            3 => CcVoltageStatus::Snk3A0,
            _ => CcVoltageStatus::Open,
        })
    }

    /// Pop one frame from the receive FIFO. The trailing CRC is discarded.
    async fn read_frame(&mut self) -> Result<Frame, Error> {
        let mut locked = self.registers.lock().await;

        // SOP token, then the header.
        let mut start = [0u8; 3];
        locked.read_block(REG_FIFOS, &mut start).await?;
        let header = LittleEndian::read_u16(&start[1..]);

        let count = usize::from((header >> 12) & 0x7);
        let mut buffer = [0u8; 4 * MAX_DATA_OBJECTS + 4];
        locked.read_block(REG_FIFOS, &mut buffer[..4 * count + 4]).await?;

        let mut frame = Frame {
            header,
            ..Default::default()
        };
        for word in buffer[..4 * count].chunks_exact(4) {
            frame.data.push(LittleEndian::read_u32(word)).map_err(|_| Error::FrameTooLong)?;
        }

        Ok(frame)
    }
}

impl<M: RawMutex, BUS: I2c, ALERT: AlertLine, DELAY: DelayNs> TcpmDriver for Fusb302<'_, M, BUS, ALERT, DELAY> {
    const HAS_AUTO_GOOD_CRC: bool = true;

    async fn init(&mut self) -> Result<(), Error> {
        let version = self.registers.read8(REG_DEVICE_ID).await? >> 4;
        if !matches!(version, DEVICE_VERSION_A | DEVICE_VERSION_B) {
            error!(
                "Unknown FUSB302 version {:#x} at {:#x}",
                version,
                self.registers.address()
            );
            return Err(Error::Unsupported);
        }

        self.registers.write8(REG_RESET, RESET_SW).await?;

        let retries = crate::PD_RETRY_COUNT & 0x3;
        self.registers
            .update8(REG_CONTROL3, |reg| {
                reg | CONTROL3_AUTO_RETRY | (retries << CONTROL3_N_RETRIES_POS)
            })
            .await?;

        self.registers
            .write8(
                REG_MASK,
                0xff & !(INTERRUPT_BC_LVL | INTERRUPT_COLLISION | INTERRUPT_ALERT | INTERRUPT_VBUSOK),
            )
            .await?;
        self.registers
            .write8(
                REG_MASKA,
                0xff & !(INTERRUPTA_RETRYFAIL | INTERRUPTA_HARDSENT | INTERRUPTA_TX_SUCCESS | INTERRUPTA_HARDRESET),
            )
            .await?;
        self.registers.write8(REG_MASKB, 0xff & !INTERRUPTB_GCRCSENT).await?;
        self.registers
            .update8(REG_CONTROL0, |reg| reg & !CONTROL0_INT_MASK)
            .await?;

        self.vconn_enabled = false;
        self.set_polarity(Polarity::Cc1).await?;
        self.registers.write8(REG_POWER, POWER_ALL).await?;

        debug!(
            "FUSB302 version {:#x} at {:#x} initialized",
            version,
            self.registers.address()
        );
        Ok(())
    }

    async fn get_cc(&mut self) -> Result<(CcVoltageStatus, CcVoltageStatus), Error> {
        if !self.pulling_up {
            let cc1 = self.measure_sink_cc(Polarity::Cc1).await?;
            let cc2 = self.measure_sink_cc(Polarity::Cc2).await?;
            // Restore the receiver to the communication line.
            let polarity = self.polarity;
            self.set_polarity(polarity).await?;
            return Ok((cc1, cc2));
        }

        if self.vconn_enabled {
            // The other line carries VCONN and cannot be measured.
            return Ok(match self.polarity {
                Polarity::Cc1 => (self.measure_source_cc(Polarity::Cc1).await?, CcVoltageStatus::Open),
                Polarity::Cc2 => (CcVoltageStatus::Open, self.measure_source_cc(Polarity::Cc2).await?),
            });
        }

        let cc1 = self.measure_source_cc(Polarity::Cc1).await?;
        let cc2 = self.measure_source_cc(Polarity::Cc2).await?;
        Ok((cc1, cc2))
    }

    async fn get_vbus_level(&mut self) -> Result<bool, Error> {
        Ok(self.registers.read8(REG_STATUS0).await? & STATUS0_VBUSOK != 0)
    }

    async fn set_cc(&mut self, pull: CcPull) -> Result<(), Error> {
        let pulls = match pull {
            CcPull::Rp => SWITCHES0_PU_EN1 | SWITCHES0_PU_EN2,
            CcPull::Rd => SWITCHES0_PDWN1 | SWITCHES0_PDWN2,
            CcPull::Open => 0,
            CcPull::Ra => return Err(Error::Unsupported),
        };

        self.registers
            .update8(REG_SWITCHES0, |reg| (reg & !SWITCHES0_PULLS) | pulls)
            .await?;
        self.pulling_up = pull == CcPull::Rp;
        Ok(())
    }

    async fn set_polarity(&mut self, polarity: Polarity) -> Result<(), Error> {
        let (measure, vconn, tx) = match polarity {
            Polarity::Cc1 => (SWITCHES0_MEAS_CC1, SWITCHES0_VCONN_CC2, SWITCHES1_TXCC1),
            Polarity::Cc2 => (SWITCHES0_MEAS_CC2, SWITCHES0_VCONN_CC1, SWITCHES1_TXCC2),
        };
        let vconn = if self.vconn_enabled { vconn } else { 0 };

        self.registers
            .update8(REG_SWITCHES0, |reg| {
                (reg & !(SWITCHES0_VCONN | SWITCHES0_MEAS)) | vconn | measure
            })
            .await?;
        self.registers
            .update8(REG_SWITCHES1, |reg| {
                (reg & !(SWITCHES1_TXCC1 | SWITCHES1_TXCC2)) | tx
            })
            .await?;

        self.polarity = polarity;
        Ok(())
    }

    async fn set_vconn(&mut self, enable: bool) -> Result<(), Error> {
        self.vconn_enabled = enable;

        // There is no dedicated VCONN switch, it follows the polarity.
        if enable {
            let polarity = self.polarity;
            self.set_polarity(polarity).await
        } else {
            self.registers
                .update8(REG_SWITCHES0, |reg| reg & !SWITCHES0_VCONN)
                .await
        }
    }

    async fn set_msg_header(&mut self, power_role: PowerRole, data_role: DataRole) -> Result<(), Error> {
        self.registers
            .update8(REG_SWITCHES1, |reg| {
                let mut reg = reg & !(SWITCHES1_POWERROLE | SWITCHES1_DATAROLE);
                if power_role == PowerRole::Source {
                    reg |= SWITCHES1_POWERROLE;
                }
                if data_role == DataRole::Dfp {
                    reg |= SWITCHES1_DATAROLE;
                }
                reg
            })
            .await
    }

    async fn set_rx_enable(&mut self, enable: bool) -> Result<(), Error> {
        self.rx_enabled = enable;

        let measure = match (enable, self.polarity) {
            (false, _) => 0,
            (true, Polarity::Cc1) => SWITCHES0_MEAS_CC1,
            (true, Polarity::Cc2) => SWITCHES0_MEAS_CC2,
        };
        self.registers
            .update8(REG_SWITCHES0, |reg| (reg & !SWITCHES0_MEAS) | measure)
            .await?;

        if enable {
            self.flush_rx_fifo().await?;
        }

        self.registers
            .update8(REG_SWITCHES1, |reg| match enable {
                true => reg | SWITCHES1_AUTO_CRC,
                false => reg & !SWITCHES1_AUTO_CRC,
            })
            .await
    }

    async fn get_message(&mut self) -> Result<Frame, Error> {
        self.read_frame().await
    }

    async fn transmit(&mut self, tx_type: TransmitType, header: u16, data: &[u32]) -> Result<(), Error> {
        if data.len() > MAX_DATA_OBJECTS {
            return Err(Error::FrameTooLong);
        }

        self.registers
            .update8(REG_CONTROL0, |reg| reg | CONTROL0_TX_FLUSH)
            .await?;

        match tx_type {
            TransmitType::Sop => {
                let length = 2 + 4 * data.len();
                let mut burst: Vec<u8, TX_BURST> = Vec::new();
                burst
                    .extend_from_slice(&[TOKEN_SYNC1, TOKEN_SYNC1, TOKEN_SYNC1, TOKEN_SYNC2])
                    .map_err(|_| Error::FrameTooLong)?;
                burst
                    .push(TOKEN_PACKSYM | (length as u8 & 0x1f))
                    .map_err(|_| Error::FrameTooLong)?;
                burst
                    .extend_from_slice(&header.to_le_bytes())
                    .map_err(|_| Error::FrameTooLong)?;
                for word in data {
                    burst
                        .extend_from_slice(&word.to_le_bytes())
                        .map_err(|_| Error::FrameTooLong)?;
                }
                burst
                    .extend_from_slice(&[TOKEN_JAMCRC, TOKEN_EOP, TOKEN_TXOFF, TOKEN_TXON])
                    .map_err(|_| Error::FrameTooLong)?;

                self.registers.write_block(REG_FIFOS, &burst).await
            }
            TransmitType::HardReset => {
                self.hard_reset_requested = true;
                self.registers
                    .update8(REG_CONTROL3, |reg| reg | CONTROL3_SEND_HARDRESET)
                    .await
            }
            TransmitType::BistMode2 => {
                self.registers
                    .update8(REG_CONTROL1, |reg| reg | CONTROL1_BIST_MODE2)
                    .await
            }
            _ => Err(Error::Unsupported),
        }
    }

    async fn wait_for_alert(&mut self) {
        self.alert_line.wait().await
    }

    async fn alert(&mut self) -> Result<AlertEvents, Error> {
        // Reading the interrupt registers clears them.
        let interrupt = self.registers.read8(REG_INTERRUPT).await?;
        let interrupt_a = self.registers.read8(REG_INTERRUPTA).await?;
        let interrupt_b = self.registers.read8(REG_INTERRUPTB).await?;
        let mut events = AlertEvents::default();

        events.cc_changed = interrupt & INTERRUPT_BC_LVL != 0;

        if interrupt & INTERRUPT_VBUSOK != 0 {
            events.vbus = Some(self.get_vbus_level().await?);
        }

        if interrupt & INTERRUPT_COLLISION != 0 {
            self.hard_reset_requested = false;
            events.tx_complete = Some(TxStatus::Failed);
        }

        if interrupt_a & INTERRUPTA_TX_SUCCESS != 0 {
            // Remove the partner's GoodCRC from the FIFO.
            self.read_frame().await?;
            events.tx_complete = Some(TxStatus::Success);
        }

        if interrupt_a & INTERRUPTA_RETRYFAIL != 0 {
            events.tx_complete = Some(TxStatus::Failed);
        }

        if interrupt_a & INTERRUPTA_HARDSENT != 0 && self.hard_reset_requested {
            self.hard_reset_requested = false;
            self.pd_reset().await?;
            events.tx_complete = Some(TxStatus::Success);
        }

        if interrupt_a & INTERRUPTA_HARDRESET != 0 {
            self.pd_reset().await?;
            events.hard_reset_received = true;
        }

        if interrupt_b & INTERRUPTB_GCRCSENT != 0 {
            if self.rx_enabled {
                events.rx_available = true;
            } else {
                self.flush_rx_fifo().await?;
            }
        }

        trace!(
            "FUSB302 interrupts {:#x} {:#x} {:#x}",
            interrupt, interrupt_a, interrupt_b
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::mutex::Mutex;
    use embassy_sync::signal::Signal;

    use super::*;
    use crate::registers::testing::FakeBus;

    const ADDRESS: u8 = 0x22;

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    fn fake_bus() -> Mutex<NoopRawMutex, FakeBus> {
        let mut bus = FakeBus::new(ADDRESS);
        bus.device.set(REG_DEVICE_ID, 0x91);
        bus.device.queue_fifo(REG_FIFOS, &[]);
        Mutex::new(bus)
    }

    #[tokio::test]
    async fn init_configures_chip() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        tcpc.init().await.unwrap();

        let bus = bus.lock().await;
        assert_eq!(bus.device.written(REG_RESET), [[RESET_SW]]);
        assert_eq!(bus.device.get(REG_CONTROL3), 0x07);
        assert_eq!(bus.device.get(REG_MASK), 0x74);
        assert_eq!(bus.device.get(REG_MASKA), 0xe2);
        assert_eq!(bus.device.get(REG_MASKB), 0xfe);
        assert_eq!(bus.device.get(REG_POWER), POWER_ALL);
        assert_eq!(bus.device.get(REG_SWITCHES1), SWITCHES1_TXCC1);
    }

    #[tokio::test]
    async fn init_rejects_unknown_device() {
        let bus = fake_bus();
        bus.lock().await.device.set(REG_DEVICE_ID, 0x00);
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        assert_eq!(tcpc.init().await, Err(Error::Unsupported));
    }

    #[tokio::test]
    async fn sink_reads_bc_level() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        tcpc.set_cc(CcPull::Rd).await.unwrap();
        bus.lock().await.device.set(REG_STATUS0, STATUS0_VBUSOK | 0x02);

        // The fake measures the same level on both lines.
        assert_eq!(
            tcpc.get_cc().await.unwrap(),
            (CcVoltageStatus::Snk1A5, CcVoltageStatus::Snk1A5)
        );
        assert!(tcpc.get_vbus_level().await.unwrap());

        let switches = bus.lock().await.device.get(REG_SWITCHES0);
        assert_eq!(switches & SWITCHES0_PULLS, SWITCHES0_PDWN1 | SWITCHES0_PDWN2);
        assert_eq!(switches & SWITCHES0_MEAS, SWITCHES0_MEAS_CC1);
    }

    #[tokio::test]
    async fn source_compares_against_rd() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        tcpc.set_cc(CcPull::Rp).await.unwrap();

        bus.lock().await.device.set(REG_STATUS0, 0x01);
        assert_eq!(tcpc.get_cc().await.unwrap(), (CcVoltageStatus::Rd, CcVoltageStatus::Rd));

        bus.lock().await.device.set(REG_STATUS0, STATUS0_COMP);
        assert_eq!(tcpc.get_cc().await.unwrap(), (CcVoltageStatus::Open, CcVoltageStatus::Open));

        tcpc.set_vconn(true).await.unwrap();
        bus.lock().await.device.set(REG_STATUS0, 0x00);
        assert_eq!(tcpc.get_cc().await.unwrap(), (CcVoltageStatus::Ra, CcVoltageStatus::Open));

        let bus = bus.lock().await;
        assert_eq!(bus.device.get(REG_MEASURE), MEASURE_MDAC_RD);
        assert_eq!(bus.device.get(REG_SWITCHES0) & SWITCHES0_VCONN, SWITCHES0_VCONN_CC2);
    }

    #[tokio::test]
    async fn ra_pull_is_unsupported() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        assert_eq!(tcpc.set_cc(CcPull::Ra).await, Err(Error::Unsupported));
    }

    #[tokio::test]
    async fn transmit_writes_tokens() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        tcpc.transmit(TransmitType::Sop, 0x1161, &[0x0801_912c]).await.unwrap();

        let bus = bus.lock().await;
        assert_eq!(
            bus.device.written(REG_FIFOS),
            [[
                TOKEN_SYNC1,
                TOKEN_SYNC1,
                TOKEN_SYNC1,
                TOKEN_SYNC2,
                TOKEN_PACKSYM | 6,
                0x61,
                0x11,
                0x2c,
                0x91,
                0x01,
                0x08,
                TOKEN_JAMCRC,
                TOKEN_EOP,
                TOKEN_TXOFF,
                TOKEN_TXON,
            ]]
        );
        assert_eq!(bus.device.get(REG_CONTROL0) & CONTROL0_TX_FLUSH, CONTROL0_TX_FLUSH);
    }

    #[tokio::test]
    async fn hard_reset_completes_on_hardsent() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        tcpc.transmit(TransmitType::HardReset, 0, &[]).await.unwrap();
        assert_eq!(
            bus.lock().await.device.get(REG_CONTROL3) & CONTROL3_SEND_HARDRESET,
            CONTROL3_SEND_HARDRESET
        );

        bus.lock().await.device.set(REG_INTERRUPTA, INTERRUPTA_HARDSENT);
        let events = tcpc.alert().await.unwrap();
        assert_eq!(events.tx_complete, Some(TxStatus::Success));
        assert_eq!(bus.lock().await.device.written(REG_RESET), [[RESET_PD]]);
    }

    #[tokio::test]
    async fn alert_reads_received_frame() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);
        tcpc.set_rx_enable(true).await.unwrap();

        {
            let mut bus = bus.lock().await;
            bus.device.set(REG_INTERRUPT, INTERRUPT_BC_LVL);
            bus.device.set(REG_INTERRUPTB, INTERRUPTB_GCRCSENT);
            // SOP token, header, one data object, CRC.
            bus.device.queue_fifo(
                REG_FIFOS,
                &[0xe0, 0x61, 0x11, 0x2c, 0x91, 0x01, 0x08, 0xaa, 0xbb, 0xcc, 0xdd],
            );
        }

        let events = tcpc.alert().await.unwrap();
        assert!(events.cc_changed);
        assert!(events.rx_available);

        let frame = tcpc.get_message().await.unwrap();
        assert_eq!(frame.header, 0x1161);
        assert_eq!(frame.data.as_slice(), &[0x0801_912c]);
        assert!(bus.lock().await.device.fifos[&REG_FIFOS].is_empty());
    }

    #[tokio::test]
    async fn tx_success_drains_good_crc() {
        let bus = fake_bus();
        let signal: Signal<NoopRawMutex, ()> = Signal::new();
        let mut tcpc = Fusb302::new(&bus, ADDRESS, &signal, NoDelay);

        {
            let mut bus = bus.lock().await;
            bus.device.set(REG_INTERRUPTA, INTERRUPTA_TX_SUCCESS);
            bus.device.queue_fifo(REG_FIFOS, &[0xe0, 0x41, 0x00, 1, 2, 3, 4]);
        }

        let events = tcpc.alert().await.unwrap();
        assert_eq!(events.tx_complete, Some(TxStatus::Success));
        assert!(!events.rx_available);
        assert!(bus.lock().await.device.fifos[&REG_FIFOS].is_empty());
    }
}
