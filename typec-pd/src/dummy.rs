//! Implements a dummy port controller, timer and device policy manager for testing.
use std::collections::VecDeque;
use std::future::pending;
use std::time::Duration;
use std::vec::Vec;

use typec_tcpm::{
    AlertEvents, CcPull, CcVoltageStatus, DataRole, Frame, MuxState, Polarity, PowerRole, TcpmDriver, TransmitType,
    TxStatus,
};
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;

use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::{DevicePolicyManager, Event, PartnerFlags, PowerSupplyError};
use crate::event_log::LogEntry;
use crate::policy_engine::PortStatus;
use crate::protocol_layer::message::crc::frame_crc;
use crate::protocol_layer::message::header::{ControlMessageType, Header, MessageType};
use crate::protocol_layer::message::pdo::Capabilities;
use crate::protocol_layer::message::units::{ElectricCurrent, ElectricPotential};
use crate::protocol_layer::message::vdm::{IdHeader, MAX_VDOS, svids_to_vdos};
use crate::timers::Timer;
use crate::vdm::AltMode;
use crate::vdm::displayport::{DP_SID, DisplayPortMode};
use crate::vdm::google::DeviceInfo;

thread_local! {
    static START: tokio::time::Instant = tokio::time::Instant::now();
}

/// A timer on top of the tokio clock, which tests run paused.
pub struct DummyTimer {}

impl Timer for DummyTimer {
    async fn after_millis(milliseconds: u64) {
        tokio::time::sleep(Duration::from_millis(milliseconds)).await
    }

    fn now_millis() -> u64 {
        START.with(|start| start.elapsed().as_millis() as u64)
    }
}

/// Source capabilities for testing: 5 V at 1 A, 12 V at 3 A, and 20 V at 5 A.
///
/// The first object flags a dual-role partner.
pub fn dummy_source_capabilities() -> Capabilities {
    Capabilities::from_words(&[0x2201_9064, 0x2203_c12c, 0x2206_41f4]).unwrap()
}

/// Sink capabilities for testing: 5 V at 3 A.
pub fn dummy_sink_capabilities() -> Capabilities {
    Capabilities::from_words(&[0x0001_912c]).unwrap()
}

#[derive(Debug, Clone, Copy)]
struct Partner {
    power_role: PowerRole,
    polarity: Polarity,
    rp: CcVoltageStatus,
    cable: bool,
}

/// A port controller with a scripted port partner behind it.
///
/// As a soft PHY, frames carry their CRC as the last word, and if enabled, every transmitted
/// message is answered with a GoodCRC from the partner. With `AUTO_GOOD_CRC`, the controller
/// reports the outcome of its own retries instead: success if the partner answers, failure otherwise.
#[derive(Debug, Default)]
pub struct DummyDriver<const AUTO_GOOD_CRC: bool = false> {
    local_pull: Option<CcPull>,
    partner: Option<Partner>,
    vbus: bool,
    rx: VecDeque<Frame>,
    pending: AlertEvents,
    transmitted: Vec<Frame>,
    auto_good_crc: bool,
    hard_resets_sent: usize,
    init_count: usize,
    polarity: Option<Polarity>,
    vconn: bool,
    rx_enabled: bool,
    mux: MuxState,
    stall_cc: bool,
}

impl DummyDriver {
    /// Create a new soft PHY dummy driver without port partner.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<const AUTO_GOOD_CRC: bool> DummyDriver<AUTO_GOOD_CRC> {
    fn notify(&mut self, events: AlertEvents) {
        self.pending.merge(events);
    }

    /// Attach a source that advertises 1.5 A on the given CC line, and turn on VBUS.
    pub fn attach_source(&mut self, polarity: Polarity) {
        self.partner = Some(Partner {
            power_role: PowerRole::Source,
            polarity,
            rp: CcVoltageStatus::Snk1A5,
            cable: false,
        });
        self.vbus = true;
        self.notify(AlertEvents {
            cc_changed: true,
            vbus: Some(true),
            ..Default::default()
        });
    }

    /// Attach a sink on the given CC line, optionally through a cable that needs VCONN.
    pub fn attach_sink(&mut self, polarity: Polarity, cable: bool) {
        self.partner = Some(Partner {
            power_role: PowerRole::Sink,
            polarity,
            rp: CcVoltageStatus::Open,
            cable,
        });
        self.notify(AlertEvents {
            cc_changed: true,
            ..Default::default()
        });
    }

    /// Let the partner present the termination of another power role, as after a power role swap.
    pub fn swap_partner_role(&mut self) {
        if let Some(partner) = self.partner.as_mut() {
            partner.power_role = partner.power_role.swapped();
            partner.rp = match partner.power_role {
                PowerRole::Source => CcVoltageStatus::SnkDefault,
                PowerRole::Sink => CcVoltageStatus::Open,
            };
        }
    }

    /// Let the next CC status read hang, like a bus transfer that is cut short.
    pub fn stall_next_cc_read(&mut self) {
        self.stall_cc = true;
    }

    /// Remove the partner, and VBUS with it.
    pub fn detach(&mut self) {
        self.partner = None;
        self.vbus = false;
        self.notify(AlertEvents {
            cc_changed: true,
            vbus: Some(false),
            ..Default::default()
        });
    }

    /// Change the VBUS level.
    pub fn set_vbus(&mut self, level: bool) {
        self.vbus = level;
        self.notify(AlertEvents {
            vbus: Some(level),
            ..Default::default()
        });
    }

    /// Enable or disable GoodCRC answers from the partner.
    pub fn auto_good_crc(&mut self, enable: bool) {
        self.auto_good_crc = enable;
    }

    /// Queue a message from the partner.
    pub fn inject_message(&mut self, header: u16, words: &[u32]) {
        self.inject_frame(header, words, frame_crc(header, words));
    }

    /// Queue a message from the partner, with a broken CRC.
    pub fn inject_corrupted_message(&mut self, header: u16, words: &[u32]) {
        self.inject_frame(header, words, !frame_crc(header, words));
    }

    fn inject_frame(&mut self, header: u16, words: &[u32], crc: u32) {
        let mut frame = Frame::new(header, words).unwrap();
        if !AUTO_GOOD_CRC {
            frame.data.push(crc).unwrap();
        }
        self.rx.push_back(frame);
    }

    /// Let the partner send hard reset signaling.
    pub fn signal_hard_reset(&mut self) {
        self.notify(AlertEvents {
            hard_reset_received: true,
            ..Default::default()
        });
    }

    /// Let the port controller lose its configuration.
    pub fn signal_tcpc_reset(&mut self) {
        self.notify(AlertEvents {
            tcpc_reset: true,
            ..Default::default()
        });
    }

    /// All frames that the stack transmitted, including GoodCRC.
    pub fn transmitted_frames(&self) -> &[Frame] {
        &self.transmitted
    }

    /// The types of the transmitted messages, without GoodCRC.
    pub fn transmitted_types(&self) -> Vec<MessageType> {
        self.transmitted
            .iter()
            .map(|frame| Header(frame.header))
            .filter(|header| !header.is_good_crc())
            .map(|header| header.message_type())
            .collect()
    }

    /// Take the oldest transmitted frame.
    pub fn take_transmitted(&mut self) -> Frame {
        self.transmitted.remove(0)
    }

    /// Forget about transmitted frames.
    pub fn clear_transmitted(&mut self) {
        self.transmitted.clear();
    }

    /// The pull that the stack presents.
    pub fn local_pull(&self) -> Option<CcPull> {
        self.local_pull
    }

    /// Number of sent hard resets.
    pub fn hard_resets_sent(&self) -> usize {
        self.hard_resets_sent
    }

    /// Number of port controller initializations.
    pub fn init_count(&self) -> usize {
        self.init_count
    }

    /// The configured mux state.
    pub fn mux(&self) -> MuxState {
        self.mux
    }

    /// Whether VCONN is on.
    pub fn vconn(&self) -> bool {
        self.vconn
    }

    /// Whether reception is on.
    pub fn rx_enabled(&self) -> bool {
        self.rx_enabled
    }

    /// The configured polarity.
    pub fn polarity(&self) -> Option<Polarity> {
        self.polarity
    }
}

impl<const AUTO_GOOD_CRC: bool> TcpmDriver for DummyDriver<AUTO_GOOD_CRC> {
    const HAS_AUTO_GOOD_CRC: bool = AUTO_GOOD_CRC;

    async fn init(&mut self) -> Result<(), typec_tcpm::Error> {
        self.init_count += 1;
        Ok(())
    }

    async fn get_cc(&mut self) -> Result<(CcVoltageStatus, CcVoltageStatus), typec_tcpm::Error> {
        if core::mem::take(&mut self.stall_cc) {
            pending::<()>().await;
        }

        let Some(partner) = self.partner else {
            return Ok((CcVoltageStatus::Open, CcVoltageStatus::Open));
        };

        let (active, other) = match (partner.power_role, self.local_pull) {
            (PowerRole::Source, Some(CcPull::Rd)) => (partner.rp, CcVoltageStatus::Open),
            (PowerRole::Sink, Some(CcPull::Rp)) if partner.cable => (CcVoltageStatus::Rd, CcVoltageStatus::Ra),
            (PowerRole::Sink, Some(CcPull::Rp)) => (CcVoltageStatus::Rd, CcVoltageStatus::Open),
            _ => (CcVoltageStatus::Open, CcVoltageStatus::Open),
        };

        Ok(match partner.polarity {
            Polarity::Cc1 => (active, other),
            Polarity::Cc2 => (other, active),
        })
    }

    async fn get_vbus_level(&mut self) -> Result<bool, typec_tcpm::Error> {
        Ok(self.vbus)
    }

    async fn set_cc(&mut self, pull: CcPull) -> Result<(), typec_tcpm::Error> {
        self.local_pull = Some(pull);
        Ok(())
    }

    async fn set_polarity(&mut self, polarity: Polarity) -> Result<(), typec_tcpm::Error> {
        self.polarity = Some(polarity);
        Ok(())
    }

    async fn set_vconn(&mut self, enable: bool) -> Result<(), typec_tcpm::Error> {
        self.vconn = enable;
        Ok(())
    }

    async fn set_msg_header(&mut self, _power_role: PowerRole, _data_role: DataRole) -> Result<(), typec_tcpm::Error> {
        Ok(())
    }

    async fn set_rx_enable(&mut self, enable: bool) -> Result<(), typec_tcpm::Error> {
        self.rx_enabled = enable;
        Ok(())
    }

    async fn get_message(&mut self) -> Result<Frame, typec_tcpm::Error> {
        self.rx.pop_front().ok_or(typec_tcpm::Error::Bus)
    }

    async fn transmit(&mut self, tx_type: TransmitType, header: u16, data: &[u32]) -> Result<(), typec_tcpm::Error> {
        if tx_type == TransmitType::HardReset {
            self.hard_resets_sent += 1;
            return Ok(());
        }

        self.transmitted.push(Frame::new(header, data)?);

        if AUTO_GOOD_CRC {
            let status = if self.auto_good_crc {
                TxStatus::Success
            } else {
                TxStatus::Failed
            };
            self.notify(AlertEvents {
                tx_complete: Some(status),
                ..Default::default()
            });
            return Ok(());
        }

        let header = Header(header);
        if self.auto_good_crc && !header.is_good_crc() {
            let template = header.with_roles(header.port_power_role().swapped(), header.port_data_role().swapped());
            let good_crc = Header::new_control(
                template,
                Counter::new_from_value(CounterType::MessageId, header.message_id()),
                ControlMessageType::GoodCRC,
            );

            let mut frame = Frame::new(good_crc.0, &[]).unwrap();
            frame.data.push(frame_crc(good_crc.0, &[])).unwrap();
            self.rx.push_front(frame);
        }

        Ok(())
    }

    async fn wait_for_alert(&mut self) {
        if self.pending.is_empty() && self.rx.is_empty() {
            pending::<()>().await;
        }
    }

    async fn alert(&mut self) -> Result<AlertEvents, typec_tcpm::Error> {
        let mut events = core::mem::take(&mut self.pending);
        events.rx_available = !self.rx.is_empty();
        Ok(events)
    }

    async fn set_mux(&mut self, state: MuxState) -> Result<(), typec_tcpm::Error> {
        self.mux = state;
        Ok(())
    }
}

/// A device policy manager that records what the policy engine asks for.
#[derive(Default)]
pub struct DummyDevice {
    /// Events to hand to the policy engine, oldest first.
    pub events: VecDeque<Event>,
    /// Every published status.
    pub statuses: Vec<PortStatus>,
    /// Logged events.
    pub log: Vec<LogEntry>,
    /// The last sink input current limit, as mA and mV.
    pub input_current_limit: Option<(u32, u32)>,
    /// The last Type-C current limit in mA.
    pub typec_current_limit: Option<u32>,
    /// Whether the source supply is on.
    pub supply_on: bool,
    /// Let the source supply fail.
    pub supply_fault: bool,
    /// The last voltage transition, by object position.
    pub voltage_position: Option<u8>,
    /// Completed data role swaps.
    pub data_swaps: Vec<DataRole>,
    /// Ask for a data role swap after the first contract.
    pub request_data_swap: bool,
    /// Refuse data role swaps.
    pub refuse_data_swap: bool,
    /// Announce identity and the DisplayPort SVID as responder.
    pub responder: bool,
    /// The DisplayPort mode driver.
    pub display_port: DisplayPortMode,
    /// Stored device information.
    pub device_info: Option<DeviceInfo>,
}

impl DevicePolicyManager for DummyDevice {
    async fn transition_voltage(&mut self, object_position: u8) {
        self.voltage_position = Some(object_position);
    }

    async fn set_power_supply_ready(&mut self) -> Result<(), PowerSupplyError> {
        if self.supply_fault {
            return Err(PowerSupplyError);
        }

        self.supply_on = true;
        Ok(())
    }

    async fn power_supply_reset(&mut self) {
        self.supply_on = false;
        self.voltage_position = None;
    }

    async fn set_input_current_limit(&mut self, current: ElectricCurrent, voltage: ElectricPotential) {
        self.input_current_limit = Some((current.get::<milliampere>(), voltage.get::<millivolt>()));
    }

    async fn set_typec_current_limit(&mut self, current: ElectricCurrent) {
        self.typec_current_limit = Some(current.get::<milliampere>());
    }

    async fn execute_data_swap(&mut self, data_role: DataRole) {
        self.data_swaps.push(data_role);
    }

    fn check_data_swap(&self, _data_role: DataRole) -> bool {
        !self.refuse_data_swap
    }

    fn check_dr_role(&self, _data_role: DataRole, _partner: PartnerFlags) -> bool {
        self.request_data_swap
    }

    fn identity(&self) -> Option<heapless::Vec<u32, MAX_VDOS>> {
        self.responder
            .then(|| heapless::Vec::from_slice(&[IdHeader(0).with_vid(0x18d1).with_modal(true).0, 0, 0x5011_0001]).unwrap())
    }

    fn svids(&self) -> Option<heapless::Vec<u32, MAX_VDOS>> {
        self.responder.then(|| svids_to_vdos(&[DP_SID]))
    }

    fn modes(&self, svid: u16) -> Option<heapless::Vec<u32, MAX_VDOS>> {
        (self.responder && svid == DP_SID).then(|| heapless::Vec::from_slice(&[0x0000_0405]).unwrap())
    }

    fn alt_mode(&mut self, svid: u16) -> Option<&mut dyn AltMode> {
        (svid == DP_SID).then_some(&mut self.display_port as &mut dyn AltMode)
    }

    fn store_device_info(&mut self, info: DeviceInfo) {
        self.device_info = Some(info);
    }

    fn log_event(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    fn status_changed(&mut self, status: &PortStatus) {
        self.statuses.push(*status);
    }

    async fn get_event(&mut self) -> Event {
        match self.events.pop_front() {
            Some(event) => event,
            None => pending().await,
        }
    }
}
