//! The policy engine runs the state machine of one Type-C port.
//!
//! It detects a port partner through the CC lines, negotiates contracts as source or sink,
//! performs swaps and resets, and discovers alternate modes as DFP.
//! See USB PD, [8.3.3]
use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use typec_tcpm::{CcPull, CcVoltageStatus, MuxState, Polarity, TcpmDriver};
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;

use crate::config::{DualRoleMode, PortConfig};
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::{DevicePolicyManager, Event, PartnerFlags};
use crate::event_log::{ChargeRole, EventKind, LogEntry};
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::protocol_layer::message::pdo::Capabilities;
use crate::protocol_layer::message::request::{Contract, PowerSource};
use crate::protocol_layer::message::units::{ElectricCurrent, ElectricPotential};
use crate::protocol_layer::message::{Data, Message};
use crate::protocol_layer::{self, ProtocolLayer};
use crate::timers::{Timer, TimerType};
use crate::vdm::VdmState;
use crate::{DataRole, PowerRole};

mod discovery;
mod sink;
mod source;
mod swap;


/// The side that started a reset or swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Initiator {
    /// This port.
    Local,
    /// The port partner.
    Partner,
}

/// The state of a port, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum PortState {
    Disabled,
    SrcDisconnected,
    SrcDisconnectedDebounce,
    SrcHardResetRecover,
    SrcStartup,
    SrcDiscovery,
    SrcNegotiate,
    SrcAccepted,
    SrcReady,
    SrcCapsExhausted,
    SnkDisconnected,
    SnkDisconnectedDebounce,
    SnkHardResetRecover,
    SnkDiscovery,
    SnkRequested,
    SnkTransition,
    SnkReady,
    SoftReset,
    HardResetSend,
    HardResetExecute,
    DrSwap,
    PrSwap,
    VconnSwap,
}

impl PortState {
    /// Whether a port partner is attached.
    pub fn is_connected(self) -> bool {
        !matches!(
            self,
            PortState::Disabled
                | PortState::SrcDisconnected
                | PortState::SrcDisconnectedDebounce
                | PortState::SnkDisconnected
                | PortState::SnkDisconnectedDebounce
        )
    }
}

/// A snapshot of a port, published to the device policy manager whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortStatus {
    /// The port index.
    pub port: usize,
    /// The state machine state.
    pub state: PortState,
    /// The present power role.
    pub power_role: PowerRole,
    /// The present data role.
    pub data_role: DataRole,
    /// The CC line that carries PD communication, while attached.
    pub polarity: Option<Polarity>,
    /// Whether this port sources VCONN.
    pub vconn: bool,
    /// The explicit contract, if any.
    pub contract: Option<Contract>,
    /// The dual-role policy.
    pub dual_role: DualRoleMode,
}

impl PortStatus {
    /// The status of a port that did not run yet.
    pub const fn new(port: usize) -> Self {
        Self {
            port,
            state: PortState::Disabled,
            power_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            polarity: None,
            vconn: false,
            contract: None,
            dual_role: DualRoleMode::ToggleOff,
        }
    }

    /// Whether a port partner is attached.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// Errors that can occur in the policy engine.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The port controller could not be initialized.
    #[error("port controller initialization failed: {0}")]
    Init(typec_tcpm::Error),
    /// The power supply could not be switched during a power role swap.
    #[error("power supply fault")]
    PowerSupply,
    /// A protocol error has occured.
    #[error(transparent)]
    Protocol(#[from] protocol_layer::Error),
}

impl From<typec_tcpm::Error> for Error {
    fn from(error: typec_tcpm::Error) -> Self {
        Error::Protocol(protocol_layer::Error::Driver(error))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    /// No pull is presented, PD activity is suspended.
    Disabled,

    // Source states.
    SrcDisconnected,
    SrcDisconnectedDebounce(Polarity),
    SrcHardResetRecover,
    SrcStartup,
    SrcDiscovery,
    /// Evaluate a received request data object.
    SrcNegotiate(u32),
    SrcAccepted(Contract),
    SrcReady,
    /// The sink never answered to the capabilities. Wait for it to speak first.
    SrcCapsExhausted,

    // Sink states.
    SnkDisconnected,
    SnkDisconnectedDebounce(Polarity),
    SnkHardResetRecover,
    SnkDiscovery,
    SnkRequested(PowerSource),
    SnkTransition(Contract),
    SnkReady,

    // Shared states.
    SoftReset(Initiator),
    HardResetSend,
    HardResetExecute,
    DrSwap(Initiator),
    PrSwap(Initiator),
    VconnSwap(Initiator),
}

impl State {
    fn port_state(&self) -> PortState {
        match self {
            State::Disabled => PortState::Disabled,
            State::SrcDisconnected => PortState::SrcDisconnected,
            State::SrcDisconnectedDebounce(_) => PortState::SrcDisconnectedDebounce,
            State::SrcHardResetRecover => PortState::SrcHardResetRecover,
            State::SrcStartup => PortState::SrcStartup,
            State::SrcDiscovery => PortState::SrcDiscovery,
            State::SrcNegotiate(_) => PortState::SrcNegotiate,
            State::SrcAccepted(_) => PortState::SrcAccepted,
            State::SrcReady => PortState::SrcReady,
            State::SrcCapsExhausted => PortState::SrcCapsExhausted,
            State::SnkDisconnected => PortState::SnkDisconnected,
            State::SnkDisconnectedDebounce(_) => PortState::SnkDisconnectedDebounce,
            State::SnkHardResetRecover => PortState::SnkHardResetRecover,
            State::SnkDiscovery => PortState::SnkDiscovery,
            State::SnkRequested(_) => PortState::SnkRequested,
            State::SnkTransition(_) => PortState::SnkTransition,
            State::SnkReady => PortState::SnkReady,
            State::SoftReset(_) => PortState::SoftReset,
            State::HardResetSend => PortState::HardResetSend,
            State::HardResetExecute => PortState::HardResetExecute,
            State::DrSwap(_) => PortState::DrSwap,
            State::PrSwap(_) => PortState::PrSwap,
            State::VconnSwap(_) => PortState::VconnSwap,
        }
    }
}

/// Implementation of the policy engine for one port.
pub struct PolicyEngine<DRIVER: TcpmDriver, TIMER: Timer, DPM: DevicePolicyManager> {
    device_policy_manager: DPM,
    protocol_layer: ProtocolLayer<DRIVER, TIMER>,
    config: PortConfig,
    state: State,
    dual_role: DualRoleMode,
    power_role: PowerRole,
    data_role: DataRole,
    /// The pull that the port controller presents, `None` when unknown.
    cc_pull: Option<CcPull>,
    polarity: Option<Polarity>,
    vconn: bool,
    contract: Option<Contract>,
    /// The partner's capabilities, as a sink.
    source_capabilities: Option<Capabilities>,
    partner: PartnerFlags,
    /// A voltage limit for requests, set by the host.
    max_request_voltage: Option<ElectricPotential>,
    hard_reset_counter: Counter,
    caps_counter: Counter,
    /// Role swaps were considered since the first contract.
    roles_checked: bool,
    discovery_pending: bool,
    vdm: VdmState,
    status: PortStatus,

    _timer: PhantomData<TIMER>,
}

impl<DRIVER: TcpmDriver, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<DRIVER, TIMER, DPM> {
    /// Create a new policy engine for a port controller `driver`.
    ///
    /// The port starts in the disconnected state that its dual-role policy selects.
    pub fn new(driver: DRIVER, device_policy_manager: DPM, config: PortConfig) -> Self {
        let power_role = config.default_power_role;
        let data_role = Self::default_data_role(power_role);

        let mut engine = Self {
            device_policy_manager,
            protocol_layer: ProtocolLayer::new(driver, ProtocolLayer::<DRIVER, TIMER>::header_template(power_role, data_role)),
            dual_role: config.dual_role,
            status: PortStatus::new(config.port),
            config,
            state: State::Disabled,
            power_role,
            data_role,
            cc_pull: None,
            polarity: None,
            vconn: false,
            contract: None,
            source_capabilities: None,
            partner: PartnerFlags::default(),
            max_request_voltage: None,
            hard_reset_counter: Counter::new(CounterType::HardReset),
            caps_counter: Counter::new(CounterType::Caps),
            roles_checked: false,
            discovery_pending: false,
            vdm: VdmState::default(),
            _timer: PhantomData,
        };

        engine.state = engine.disconnected_state();
        engine
    }

    /// The present status of the port.
    pub fn status(&self) -> PortStatus {
        self.status
    }

    /// Access the device policy manager.
    pub fn device_policy_manager(&mut self) -> &mut DPM {
        &mut self.device_policy_manager
    }

    /// What was discovered about the port partner through VDMs.
    pub fn vdm_state(&self) -> &VdmState {
        &self.vdm
    }

    /// Run the port's state machine continuously.
    ///
    /// The loop is only broken if the port controller cannot be initialized.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.init().await?;

        loop {
            self.run_step().await?;
        }
    }

    async fn init(&mut self) -> Result<(), Error> {
        if let Err(error) = self.protocol_layer.driver().init().await {
            error!("Port {}: port controller initialization failed: {:?}", self.config.port, error);
            return Err(Error::Init(error));
        }

        self.cc_pull = None;
        Ok(())
    }

    /// Run a single step in the policy engine state machine.
    async fn run_step(&mut self) -> Result<(), Error> {
        let new_state = match self.update_state().await {
            Ok(state) => state,
            Err(Error::Protocol(error)) => self.recover(error).await?,
            Err(error) => return Err(error),
        };

        self.set_state(new_state);
        Ok(())
    }

    /// Find the state to continue with after a protocol error.
    async fn recover(&mut self, error: protocol_layer::Error) -> Result<State, Error> {
        use protocol_layer::Error as ProtocolError;

        let state = match (self.state, error) {
            (_, ProtocolError::HardReset) => State::HardResetExecute,
            (_, ProtocolError::Disconnected) => {
                info!("Port {}: detached", self.config.port);
                self.disconnect().await
            }
            (_, ProtocolError::TcpcReset) => {
                self.init().await?;
                self.disconnect().await
            }
            (_, ProtocolError::SoftReset) => State::SoftReset(Initiator::Partner),

            // A failing soft reset escalates to a hard reset.
            // See USB PD, [6.7.1.1]
            (State::SoftReset(_), _) => State::HardResetSend,

            // Any protocol error during a power transition is answered with a hard reset.
            // See USB PD, [6.8.1]
            (State::SnkTransition(_) | State::SrcAccepted(_), _) => State::HardResetSend,

            (_, ProtocolError::UnexpectedMessage) => State::SoftReset(Initiator::Local),
            (_, ProtocolError::ReceiveTimeout | ProtocolError::TransmitRetriesExceeded) => State::HardResetSend,

            (state, ProtocolError::Driver(_error)) => {
                warn!("Port {}: driver error {:?} in {:?}", self.config.port, _error, state);
                TimerType::new::<TIMER>(TimerType::CcPoll).await;
                state
            }
        };

        Ok(state)
    }

    async fn update_state(&mut self) -> Result<State, Error> {
        match self.state {
            State::Disabled => self.disabled().await,

            State::SrcDisconnected => self.disconnected(PowerRole::Source).await,
            State::SrcDisconnectedDebounce(polarity) => self.disconnected_debounce(PowerRole::Source, polarity).await,
            State::SrcHardResetRecover => self.src_hard_reset_recover().await,
            State::SrcStartup => self.src_startup().await,
            State::SrcDiscovery => self.src_discovery().await,
            State::SrcNegotiate(rdo) => self.src_negotiate(rdo).await,
            State::SrcAccepted(contract) => self.src_accepted(contract).await,
            State::SrcReady | State::SnkReady => self.ready().await,
            State::SrcCapsExhausted => self.src_caps_exhausted().await,

            State::SnkDisconnected => self.disconnected(PowerRole::Sink).await,
            State::SnkDisconnectedDebounce(polarity) => self.disconnected_debounce(PowerRole::Sink, polarity).await,
            State::SnkHardResetRecover => self.snk_hard_reset_recover().await,
            State::SnkDiscovery => self.snk_discovery().await,
            State::SnkRequested(request) => self.snk_requested(request).await,
            State::SnkTransition(contract) => self.snk_transition(contract).await,

            State::SoftReset(initiator) => self.soft_reset(initiator).await,
            State::HardResetSend => self.hard_reset_send().await,
            State::HardResetExecute => self.hard_reset_execute().await,
            State::DrSwap(initiator) => self.data_swap(initiator).await,
            State::PrSwap(initiator) => self.power_swap(initiator).await,
            State::VconnSwap(initiator) => self.vconn_swap(initiator).await,
        }
    }

    fn set_state(&mut self, state: State) {
        if state != self.state {
            debug!("Port {}: {:?} -> {:?}", self.config.port, self.state, state);
        }

        self.state = state;
        self.publish_status();
    }

    fn publish_status(&mut self) {
        let status = PortStatus {
            port: self.config.port,
            state: self.state.port_state(),
            power_role: self.power_role,
            data_role: self.data_role,
            polarity: self.polarity,
            vconn: self.vconn,
            contract: self.contract,
            dual_role: self.dual_role,
        };

        if status != self.status {
            self.status = status;
            self.device_policy_manager.status_changed(&status);
        }
    }

    fn default_data_role(power_role: PowerRole) -> DataRole {
        match power_role {
            PowerRole::Source => DataRole::Dfp,
            PowerRole::Sink => DataRole::Ufp,
        }
    }

    /// The disconnected state that the dual-role policy selects.
    fn disconnected_state(&self) -> State {
        let power_role = match self.dual_role {
            DualRoleMode::ForceSource => PowerRole::Source,
            DualRoleMode::ForceSink | DualRoleMode::ToggleOff => PowerRole::Sink,
            DualRoleMode::ToggleOn => self.config.default_power_role,
        };

        let power_role = if self.config.supports(power_role) {
            power_role
        } else {
            power_role.swapped()
        };

        Self::disconnected_state_for(power_role)
    }

    fn disconnected_state_for(power_role: PowerRole) -> State {
        match power_role {
            PowerRole::Source => State::SrcDisconnected,
            PowerRole::Sink => State::SnkDisconnected,
        }
    }

    fn ready_state(&self) -> State {
        match self.power_role {
            PowerRole::Source => State::SrcReady,
            PowerRole::Sink => State::SnkReady,
        }
    }

    fn discovery_state(&mut self) -> State {
        match self.power_role {
            PowerRole::Source => {
                self.caps_counter.reset();
                State::SrcDiscovery
            }
            PowerRole::Sink => State::SnkDiscovery,
        }
    }

    fn log(&mut self, mut entry: LogEntry) {
        entry.timestamp_ms = TIMER::now_millis() as u32;
        self.device_policy_manager.log_event(entry);
    }

    fn log_charge(&mut self) {
        let role = match (self.polarity, self.power_role) {
            (None, _) => ChargeRole::Disconnected,
            (Some(_), PowerRole::Source) => ChargeRole::Source,
            (Some(_), PowerRole::Sink) => ChargeRole::Sink,
        };
        let (voltage_mv, current_ma) = self
            .contract
            .as_ref()
            .map_or((0, 0), Contract::millivolts_milliamperes);

        self.log(LogEntry::charge(
            self.config.port as u8,
            role,
            self.dual_role == DualRoleMode::ToggleOn,
            voltage_mv,
            current_ma,
        ));
    }

    /// Present the pull of a power role, while disconnected.
    async fn present(&mut self, power_role: PowerRole) -> Result<(), Error> {
        let pull = match power_role {
            PowerRole::Source => CcPull::Rp,
            PowerRole::Sink => CcPull::Rd,
        };

        if self.cc_pull != Some(pull) {
            self.protocol_layer.driver().set_cc(pull).await?;
            self.cc_pull = Some(pull);
        }

        if self.power_role != power_role {
            self.power_role = power_role;
            self.data_role = Self::default_data_role(power_role);
        }

        Ok(())
    }

    /// The polarity of a port partner that the CC lines show, if any.
    fn detect(power_role: PowerRole, cc1: CcVoltageStatus, cc2: CcVoltageStatus) -> Option<Polarity> {
        match power_role {
            PowerRole::Sink if cc1.is_rp() || cc2.is_rp() => Some(if cc2.rp_current_ma() > cc1.rp_current_ma() {
                Polarity::Cc2
            } else {
                Polarity::Cc1
            }),
            PowerRole::Source if cc1.is_rd() => Some(Polarity::Cc1),
            PowerRole::Source if cc2.is_rd() => Some(Polarity::Cc2),
            _ => None,
        }
    }

    async fn disabled(&mut self) -> Result<State, Error> {
        if self.cc_pull != Some(CcPull::Open) {
            let driver = self.protocol_layer.driver();
            driver.set_rx_enable(false).await?;
            driver.set_cc(CcPull::Open).await?;
            self.cc_pull = Some(CcPull::Open);
        }

        loop {
            match self.device_policy_manager.get_event().await {
                Event::Resume => return Ok(self.disconnected_state()),
                Event::SetDualRole(mode) => self.dual_role = mode,
                Event::Renegotiate { max_voltage_mv } => self.limit_request_voltage(max_voltage_mv),
                _event => debug!("Port {}: ignoring {:?} while suspended", self.config.port, _event),
            }
        }
    }

    /// Look for a port partner, and toggle the power role if the policy asks for it.
    async fn disconnected(&mut self, power_role: PowerRole) -> Result<State, Error> {
        self.present(power_role).await?;

        let toggle = self.dual_role == DualRoleMode::ToggleOn && self.config.supports(power_role.swapped());
        let period = match (toggle, power_role) {
            (false, _) => TimerType::CcPoll,
            (true, PowerRole::Source) => TimerType::DrpSrc,
            (true, PowerRole::Sink) => TimerType::DrpSnk,
        };

        if let Either::Second(event) =
            select(TimerType::new::<TIMER>(period), self.device_policy_manager.get_event()).await
        {
            return Ok(match event {
                Event::SetDualRole(mode) => {
                    self.dual_role = mode;
                    self.disconnected_state()
                }
                Event::Suspend => State::Disabled,
                Event::Renegotiate { max_voltage_mv } => {
                    self.limit_request_voltage(max_voltage_mv);
                    self.state
                }
                _event => {
                    debug!("Port {}: ignoring {:?} while disconnected", self.config.port, _event);
                    self.state
                }
            });
        }

        let (cc1, cc2) = self.protocol_layer.driver().get_cc().await?;
        if let Some(polarity) = Self::detect(power_role, cc1, cc2) {
            return Ok(match power_role {
                PowerRole::Source => State::SrcDisconnectedDebounce(polarity),
                PowerRole::Sink => State::SnkDisconnectedDebounce(polarity),
            });
        }

        Ok(if toggle {
            Self::disconnected_state_for(power_role.swapped())
        } else {
            self.state
        })
    }

    /// Check that the port partner is still there after the debounce time, and attach to it.
    async fn disconnected_debounce(&mut self, power_role: PowerRole, polarity: Polarity) -> Result<State, Error> {
        TimerType::new::<TIMER>(TimerType::CcDebounce).await;

        let (cc1, cc2) = self.protocol_layer.driver().get_cc().await?;
        if Self::detect(power_role, cc1, cc2) != Some(polarity) {
            trace!("Port {}: CC bounced", self.config.port);
            return Ok(Self::disconnected_state_for(power_role));
        }

        let (active, other) = match polarity {
            Polarity::Cc1 => (cc1, cc2),
            Polarity::Cc2 => (cc2, cc1),
        };

        self.attach(power_role, polarity, active, other).await
    }

    async fn attach(
        &mut self,
        power_role: PowerRole,
        polarity: Polarity,
        active: CcVoltageStatus,
        other: CcVoltageStatus,
    ) -> Result<State, Error> {
        info!("Port {}: attached as {:?} on {:?}", self.config.port, power_role, polarity);

        self.data_role = Self::default_data_role(power_role);
        self.hard_reset_counter.reset();
        self.caps_counter.reset();
        self.vdm.reset();
        self.roles_checked = false;
        self.discovery_pending = self.data_role == DataRole::Dfp;

        self.protocol_layer.reset();
        self.protocol_layer.driver().set_polarity(polarity).await?;
        self.protocol_layer.set_roles(power_role, self.data_role).await?;
        self.protocol_layer.driver().set_rx_enable(true).await?;
        self.protocol_layer.attach(power_role, polarity);
        self.polarity = Some(polarity);
        self.log(LogEntry::new(EventKind::McuConnect, self.config.port as u8, 1));

        Ok(match power_role {
            PowerRole::Source => {
                let driver = self.protocol_layer.driver();
                if other.is_ra() {
                    driver.set_vconn(true).await?;
                    self.vconn = true;
                }
                driver.set_mux(MuxState::USB.with_polarity(polarity)).await?;

                State::SrcStartup
            }
            PowerRole::Sink => {
                self.device_policy_manager
                    .set_typec_current_limit(ElectricCurrent::new::<milliampere>(active.rp_current_ma()))
                    .await;

                State::SnkDiscovery
            }
        })
    }

    /// Keep a voltage limit from the host for all later requests, also across detach.
    fn limit_request_voltage(&mut self, max_voltage_mv: Option<u32>) {
        if let Some(max_voltage_mv) = max_voltage_mv {
            self.max_request_voltage = Some(ElectricPotential::new::<millivolt>(max_voltage_mv));
        }
    }

    /// Draw no more current from VBUS.
    async fn release_input_current(&mut self) {
        self.device_policy_manager
            .set_input_current_limit(
                ElectricCurrent::new::<milliampere>(0),
                ElectricPotential::new::<millivolt>(0),
            )
            .await;
    }

    /// Tear down everything that belongs to an attached port partner.
    ///
    /// Reports the disconnected state to continue with.
    async fn disconnect(&mut self) -> State {
        let was_attached = self.polarity.is_some();

        self.protocol_layer.detach();
        self.protocol_layer.reset();
        self.exit_mode().await;

        if let Err(_error) = self.quiesce_driver().await {
            warn!("Port {}: driver error {:?} on detach", self.config.port, _error);
        }

        match self.power_role {
            PowerRole::Source => self.device_policy_manager.power_supply_reset().await,
            PowerRole::Sink => self.release_input_current().await,
        }

        self.vconn = false;
        self.contract = None;
        self.source_capabilities = None;
        self.partner = PartnerFlags::default();
        self.polarity = None;
        self.roles_checked = false;
        self.discovery_pending = false;
        self.hard_reset_counter.reset();
        self.caps_counter.reset();

        if was_attached {
            self.log(LogEntry::new(EventKind::McuConnect, self.config.port as u8, 0));
            self.log_charge();
        }

        self.disconnected_state()
    }

    async fn quiesce_driver(&mut self) -> Result<(), typec_tcpm::Error> {
        let driver = self.protocol_layer.driver();
        driver.set_rx_enable(false).await?;
        driver.set_vconn(false).await?;
        driver.set_mux(MuxState::NONE).await
    }

    /// Handle messages and events while a contract is in place.
    async fn ready(&mut self) -> Result<State, Error> {
        if !self.roles_checked {
            self.roles_checked = true;

            if self.device_policy_manager.check_dr_role(self.data_role, self.partner) {
                return Ok(State::DrSwap(Initiator::Local));
            }

            if self.dual_role == DualRoleMode::ToggleOn && self.device_policy_manager.check_pr_role(self.partner) {
                return Ok(State::PrSwap(Initiator::Local));
            }
        }

        if self.discovery_pending && self.data_role == DataRole::Dfp {
            self.discovery_pending = false;
            self.discover().await?;
            return Ok(self.state);
        }

        match select(
            self.protocol_layer.receive_message(),
            self.device_policy_manager.get_event(),
        )
        .await
        {
            Either::First(message) => self.handle_ready_message(message?).await,
            Either::Second(event) => self.handle_ready_event(event).await,
        }
    }

    async fn handle_ready_message(&mut self, message: Message) -> Result<State, Error> {
        let ready = self.state;

        let state = match message.header.message_type() {
            MessageType::Control(ControlMessageType::GetSourceCap) => {
                if self.config.supports(PowerRole::Source) {
                    self.protocol_layer
                        .transmit_source_capabilities(&self.config.source_capabilities)
                        .await?;
                } else {
                    self.protocol_layer.transmit_control(ControlMessageType::Reject).await?;
                }
                ready
            }
            MessageType::Control(ControlMessageType::GetSinkCap) => {
                if self.config.supports(PowerRole::Sink) {
                    self.protocol_layer
                        .transmit_data(Data::SinkCapabilities(self.config.sink_capabilities.clone()))
                        .await?;
                } else {
                    self.protocol_layer.transmit_control(ControlMessageType::Reject).await?;
                }
                ready
            }
            MessageType::Control(ControlMessageType::DrSwap) => {
                if self.device_policy_manager.check_data_swap(self.data_role) {
                    self.protocol_layer.transmit_control(ControlMessageType::Accept).await?;
                    State::DrSwap(Initiator::Partner)
                } else {
                    self.protocol_layer.transmit_control(ControlMessageType::Reject).await?;
                    ready
                }
            }
            MessageType::Control(ControlMessageType::PrSwap) => {
                if self.dual_role == DualRoleMode::ToggleOn && self.device_policy_manager.check_power_swap() {
                    self.protocol_layer.transmit_control(ControlMessageType::Accept).await?;
                    State::PrSwap(Initiator::Partner)
                } else {
                    self.protocol_layer.transmit_control(ControlMessageType::Reject).await?;
                    ready
                }
            }
            MessageType::Control(ControlMessageType::VconnSwap) => {
                if self.device_policy_manager.check_vconn_swap() {
                    self.protocol_layer.transmit_control(ControlMessageType::Accept).await?;
                    State::VconnSwap(Initiator::Partner)
                } else {
                    self.protocol_layer.transmit_control(ControlMessageType::Reject).await?;
                    ready
                }
            }
            MessageType::Control(
                ControlMessageType::Ping
                | ControlMessageType::GotoMin
                | ControlMessageType::NotSupported
                | ControlMessageType::Reserved(_),
            ) => ready,
            MessageType::Data(DataMessageType::Request) if self.power_role == PowerRole::Source => {
                match message.data {
                    Some(Data::Request(rdo)) => State::SrcNegotiate(rdo),
                    _ => ready,
                }
            }
            MessageType::Data(DataMessageType::SourceCapabilities) if self.power_role == PowerRole::Sink => {
                match message.data {
                    Some(Data::SourceCapabilities(capabilities)) => self.evaluate_capabilities(capabilities)?,
                    _ => ready,
                }
            }
            MessageType::Data(DataMessageType::VendorDefined) => {
                if let Some(Data::VendorDefined(vdm)) = &message.data {
                    self.handle_vdm(vdm).await?;
                }
                ready
            }
            MessageType::Data(
                DataMessageType::SinkCapabilities
                | DataMessageType::Bist
                | DataMessageType::BatteryStatus
                | DataMessageType::Alert
                | DataMessageType::GetCountryInfo
                | DataMessageType::Reserved(_),
            ) => {
                trace!("Ignoring {:?}", message.header.message_type());
                ready
            }
            _message_type => {
                warn!("Port {}: unexpected {:?} in {:?}", self.config.port, _message_type, ready);
                return Err(protocol_layer::Error::UnexpectedMessage.into());
            }
        };

        Ok(state)
    }

    async fn handle_ready_event(&mut self, event: Event) -> Result<State, Error> {
        let ready = self.state;

        let state = match event {
            Event::RequestPowerSwap if self.dual_role == DualRoleMode::ToggleOn => State::PrSwap(Initiator::Local),
            Event::RequestPowerSwap => {
                warn!("Port {}: power role swaps need dual-role toggling", self.config.port);
                ready
            }
            Event::RequestDataSwap => State::DrSwap(Initiator::Local),
            Event::RequestVconnSwap => State::VconnSwap(Initiator::Local),
            Event::SendVdm { svid, command, vdos } => {
                self.send_vdm(svid, command, &vdos).await?;
                ready
            }
            Event::HardReset => State::HardResetSend,
            Event::SoftReset => State::SoftReset(Initiator::Local),
            Event::Renegotiate { max_voltage_mv } => {
                self.limit_request_voltage(max_voltage_mv);

                match (self.power_role, self.source_capabilities.clone()) {
                    (PowerRole::Sink, Some(capabilities)) => self.evaluate_capabilities(capabilities)?,
                    (PowerRole::Sink, None) => ready,
                    (PowerRole::Source, _) => self.discovery_state(),
                }
            }
            Event::SetDualRole(mode) => self.set_dual_role(mode).await,
            Event::Suspend => {
                self.disconnect().await;
                State::Disabled
            }
            Event::Resume => ready,
        };

        Ok(state)
    }

    /// Apply a new dual-role policy while attached.
    ///
    /// The partner is dropped if the policy forbids the present power role.
    async fn set_dual_role(&mut self, mode: DualRoleMode) -> State {
        info!("Port {}: dual-role mode {:?}", self.config.port, mode);
        self.dual_role = mode;

        match (mode, self.power_role) {
            (DualRoleMode::ForceSink, PowerRole::Source) | (DualRoleMode::ForceSource, PowerRole::Sink) => {
                self.disconnect().await
            }
            _ => self.state,
        }
    }
}
