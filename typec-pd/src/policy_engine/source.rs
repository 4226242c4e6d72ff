//! Source states of the policy engine.
//! See USB PD, [8.3.3.2]
use embassy_futures::select::{Either, select};
use typec_tcpm::TcpmDriver;

use super::{Error, PolicyEngine, State};
use crate::PowerRole;
use crate::device_policy_manager::{DevicePolicyManager, Event};
use crate::event_log::{EventKind, LogEntry};
use crate::protocol_layer;
use crate::protocol_layer::message::Data;
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::protocol_layer::message::request::{Contract, PowerSource};
use crate::timers::{Timer, TimerType};

impl<DRIVER: TcpmDriver, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<DRIVER, TIMER, DPM> {
    /// Turn on VBUS at vSafe5V.
    pub(super) async fn src_startup(&mut self) -> Result<State, Error> {
        if !self.device_policy_manager.board_checks() {
            TimerType::new::<TIMER>(TimerType::SendSourceCap).await;
            return Ok(State::SrcStartup);
        }

        self.contract = None;

        // The sink may have left during a hard reset recovery, keep VBUS off then.
        let (cc1, cc2) = self.protocol_layer.driver().get_cc().await?;
        if Self::detect(PowerRole::Source, cc1, cc2).is_none() {
            info!("Port {}: sink went away before VBUS was turned on", self.config.port);
            return Ok(self.disconnect().await);
        }

        if let Err(_error) = self.device_policy_manager.set_power_supply_ready().await {
            error!("Port {}: {}", self.config.port, _error);
            self.log(LogEntry::new(EventKind::PsFault, self.config.port as u8, 0));
            return Ok(self.disconnect().await);
        }

        TIMER::after_millis(self.config.power_supply_turn_on_delay_ms).await;
        self.caps_counter.reset();

        Ok(State::SrcDiscovery)
    }

    /// Advertise the capabilities until a sink requests from them.
    pub(super) async fn src_discovery(&mut self) -> Result<State, Error> {
        match self
            .protocol_layer
            .transmit_source_capabilities(&self.config.source_capabilities)
            .await
        {
            Ok(()) => (),
            Err(protocol_layer::Error::TransmitRetriesExceeded) => {
                if self.caps_counter.increment().is_err() {
                    info!("Port {}: sink does not answer, stop advertising", self.config.port);
                    return Ok(State::SrcCapsExhausted);
                }

                TimerType::new::<TIMER>(TimerType::SendSourceCap).await;
                return Ok(State::SrcDiscovery);
            }
            Err(error) => return Err(error.into()),
        }

        let message = self
            .protocol_layer
            .receive_message_type(&[MessageType::Data(DataMessageType::Request)], TimerType::SenderResponse)
            .await?;

        match message.data {
            Some(Data::Request(rdo)) => Ok(State::SrcNegotiate(rdo)),
            _ => Err(protocol_layer::Error::UnexpectedMessage.into()),
        }
    }

    pub(super) async fn src_negotiate(&mut self, rdo: u32) -> Result<State, Error> {
        match PowerSource::validate(rdo, &self.config.source_capabilities) {
            Ok(contract) => {
                self.protocol_layer.transmit_control(ControlMessageType::Accept).await?;
                Ok(State::SrcAccepted(contract))
            }
            Err(_reason) => {
                warn!("Port {}: invalid request {:#x}: {:?}", self.config.port, rdo, _reason);
                self.protocol_layer.transmit_control(ControlMessageType::Reject).await?;

                Ok(if self.contract.is_some() {
                    State::SrcReady
                } else {
                    State::SrcDiscovery
                })
            }
        }
    }

    /// Switch the supply to the accepted voltage, and announce that it is ready.
    pub(super) async fn src_accepted(&mut self, contract: Contract) -> Result<State, Error> {
        TimerType::new::<TIMER>(TimerType::SrcTransition).await;

        if self.contract.map(|present| present.object_position) != Some(contract.object_position) {
            self.device_policy_manager
                .transition_voltage(contract.object_position)
                .await;
            TIMER::after_millis(self.config.power_supply_turn_on_delay_ms).await;
        }

        self.protocol_layer.transmit_control(ControlMessageType::PsRdy).await?;

        info!(
            "Port {}: contract {} mV, {} mA",
            self.config.port,
            contract.voltage.get::<uom::si::electric_potential::millivolt>(),
            contract.current.get::<uom::si::electric_current::milliampere>()
        );
        self.contract = Some(contract);
        self.hard_reset_counter.reset();
        self.log_charge();

        Ok(State::SrcReady)
    }

    /// Stay quiet until the sink speaks, or the host asks for a new attempt.
    pub(super) async fn src_caps_exhausted(&mut self) -> Result<State, Error> {
        match select(
            self.protocol_layer.receive_message(),
            self.device_policy_manager.get_event(),
        )
        .await
        {
            Either::First(message) => {
                let _message = message?;
                debug!("Port {}: sink sent {:?}", self.config.port, _message.header.message_type());
                Ok(self.discovery_state())
            }
            Either::Second(event) => Ok(match event {
                Event::Renegotiate { max_voltage_mv } => {
                    self.limit_request_voltage(max_voltage_mv);
                    self.discovery_state()
                }
                Event::HardReset => State::HardResetSend,
                Event::SetDualRole(mode) => self.set_dual_role(mode).await,
                Event::Suspend => {
                    self.disconnect().await;
                    State::Disabled
                }
                _event => {
                    debug!("Port {}: ignoring {:?} without contract", self.config.port, _event);
                    State::SrcCapsExhausted
                }
            }),
        }
    }

    pub(super) async fn src_hard_reset_recover(&mut self) -> Result<State, Error> {
        TimerType::new::<TIMER>(TimerType::SrcRecover).await;
        Ok(State::SrcStartup)
    }
}
