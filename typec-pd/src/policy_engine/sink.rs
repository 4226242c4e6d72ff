//! Sink states of the policy engine.
//! See USB PD, [8.3.3.3]
use typec_tcpm::TcpmDriver;
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::millivolt;

use super::{Error, PolicyEngine, State};
use crate::device_policy_manager::{DevicePolicyManager, PartnerFlags};
use crate::protocol_layer;
use crate::protocol_layer::message::Data;
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType};
use crate::protocol_layer::message::pdo::Capabilities;
use crate::protocol_layer::message::request::{Contract, PowerSource};
use crate::timers::{Timer, TimerType};

impl<DRIVER: TcpmDriver, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<DRIVER, TIMER, DPM> {
    /// Select a request from source capabilities.
    pub(super) fn evaluate_capabilities(&mut self, capabilities: Capabilities) -> Result<State, Error> {
        self.partner = PartnerFlags::from_capabilities(&capabilities);

        let mut policy = self.config.sink_policy;
        if let Some(max_voltage) = self.max_request_voltage {
            policy.limit_voltage(max_voltage);
        }

        let device_policy_manager = &self.device_policy_manager;
        let request = PowerSource::new_from_policy(&capabilities, &policy, |voltage| {
            device_policy_manager.is_valid_input_voltage(voltage)
        });
        self.source_capabilities = Some(capabilities);

        match request {
            Some(request) => Ok(State::SnkRequested(request)),
            None => {
                warn!("Port {}: empty source capabilities", self.config.port);
                Err(protocol_layer::Error::UnexpectedMessage.into())
            }
        }
    }

    pub(super) async fn snk_discovery(&mut self) -> Result<State, Error> {
        if !self.device_policy_manager.board_checks() {
            TimerType::new::<TIMER>(TimerType::SinkWaitCap).await;
            return Ok(State::SnkDiscovery);
        }

        let result = self
            .protocol_layer
            .receive_message_type(
                &[MessageType::Data(DataMessageType::SourceCapabilities)],
                TimerType::SinkWaitCap,
            )
            .await;

        match result {
            Ok(message) => match message.data {
                Some(Data::SourceCapabilities(capabilities)) => self.evaluate_capabilities(capabilities),
                _ => Ok(State::SnkDiscovery),
            },
            Err(protocol_layer::Error::ReceiveTimeout) if !self.hard_reset_counter.is_at_max() => {
                debug!("Port {}: no source capabilities", self.config.port);
                Ok(State::HardResetSend)
            }
            Err(protocol_layer::Error::ReceiveTimeout) => {
                // The partner does not speak PD, stay on Type-C current as long as VBUS is there.
                let vbus = self.protocol_layer.driver().get_vbus_level().await?;
                if self.device_policy_manager.snk_is_vbus_provided(vbus) {
                    Ok(State::SnkDiscovery)
                } else {
                    Ok(self.disconnect().await)
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    pub(super) async fn snk_requested(&mut self, request: PowerSource) -> Result<State, Error> {
        self.protocol_layer.transmit_data(Data::Request(request.to_raw())).await?;

        let message_type = self
            .protocol_layer
            .receive_message_type(
                &[
                    MessageType::Control(ControlMessageType::Accept),
                    MessageType::Control(ControlMessageType::Reject),
                    MessageType::Control(ControlMessageType::Wait),
                ],
                TimerType::SenderResponse,
            )
            .await?
            .header
            .message_type();

        if message_type == MessageType::Control(ControlMessageType::Accept) {
            let contract = self
                .source_capabilities
                .as_ref()
                .and_then(|capabilities| Contract::new(capabilities, &request))
                .ok_or(protocol_layer::Error::UnexpectedMessage)?;

            return Ok(State::SnkTransition(contract));
        }

        debug!("Port {}: request refused with {:?}", self.config.port, message_type);
        Ok(if self.contract.is_some() {
            State::SnkReady
        } else {
            State::SnkDiscovery
        })
    }

    pub(super) async fn snk_transition(&mut self, contract: Contract) -> Result<State, Error> {
        self.protocol_layer
            .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PsTransition)
            .await?;

        info!(
            "Port {}: contract {} mV, {} mA",
            self.config.port,
            contract.voltage.get::<millivolt>(),
            contract.current.get::<milliampere>()
        );
        self.contract = Some(contract);
        self.hard_reset_counter.reset();
        self.device_policy_manager
            .set_input_current_limit(contract.current, contract.voltage)
            .await;
        self.log_charge();

        Ok(State::SnkReady)
    }

    /// Wait for the source to drop VBUS and bring it back after a hard reset.
    pub(super) async fn snk_hard_reset_recover(&mut self) -> Result<State, Error> {
        self.release_input_current().await;

        if !self.protocol_layer.wait_for_vbus(false, TimerType::SafeZeroV).await? {
            trace!("Port {}: VBUS did not drop", self.config.port);
        }

        if self
            .protocol_layer
            .wait_for_vbus(true, TimerType::SrcRecoverMax)
            .await?
        {
            Ok(State::SnkDiscovery)
        } else {
            warn!("Port {}: VBUS did not return after hard reset", self.config.port);
            Ok(self.disconnect().await)
        }
    }
}
