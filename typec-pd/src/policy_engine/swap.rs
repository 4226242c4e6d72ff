//! Resets and role swaps, shared by source and sink.
use typec_tcpm::{CcPull, TcpmDriver};

use super::{Error, Initiator, PolicyEngine, State};
use crate::device_policy_manager::DevicePolicyManager;
use crate::event_log::{EventKind, LogEntry};
use crate::protocol_layer::message::header::{ControlMessageType, MessageType};
use crate::protocol_layer::Error as ProtocolError;
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

impl<DRIVER: TcpmDriver, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<DRIVER, TIMER, DPM> {
    /// See USB PD, [8.3.3.4]
    pub(super) async fn soft_reset(&mut self, initiator: Initiator) -> Result<State, Error> {
        match initiator {
            Initiator::Local => {
                self.protocol_layer.reset();
                self.protocol_layer.transmit_control(ControlMessageType::SoftReset).await?;
                self.protocol_layer
                    .receive_message_type(
                        &[MessageType::Control(ControlMessageType::Accept)],
                        TimerType::SenderResponse,
                    )
                    .await?;
            }
            Initiator::Partner => {
                self.protocol_layer.transmit_control(ControlMessageType::Accept).await?;
            }
        }

        Ok(self.discovery_state())
    }

    pub(super) async fn hard_reset_send(&mut self) -> Result<State, Error> {
        if self.hard_reset_counter.is_at_max() {
            warn!("Port {}: partner does not recover from hard resets", self.config.port);
            return Ok(self.disconnect().await);
        }

        _ = self.hard_reset_counter.increment();
        info!("Port {}: send hard reset", self.config.port);
        self.protocol_layer.hard_reset().await?;

        Ok(State::HardResetExecute)
    }

    /// Return to default roles and power levels after hard reset signaling.
    /// See USB PD, [6.8.3]
    pub(super) async fn hard_reset_execute(&mut self) -> Result<State, Error> {
        self.exit_mode().await;

        self.contract = None;
        self.source_capabilities = None;
        self.roles_checked = false;
        self.data_role = Self::default_data_role(self.power_role);
        self.discovery_pending = self.data_role == DataRole::Dfp;
        self.protocol_layer.set_roles(self.power_role, self.data_role).await?;
        self.log_charge();

        Ok(match self.power_role {
            PowerRole::Source => {
                TimerType::new::<TIMER>(TimerType::PsHardReset).await;
                self.device_policy_manager.power_supply_reset().await;
                State::SrcHardResetRecover
            }
            PowerRole::Sink => State::SnkHardResetRecover,
        })
    }

    /// Ask the partner for a swap. Reports whether it accepted.
    async fn request_swap(&mut self, message_type: ControlMessageType) -> Result<bool, Error> {
        self.protocol_layer.transmit_control(message_type).await?;

        let result = self
            .protocol_layer
            .receive_message_type(
                &[
                    MessageType::Control(ControlMessageType::Accept),
                    MessageType::Control(ControlMessageType::Reject),
                    MessageType::Control(ControlMessageType::Wait),
                ],
                TimerType::SenderResponse,
            )
            .await;

        match result {
            Ok(message) => Ok(message.header.message_type() == MessageType::Control(ControlMessageType::Accept)),
            Err(ProtocolError::ReceiveTimeout) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// See USB PD, [8.3.3.19]
    pub(super) async fn data_swap(&mut self, initiator: Initiator) -> Result<State, Error> {
        if initiator == Initiator::Local && !self.request_swap(ControlMessageType::DrSwap).await? {
            debug!("Port {}: data role swap refused", self.config.port);
            return Ok(self.ready_state());
        }

        self.exit_mode().await;
        self.data_role = self.data_role.swapped();
        self.discovery_pending = self.data_role == DataRole::Dfp;
        self.protocol_layer.set_roles(self.power_role, self.data_role).await?;
        self.device_policy_manager.execute_data_swap(self.data_role).await;
        info!("Port {}: data role is now {:?}", self.config.port, self.data_role);

        Ok(self.ready_state())
    }

    /// See USB PD, [8.3.3.18]
    pub(super) async fn power_swap(&mut self, initiator: Initiator) -> Result<State, Error> {
        if initiator == Initiator::Local && !self.request_swap(ControlMessageType::PrSwap).await? {
            debug!("Port {}: power role swap refused", self.config.port);
            return Ok(self.ready_state());
        }

        // The CC lines change hands, the partner must not be reported as detached meanwhile.
        self.protocol_layer.detach();

        let result = match self.power_role {
            PowerRole::Source => self.swap_to_sink().await,
            PowerRole::Sink => self.swap_to_source().await,
        };

        if let Some(polarity) = self.polarity {
            self.protocol_layer.attach(self.power_role, polarity);
        }

        match result {
            Ok(state) => {
                info!("Port {}: power role is now {:?}", self.config.port, self.power_role);
                self.log_charge();
                Ok(state)
            }
            Err(
                Error::PowerSupply
                | Error::Protocol(
                    ProtocolError::ReceiveTimeout
                    | ProtocolError::TransmitRetriesExceeded
                    | ProtocolError::UnexpectedMessage,
                ),
            ) => {
                // VBUS already changed, only error recovery is left.
                warn!("Port {}: power role swap failed", self.config.port);
                Ok(self.disconnect().await)
            }
            Err(error) => Err(error),
        }
    }

    async fn swap_to_sink(&mut self) -> Result<State, Error> {
        TimerType::new::<TIMER>(TimerType::SrcTransition).await;
        self.device_policy_manager.power_supply_reset().await;
        self.contract = None;
        TIMER::after_millis(self.config.power_supply_turn_off_delay_ms).await;

        self.protocol_layer.driver().set_cc(CcPull::Rd).await?;
        self.cc_pull = Some(CcPull::Rd);
        self.power_role = PowerRole::Sink;
        self.protocol_layer.set_roles(self.power_role, self.data_role).await?;
        self.protocol_layer.transmit_control(ControlMessageType::PsRdy).await?;

        self.protocol_layer
            .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PsSourceOn)
            .await?;

        Ok(State::SnkDiscovery)
    }

    async fn swap_to_source(&mut self) -> Result<State, Error> {
        self.release_input_current().await;
        self.contract = None;

        self.protocol_layer
            .receive_message_type(&[MessageType::Control(ControlMessageType::PsRdy)], TimerType::PsSourceOff)
            .await?;

        self.protocol_layer.driver().set_cc(CcPull::Rp).await?;
        self.cc_pull = Some(CcPull::Rp);
        self.power_role = PowerRole::Source;
        self.protocol_layer.set_roles(self.power_role, self.data_role).await?;

        if let Err(_error) = self.device_policy_manager.set_power_supply_ready().await {
            error!("Port {}: {}", self.config.port, _error);
            self.log(LogEntry::new(EventKind::PsFault, self.config.port as u8, 0));
            return Err(Error::PowerSupply);
        }

        TIMER::after_millis(self.config.power_supply_turn_on_delay_ms).await;
        self.protocol_layer.transmit_control(ControlMessageType::PsRdy).await?;

        Ok(self.discovery_state())
    }

    /// See USB PD, [8.3.3.20]
    pub(super) async fn vconn_swap(&mut self, initiator: Initiator) -> Result<State, Error> {
        if initiator == Initiator::Local && !self.request_swap(ControlMessageType::VconnSwap).await? {
            debug!("Port {}: VCONN swap refused", self.config.port);
            return Ok(self.ready_state());
        }

        if self.vconn {
            let result = self
                .protocol_layer
                .receive_message_type(
                    &[MessageType::Control(ControlMessageType::PsRdy)],
                    TimerType::VconnSourceOn,
                )
                .await;

            match result {
                Ok(_) => {
                    self.protocol_layer.driver().set_vconn(false).await?;
                    self.vconn = false;
                }
                Err(ProtocolError::ReceiveTimeout) => {
                    warn!("Port {}: partner did not take over VCONN", self.config.port);
                }
                Err(error) => return Err(error.into()),
            }
        } else {
            self.protocol_layer.driver().set_vconn(true).await?;
            self.vconn = true;
            self.protocol_layer.transmit_control(ControlMessageType::PsRdy).await?;
        }

        info!("Port {}: VCONN source {}", self.config.port, self.vconn);
        Ok(self.ready_state())
    }
}
