//! Vendor defined messages between port partners.
//!
//! As DFP, the partner's identity, SVIDs and modes are discovered after the first contract,
//! and the first mode that an [`AltMode`](crate::vdm::AltMode) driver accepts is entered.
//! See USB PD, [6.4.4]
use embassy_futures::select::{Either, select};
use heapless::Vec;
use typec_tcpm::{MuxState, TcpmDriver};

use super::{Error, PolicyEngine};
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::DevicePolicyManager;
use crate::protocol_layer::message::Data;
use crate::protocol_layer::message::header::{ControlMessageType, MessageType};
use crate::protocol_layer::message::vdm::{Command, CommandType, PD_SID, Vdm, VdmHeader};
use crate::timers::{Timer, TimerType};
use crate::vdm::{self, ActiveMode, MAX_MODE_SVIDS};

/// Standard and vendor IDs from this value on are reserved for standards.
const STANDARD_SVID_MIN: u16 = 0xff00;

impl<DRIVER: TcpmDriver, TIMER: Timer, DPM: DevicePolicyManager> PolicyEngine<DRIVER, TIMER, DPM> {
    /// Answer a VDM from the partner, if it needs an answer.
    pub(super) async fn handle_vdm(&mut self, request: &Vdm) -> Result<(), Error> {
        if let Some(answer) = vdm::respond(&mut self.device_policy_manager, &self.vdm, request) {
            self.protocol_layer.transmit_data(Data::VendorDefined(answer)).await?;
        }

        Ok(())
    }

    /// Send a VDM on behalf of the host, without waiting for an answer.
    pub(super) async fn send_vdm(&mut self, svid: u16, command: u8, vdos: &[u32]) -> Result<(), Error> {
        let header = if svid >= STANDARD_SVID_MIN || command <= u8::from(Command::Attention) {
            VdmHeader::new_structured(svid, Command::from(command), 0)
        } else {
            VdmHeader::new_unstructured(svid, u16::from(command))
        };

        debug!("Port {}: send VDM {:#x}", self.config.port, header.0);
        self.protocol_layer
            .transmit_data(Data::VendorDefined(Vdm::new_with_vdos(header, vdos)))
            .await?;

        Ok(())
    }

    /// Send a structured request, and wait for its answer.
    ///
    /// Busy answers are retried. Reports `None` if the partner answered with NAK, or not at all.
    async fn vdm_request(&mut self, request: Vdm) -> Result<Option<Vdm>, Error> {
        let mut busy_counter = Counter::new(CounterType::Busy);

        loop {
            self.protocol_layer
                .transmit_data(Data::VendorDefined(request.clone()))
                .await?;

            let answer = match select(
                self.wait_vdm_answer(request.header),
                TimerType::new::<TIMER>(TimerType::VdmSenderResponse),
            )
            .await
            {
                Either::First(answer) => answer?,
                Either::Second(()) => {
                    debug!("Port {}: no answer to {:?}", self.config.port, request.header.command());
                    return Ok(None);
                }
            };

            match answer {
                Some(answer) if answer.header.command_type() == CommandType::Busy => {
                    if busy_counter.increment().is_err() {
                        warn!("Port {}: partner stays busy", self.config.port);
                        return Ok(None);
                    }

                    TimerType::new::<TIMER>(TimerType::VdmBusy).await;
                }
                Some(answer) if answer.header.command_type() == CommandType::Ack => return Ok(Some(answer)),
                _ => return Ok(None),
            }
        }
    }

    /// Wait for the answer to a request. Requests that the partner sends meanwhile are answered.
    ///
    /// Any other message ends the wait. It is kept for the ready state to handle.
    async fn wait_vdm_answer(&mut self, request: VdmHeader) -> Result<Option<Vdm>, Error> {
        loop {
            let message = self.protocol_layer.receive_message().await?;

            let vdm = match &message.data {
                Some(Data::VendorDefined(vdm)) => vdm.clone(),
                _ if message.header.message_type() == MessageType::Control(ControlMessageType::Ping) => continue,
                _ => {
                    self.protocol_layer.defer(message);
                    return Ok(None);
                }
            };

            let header = vdm.header;
            if header.structured()
                && header.command_type() != CommandType::Request
                && header.svid() == request.svid()
                && header.command() == request.command()
            {
                return Ok(Some(vdm));
            }

            self.handle_vdm(&vdm).await?;
        }
    }

    /// Discover the partner's modes, and enter one.
    pub(super) async fn discover(&mut self) -> Result<(), Error> {
        self.vdm.reset();

        let request = Vdm::new(VdmHeader::new_structured(PD_SID, Command::DiscoverIdentity, 0));
        let Some(identity) = self.vdm_request(request).await? else {
            return Ok(());
        };

        if !self.vdm.record_identity(&identity.vdos) {
            return Ok(());
        }

        loop {
            let request = Vdm::new(VdmHeader::new_structured(PD_SID, Command::DiscoverSvids, 0));
            let Some(svids) = self.vdm_request(request).await? else {
                return Ok(());
            };

            if !self.vdm.record_svids(&svids.vdos) {
                break;
            }
        }

        let svids = self.vdm.svids.clone();
        for svid in svids {
            if self.device_policy_manager.alt_mode(svid).is_none() {
                continue;
            }

            let request = Vdm::new(VdmHeader::new_structured(svid, Command::DiscoverModes, 0));
            if let Some(modes) = self.vdm_request(request).await? {
                self.vdm.record_modes(svid, &modes.vdos);
            }
        }

        let mode_svids: Vec<u16, MAX_MODE_SVIDS> = self.vdm.modes.iter().map(|modes| modes.svid).collect();
        for svid in mode_svids {
            if self.enter_mode(svid, 1).await? {
                return self.configure_mode(svid, 1).await;
            }
        }

        debug!("Port {}: no mode entered", self.config.port);
        Ok(())
    }

    /// Enter a discovered mode, if its driver accepts the capabilities. Reports whether it was entered.
    async fn enter_mode(&mut self, svid: u16, object_position: u8) -> Result<bool, Error> {
        let Some(mode_caps) = self.vdm.mode_caps(svid, object_position) else {
            return Ok(false);
        };

        let accepted = self
            .device_policy_manager
            .alt_mode(svid)
            .is_some_and(|mode| mode.enter(mode_caps));
        if !accepted {
            return Ok(false);
        }

        let request = Vdm::new(VdmHeader::new_structured(svid, Command::EnterMode, object_position));
        if self.vdm_request(request).await?.is_none() {
            if let Some(mode) = self.device_policy_manager.alt_mode(svid) {
                mode.exit();
            }
            return Ok(false);
        }

        info!("Port {}: entered mode {:#x}", self.config.port, svid);
        self.vdm.active = Some(ActiveMode { svid, object_position });
        Ok(true)
    }

    /// Run the status and configuration exchange of an entered mode, and switch the mux.
    async fn configure_mode(&mut self, svid: u16, object_position: u8) -> Result<(), Error> {
        let Some(status) = self
            .device_policy_manager
            .alt_mode(svid)
            .and_then(|mode| mode.status(object_position))
        else {
            return Ok(());
        };

        if !status.header.structured() {
            self.protocol_layer.transmit_data(Data::VendorDefined(status)).await?;
            return Ok(());
        }

        let Some(answer) = self.vdm_request(status).await? else {
            return Ok(());
        };

        let Some(config) = self
            .device_policy_manager
            .alt_mode(svid)
            .and_then(|mode| mode.config(object_position, &answer.vdos))
        else {
            return Ok(());
        };

        if self.vdm_request(config).await?.is_none() {
            warn!("Port {}: mode {:#x} configuration refused", self.config.port, svid);
            return Ok(());
        }

        let Some(mux) = self.device_policy_manager.alt_mode(svid).map(|mode| {
            mode.post_config();
            mode.mux_state()
        }) else {
            return Ok(());
        };

        if let Some(polarity) = self.polarity {
            self.protocol_layer.driver().set_mux(mux.with_polarity(polarity)).await?;
        }

        Ok(())
    }

    /// Leave the entered mode, and forget everything that was discovered.
    pub(super) async fn exit_mode(&mut self) {
        if let Some(active) = self.vdm.active {
            debug!("Port {}: exit mode {:#x}", self.config.port, active.svid);
            if let Some(mode) = self.device_policy_manager.alt_mode(active.svid) {
                mode.exit();
            }

            let mux = match self.polarity {
                Some(polarity) => MuxState::USB.with_polarity(polarity),
                None => MuxState::NONE,
            };

            if let Err(_error) = self.protocol_layer.driver().set_mux(mux).await {
                warn!("Port {}: cannot switch mux: {:?}", self.config.port, _error);
            }
        }

        self.vdm.reset();
    }
}
