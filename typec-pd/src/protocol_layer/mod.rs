//! The protocol layer is controlled by the policy engine, and commands the port controller.
//!
//! Handles
//! - construction of messages,
//! - CRC generation and checking on soft PHYs,
//! - GoodCRC answers and their correlation with transmitted message IDs,
//! - message retry counters,
//! - duplicate detection,
//! - reset operation,
//! - detection of detach while a message exchange is pending.
//!
//! At this point in time, the protocol layer does not support extended messages.
pub mod message;

use core::marker::PhantomData;

use embassy_futures::select::{Either, select};
use heapless::{Deque, Vec};
use message::crc::frame_crc;
use message::header::{ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision};
use message::{Data, Message};
use typec_tcpm::{AlertEvents, FRAME_WORDS, Polarity, TcpmDriver, TransmitType, TxStatus};

use crate::counters::{Counter, CounterType};
use crate::timers::{Timer, TimerType};
use crate::{DataRole, PowerRole};

/// Number of received messages that can wait for the policy engine.
const RX_QUEUE_DEPTH: usize = 4;

/// Errors that can occur in the protocol layer.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Hard reset signaling was received.
    #[error("hard reset received")]
    HardReset,
    /// Port partner requested soft reset.
    #[error("soft reset received")]
    SoftReset,
    /// The port partner went away.
    #[error("port partner disconnected")]
    Disconnected,
    /// The port controller lost its configuration.
    #[error("port controller reset")]
    TcpcReset,
    /// A timeout during message reception.
    #[error("receive timeout")]
    ReceiveTimeout,
    /// Transmission failed after the maximum number of allowed retries.
    #[error("transmit retries exceeded")]
    TransmitRetriesExceeded,
    /// A message was received that does not fit the present state.
    #[error("unexpected message")]
    UnexpectedMessage,
    /// The port controller driver failed.
    #[error("driver error: {0}")]
    Driver(#[from] typec_tcpm::Error),
}

#[derive(Debug)]
struct Counters {
    rx_message: Option<Counter>,
    tx_message: Counter,
    retry: Counter,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            rx_message: None,
            tx_message: Counter::new(CounterType::MessageId),
            retry: Counter::new(CounterType::Retry),
        }
    }
}

/// The attached port partner, as seen from the CC line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attachment {
    power_role: PowerRole,
    polarity: Polarity,
}

/// The USB PD protocol layer.
#[derive(Debug)]
pub struct ProtocolLayer<DRIVER: TcpmDriver, TIMER: Timer> {
    driver: DRIVER,
    counters: Counters,
    default_header: Header,
    attachment: Option<Attachment>,
    received: Deque<Message, RX_QUEUE_DEPTH>,
    /// Alert events that were read from the port controller, but not handled yet.
    pending: AlertEvents,
    good_crc: Option<u8>,
    tx_status: Option<TxStatus>,
    vbus: Option<bool>,
    _timer: PhantomData<TIMER>,
}

impl<DRIVER: TcpmDriver, TIMER: Timer> ProtocolLayer<DRIVER, TIMER> {
    /// Create a new protocol layer from a driver and default header.
    pub fn new(driver: DRIVER, default_header: Header) -> Self {
        Self {
            driver,
            counters: Default::default(),
            default_header,
            attachment: None,
            received: Deque::new(),
            pending: AlertEvents::default(),
            good_crc: None,
            tx_status: None,
            vbus: None,
            _timer: PhantomData,
        }
    }

    /// A header template for the given roles, as used for transmission.
    pub fn header_template(power_role: PowerRole, data_role: DataRole) -> Header {
        Header::new_template(data_role, power_role, SpecificationRevision::R2_0)
    }

    /// Access the port controller driver.
    pub fn driver(&mut self) -> &mut DRIVER {
        &mut self.driver
    }

    /// The header template that transmitted messages follow.
    pub fn header(&self) -> Header {
        self.default_header
    }

    /// Reset the protocol layer.
    ///
    /// Message IDs start over, and received messages that were not consumed are dropped.
    pub fn reset(&mut self) {
        self.counters = Default::default();
        self.received.clear();
        self.good_crc = None;
        self.tx_status = None;
    }

    /// Start watching the CC line of an attached port partner.
    pub fn attach(&mut self, power_role: PowerRole, polarity: Polarity) {
        self.attachment = Some(Attachment { power_role, polarity });
    }

    /// Stop watching the CC line, e.g. while the power role is swapped.
    pub fn detach(&mut self) {
        self.attachment = None;
    }

    /// Update the roles in transmitted headers, and in the port controller.
    pub async fn set_roles(&mut self, power_role: PowerRole, data_role: DataRole) -> Result<(), Error> {
        self.default_header = self.default_header.with_roles(power_role, data_role);
        if let Some(attachment) = self.attachment.as_mut() {
            attachment.power_role = power_role;
        }

        self.driver.set_msg_header(power_role, data_role).await?;
        Ok(())
    }

    /// Wait for the next alert, and process it.
    ///
    /// The port controller forgets about events once they are read. They are kept in `pending`
    /// until handled, so that a wait that is dropped midway does not lose them.
    async fn poll_alert(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            self.driver.wait_for_alert().await;
            let events = self.driver.alert().await?;
            self.pending.merge(events);
        }

        self.handle_events().await
    }

    async fn handle_events(&mut self) -> Result<(), Error> {
        if self.pending.tcpc_reset {
            warn!("Port controller reset");
            self.pending = AlertEvents::default();
            self.reset();
            return Err(Error::TcpcReset);
        }

        if self.pending.hard_reset_received {
            debug!("Hard reset received");
            // Messages and transmissions from before the hard reset are void.
            self.pending = AlertEvents {
                cc_changed: self.pending.cc_changed,
                vbus: self.pending.vbus,
                ..Default::default()
            };
            self.reset();
            return Err(Error::HardReset);
        }

        if self.pending.cc_changed {
            let result = self.check_attachment().await;
            self.pending.cc_changed = false;
            result?;
        }

        if let Some(level) = self.pending.vbus.take() {
            self.vbus = Some(level);
        }

        if let Some(status) = self.pending.tx_complete.take() {
            self.tx_status = Some(status);
        }

        if self.pending.rx_available {
            let result = self.read_message().await;
            self.pending.rx_available = false;
            result?;
        }

        Ok(())
    }

    /// Check that the attached port partner still terminates the active CC line.
    async fn check_attachment(&mut self) -> Result<(), Error> {
        let Some(attachment) = self.attachment else {
            return Ok(());
        };

        let (cc1, cc2) = self.driver.get_cc().await?;
        let cc = match attachment.polarity {
            Polarity::Cc1 => cc1,
            Polarity::Cc2 => cc2,
        };

        let present = match attachment.power_role {
            PowerRole::Sink => cc.is_rp(),
            PowerRole::Source => cc.is_rd(),
        };

        if present {
            Ok(())
        } else {
            debug!("Port partner detached, CC is {:?}", cc);
            self.attachment = None;
            self.pending = AlertEvents {
                vbus: self.pending.vbus,
                ..Default::default()
            };
            self.reset();
            Err(Error::Disconnected)
        }
    }

    /// Read one frame from the port controller.
    async fn read_message(&mut self) -> Result<(), Error> {
        let frame = self.driver.get_message().await?;
        self.pending.rx_available = false;
        let raw_header = Header(frame.header);

        let words = if DRIVER::HAS_AUTO_GOOD_CRC {
            &frame.data[..]
        } else {
            let Some((crc, words)) = frame.data.split_last() else {
                warn!("Dropping frame without CRC");
                return Ok(());
            };

            if *crc != frame_crc(frame.header, words) {
                warn!("Dropping frame with CRC mismatch");
                return Ok(());
            }

            words
        };

        if raw_header.is_good_crc() {
            trace!("Received GoodCRC for message ID {}", raw_header.message_id());
            self.good_crc = Some(raw_header.message_id());
            return Ok(());
        }

        if !DRIVER::HAS_AUTO_GOOD_CRC {
            self.transmit_good_crc(raw_header.message_id()).await?;
        }

        let message = match Message::from_frame(frame.header, words) {
            Ok(message) => message,
            Err(_error) => {
                warn!("Dropping unparsable message: {:?}", _error);
                return Ok(());
            }
        };

        if message.header.message_type() == MessageType::Control(ControlMessageType::SoftReset) {
            debug!("Soft reset received");
            self.reset();
            return Err(Error::SoftReset);
        }

        // See USB PD, [6.7.1.2]
        let message_id = message.header.message_id();
        match self.counters.rx_message.as_mut() {
            Some(counter) if counter.value() == message_id => {
                trace!("Received retransmission of message ID {}", message_id);
                return Ok(());
            }
            Some(counter) => counter.set(message_id),
            None => self.counters.rx_message = Some(Counter::new_from_value(CounterType::MessageId, message_id)),
        }

        trace!("Received message {:?}", message);
        if let Err(message) = self.received.push_back(message) {
            warn!("Receive queue full, dropping the oldest message");
            self.received.pop_front();
            self.received.push_back(message).ok();
        }

        Ok(())
    }

    /// Answer a received message on soft PHYs.
    async fn transmit_good_crc(&mut self, message_id: u8) -> Result<(), Error> {
        trace!("Transmit GoodCRC for message ID {}", message_id);

        let header = Header::new_control(
            self.default_header,
            Counter::new_from_value(CounterType::MessageId, message_id),
            ControlMessageType::GoodCRC,
        );

        self.driver
            .transmit(TransmitType::Sop, header.0, &[frame_crc(header.0, &[])])
            .await?;
        Ok(())
    }

    /// Wait for the outcome of the transmission of the message with the given ID.
    ///
    /// On soft PHYs, this is the matching GoodCRC. Otherwise, the port controller reports it.
    async fn wait_for_acknowledge(&mut self, message_id: u8) -> Result<TxStatus, Error> {
        loop {
            if DRIVER::HAS_AUTO_GOOD_CRC {
                if let Some(status) = self.tx_status.take() {
                    return Ok(status);
                }
            } else if let Some(acknowledged_id) = self.good_crc.take() {
                if acknowledged_id == message_id {
                    return Ok(TxStatus::Success);
                }

                // Wrong transmitted message was acknowledged.
                warn!("GoodCRC for message ID {}, expected {}", acknowledged_id, message_id);
            }

            self.poll_alert().await?;
        }
    }

    /// Transmit a message.
    async fn transmit(&mut self, message: Message) -> Result<(), Error> {
        trace!("Transmit message {:?}", message);

        let header = message.header;
        let mut words: Vec<u32, FRAME_WORDS> = message.to_words().iter().copied().collect();
        if !DRIVER::HAS_AUTO_GOOD_CRC {
            words.push(frame_crc(header.0, &words)).ok();
        }

        self.counters.retry.reset();

        loop {
            self.good_crc = None;
            self.tx_status = None;
            self.pending.tx_complete = None;
            self.driver.transmit(TransmitType::Sop, header.0, &words).await?;

            let status = match select(
                self.wait_for_acknowledge(header.message_id()),
                TimerType::new::<TIMER>(TimerType::TcpcTxTimeout),
            )
            .await
            {
                Either::First(result) => Some(result?),
                Either::Second(()) => None,
            };

            match status {
                Some(TxStatus::Success) => {
                    // See USB PD, [6.7.1.1]
                    _ = self.counters.tx_message.increment();
                    trace!("Transmit success");
                    return Ok(());
                }
                // The port controller has used up the retries already.
                Some(TxStatus::Failed) if DRIVER::HAS_AUTO_GOOD_CRC => {
                    warn!("Port controller gave up on message ID {}", header.message_id());
                    return Err(Error::TransmitRetriesExceeded);
                }
                _ => (),
            }

            if self.counters.retry.increment().is_err() {
                warn!("No GoodCRC for message ID {}", header.message_id());
                return Err(Error::TransmitRetriesExceeded);
            }

            trace!("Retransmit message ID {}", header.message_id());
        }
    }

    /// Transmit a control message of the provided type.
    pub async fn transmit_control(&mut self, control_message_type: ControlMessageType) -> Result<(), Error> {
        let header = Header::new_control(self.default_header, self.counters.tx_message, control_message_type);
        self.transmit(Message::new(header)).await
    }

    /// Transmit a data message.
    pub async fn transmit_data(&mut self, data: Data) -> Result<(), Error> {
        let num_objects = data.to_words().len() as u8;
        let header = Header::new_data(
            self.default_header,
            self.counters.tx_message,
            data.message_type(),
            num_objects,
        );

        self.transmit(Message::new_with_data(header, data)).await
    }

    /// Transmit the source capabilities.
    pub async fn transmit_source_capabilities(
        &mut self,
        capabilities: &message::pdo::Capabilities,
    ) -> Result<(), Error> {
        self.transmit_data(Data::SourceCapabilities(capabilities.clone()))
            .await
    }

    /// Receive the next message.
    pub async fn receive_message(&mut self) -> Result<Message, Error> {
        loop {
            if let Some(message) = self.received.pop_front() {
                return Ok(message);
            }

            self.poll_alert().await?;
        }
    }

    /// Put a received message back, so that the next call to [`Self::receive_message`] reports it.
    pub fn defer(&mut self, message: Message) {
        if let Err(message) = self.received.push_front(message) {
            warn!("Receive queue full, dropping the newest message");
            self.received.pop_back();
            self.received.push_front(message).ok();
        }
    }

    /// Wait until a message of one of the chosen types is received, or a timeout occurs.
    ///
    /// Ping and reserved messages are skipped. Any other message is unexpected.
    pub async fn receive_message_type(
        &mut self,
        message_types: &[MessageType],
        timer_type: TimerType,
    ) -> Result<Message, Error> {
        let receive_fut = async {
            loop {
                let message = self.receive_message().await?;

                match message.header.message_type() {
                    MessageType::Control(ControlMessageType::Ping | ControlMessageType::Reserved(_))
                    | MessageType::Data(DataMessageType::Reserved(_)) => {
                        trace!("Ignoring message {:?}", message.header.message_type());
                    }
                    message_type if message_types.contains(&message_type) => return Ok(message),
                    _message_type => {
                        warn!("Unexpected message {:?}", _message_type);
                        return Err(Error::UnexpectedMessage);
                    }
                }
            }
        };

        match select(receive_fut, TimerType::new::<TIMER>(timer_type)).await {
            Either::First(result) => result,
            Either::Second(()) => Err(Error::ReceiveTimeout),
        }
    }

    /// Wait until VBUS reaches the given level, or a timeout occurs.
    ///
    /// Reports whether the level was reached.
    pub async fn wait_for_vbus(&mut self, present: bool, timer_type: TimerType) -> Result<bool, Error> {
        self.vbus = None;
        if self.driver.get_vbus_level().await? == present {
            return Ok(true);
        }

        let level_fut = async {
            loop {
                if self.vbus == Some(present) {
                    return Ok::<(), Error>(());
                }

                self.poll_alert().await?;
            }
        };

        match select(level_fut, TimerType::new::<TIMER>(timer_type)).await {
            Either::First(result) => result.map(|_: ()| true),
            Either::Second(()) => Ok(false),
        }
    }

    /// Perform a hard-reset procedure.
    ///
    // See USB PD, [6.7.1.1]
    pub async fn hard_reset(&mut self) -> Result<(), Error> {
        self.reset();
        self.driver.transmit(TransmitType::HardReset, 0, &[]).await?;

        if DRIVER::HAS_AUTO_GOOD_CRC {
            let complete_fut = async {
                loop {
                    if self.tx_status.take().is_some() {
                        return Ok::<(), Error>(());
                    }

                    match self.poll_alert().await {
                        // Our own signaling may be reported back.
                        Err(Error::HardReset) => return Ok(()),
                        other => other?,
                    }
                }
            };

            if let Either::First(result) = select(complete_fut, TimerType::new::<TIMER>(TimerType::TcpcTxTimeout)).await {
                result?;
            }
        }

        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyDriver, DummyTimer};
    use crate::protocol_layer::message::pdo::Capabilities;
    use typec_tcpm::CcPull;

    async fn sink_layer() -> ProtocolLayer<DummyDriver, DummyTimer> {
        let mut driver = DummyDriver::new();
        driver.set_cc(CcPull::Rd).await.unwrap();
        driver.attach_source(Polarity::Cc1);
        driver.auto_good_crc(true);

        let template = ProtocolLayer::<DummyDriver, DummyTimer>::header_template(PowerRole::Sink, DataRole::Ufp);
        let mut layer = ProtocolLayer::new(driver, template);
        layer.attach(PowerRole::Sink, Polarity::Cc1);
        layer
    }

    #[tokio::test(start_paused = true)]
    async fn message_ids_advance_per_transmission() {
        let mut layer = sink_layer().await;

        for _ in 0..10 {
            layer.transmit_control(ControlMessageType::GetSourceCap).await.unwrap();
        }

        let ids: std::vec::Vec<u8> = layer
            .driver()
            .transmitted_frames()
            .iter()
            .map(|frame| Header(frame.header).message_id())
            .collect();
        assert_eq!(ids, [0, 1, 2, 3, 4, 5, 6, 7, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn received_message_is_acknowledged() {
        let mut layer = sink_layer().await;
        let source = ProtocolLayer::<DummyDriver, DummyTimer>::header_template(PowerRole::Source, DataRole::Dfp);
        let caps = Capabilities::from_words(&[0x2201_9064]).unwrap();

        let header = Header::new_data(
            source,
            Counter::new_from_value(CounterType::MessageId, 2),
            DataMessageType::SourceCapabilities,
            1,
        );
        layer.driver().inject_message(header.0, &caps.to_words());

        let message = layer.receive_message().await.unwrap();
        assert_eq!(message.data, Some(Data::SourceCapabilities(caps)));

        let good_crc = layer.driver().take_transmitted();
        assert_eq!(good_crc.header, 0x0441);
        assert_eq!(good_crc.data.as_slice(), &[0xAFD6_A8A2]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_are_dropped_but_acknowledged() {
        let mut layer = sink_layer().await;
        let source = ProtocolLayer::<DummyDriver, DummyTimer>::header_template(PowerRole::Source, DataRole::Dfp);

        let accept = Header::new_control(source, Counter::new(CounterType::MessageId), ControlMessageType::Accept);
        let ps_rdy = Header::new_control(
            source,
            Counter::new_from_value(CounterType::MessageId, 1),
            ControlMessageType::PsRdy,
        );
        layer.driver().inject_message(accept.0, &[]);
        layer.driver().inject_message(accept.0, &[]);
        layer.driver().inject_message(ps_rdy.0, &[]);

        let first = layer.receive_message().await.unwrap();
        let second = layer.receive_message().await.unwrap();
        assert_eq!(first.header, accept);
        assert_eq!(second.header, ps_rdy);

        // Three GoodCRC answers, one per received frame.
        assert_eq!(layer.driver().transmitted_frames().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_frames_are_not_acknowledged() {
        let mut layer = sink_layer().await;
        let source = ProtocolLayer::<DummyDriver, DummyTimer>::header_template(PowerRole::Source, DataRole::Dfp);
        let accept = Header::new_control(source, Counter::new(CounterType::MessageId), ControlMessageType::Accept);

        layer.driver().inject_corrupted_message(accept.0, &[]);

        let result = layer
            .receive_message_type(
                &[MessageType::Control(ControlMessageType::Accept)],
                TimerType::SenderResponse,
            )
            .await;
        assert_eq!(result, Err(Error::ReceiveTimeout));
        assert!(layer.driver().transmitted_frames().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let mut layer = sink_layer().await;
        layer.driver().auto_good_crc(false);

        let result = layer.transmit_control(ControlMessageType::GetSourceCap).await;
        assert_eq!(result, Err(Error::TransmitRetriesExceeded));

        // One transmission, plus three retries, all with the same ID.
        let frames = layer.driver().transmitted_frames();
        assert_eq!(frames.len(), 1 + usize::from(typec_tcpm::PD_RETRY_COUNT));
        assert!(frames.iter().all(|frame| Header(frame.header).message_id() == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_retry_failure_is_final() {
        let mut driver = DummyDriver::<true>::default();
        driver.set_cc(CcPull::Rd).await.unwrap();
        driver.attach_source(Polarity::Cc1);

        let template = ProtocolLayer::<DummyDriver<true>, DummyTimer>::header_template(PowerRole::Sink, DataRole::Ufp);
        let mut layer = ProtocolLayer::<_, DummyTimer>::new(driver, template);
        layer.attach(PowerRole::Sink, Polarity::Cc1);

        // The port controller already retried on its own.
        let result = layer.transmit_control(ControlMessageType::GetSourceCap).await;
        assert_eq!(result, Err(Error::TransmitRetriesExceeded));
        assert_eq!(layer.driver().transmitted_frames().len(), 1);

        layer.driver().auto_good_crc(true);
        layer.transmit_control(ControlMessageType::GetSourceCap).await.unwrap();

        let frames = layer.driver().transmitted_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(Header(frames[1].header).message_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_reset_restarts_message_ids() {
        let mut layer = sink_layer().await;
        layer.transmit_control(ControlMessageType::GetSourceCap).await.unwrap();

        let source = ProtocolLayer::<DummyDriver, DummyTimer>::header_template(PowerRole::Source, DataRole::Dfp);
        let soft_reset = Header::new_control(source, Counter::new(CounterType::MessageId), ControlMessageType::SoftReset);
        layer.driver().inject_message(soft_reset.0, &[]);

        assert_eq!(layer.receive_message().await, Err(Error::SoftReset));

        layer.driver().clear_transmitted();
        layer.transmit_control(ControlMessageType::Accept).await.unwrap();
        assert_eq!(Header(layer.driver().take_transmitted().header).message_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_cancels_pending_receive() {
        let mut layer = sink_layer().await;
        layer.driver().detach();

        let result = layer
            .receive_message_type(
                &[MessageType::Data(DataMessageType::SourceCapabilities)],
                TimerType::SinkWaitCap,
            )
            .await;
        assert_eq!(result, Err(Error::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_alert_handling_keeps_events() {
        let mut layer = sink_layer().await;
        layer.driver().detach();
        layer.driver().stall_next_cc_read();

        // Give up while the alert is being handled.
        assert!(matches!(select(layer.receive_message(), async {}).await, Either::Second(())));

        let result = tokio::time::timeout(core::time::Duration::from_secs(1), layer.receive_message()).await;
        assert_eq!(result, Ok(Err(Error::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_reset_signaling_is_reported() {
        let mut layer = sink_layer().await;
        layer.driver().signal_hard_reset();

        assert_eq!(layer.receive_message().await, Err(Error::HardReset));
    }
}
