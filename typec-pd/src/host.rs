//! State that the port tasks share with the host interface.
//!
//! The device policy manager of each port publishes its status here, merges log entries, and takes
//! requests from its port's channel in [`DevicePolicyManager::get_event`](crate::device_policy_manager::DevicePolicyManager::get_event).
//! The host, e.g. a host command handler or the [console](crate::console), reads the status and queues requests.
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, Receiver, TrySendError};

use crate::PowerRole;
use crate::device_policy_manager::Event;
use crate::event_log::{ChargeRole, EventLog, LogEntry};
use crate::policy_engine::PortStatus;
use crate::protocol_layer::message::request::Contract;
use crate::vdm::google::DeviceInfo;

/// Requests that can be queued per port.
pub const REQUEST_DEPTH: usize = 4;

/// Entries that the event log holds.
pub const LOG_DEPTH: usize = 32;

/// Errors of host requests.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// There is no such port.
    #[error("invalid port {0}")]
    InvalidPort(usize),
    /// The port did not take earlier requests yet.
    #[error("port {0} is busy")]
    Busy(usize),
}

/// A directive for the highest voltage that sinks request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MaxVoltage {
    /// Keep the present limit.
    NoChange,
    /// Limit requests to the given voltage, and negotiate again.
    Millivolts(u32),
}

/// The charge status of a port, as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChargeStatus {
    /// Whether the port provides or consumes power, if anything is attached.
    pub role: ChargeRole,
    /// Whether the port toggles between the power roles.
    pub dual_role: bool,
    /// The contract voltage, zero without contract.
    pub voltage_mv: u32,
    /// The contract current, zero without contract.
    pub current_ma: u32,
    /// The position of the selected source capability.
    pub object_position: Option<u8>,
}

struct HostState<const N: usize> {
    ports: [PortStatus; N],
    device_info: [Option<DeviceInfo>; N],
    max_voltage_mv: Option<u32>,
    vbus_present: bool,
    log: EventLog<LOG_DEPTH>,
}

/// Host view of `N` ports.
pub struct PdHost<M: RawMutex, const N: usize> {
    state: Mutex<M, RefCell<HostState<N>>>,
    requests: [Channel<M, Event, REQUEST_DEPTH>; N],
}

impl<M: RawMutex, const N: usize> PdHost<M, N> {
    /// Create the host state, with all ports disabled.
    pub const fn new() -> Self {
        let mut ports = [PortStatus::new(0); N];
        let mut port = 0;
        while port < N {
            ports[port] = PortStatus::new(port);
            port += 1;
        }

        Self {
            state: Mutex::new(RefCell::new(HostState {
                ports,
                device_info: [const { None }; N],
                max_voltage_mv: None,
                vbus_present: true,
                log: EventLog::new(),
            })),
            requests: [const { Channel::new() }; N],
        }
    }

    /// Number of ports.
    pub const fn port_count(&self) -> usize {
        N
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HostState<N>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    fn check_port(port: usize) -> Result<(), Error> {
        if port < N { Ok(()) } else { Err(Error::InvalidPort(port)) }
    }

    /// The last status that a port published.
    pub fn port_status(&self, port: usize) -> Result<PortStatus, Error> {
        Self::check_port(port)?;
        Ok(self.with_state(|state| state.ports[port]))
    }

    /// Publish the status of a port, usually from [`DevicePolicyManager::status_changed`](crate::device_policy_manager::DevicePolicyManager::status_changed).
    pub fn update_status(&self, status: &PortStatus) -> Result<(), Error> {
        Self::check_port(status.port)?;

        self.with_state(|state| {
            let previous = &mut state.ports[status.port];
            if previous.is_connected() && !status.is_connected() {
                state.device_info[status.port] = None;
            }
            *previous = *status;
        });

        Ok(())
    }

    /// The charge status of a port.
    pub fn charge_status(&self, port: usize) -> Result<ChargeStatus, Error> {
        let status = self.port_status(port)?;

        let role = match (status.is_connected(), status.power_role) {
            (false, _) => ChargeRole::Disconnected,
            (true, PowerRole::Source) => ChargeRole::Source,
            (true, PowerRole::Sink) => ChargeRole::Sink,
        };

        let (voltage_mv, current_ma) = status
            .contract
            .as_ref()
            .map_or((0, 0), Contract::millivolts_milliamperes);

        Ok(ChargeStatus {
            role,
            dual_role: status.dual_role == crate::config::DualRoleMode::ToggleOn,
            voltage_mv,
            current_ma,
            object_position: status.contract.map(|contract| contract.object_position),
        })
    }

    /// Queue a request for the policy engine of a port.
    pub fn request(&self, port: usize, event: Event) -> Result<(), Error> {
        Self::check_port(port)?;

        match self.requests[port].try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_event)) => {
                warn!("Port {}: request queue full, dropping {:?}", port, _event);
                Err(Error::Busy(port))
            }
        }
    }

    /// The receiving end of a port's request queue, for its device policy manager.
    pub fn requests(&self, port: usize) -> Result<Receiver<'_, M, Event, REQUEST_DEPTH>, Error> {
        Self::check_port(port)?;
        Ok(self.requests[port].receiver())
    }

    /// Apply a voltage limit to sink requests of all ports.
    ///
    /// A new limit lets every port negotiate again.
    pub fn set_max_voltage(&self, max_voltage: MaxVoltage) -> Result<(), Error> {
        let MaxVoltage::Millivolts(max_voltage_mv) = max_voltage else {
            return Ok(());
        };

        info!("Maximum request voltage {} mV", max_voltage_mv);
        self.with_state(|state| state.max_voltage_mv = Some(max_voltage_mv));

        let mut result = Ok(());
        for port in 0..N {
            let request = self.request(
                port,
                Event::Renegotiate {
                    max_voltage_mv: Some(max_voltage_mv),
                },
            );
            result = result.and(request);
        }

        result
    }

    /// The voltage limit for sink requests, if any.
    pub fn max_voltage_mv(&self) -> Option<u32> {
        self.with_state(|state| state.max_voltage_mv)
    }

    /// Store what an accessory on a port reported about its firmware.
    pub fn store_device_info(&self, port: usize, info: DeviceInfo) -> Result<(), Error> {
        Self::check_port(port)?;
        self.with_state(|state| state.device_info[port] = Some(info));
        Ok(())
    }

    /// What the accessory on a port reported about its firmware.
    pub fn device_info(&self, port: usize) -> Result<Option<DeviceInfo>, Error> {
        Self::check_port(port)?;
        Ok(self.with_state(|state| state.device_info[port]))
    }

    /// Flip the VBUS override of evaluation boards. Reports the new level.
    pub fn toggle_vbus(&self) -> bool {
        self.with_state(|state| {
            state.vbus_present = !state.vbus_present;
            state.vbus_present
        })
    }

    /// Whether VBUS is reported as present, as overridden on evaluation boards.
    pub fn vbus_present(&self) -> bool {
        self.with_state(|state| state.vbus_present)
    }

    /// Add an entry to the event log.
    pub fn log_event(&self, entry: LogEntry, now_ms: u64) {
        self.with_state(|state| state.log.push(entry, now_ms));
    }

    /// Merge an entry that an accessory on a port reported. Reports whether it was added.
    pub fn log_remote(&self, port: usize, vdos: &[u32], now_ms: u64) -> Result<bool, Error> {
        Self::check_port(port)?;
        Ok(self.with_state(|state| state.log.push_remote(port as u8, vdos, now_ms)))
    }

    /// Take the oldest log entry.
    pub fn dequeue_log(&self, now_ms: u64) -> LogEntry {
        self.with_state(|state| state.log.dequeue(now_ms))
    }
}

impl<M: RawMutex, const N: usize> Default for PdHost<M, N> {
    fn default() -> Self {
        Self::new()
    }
}
