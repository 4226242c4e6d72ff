//! Debug console commands.
//!
//! ```text
//! vbus
//! pd <port> state
//! pd <port> hard|soft
//! pd <port> swap power|data|vconn
//! pd <port> dualrole on|off|sink|source
//! pd <port> vdm <svid> <command> [vdo..]
//! pd <port> suspend|resume
//! pdlog
//! ```
//!
//! Numbers are decimal, or hexadecimal with a `0x` prefix.
use core::fmt::Write;
use core::str::SplitWhitespace;

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use crate::config::DualRoleMode;
use crate::device_policy_manager::Event;
use crate::event_log::EventKind;
use crate::host::{self, PdHost};
use crate::protocol_layer::message::vdm::MAX_VDOS;

/// Errors of console commands.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The command is not known.
    #[error("unknown command")]
    UnknownCommand,
    /// An argument is missing.
    #[error("missing argument")]
    MissingArgument,
    /// An argument could not be parsed.
    #[error("invalid argument")]
    InvalidArgument,
    /// The host refused the request.
    #[error(transparent)]
    Host(#[from] host::Error),
    /// Writing the output failed.
    #[error("output error")]
    Output(#[from] core::fmt::Error),
}

/// Run one command line, and write its output.
pub fn execute<M: RawMutex, const N: usize>(
    line: &str,
    host: &PdHost<M, N>,
    now_ms: u64,
    out: &mut impl Write,
) -> Result<(), Error> {
    let mut args = line.split_whitespace();

    match args.next() {
        Some("vbus") => {
            let present = host.toggle_vbus();
            writeln!(out, "VBUS {}", if present { "on" } else { "off" })?;
            Ok(())
        }
        Some("pd") => {
            let port = parse_number(args.next().ok_or(Error::MissingArgument)?)? as usize;
            port_command(port, &mut args, host, out)
        }
        Some("pdlog") => dump_log(host, now_ms, out),
        _ => Err(Error::UnknownCommand),
    }
}

fn port_command<M: RawMutex, const N: usize>(
    port: usize,
    args: &mut SplitWhitespace<'_>,
    host: &PdHost<M, N>,
    out: &mut impl Write,
) -> Result<(), Error> {
    let event = match args.next().ok_or(Error::MissingArgument)? {
        "state" => {
            let status = host.port_status(port)?;
            write!(
                out,
                "Port {}: {:?}, {:?}/{:?}, dual-role {:?}",
                port, status.state, status.power_role, status.data_role, status.dual_role
            )?;
            if let Some(polarity) = status.polarity {
                write!(out, ", {:?}", polarity)?;
            }
            if status.vconn {
                write!(out, ", VCONN")?;
            }
            if let Some(contract) = status.contract {
                let (voltage_mv, current_ma) = contract.millivolts_milliamperes();
                write!(out, ", {} mV {} mA", voltage_mv, current_ma)?;
            }
            writeln!(out)?;
            return Ok(());
        }
        "hard" => Event::HardReset,
        "soft" => Event::SoftReset,
        "swap" => match args.next().ok_or(Error::MissingArgument)? {
            "power" => Event::RequestPowerSwap,
            "data" => Event::RequestDataSwap,
            "vconn" => Event::RequestVconnSwap,
            _ => return Err(Error::InvalidArgument),
        },
        "dualrole" => Event::SetDualRole(match args.next().ok_or(Error::MissingArgument)? {
            "on" => DualRoleMode::ToggleOn,
            "off" => DualRoleMode::ToggleOff,
            "sink" => DualRoleMode::ForceSink,
            "source" => DualRoleMode::ForceSource,
            _ => return Err(Error::InvalidArgument),
        }),
        "vdm" => {
            let svid = parse_number(args.next().ok_or(Error::MissingArgument)?)?;
            let command = parse_number(args.next().ok_or(Error::MissingArgument)?)?;

            let mut vdos = Vec::<u32, MAX_VDOS>::new();
            for arg in args {
                vdos.push(parse_number(arg)?).map_err(|_| Error::InvalidArgument)?;
            }

            Event::SendVdm {
                svid: u16::try_from(svid).map_err(|_| Error::InvalidArgument)?,
                command: u8::try_from(command).map_err(|_| Error::InvalidArgument)?,
                vdos,
            }
        }
        "suspend" => Event::Suspend,
        "resume" => Event::Resume,
        _ => return Err(Error::UnknownCommand),
    };

    host.request(port, event)?;
    Ok(())
}

fn dump_log<M: RawMutex, const N: usize>(host: &PdHost<M, N>, now_ms: u64, out: &mut impl Write) -> Result<(), Error> {
    loop {
        let entry = host.dequeue_log(now_ms);
        if entry.kind == EventKind::NoEntry {
            return Ok(());
        }

        write!(
            out,
            "{} ms ago: {:?} port {} data {:#x}",
            entry.timestamp_ms, entry.kind, entry.port, entry.data
        )?;
        for word in &entry.payload {
            write!(out, " {:#010x}", word)?;
        }
        writeln!(out)?;
    }
}

fn parse_number(arg: &str) -> Result<u32, Error> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => arg.parse(),
    };

    parsed.map_err(|_| Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use std::string::String;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::millivolt;

    use super::*;
    use crate::event_log::{ChargeRole, LogEntry};
    use crate::policy_engine::{PortState, PortStatus};
    use crate::protocol_layer::message::request::Contract;
    use crate::protocol_layer::message::units::{ElectricCurrent, ElectricPotential};

    type Host = PdHost<NoopRawMutex, 2>;

    fn run(line: &str, host: &Host) -> Result<String, Error> {
        let mut out = String::new();
        execute(line, host, 2000, &mut out)?;
        Ok(out)
    }

    #[tokio::test]
    async fn port_commands_queue_requests() {
        let host = Host::new();

        run("pd 1 hard", &host).unwrap();
        run("pd 1 swap data", &host).unwrap();
        run("pd 1 dualrole sink", &host).unwrap();
        run("pd 1 suspend", &host).unwrap();

        let requests = host.requests(1).unwrap();
        assert_eq!(requests.receive().await, Event::HardReset);
        assert_eq!(requests.receive().await, Event::RequestDataSwap);
        assert_eq!(requests.receive().await, Event::SetDualRole(DualRoleMode::ForceSink));
        assert_eq!(requests.receive().await, Event::Suspend);
    }

    #[tokio::test]
    async fn vdm_command_parses_numbers() {
        let host = Host::new();

        run("pd 0 vdm 0x18d1 0x1 0x10 7", &host).unwrap();

        let event = host.requests(0).unwrap().receive().await;
        assert_eq!(
            event,
            Event::SendVdm {
                svid: 0x18d1,
                command: 1,
                vdos: Vec::from_slice(&[0x10, 7]).unwrap(),
            }
        );
    }

    #[test]
    fn invalid_input_is_reported() {
        let host = Host::new();

        assert_eq!(run("reboot", &host), Err(Error::UnknownCommand));
        assert_eq!(run("pd", &host), Err(Error::MissingArgument));
        assert_eq!(run("pd 0 swap", &host), Err(Error::MissingArgument));
        assert_eq!(run("pd 0 swap fast", &host), Err(Error::InvalidArgument));
        assert_eq!(run("pd 0 vdm 0x12345 1", &host), Err(Error::InvalidArgument));
        assert_eq!(run("pd 5 hard", &host), Err(Error::Host(host::Error::InvalidPort(5))));
    }

    #[test]
    fn state_shows_contract() {
        let host = Host::new();
        host.update_status(&PortStatus {
            state: PortState::SnkReady,
            polarity: Some(crate::Polarity::Cc2),
            contract: Some(Contract {
                object_position: 1,
                voltage: ElectricPotential::new::<millivolt>(5000),
                current: ElectricCurrent::new::<milliampere>(900),
                rdo: 0,
            }),
            ..PortStatus::new(0)
        })
        .unwrap();

        assert_eq!(
            run("pd 0 state", &host).unwrap(),
            "Port 0: SnkReady, Sink/Ufp, dual-role ToggleOff, Cc2, 5000 mV 900 mA\n"
        );
    }

    #[test]
    fn vbus_toggles() {
        let host = Host::new();
        assert_eq!(run("vbus", &host).unwrap(), "VBUS off\n");
        assert_eq!(run("vbus", &host).unwrap(), "VBUS on\n");
    }

    #[test]
    fn log_is_drained() {
        let host = Host::new();
        host.log_event(LogEntry::new(EventKind::McuConnect, 1, 1), 500);
        host.log_event(LogEntry::charge(1, ChargeRole::Sink, false, 5000, 900), 1500);

        let output = run("pdlog", &host).unwrap();
        let lines: std::vec::Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            [
                "1500 ms ago: McuConnect port 1 data 0x1",
                "500 ms ago: McuCharge port 1 data 0x2 0x13880384 0x00001194",
            ]
        );
        assert!(run("pdlog", &host).unwrap().is_empty());
    }
}
