//! USB Power Delivery port state machine.
//!
//! One [`policy_engine::PolicyEngine`] runs per Type-C port, on top of a [`typec_tcpm::TcpmDriver`].
//! It detects attachment, negotiates power contracts as source or sink, swaps roles,
//! and discovers and enters alternate modes through vendor defined messages.
//!
//! Board specific behaviour is supplied through the [`device_policy_manager::DevicePolicyManager`] trait.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

mod fmt;

#[macro_use]
extern crate uom;

pub mod config;
pub mod console;
pub mod counters;
pub mod device_policy_manager;
pub mod event_log;
pub mod host;
pub mod policy_engine;
pub mod protocol_layer;
pub mod timers;
pub mod vdm;

#[cfg(test)]
pub mod dummy;

pub use typec_tcpm::{DataRole, Polarity, PowerRole};
