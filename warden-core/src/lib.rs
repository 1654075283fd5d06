//! Core types for the warden VM lifecycle supervisor.
//!
//! Defines the fundamental domain types shared between the supervisor engine
//! and embedding applications: instance configuration, lifecycle states, the
//! notification event vocabulary, and the control-API wire types.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod report;
pub mod state;

pub use config::{InstanceConfig, ResourcePaths, SharedDir};
pub use error::CoreError;
pub use event::{Notification, NotifyEventKind};
pub use id::InstanceId;
pub use report::{GuestRunState, InstanceInfo, VmStateReport};
pub use state::LifecycleState;
