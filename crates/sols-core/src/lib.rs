//! `sols-core`
//!
//! Core types and traits for the SOLS acquisition sequencer.
//!
//! This crate holds everything the other crates agree on: the device model
//! and capability traits of the Device Abstraction Layer, the acquisition
//! request, the timing plan, device events and camera frames, the shared
//! monotonic clock, the error kinds and the layered settings.
//!
//! ## Key Types
//!
//! - [`device::DeviceDescriptor`]: what the DAL knows about one device
//! - [`capabilities::DeviceHandle`]: closed set of capability handles
//! - [`request::AcquisitionRequest`]: declarative experiment description
//! - [`plan::TimingPlan`]: compiled, immutable schedule
//! - [`event::DeviceEvent`] / [`frame::CameraFrame`]: what comes back from hardware
//! - [`error::SequencerError`]: consolidated error type

pub mod capabilities;
pub mod clock;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod frame;
pub mod limits;
pub mod plan;
pub mod request;

pub use clock::{Clock, MonotonicClock};
pub use device::{DeviceDescriptor, DeviceId, DeviceKind, DeviceStatus, DeviceTarget};
pub use error::{AppResult, SequencerError};
pub use plan::{LogicalCoordinate, PlanStep, StepKind, TimingPlan};
pub use request::AcquisitionRequest;
