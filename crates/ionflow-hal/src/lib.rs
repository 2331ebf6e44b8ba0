//! ionflow Hardware Abstraction Layer
//!
//! Interfaces between the experiment execution pipeline and the outside
//! world: parameter stores, device controllers, the sequence generator and
//! the hardware that runs generated programs.
//!
//! # Overview
//!
//! - [`ParameterId`] and [`ParameterValue`] describe what a scan changes
//! - [`DeviceRegistry`] and [`DeviceClient`] reach external devices
//! - [`ParameterSource`] answers global and namespace-scoped parameter queries
//! - [`SequenceGenerator`] turns a parameter snapshot into a program
//! - [`HardwareBackend`] executes a program and returns [`ChannelData`]
//!
//! # Implementing a Hardware Backend
//!
//! ```ignore
//! use async_trait::async_trait;
//! use ionflow_hal::{ChannelData, HalResult, HardwareBackend};
//!
//! struct Fpga;
//!
//! #[async_trait]
//! impl HardwareBackend for Fpga {
//!     fn name(&self) -> &str { "fpga" }
//!
//!     async fn execute(&self, program: &str, shots: u32) -> HalResult<ChannelData> {
//!         // Upload program, trigger, collect counts
//!         # todo!()
//!     }
//! }
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod parameter;

pub use backend::{ChannelData, ExperimentRef, HardwareBackend, ParameterSource, SequenceGenerator};
pub use device::{DeviceClient, DeviceInfo, DeviceRegistry, DeviceStatus};
pub use error::{HalError, HalResult};
pub use parameter::{ParameterId, ParameterMap, ParameterValue, DEVICE_KEY_SEPARATOR};
