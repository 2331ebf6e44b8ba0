//! ionflow Simulated Collaborators
//!
//! In-process implementations of every collaborator trait in `ionflow-hal`,
//! for tests, demos and running the pipeline without a lab attached.
//!
//! | type                          | implements                            |
//! |-------------------------------|---------------------------------------|
//! | [`InMemoryParameterSource`]   | `ParameterSource`                     |
//! | [`SimDeviceBank`]             | `DeviceRegistry`, `DeviceClient`      |
//! | [`TemplateSequenceGenerator`] | `SequenceGenerator`                   |
//! | [`SimulatedHardware`]         | `HardwareBackend`                     |
//!
//! Every type records what was asked of it (queries, writes, executed
//! programs) so tests can assert on side effects.
//!
//! # Example
//!
//! ```ignore
//! use ionflow_adapter_sim::{SimDeviceBank, SimulatedHardware};
//! use ionflow_hal::DeviceInfo;
//!
//! let devices = SimDeviceBank::new()
//!     .with_device(DeviceInfo::new("rf", "tcp://10.0.0.5:5025"))
//!     .with_mismatch("rf", "freq");
//! let hardware = SimulatedHardware::new().with_channels(["pmt"]);
//! ```

mod devices;
mod hardware;
mod parameters;
mod sequence;

pub use devices::SimDeviceBank;
pub use hardware::SimulatedHardware;
pub use parameters::InMemoryParameterSource;
pub use sequence::TemplateSequenceGenerator;
