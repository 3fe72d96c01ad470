//! Capture sources
//!
//! - [`Simulator`]: drives the userspace pipeline from producer threads
//! - `LsmCapture` (Linux): loads the BPF LSM programs and drains their ring buffers

pub mod host;
pub mod simulator;

#[cfg(target_os = "linux")]
pub mod lsm;

pub use host::HostStatus;
pub use simulator::{ProducerTally, SimulationReport, Simulator, SimulatorConfig};

#[cfg(target_os = "linux")]
pub use lsm::{LsmCapture, LsmCaptureConfig};
