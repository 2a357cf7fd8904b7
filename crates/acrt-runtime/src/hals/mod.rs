//! HAL implementations
//!
//! One HAL ships with the runtime:
//! - **Software**: in-process simulated driver (device open counting, queue
//!   pairs, report routing, byte-accurate device memory, fault injection)

pub mod software;

pub use software::{HalOp, SoftwareHal, SoftwareHalConfig};
