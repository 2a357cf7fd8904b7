//! Device, context and stream lifecycle core of the acrt accelerator runtime.
//!
//! The runtime sits between applications and a driver HAL. It reference
//! counts devices, pools contexts, tracks which context is current for each
//! thread, owns the submit/completion queues behind streams and routes
//! completion reports to subscribed host threads.
//!
//! # Layers
//!
//! ```text
//! ffi (rt* C ABI) ──► api (process-wide Runtime) ──► Runtime
//!                                                     ├─ DeviceTable     RefObj<Device> per slot
//!                                                     ├─ ContextManager  MemPool<Context>
//!                                                     ├─ streams         Stream owns SQ/CQ
//!                                                     └─ subscriptions   report routing
//!                                                           │
//!                                                           ▼
//!                                                     dyn Hal (SoftwareHal)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use acrt_runtime::{Runtime, RuntimeConfig, StreamConfig};
//! use acrt_runtime::hals::SoftwareHalConfig;
//!
//! # fn main() -> acrt_runtime::Result<()> {
//! let (rt, _hal) =
//!     Runtime::with_software_hal(RuntimeConfig::default(), SoftwareHalConfig::default())?;
//! rt.set_device(0)?;
//! let ctx = rt.ctx_create(0, 0)?;
//! let stream = rt.stream_create(&StreamConfig::default())?;
//! rt.stream_synchronize(stream)?;
//! rt.stream_destroy(stream)?;
//! rt.ctx_destroy(ctx)?;
//! rt.device_reset(0)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Building blocks
//!
//! | Type | Role |
//! |------|------|
//! | [`RefObj`] | Shared object created on first acquire, destroyed on last release |
//! | [`MemPool`] | Fixed-capacity arena with generation-checked handles |
//! | [`ContextRegistry`] | Current-context strategy: thread-local or task-id table |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod api;
pub mod config;
pub mod context;
pub mod device;
mod error;
pub mod ffi;
pub mod hal;
pub mod hals;
pub mod mem_pool;
pub mod ref_obj;
mod report;
mod runtime;
mod spin;
pub mod stream;
mod subscribe;
pub mod thread;

pub use acrt_drv;

pub use config::{Platform, RuntimeConfig};
pub use context::{ContextHandle, ContextRegistry};
pub use device::{Device, DeviceTable};
pub use error::{Result, RtError, RT_SUCCESS};
pub use hal::{select_hal, Hal, HalSelection, HalType};
pub use mem_pool::{MemHandle, MemPool, PoolPolicy};
pub use ref_obj::{AcquireError, RefObj, ReleaseError, Released};
pub use runtime::Runtime;
pub use spin::SpinPolicy;
pub use stream::{StreamConfig, StreamHandle, Workspace};
pub use thread::current_thread_id;

/// Commonly used types.
pub mod prelude {
    pub use crate::acrt_drv::{DevicePtr, MallocPolicy, MemAttr, MemInfo, RunMode};
    pub use crate::{
        ContextHandle, Platform, Result, RtError, Runtime, RuntimeConfig, StreamConfig,
        StreamHandle,
    };
}
