//! Driver boundary model for the acrt accelerator runtime.
//!
//! This crate has **no dependencies** and **no driver access**. It is a pure
//! model of what crosses the HAL boundary: the closed set of driver error
//! codes, the submit/completion queue descriptors, report kinds, device
//! memory descriptors and the fixed limits the runtime is built against.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`error`] | `DrvError`, the closed driver error enumeration and its numeric codes |
//! | [`queue`] | SQ/CQ allocation request and response, task kinds, completion reports |
//! | [`mem`] | Device pointers, malloc policies, memcpy directions, memory info |
//! | [`limits`] | Device count, queue sentinels, run modes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod limits;
pub mod mem;
pub mod queue;

pub use error::{DrvError, DrvResult};
pub use limits::{RunMode, MAX_DEVICE_NUM, SQ_ID_NONE, THREAD_ID_UNSUBSCRIBED};
pub use mem::{DevicePtr, MallocPolicy, MemAttr, MemInfo, MemcpyKind};
pub use queue::{Report, ReportKind, SqCqInfo, SqCqRequest, TaskKind};
