//! Hardware abstraction layer boundary
//!
//! The runtime never talks to a device directly. Everything below the
//! runtime (device open, queue pairs, task submission, completion reports,
//! device memory) goes through a [`Hal`] trait object. Every call reports
//! failure with the closed driver enumeration [`DrvError`]; translation to
//! runtime errors happens in the caller.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use acrt_drv::{
    DevicePtr, DrvResult, MallocPolicy, MemAttr, MemInfo, Report, ReportKind, RunMode, SqCqInfo,
    SqCqRequest, TaskKind,
};

use crate::error::Result;
use crate::hals::software::{SoftwareHal, SoftwareHalConfig};

/// Driver interface consumed by the runtime.
///
/// Implementations are shared across threads and must serialize their own
/// state. Blocking calls (`wait_complete`, `report_wait`) take an optional
/// timeout; `None` waits forever.
pub trait Hal: Debug + Send + Sync {
    /// HAL type for logging
    fn hal_type(&self) -> HalType;

    /// Where the host program runs relative to the device
    fn run_mode(&self) -> RunMode;

    /// Number of devices the driver exposes
    ///
    /// # Errors
    ///
    /// Returns the driver error if enumeration fails.
    fn device_count(&self) -> DrvResult<u32>;

    /// Open a device
    ///
    /// # Errors
    ///
    /// Returns the driver error if the device is absent or already open.
    fn device_open(&self, device_id: u32) -> DrvResult<()>;

    /// Close a device opened with [`device_open`](Self::device_open)
    ///
    /// # Errors
    ///
    /// Returns the driver error if the device is not open.
    fn device_close(&self, device_id: u32) -> DrvResult<()>;

    /// Allocate a submit/completion queue pair
    ///
    /// # Errors
    ///
    /// Returns [`DrvError::NoStreamResources`](acrt_drv::DrvError::NoStreamResources)
    /// when the device has no queue left.
    fn sq_cq_allocate(&self, device_id: u32, request: &SqCqRequest) -> DrvResult<SqCqInfo>;

    /// Free a queue pair
    ///
    /// # Errors
    ///
    /// Returns the driver error for an unknown queue.
    fn sq_cq_free(&self, device_id: u32, sq_id: u32) -> DrvResult<()>;

    /// Post a task, returning its task id
    ///
    /// # Errors
    ///
    /// Returns the driver error for an unknown queue or undeliverable task.
    fn submit(&self, device_id: u32, sq_id: u32, task: TaskKind) -> DrvResult<u32>;

    /// Block until `task_id` and everything before it on the queue completed
    ///
    /// # Errors
    ///
    /// Returns [`DrvError::WaitTimeout`](acrt_drv::DrvError::WaitTimeout) when
    /// the timeout elapses.
    fn wait_complete(
        &self,
        device_id: u32,
        sq_id: u32,
        task_id: u32,
        timeout: Option<Duration>,
    ) -> DrvResult<()>;

    /// Route reports of `kind` from a queue to `subscribe_id`
    ///
    /// # Errors
    ///
    /// Returns the driver error if the queue is unknown or already routed.
    fn subscribe_tid(
        &self,
        device_id: u32,
        sq_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
    ) -> DrvResult<()>;

    /// Undo [`subscribe_tid`](Self::subscribe_tid)
    ///
    /// # Errors
    ///
    /// Returns the driver error if the route does not exist.
    fn unsubscribe_tid(
        &self,
        device_id: u32,
        sq_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
    ) -> DrvResult<()>;

    /// Block until a report of `kind` arrives for `subscribe_id`
    ///
    /// # Errors
    ///
    /// Returns [`DrvError::WaitTimeout`](acrt_drv::DrvError::WaitTimeout) when
    /// the timeout elapses.
    fn report_wait(
        &self,
        device_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
        timeout: Option<Duration>,
    ) -> DrvResult<Report>;

    /// Acknowledge a processed report, unblocking its queue
    ///
    /// # Errors
    ///
    /// Returns the driver error if the report's queue is gone.
    fn report_release(&self, device_id: u32, report: &Report) -> DrvResult<()>;

    /// Allocate device memory
    ///
    /// # Errors
    ///
    /// Returns the driver error when memory is exhausted.
    fn mem_alloc(&self, device_id: u32, size: u64, policy: MallocPolicy) -> DrvResult<DevicePtr>;

    /// Free device memory
    ///
    /// # Errors
    ///
    /// Returns the driver error for a pointer not returned by `mem_alloc`.
    fn mem_free(&self, device_id: u32, ptr: DevicePtr) -> DrvResult<()>;

    /// Fill device memory with a byte
    ///
    /// # Errors
    ///
    /// Returns the driver error if the range is not allocated.
    fn mem_set(&self, device_id: u32, ptr: DevicePtr, value: u8, count: u64) -> DrvResult<()>;

    /// Copy host bytes to device memory
    ///
    /// # Errors
    ///
    /// Returns the driver error if the range is not allocated.
    fn mem_write(&self, device_id: u32, dst: DevicePtr, src: &[u8]) -> DrvResult<()>;

    /// Copy device memory to host bytes
    ///
    /// # Errors
    ///
    /// Returns the driver error if the range is not allocated.
    fn mem_read(&self, device_id: u32, src: DevicePtr, dst: &mut [u8]) -> DrvResult<()>;

    /// Copy within device memory
    ///
    /// # Errors
    ///
    /// Returns the driver error if either range is not allocated.
    fn mem_copy(&self, device_id: u32, dst: DevicePtr, src: DevicePtr, count: u64)
        -> DrvResult<()>;

    /// Free and total device memory
    ///
    /// # Errors
    ///
    /// Returns the driver error if the device is not open.
    fn mem_info(&self, device_id: u32, attr: MemAttr) -> DrvResult<MemInfo>;
}

/// HAL type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalType {
    /// In-process simulated driver, no hardware required
    Software,
}

impl std::fmt::Display for HalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software => write!(f, "Software (simulated driver)"),
        }
    }
}

/// HAL selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HalSelection {
    /// Best available driver
    #[default]
    Auto,

    /// Force the simulated driver with the given settings
    Software(SoftwareHalConfig),
}

/// Select a HAL
///
/// No hardware driver is linked into this build, so `Auto` resolves to the
/// simulated driver with settings from the environment.
///
/// # Errors
///
/// Returns error if no HAL can be brought up.
pub fn select_hal(selection: HalSelection) -> Result<Arc<dyn Hal>> {
    match selection {
        HalSelection::Auto => {
            tracing::info!("No hardware driver available, using software HAL");
            Ok(Arc::new(SoftwareHal::new(SoftwareHalConfig::from_env())))
        }
        HalSelection::Software(config) => Ok(Arc::new(SoftwareHal::new(config))),
    }
}
