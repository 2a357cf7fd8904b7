//! Process-wide runtime
//!
//! [`init`] creates the single [`Runtime`] used by the C ABI and by the free
//! functions below; [`deinit`] drops it. Every function here forwards to the
//! method of the same name and fails with `NotInitialized` outside an
//! `init`/`deinit` pair.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use acrt_drv::{DevicePtr, MallocPolicy, MemAttr, MemInfo, RunMode};
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::context::ContextHandle;
use crate::error::{Result, RtError};
use crate::hal::{select_hal, HalSelection};
use crate::runtime::Runtime;
use crate::stream::{StreamConfig, StreamHandle, Workspace};

static RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Bring up the process-wide runtime from the environment.
///
/// A second call while initialized is a no-op.
///
/// # Errors
///
/// Returns error if no HAL can be brought up.
pub fn init() -> Result<()> {
    init_with(RuntimeConfig::from_env(), HalSelection::Auto)
}

/// Bring up the process-wide runtime with explicit settings.
///
/// # Errors
///
/// Returns error if the HAL or the configuration is unusable.
pub fn init_with(config: RuntimeConfig, selection: HalSelection) -> Result<()> {
    let mut slot = RUNTIME.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        debug!("Runtime already initialized");
        return Ok(());
    }
    let hal = select_hal(selection)?;
    *slot = Some(Arc::new(Runtime::new(config, hal)?));
    info!("Process runtime initialized");
    Ok(())
}

/// Tear down the process-wide runtime.
///
/// Calls already in flight finish against the old instance.
///
/// # Errors
///
/// `NotInitialized` without a matching [`init`].
pub fn deinit() -> Result<()> {
    let runtime = RUNTIME
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(RtError::NotInitialized)?;
    runtime.shutdown();
    info!("Process runtime deinitialized");
    Ok(())
}

/// Whether [`init`] has run without a later [`deinit`]
pub fn is_initialized() -> bool {
    RUNTIME
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

/// The process-wide runtime
///
/// # Errors
///
/// `NotInitialized` outside an `init`/`deinit` pair.
pub fn runtime() -> Result<Arc<Runtime>> {
    RUNTIME
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(RtError::NotInitialized)
}

/// See [`Runtime::set_device`].
///
/// # Errors
///
/// See [`Runtime::set_device`].
pub fn set_device(device_id: u32) -> Result<()> {
    runtime()?.set_device(device_id)
}

/// See [`Runtime::device_reset`].
///
/// # Errors
///
/// See [`Runtime::device_reset`].
pub fn device_reset(device_id: u32) -> Result<()> {
    runtime()?.device_reset(device_id)
}

/// See [`Runtime::get_device`].
///
/// # Errors
///
/// See [`Runtime::get_device`].
pub fn get_device() -> Result<u32> {
    runtime()?.get_device()
}

/// See [`Runtime::run_mode`].
///
/// # Errors
///
/// `NotInitialized` outside an `init`/`deinit` pair.
pub fn get_run_mode() -> Result<RunMode> {
    Ok(runtime()?.run_mode())
}

/// See [`Runtime::ctx_create`].
///
/// # Errors
///
/// See [`Runtime::ctx_create`].
pub fn ctx_create(flags: u32, device_id: u32) -> Result<ContextHandle> {
    runtime()?.ctx_create(flags, device_id)
}

/// See [`Runtime::ctx_destroy`].
///
/// # Errors
///
/// See [`Runtime::ctx_destroy`].
pub fn ctx_destroy(ctx: ContextHandle) -> Result<()> {
    runtime()?.ctx_destroy(ctx)
}

/// See [`Runtime::ctx_get_current`].
///
/// # Errors
///
/// See [`Runtime::ctx_get_current`].
pub fn ctx_get_current() -> Result<ContextHandle> {
    runtime()?.ctx_get_current()
}

/// See [`Runtime::ctx_set_current`].
///
/// # Errors
///
/// See [`Runtime::ctx_set_current`].
pub fn ctx_set_current(ctx: Option<ContextHandle>) -> Result<()> {
    runtime()?.ctx_set_current(ctx)
}

/// See [`Runtime::stream_create`].
///
/// # Errors
///
/// See [`Runtime::stream_create`].
pub fn stream_create(config: &StreamConfig) -> Result<StreamHandle> {
    runtime()?.stream_create(config)
}

/// See [`Runtime::stream_destroy`].
///
/// # Errors
///
/// See [`Runtime::stream_destroy`].
pub fn stream_destroy(stream: StreamHandle) -> Result<()> {
    runtime()?.stream_destroy(stream)
}

/// See [`Runtime::stream_synchronize`].
///
/// # Errors
///
/// See [`Runtime::stream_synchronize`].
pub fn stream_synchronize(stream: StreamHandle) -> Result<()> {
    runtime()?.stream_synchronize(stream)
}

/// See [`Runtime::stream_sqid`].
///
/// # Errors
///
/// See [`Runtime::stream_sqid`].
pub fn stream_sqid(stream: StreamHandle) -> Result<u32> {
    runtime()?.stream_sqid(stream)
}

/// See [`Runtime::stream_workspace`].
///
/// # Errors
///
/// See [`Runtime::stream_workspace`].
pub fn stream_workspace(stream: StreamHandle) -> Result<Option<Workspace>> {
    runtime()?.stream_workspace(stream)
}

/// See [`Runtime::subscribe_report`].
///
/// # Errors
///
/// See [`Runtime::subscribe_report`].
pub fn subscribe_report(thread_id: u64, stream: StreamHandle) -> Result<()> {
    runtime()?.subscribe_report(thread_id, stream)
}

/// See [`Runtime::unsubscribe_report`].
///
/// # Errors
///
/// See [`Runtime::unsubscribe_report`].
pub fn unsubscribe_report(thread_id: u64, stream: StreamHandle) -> Result<()> {
    runtime()?.unsubscribe_report(thread_id, stream)
}

/// See [`Runtime::subscribe_host_func`].
///
/// # Errors
///
/// See [`Runtime::subscribe_host_func`].
pub fn subscribe_host_func(thread_id: u64, stream: StreamHandle) -> Result<()> {
    runtime()?.subscribe_host_func(thread_id, stream)
}

/// See [`Runtime::unsubscribe_host_func`].
///
/// # Errors
///
/// See [`Runtime::unsubscribe_host_func`].
pub fn unsubscribe_host_func(thread_id: u64, stream: StreamHandle) -> Result<()> {
    runtime()?.unsubscribe_host_func(thread_id, stream)
}

/// See [`Runtime::callback_launch`].
///
/// # Errors
///
/// See [`Runtime::callback_launch`].
pub fn callback_launch<F>(stream: StreamHandle, blocking: bool, func: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    runtime()?.callback_launch(stream, blocking, func)
}

/// See [`Runtime::process_report`].
///
/// # Errors
///
/// See [`Runtime::process_report`].
pub fn process_report(timeout: Option<Duration>) -> Result<()> {
    runtime()?.process_report(timeout)
}

/// See [`Runtime::launch_host_func`].
///
/// # Errors
///
/// See [`Runtime::launch_host_func`].
pub fn launch_host_func<F>(stream: StreamHandle, func: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    runtime()?.launch_host_func(stream, func)
}

/// See [`Runtime::process_host_func`].
///
/// # Errors
///
/// See [`Runtime::process_host_func`].
pub fn process_host_func(timeout: Option<Duration>) -> Result<()> {
    runtime()?.process_host_func(timeout)
}

/// See [`Runtime::malloc`].
///
/// # Errors
///
/// See [`Runtime::malloc`].
pub fn malloc(size: u64, policy: MallocPolicy) -> Result<DevicePtr> {
    runtime()?.malloc(size, policy)
}

/// See [`Runtime::free`].
///
/// # Errors
///
/// See [`Runtime::free`].
pub fn free(ptr: DevicePtr) -> Result<()> {
    runtime()?.free(ptr)
}

/// See [`Runtime::memset`].
///
/// # Errors
///
/// See [`Runtime::memset`].
pub fn memset(ptr: DevicePtr, dest_max: u64, value: u8, count: u64) -> Result<()> {
    runtime()?.memset(ptr, dest_max, value, count)
}

/// See [`Runtime::memcpy_to_device`].
///
/// # Errors
///
/// See [`Runtime::memcpy_to_device`].
pub fn memcpy_to_device(dst: DevicePtr, dest_max: u64, src: &[u8]) -> Result<()> {
    runtime()?.memcpy_to_device(dst, dest_max, src)
}

/// See [`Runtime::memcpy_to_host`].
///
/// # Errors
///
/// See [`Runtime::memcpy_to_host`].
pub fn memcpy_to_host(dst: &mut [u8], src: DevicePtr) -> Result<()> {
    runtime()?.memcpy_to_host(dst, src)
}

/// See [`Runtime::memcpy_on_device`].
///
/// # Errors
///
/// See [`Runtime::memcpy_on_device`].
pub fn memcpy_on_device(dst: DevicePtr, dest_max: u64, src: DevicePtr, count: u64) -> Result<()> {
    runtime()?.memcpy_on_device(dst, dest_max, src, count)
}

/// See [`Runtime::mem_get_info`].
///
/// # Errors
///
/// See [`Runtime::mem_get_info`].
pub fn mem_get_info(attr: MemAttr) -> Result<MemInfo> {
    runtime()?.mem_get_info(attr)
}
