//! Runtime instance
//!
//! [`Runtime`] owns every piece of process-wide state: the device table, the
//! context pool with its current-context registry, the stream index, the
//! subscription table and pending host work. Most programs use the single
//! instance behind [`crate::api`] and the C ABI; tests and embedders may
//! build as many independent instances as they like.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use acrt_drv::{DevicePtr, MallocPolicy, MemAttr, MemInfo, ReportKind, RunMode};
use tracing::{debug, info, warn};

use crate::config::{Platform, RuntimeConfig};
use crate::context::{ContextHandle, ContextManager};
use crate::device::DeviceTable;
use crate::error::{Result, RtError};
use crate::hal::Hal;
use crate::hals::{SoftwareHal, SoftwareHalConfig};
use crate::report::ReportHub;
use crate::stream::{Stream, StreamConfig, StreamHandle, Workspace};
use crate::subscribe::SubscribeManager;

/// Accelerator runtime instance
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    hal: Arc<dyn Hal>,
    devices: DeviceTable,
    contexts: ContextManager,
    subscriptions: SubscribeManager,
    reports: ReportHub,
    streams: RwLock<HashMap<u32, Weak<Stream>>>,
    next_stream_id: AtomicU32,
}

impl Runtime {
    /// Create a runtime over `hal`.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a configuration with no device slots or an empty
    /// context pool.
    pub fn new(config: RuntimeConfig, hal: Arc<dyn Hal>) -> Result<Self> {
        if config.max_devices == 0 || config.context_pool_capacity == 0 {
            return Err(RtError::InvalidParam);
        }
        info!(
            "Runtime on {} HAL: {} platform, {} device slot(s), {} context(s)",
            hal.hal_type(),
            config.platform,
            config.max_devices,
            config.context_pool_capacity
        );
        Ok(Self {
            devices: DeviceTable::new(Arc::clone(&hal), config.max_devices, config.spin),
            contexts: ContextManager::new(&config),
            subscriptions: SubscribeManager::new(config.platform),
            reports: ReportHub::default(),
            streams: RwLock::new(HashMap::new()),
            next_stream_id: AtomicU32::new(0),
            hal,
            config,
        })
    }

    /// Create a runtime over a fresh simulated driver, returning both.
    ///
    /// # Errors
    ///
    /// Same as [`Runtime::new`].
    pub fn with_software_hal(
        config: RuntimeConfig,
        hal_config: SoftwareHalConfig,
    ) -> Result<(Self, Arc<SoftwareHal>)> {
        let hal = Arc::new(SoftwareHal::new(hal_config));
        let runtime = Self::new(config, hal.clone())?;
        Ok((runtime, hal))
    }

    /// Configuration in effect
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// HAL in use
    pub fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    /// Current-context backend
    pub fn platform(&self) -> Platform {
        self.contexts.platform()
    }

    /// Where the host program runs relative to the device
    pub fn run_mode(&self) -> RunMode {
        self.hal.run_mode()
    }

    /// Devices usable by this runtime
    ///
    /// # Errors
    ///
    /// Returns the translated driver error if enumeration fails.
    pub fn device_count(&self) -> Result<u32> {
        let count = self.hal.device_count().map_err(RtError::from_drv)?;
        Ok(count.min(self.devices.capacity()))
    }

    // ---- devices -------------------------------------------------------

    /// Retain device `device_id` and make its primary context current.
    ///
    /// # Errors
    ///
    /// `InvalidDeviceId` for an unknown device, otherwise the error of the
    /// failing step; partial work is undone.
    pub fn set_device(&self, device_id: u32) -> Result<()> {
        self.devices.retain(device_id)?;
        let primary = match self.contexts.acquire_primary(&self.devices, device_id) {
            Ok(primary) => primary,
            Err(e) => {
                self.unwind_device(device_id);
                return Err(e);
            }
        };
        if let Err(e) = self.contexts.set_current(Some(primary)) {
            match self.contexts.release_primary(&self.devices, device_id) {
                Ok(ids) => self.forget_streams(&ids),
                Err(unwind) => warn!("Unwinding primary context of device {device_id}: {unwind}"),
            }
            self.unwind_device(device_id);
            return Err(e);
        }
        info!("Device {device_id} set, primary context {primary} current");
        Ok(())
    }

    fn unwind_device(&self, device_id: u32) {
        if let Err(e) = self.devices.release(device_id) {
            warn!("Unwinding retain of device {device_id}: {e}");
        }
    }

    /// Undo one [`set_device`](Self::set_device).
    ///
    /// The primary context is destroyed, with its streams, on the last reset.
    ///
    /// # Errors
    ///
    /// `InvalidDeviceId` for an unknown device, `InvalidParam` without a
    /// matching `set_device`.
    pub fn device_reset(&self, device_id: u32) -> Result<()> {
        let torn_down = self.contexts.release_primary(&self.devices, device_id)?;
        self.forget_streams(&torn_down);
        self.devices.release(device_id)?;
        info!("Device {device_id} reset");
        Ok(())
    }

    /// Device of the current context
    ///
    /// # Errors
    ///
    /// `ContextNull` without a current context.
    pub fn get_device(&self) -> Result<u32> {
        Ok(self.contexts.current()?.1.device_id())
    }

    /// Live references to a device
    pub fn device_ref_count(&self, device_id: u32) -> u64 {
        self.devices.ref_count(device_id)
    }

    /// Live references to a device's primary context
    pub fn primary_ref_count(&self, device_id: u32) -> u64 {
        self.contexts.primary_ref_count(device_id)
    }

    // ---- contexts ------------------------------------------------------

    /// Create a context on `device_id` and make it current.
    ///
    /// # Errors
    ///
    /// `InvalidDeviceId`, `DevSetup` if the device cannot be brought up,
    /// `MemoryAllocation` when the context pool is exhausted.
    pub fn ctx_create(&self, flags: u32, device_id: u32) -> Result<ContextHandle> {
        self.contexts.create(&self.devices, device_id, flags)
    }

    /// Destroy a context and every stream it still owns.
    ///
    /// # Errors
    ///
    /// `ContextNull` for a stale handle, `InvalidParam` for a primary
    /// context (use [`device_reset`](Self::device_reset)).
    pub fn ctx_destroy(&self, ctx: ContextHandle) -> Result<()> {
        if self.contexts.get(ctx)?.is_primary() {
            warn!("Refusing to destroy primary context {ctx}");
            return Err(RtError::InvalidParam);
        }
        let torn_down = self.contexts.destroy(&self.devices, ctx)?;
        self.forget_streams(&torn_down);
        Ok(())
    }

    /// The caller's current context
    ///
    /// # Errors
    ///
    /// `ContextNull` if none is registered or the registered one is gone.
    pub fn ctx_get_current(&self) -> Result<ContextHandle> {
        Ok(self.contexts.current()?.0)
    }

    /// Make `ctx` current for the caller, or clear with `None`.
    ///
    /// # Errors
    ///
    /// `ContextNull` for a stale handle.
    pub fn ctx_set_current(&self, ctx: Option<ContextHandle>) -> Result<()> {
        self.contexts.set_current(ctx)
    }

    /// Streams owned by a context
    ///
    /// # Errors
    ///
    /// `ContextNull` for a stale handle.
    pub fn ctx_stream_count(&self, ctx: ContextHandle) -> Result<usize> {
        Ok(self.contexts.get(ctx)?.stream_count())
    }

    /// Live contexts, primary ones included
    pub fn live_context_count(&self) -> u32 {
        self.contexts.live_count()
    }

    // ---- streams -------------------------------------------------------

    fn streams_read(&self) -> RwLockReadGuard<'_, HashMap<u32, Weak<Stream>>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams_write(&self) -> RwLockWriteGuard<'_, HashMap<u32, Weak<Stream>>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream(&self, handle: StreamHandle) -> Result<Arc<Stream>> {
        self.streams_read()
            .get(&handle.id())
            .and_then(Weak::upgrade)
            .filter(|s| !s.is_released())
            .ok_or(RtError::StreamNull)
    }

    fn forget_streams(&self, ids: &[u32]) {
        if ids.is_empty() {
            return;
        }
        let mut index = self.streams_write();
        for id in ids {
            index.remove(id);
            self.reports.discard_stream(*id);
        }
    }

    /// Create a stream in the current context.
    ///
    /// # Errors
    ///
    /// `ContextNull` without a current context, `InvalidParam` for a bad
    /// priority, `StreamResourceExhausted` when the driver has no queue left.
    pub fn stream_create(&self, config: &StreamConfig) -> Result<StreamHandle> {
        let (ctx_handle, ctx) = self.contexts.current()?;
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = ctx.create_stream(ctx_handle, id, config)?;
        let handle = stream.handle();
        self.streams_write().insert(id, Arc::downgrade(&stream));
        Ok(handle)
    }

    /// Destroy a stream of the current context.
    ///
    /// # Errors
    ///
    /// `ContextNull` without a current context, `StreamNull` for a stale
    /// handle, `StreamContextMismatch` if another context owns the stream.
    pub fn stream_destroy(&self, handle: StreamHandle) -> Result<()> {
        let (ctx_handle, ctx) = self.contexts.current()?;
        let stream = self.stream(handle)?;
        if stream.context() != ctx_handle {
            return Err(RtError::StreamContextMismatch);
        }
        if !ctx.detach_stream(&stream) {
            return Err(RtError::StreamNull);
        }
        self.forget_streams(&[stream.id()]);
        stream.release()
    }

    /// Block until all work posted to the stream has completed.
    ///
    /// Bounded by [`RuntimeConfig::stream_sync_timeout`].
    ///
    /// # Errors
    ///
    /// `StreamNull` for a stale handle, `WaitTimeout` when the bound elapses.
    pub fn stream_synchronize(&self, handle: StreamHandle) -> Result<()> {
        self.stream(handle)?
            .synchronize(self.config.stream_sync_timeout)
    }

    /// Submit-queue id of a stream
    ///
    /// # Errors
    ///
    /// `StreamNull` for a stale handle.
    pub fn stream_sqid(&self, handle: StreamHandle) -> Result<u32> {
        self.stream(handle)?.sq_id()
    }

    /// Workspace of a stream
    ///
    /// # Errors
    ///
    /// `StreamNull` for a stale handle.
    pub fn stream_workspace(&self, handle: StreamHandle) -> Result<Option<Workspace>> {
        Ok(self.stream(handle)?.workspace())
    }

    /// Context owning a stream
    ///
    /// # Errors
    ///
    /// `StreamNull` for a stale handle.
    pub fn stream_context(&self, handle: StreamHandle) -> Result<ContextHandle> {
        Ok(self.stream(handle)?.context())
    }

    // ---- subscriptions -------------------------------------------------

    /// Route the stream's callback reports to `thread_id`.
    ///
    /// # Errors
    ///
    /// `StreamAlreadySubscribed` if another thread holds the slot.
    pub fn subscribe_report(&self, thread_id: u64, stream: StreamHandle) -> Result<()> {
        let stream = self.stream(stream)?;
        self.subscriptions
            .subscribe(thread_id, &stream, ReportKind::Callback)
    }

    /// Undo [`subscribe_report`](Self::subscribe_report).
    ///
    /// # Errors
    ///
    /// `StreamSubscribeMismatch` if `thread_id` is not the subscriber.
    pub fn unsubscribe_report(&self, thread_id: u64, stream: StreamHandle) -> Result<()> {
        let stream = self.stream(stream)?;
        self.subscriptions
            .unsubscribe(thread_id, &stream, ReportKind::Callback)
    }

    /// Route the stream's host-function reports to `thread_id`.
    ///
    /// # Errors
    ///
    /// `StreamAlreadySubscribed` if another thread holds the slot.
    pub fn subscribe_host_func(&self, thread_id: u64, stream: StreamHandle) -> Result<()> {
        let stream = self.stream(stream)?;
        self.subscriptions
            .subscribe(thread_id, &stream, ReportKind::HostFunc)
    }

    /// Undo [`subscribe_host_func`](Self::subscribe_host_func).
    ///
    /// # Errors
    ///
    /// `StreamSubscribeMismatch` if `thread_id` is not the subscriber.
    pub fn unsubscribe_host_func(&self, thread_id: u64, stream: StreamHandle) -> Result<()> {
        let stream = self.stream(stream)?;
        self.subscriptions
            .unsubscribe(thread_id, &stream, ReportKind::HostFunc)
    }

    // ---- host work -----------------------------------------------------

    /// Post a callback on the stream for its subscribed thread.
    ///
    /// A blocking callback holds the stream until it has been processed.
    ///
    /// # Errors
    ///
    /// `StreamNoCallbackRegistered` if no thread subscribed to the stream's
    /// callback reports.
    pub fn callback_launch<F>(&self, stream: StreamHandle, blocking: bool, func: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stream = self.stream(stream)?;
        self.reports
            .launch(&stream, ReportKind::Callback, blocking, Box::new(func))
            .map(drop)
    }

    /// Post a host function on the stream. Work after it waits for it.
    ///
    /// # Errors
    ///
    /// `StreamNoCallbackRegistered` if no thread subscribed to the stream's
    /// host-function reports.
    pub fn launch_host_func<F>(&self, stream: StreamHandle, func: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stream = self.stream(stream)?;
        self.reports
            .launch(&stream, ReportKind::HostFunc, true, Box::new(func))
            .map(drop)
    }

    /// Run one callback routed to the calling thread.
    ///
    /// # Errors
    ///
    /// `ReportTimeout` if nothing arrives within `timeout` (`None` waits
    /// forever), `StreamNoCallbackRegistered` if the caller never subscribed.
    pub fn process_report(&self, timeout: Option<Duration>) -> Result<()> {
        self.process(ReportKind::Callback, timeout)
    }

    /// Run one host function routed to the calling thread.
    ///
    /// # Errors
    ///
    /// Same as [`process_report`](Self::process_report).
    pub fn process_host_func(&self, timeout: Option<Duration>) -> Result<()> {
        self.process(ReportKind::HostFunc, timeout)
    }

    fn process(&self, kind: ReportKind, timeout: Option<Duration>) -> Result<()> {
        let subscribe_id = self
            .subscriptions
            .current_subscribe_id()
            .ok_or(RtError::StreamNoCallbackRegistered)?;
        let device_id = self.report_device()?;
        self.reports
            .process(self.hal.as_ref(), device_id, kind, subscribe_id, timeout)
    }

    /// Device whose reports the caller waits on: the current context's, or
    /// the first retained device for threads without one.
    fn report_device(&self) -> Result<u32> {
        if let Ok((_, ctx)) = self.contexts.current() {
            return Ok(ctx.device_id());
        }
        (0..self.devices.capacity())
            .find(|&id| self.devices.ref_count(id) > 0)
            .ok_or(RtError::ContextNull)
    }

    // ---- memory --------------------------------------------------------

    fn current_device(&self) -> Result<u32> {
        self.get_device()
    }

    /// Allocate device memory on the current context's device.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a zero size, `ContextNull` without a current
    /// context, `MemoryAllocation` when the device is full.
    pub fn malloc(&self, size: u64, policy: MallocPolicy) -> Result<DevicePtr> {
        if size == 0 {
            return Err(RtError::InvalidParam);
        }
        let device_id = self.current_device()?;
        let ptr = self
            .hal
            .mem_alloc(device_id, size, policy)
            .map_err(RtError::from_drv)?;
        debug!("Allocated {size} bytes at {ptr:?} on device {device_id}");
        Ok(ptr)
    }

    /// Free device memory.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a null or unknown pointer.
    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Err(RtError::InvalidParam);
        }
        let device_id = self.current_device()?;
        self.hal
            .mem_free(device_id, ptr)
            .map_err(RtError::from_drv)
    }

    /// Fill `count` bytes at `ptr` with `value`.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a null pointer or `count > dest_max`.
    pub fn memset(&self, ptr: DevicePtr, dest_max: u64, value: u8, count: u64) -> Result<()> {
        if ptr.is_null() || count > dest_max {
            return Err(RtError::InvalidParam);
        }
        if count == 0 {
            return Ok(());
        }
        let device_id = self.current_device()?;
        self.hal
            .mem_set(device_id, ptr, value, count)
            .map_err(RtError::from_drv)
    }

    /// Copy host bytes to device memory.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a null pointer or a source longer than `dest_max`.
    pub fn memcpy_to_device(&self, dst: DevicePtr, dest_max: u64, src: &[u8]) -> Result<()> {
        if dst.is_null() || src.len() as u64 > dest_max {
            return Err(RtError::InvalidParam);
        }
        if src.is_empty() {
            return Ok(());
        }
        let device_id = self.current_device()?;
        self.hal
            .mem_write(device_id, dst, src)
            .map_err(RtError::from_drv)
    }

    /// Copy device memory to host bytes; fills all of `dst`.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a null pointer.
    pub fn memcpy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        if src.is_null() {
            return Err(RtError::InvalidParam);
        }
        if dst.is_empty() {
            return Ok(());
        }
        let device_id = self.current_device()?;
        self.hal
            .mem_read(device_id, src, dst)
            .map_err(RtError::from_drv)
    }

    /// Copy `count` bytes within device memory.
    ///
    /// # Errors
    ///
    /// `InvalidParam` for a null pointer or `count > dest_max`.
    pub fn memcpy_on_device(
        &self,
        dst: DevicePtr,
        dest_max: u64,
        src: DevicePtr,
        count: u64,
    ) -> Result<()> {
        if dst.is_null() || src.is_null() || count > dest_max {
            return Err(RtError::InvalidParam);
        }
        if count == 0 {
            return Ok(());
        }
        let device_id = self.current_device()?;
        self.hal
            .mem_copy(device_id, dst, src, count)
            .map_err(RtError::from_drv)
    }

    /// Free and total memory of the current context's device.
    ///
    /// # Errors
    ///
    /// `ContextNull` without a current context.
    pub fn mem_get_info(&self, attr: MemAttr) -> Result<MemInfo> {
        let device_id = self.current_device()?;
        self.hal
            .mem_info(device_id, attr)
            .map_err(RtError::from_drv)
    }

    // ---- teardown ------------------------------------------------------

    /// Destroy every live context and close every device.
    ///
    /// Handles held by callers become stale. Runs on drop.
    pub fn shutdown(&self) {
        let primaries = self.contexts.drain_primaries(&self.devices);
        self.forget_streams(&primaries);
        let live = self.contexts.live_handles();
        if !live.is_empty() {
            info!("Shutting down {} live context(s)", live.len());
        }
        for handle in live {
            match self.contexts.destroy(&self.devices, handle) {
                Ok(ids) => self.forget_streams(&ids),
                Err(e) => debug!("Context {handle} went away during shutdown: {e}"),
            }
        }
        self.devices.release_all();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        info!("Runtime dropped");
    }
}
