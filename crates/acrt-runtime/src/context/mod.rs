//! Contexts and the current-context registry
//!
//! A context binds a device reference to the streams created under it.
//! Contexts live in a [`MemPool`]; callers hold a [`ContextHandle`] (pool
//! index plus allocation sequence), never the context itself, so a handle
//! used after destroy resolves to `ContextNull` instead of a reused node.
//!
//! ```text
//! create:  retain device -> pool alloc -> register current
//! destroy: pool free -> clear current -> tear down streams -> release device
//! ```

pub mod registry;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use crate::config::{Platform, RuntimeConfig};
use crate::device::{Device, DeviceTable};
use crate::error::{Result, RtError};
use crate::mem_pool::{MemHandle, MemPool};
use crate::ref_obj::{AcquireError, RefObj, ReleaseError};
use crate::stream::{Stream, StreamConfig};

pub use registry::{new_registry, ContextRegistry, TaskTableRegistry, ThreadLocalRegistry};

/// Reference to a pooled context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(MemHandle);

impl ContextHandle {
    /// Opaque non-zero word for the C ABI.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    /// Inverse of [`to_raw`](Self::to_raw). Zero is not a context.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match MemHandle::from_raw(raw) {
            Some(handle) => Some(Self(handle)),
            None => None,
        }
    }
}

impl From<MemHandle> for ContextHandle {
    fn from(handle: MemHandle) -> Self {
        Self(handle)
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}.{}", self.0.index(), self.0.seq())
    }
}

#[derive(Debug, Default)]
struct StreamList {
    streams: Vec<Arc<Stream>>,
    closed: bool,
}

/// Device binding plus the streams created under it
#[derive(Debug)]
pub struct Context {
    device: Arc<Device>,
    flags: u32,
    primary: bool,
    streams: Mutex<StreamList>,
    #[cfg(test)]
    fail_next_record: std::sync::atomic::AtomicBool,
}

impl Context {
    fn new(device: Arc<Device>, flags: u32, primary: bool) -> Self {
        Self {
            device,
            flags,
            primary,
            streams: Mutex::new(StreamList::default()),
            #[cfg(test)]
            fail_next_record: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn lock_streams(&self) -> MutexGuard<'_, StreamList> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device the context runs on
    pub fn device_id(&self) -> u32 {
        self.device.id()
    }

    /// Device handle
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Creation flags
    pub const fn flags(&self) -> u32 {
        self.flags
    }

    /// Whether this is a device's primary context
    pub const fn is_primary(&self) -> bool {
        self.primary
    }

    /// Streams currently owned
    pub fn stream_count(&self) -> usize {
        self.lock_streams().streams.len()
    }

    /// Snapshot of the owned streams
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.lock_streams().streams.clone()
    }

    /// Whether `stream` is owned by this context
    pub fn owns_stream(&self, stream: &Stream) -> bool {
        self.lock_streams()
            .streams
            .iter()
            .any(|s| std::ptr::eq(s.as_ref(), stream))
    }

    /// Create a stream owned by this context.
    ///
    /// `owner` must be this context's handle.
    pub(crate) fn create_stream(
        &self,
        owner: ContextHandle,
        id: u32,
        config: &StreamConfig,
    ) -> Result<Arc<Stream>> {
        let stream = Arc::new(Stream::create(id, owner, &self.device, config)?);
        let mut list = self.lock_streams();
        if list.closed {
            drop(list);
            debug!("Context {owner} destroyed while creating stream {id}");
            stream.release()?;
            return Err(RtError::ContextNull);
        }
        if !self.reserve_stream(&mut list) {
            drop(list);
            error!("Cannot record stream {id} in context {owner}");
            if let Err(e) = stream.release() {
                warn!("Releasing stream {id} after failed create: {e}");
            }
            return Err(RtError::Internal);
        }
        list.streams.push(Arc::clone(&stream));
        Ok(stream)
    }

    fn reserve_stream(&self, list: &mut StreamList) -> bool {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self.fail_next_record.swap(false, Ordering::Relaxed) {
                return false;
            }
        }
        list.streams.try_reserve(1).is_ok()
    }

    /// Remove `stream` from the owned set. Not found is a no-op returning
    /// `false`. The caller releases the stream.
    pub(crate) fn detach_stream(&self, stream: &Stream) -> bool {
        let mut list = self.lock_streams();
        match list
            .streams
            .iter()
            .position(|s| std::ptr::eq(s.as_ref(), stream))
        {
            Some(pos) => {
                list.streams.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Close the stream list and release every stream. Returns their ids.
    fn teardown(&self) -> Vec<u32> {
        let streams = {
            let mut list = self.lock_streams();
            list.closed = true;
            std::mem::take(&mut list.streams)
        };
        streams
            .iter()
            .map(|stream| {
                if let Err(e) = stream.release() {
                    warn!("Releasing stream {} failed: {e}", stream.id());
                }
                stream.id()
            })
            .collect()
    }
}

/// Context pool, current-context registry and per-device primary contexts
#[derive(Debug)]
pub(crate) struct ContextManager {
    pool: MemPool<Context>,
    registry: Box<dyn ContextRegistry>,
    primaries: Box<[RefObj<ContextHandle>]>,
}

impl ContextManager {
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        Self {
            pool: MemPool::new(
                "context",
                config.context_pool_capacity,
                config.context_pool_policy,
            ),
            registry: new_registry(config.platform),
            primaries: (0..config.max_devices)
                .map(|_| RefObj::with_spin_policy(config.spin))
                .collect(),
        }
    }

    pub(crate) fn platform(&self) -> Platform {
        self.registry.platform()
    }

    /// Create a context on `device_id` and make it current.
    pub(crate) fn create(
        &self,
        devices: &DeviceTable,
        device_id: u32,
        flags: u32,
    ) -> Result<ContextHandle> {
        let handle = self.create_detached(devices, device_id, flags, false)?;
        if let Err(e) = self.registry.set_current(Some(handle)) {
            error!("Cannot make {handle} current: {e}");
            if let Err(unwind) = self.destroy(devices, handle) {
                warn!("Unwinding {handle} failed: {unwind}");
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn create_detached(
        &self,
        devices: &DeviceTable,
        device_id: u32,
        flags: u32,
        primary: bool,
    ) -> Result<ContextHandle> {
        let device = devices.retain(device_id).map_err(|e| match e {
            RtError::InvalidDeviceId => e,
            other => {
                error!("Device {device_id} setup failed: {other}");
                RtError::DevSetup
            }
        })?;
        let Some(handle) = self.pool.alloc(Context::new(device, flags, primary)) else {
            if let Err(e) = devices.release(device_id) {
                warn!("Unwinding device {device_id} retain failed: {e}");
            }
            return Err(RtError::MemoryAllocation);
        };
        let handle = ContextHandle(handle);
        info!("Created context {handle} on device {device_id}");
        Ok(handle)
    }

    /// Destroy a context. Returns the ids of the streams it tore down.
    pub(crate) fn destroy(&self, devices: &DeviceTable, handle: ContextHandle) -> Result<Vec<u32>> {
        let mut taken = None;
        if !self.pool.free_with(handle.0, |ctx| taken = Some(ctx)) {
            return Err(RtError::ContextNull);
        }
        let Some(ctx) = taken else {
            return Err(RtError::ContextNull);
        };
        self.registry.forget(handle);
        let streams = ctx.teardown();
        if let Err(e) = devices.release(ctx.device_id()) {
            warn!("Releasing device {} for {handle} failed: {e}", ctx.device_id());
        }
        info!(
            "Destroyed context {handle} ({} stream(s) torn down)",
            streams.len()
        );
        Ok(streams)
    }

    /// Live context behind `handle`
    pub(crate) fn get(&self, handle: ContextHandle) -> Result<Arc<Context>> {
        self.pool.get(handle.0).ok_or(RtError::ContextNull)
    }

    /// Caller's current context. A stale registration is cleared.
    pub(crate) fn current(&self) -> Result<(ContextHandle, Arc<Context>)> {
        let handle = self.registry.current().ok_or(RtError::ContextNull)?;
        if let Some(ctx) = self.pool.get(handle.0) {
            return Ok((handle, ctx));
        }
        debug!("Current context {handle} is stale");
        self.registry.clear_if_current(handle);
        Err(RtError::ContextNull)
    }

    /// Register `handle` (validated) as current, or clear with `None`.
    pub(crate) fn set_current(&self, handle: Option<ContextHandle>) -> Result<()> {
        if let Some(handle) = handle {
            if !self.pool.mem_match_seq(handle.0) {
                return Err(RtError::ContextNull);
            }
        }
        self.registry.set_current(handle)
    }

    fn primary_slot(&self, device_id: u32) -> Result<&RefObj<ContextHandle>> {
        self.primaries
            .get(device_id as usize)
            .ok_or(RtError::InvalidDeviceId)
    }

    /// Take a reference to the device's primary context, creating it first.
    pub(crate) fn acquire_primary(
        &self,
        devices: &DeviceTable,
        device_id: u32,
    ) -> Result<ContextHandle> {
        self.primary_slot(device_id)?
            .acquire(|| self.create_detached(devices, device_id, 0, true))
            .map(|handle| *handle)
            .map_err(|e| match e {
                AcquireError::Create(e) => e,
                AcquireError::Overflow | AcquireError::RetryExhausted => {
                    warn!("Primary context of device {device_id}: {e}");
                    RtError::Internal
                }
            })
    }

    /// Drop a reference to the device's primary context, destroying it on
    /// last release. Returns the ids of streams torn down with it.
    pub(crate) fn release_primary(
        &self,
        devices: &DeviceTable,
        device_id: u32,
    ) -> Result<Vec<u32>> {
        let mut streams = Vec::new();
        self.primary_slot(device_id)?
            .release(|handle| {
                match self.destroy(devices, *handle) {
                    Ok(ids) => streams = ids,
                    Err(e) => warn!("Destroying primary context {handle} failed: {e}"),
                }
            })
            .map_err(|e| match e {
                ReleaseError::NotAcquired => RtError::InvalidParam,
                ReleaseError::RetryExhausted => RtError::Internal,
            })?;
        Ok(streams)
    }

    /// Release every outstanding reference to every primary context.
    /// Returns the ids of streams torn down with them.
    pub(crate) fn drain_primaries(&self, devices: &DeviceTable) -> Vec<u32> {
        let mut streams = Vec::new();
        for device_id in (0u32..).take(self.primaries.len()) {
            loop {
                match self.release_primary(devices, device_id) {
                    Ok(ids) => streams.extend(ids),
                    Err(RtError::InvalidParam) => break,
                    Err(e) => {
                        warn!("Draining primary context of device {device_id}: {e}");
                        break;
                    }
                }
            }
        }
        streams
    }

    /// References held on the device's primary context
    pub(crate) fn primary_ref_count(&self, device_id: u32) -> u64 {
        self.primary_slot(device_id).map_or(0, RefObj::ref_count)
    }

    pub(crate) fn live_handles(&self) -> Vec<ContextHandle> {
        self.pool
            .live_handles()
            .into_iter()
            .map(ContextHandle)
            .collect()
    }

    pub(crate) fn live_count(&self) -> u32 {
        self.pool.live_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hals::{HalOp, SoftwareHal, SoftwareHalConfig};
    use crate::mem_pool::PoolPolicy;
    use acrt_drv::DrvError;

    struct Fixture {
        hal: Arc<SoftwareHal>,
        devices: DeviceTable,
        contexts: ContextManager,
    }

    fn fixture(config: RuntimeConfig) -> Fixture {
        let hal = Arc::new(SoftwareHal::new(SoftwareHalConfig::default()));
        Fixture {
            devices: DeviceTable::new(hal.clone(), config.max_devices, config.spin),
            contexts: ContextManager::new(&config),
            hal,
        }
    }

    #[test]
    fn create_registers_current_and_destroy_clears_it() {
        let f = fixture(RuntimeConfig::default());
        let h = f.contexts.create(&f.devices, 0, 0).unwrap();
        assert_eq!(f.contexts.current().unwrap().0, h);
        assert_eq!(f.devices.ref_count(0), 1);

        f.contexts.destroy(&f.devices, h).unwrap();
        assert_eq!(f.contexts.current().unwrap_err(), RtError::ContextNull);
        assert_eq!(f.devices.ref_count(0), 0);
        assert_eq!(f.hal.close_count(0), 1);
    }

    #[test]
    fn destroy_twice_reports_context_null() {
        let f = fixture(RuntimeConfig::default());
        let h = f.contexts.create(&f.devices, 0, 0).unwrap();
        f.contexts.destroy(&f.devices, h).unwrap();
        assert_eq!(f.contexts.destroy(&f.devices, h), Err(RtError::ContextNull));
        assert_eq!(f.devices.ref_count(0), 0);
    }

    #[test]
    fn invalid_device_passes_through_other_failures_become_dev_setup() {
        let f = fixture(RuntimeConfig::default());
        assert_eq!(
            f.contexts.create(&f.devices, 5, 0),
            Err(RtError::InvalidDeviceId)
        );
        f.hal.fail_next(HalOp::DeviceOpen, DrvError::BusDown);
        assert_eq!(f.contexts.create(&f.devices, 0, 0), Err(RtError::DevSetup));
        assert_eq!(f.devices.ref_count(0), 0);
        assert_eq!(f.contexts.live_count(), 0);
    }

    #[test]
    fn pool_exhaustion_unwinds_device_retain() {
        let f = fixture(RuntimeConfig::default().with_context_pool(1, PoolPolicy::Reuse));
        let h = f.contexts.create(&f.devices, 0, 0).unwrap();
        assert_eq!(
            f.contexts.create(&f.devices, 0, 0),
            Err(RtError::MemoryAllocation)
        );
        assert_eq!(f.devices.ref_count(0), 1);
        f.contexts.destroy(&f.devices, h).unwrap();
    }

    #[test]
    fn stale_current_after_reuse_is_detected() {
        let f = fixture(RuntimeConfig::default());
        let old = f.contexts.create(&f.devices, 0, 0).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| f.contexts.destroy(&f.devices, old).unwrap());
        });
        let new = std::thread::scope(|s| {
            s.spawn(|| f.contexts.create(&f.devices, 0, 0).unwrap())
                .join()
                .unwrap()
        });
        assert_eq!(old.0.index(), new.0.index());
        assert_eq!(f.contexts.current().unwrap_err(), RtError::ContextNull);
        assert_eq!(f.contexts.set_current(Some(old)), Err(RtError::ContextNull));
        f.contexts.set_current(Some(new)).unwrap();
        assert_eq!(f.contexts.current().unwrap().0, new);
    }

    #[test]
    fn streams_are_torn_down_with_their_context() {
        let f = fixture(RuntimeConfig::default());
        let h = f.contexts.create(&f.devices, 0, 0).unwrap();
        let ctx = f.contexts.get(h).unwrap();
        let a = ctx.create_stream(h, 1, &StreamConfig::default()).unwrap();
        let b = ctx.create_stream(h, 2, &StreamConfig::default()).unwrap();
        assert_eq!(f.hal.queue_count(0), 2);

        assert!(ctx.detach_stream(&a));
        assert!(!ctx.detach_stream(&a));
        a.release().unwrap();
        assert_eq!(ctx.stream_count(), 1);

        let torn_down = f.contexts.destroy(&f.devices, h).unwrap();
        assert_eq!(torn_down, vec![2]);
        assert!(b.is_released());
        assert_eq!(
            ctx.create_stream(h, 3, &StreamConfig::default()).unwrap_err(),
            RtError::ContextNull
        );
    }

    #[test]
    fn failed_stream_record_releases_the_queue() {
        let f = fixture(RuntimeConfig::default());
        let h = f.contexts.create(&f.devices, 0, 0).unwrap();
        let ctx = f.contexts.get(h).unwrap();
        ctx.fail_next_record.store(true, std::sync::atomic::Ordering::Relaxed);
        let config = StreamConfig::default().with_workspace_size(4096);
        assert_eq!(ctx.create_stream(h, 1, &config).unwrap_err(), RtError::Internal);
        assert_eq!(ctx.stream_count(), 0);
        assert_eq!(f.hal.queue_count(0), 0);
        assert_eq!(f.hal.allocated_bytes(0), 0);

        ctx.create_stream(h, 2, &config).unwrap();
        assert_eq!(f.hal.queue_count(0), 1);
        f.contexts.destroy(&f.devices, h).unwrap();
    }

    #[test]
    fn primary_context_is_shared_and_destroyed_on_last_release() {
        let f = fixture(RuntimeConfig::default());
        let a = f.contexts.acquire_primary(&f.devices, 0).unwrap();
        let b = f.contexts.acquire_primary(&f.devices, 0).unwrap();
        assert_eq!(a, b);
        assert!(f.contexts.get(a).unwrap().is_primary());
        assert_eq!(f.contexts.primary_ref_count(0), 2);

        f.contexts.release_primary(&f.devices, 0).unwrap();
        assert!(f.contexts.get(a).is_ok());
        f.contexts.release_primary(&f.devices, 0).unwrap();
        assert_eq!(f.contexts.get(a).unwrap_err(), RtError::ContextNull);
        assert_eq!(
            f.contexts.release_primary(&f.devices, 0),
            Err(RtError::InvalidParam)
        );
        assert_eq!(f.devices.ref_count(0), 0);
    }

    #[test]
    fn task_table_platform_behaves_like_hosted() {
        let f = fixture(RuntimeConfig::default().with_platform(Platform::TaskTable));
        assert_eq!(f.contexts.platform(), Platform::TaskTable);
        let h = f.contexts.create(&f.devices, 0, 0).unwrap();
        assert_eq!(f.contexts.current().unwrap().0, h);
        f.contexts.destroy(&f.devices, h).unwrap();
        assert_eq!(f.contexts.current().unwrap_err(), RtError::ContextNull);
    }
}
