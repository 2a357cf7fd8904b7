//! Streams
//!
//! A stream is one submit/completion queue pair on a device, plus an
//! optional device-memory workspace and two subscriber slots (one per
//! [`ReportKind`]). Streams are owned by the context that created them; the
//! runtime hands out [`StreamHandle`]s that resolve through a weak index.
//!
//! Releasing a stream frees its queue pair and workspace exactly once, no
//! matter how many paths (explicit destroy, context teardown, drop) reach it.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acrt_drv::{
    DevicePtr, DrvError, MallocPolicy, ReportKind, SqCqRequest, TaskKind, SQ_ID_NONE,
    THREAD_ID_UNSUBSCRIBED,
};
use tracing::{debug, warn};

use crate::context::ContextHandle;
use crate::device::Device;
use crate::error::{Result, RtError};

/// Highest accepted stream priority
pub const MAX_STREAM_PRIORITY: u32 = 7;

const NO_TASK: u32 = u32::MAX;

/// Stream creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamConfig {
    /// Scheduling priority, `0..=MAX_STREAM_PRIORITY`, passed to the driver as a QoS hint
    pub priority: u32,
    /// Stream flags, passed through to the driver
    pub flags: u32,
    /// Device memory reserved for the stream; zero for none
    pub workspace_size: u64,
}

impl StreamConfig {
    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the flags
    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Set the workspace size
    #[must_use]
    pub fn with_workspace_size(mut self, workspace_size: u64) -> Self {
        self.workspace_size = workspace_size;
        self
    }
}

/// Process-wide stream id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(u32);

impl StreamHandle {
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Stream id
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }

    /// Opaque non-zero word for the C ABI
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0 as u64 + 1
    }

    /// Inverse of [`to_raw`](Self::to_raw)
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let id = raw.checked_sub(1)?;
        u32::try_from(id).ok().map(Self)
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Device memory reserved for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workspace {
    /// Base address
    pub ptr: DevicePtr,
    /// Size in bytes
    pub size: u64,
}

/// Queue pair owned by a context
#[derive(Debug)]
pub struct Stream {
    id: u32,
    context: ContextHandle,
    device: Arc<Device>,
    sq_id: AtomicU32,
    cq_id: u32,
    priority: u32,
    flags: u32,
    subscribers: [AtomicU64; 2],
    subscribe_ids: [AtomicU64; 2],
    workspace: Option<Workspace>,
    last_task_id: AtomicU32,
}

impl Stream {
    /// Allocate the queue pair and workspace.
    pub(crate) fn create(
        id: u32,
        context: ContextHandle,
        device: &Arc<Device>,
        config: &StreamConfig,
    ) -> Result<Self> {
        if config.priority > MAX_STREAM_PRIORITY {
            return Err(RtError::InvalidParam);
        }
        let hal = device.hal();
        let request = SqCqRequest {
            priority: config.priority,
            flags: config.flags,
        };
        let queue = hal
            .sq_cq_allocate(device.id(), &request)
            .map_err(RtError::from_drv)?;

        let workspace = if config.workspace_size == 0 {
            None
        } else {
            match hal.mem_alloc(device.id(), config.workspace_size, MallocPolicy::HugeFirst) {
                Ok(ptr) => Some(Workspace {
                    ptr,
                    size: config.workspace_size,
                }),
                Err(e) => {
                    if let Err(free) = hal.sq_cq_free(device.id(), queue.sq_id) {
                        warn!("Freeing sq {} after workspace failure: {free}", queue.sq_id);
                    }
                    return Err(RtError::from_drv(e));
                }
            }
        };

        debug!(
            "Created stream {id} (sq {}, cq {}, priority {}) in {context}",
            queue.sq_id, queue.cq_id, config.priority
        );
        Ok(Self {
            id,
            context,
            device: Arc::clone(device),
            sq_id: AtomicU32::new(queue.sq_id),
            cq_id: queue.cq_id,
            priority: config.priority,
            flags: config.flags,
            subscribers: [
                AtomicU64::new(THREAD_ID_UNSUBSCRIBED),
                AtomicU64::new(THREAD_ID_UNSUBSCRIBED),
            ],
            subscribe_ids: [AtomicU64::new(0), AtomicU64::new(0)],
            workspace,
            last_task_id: AtomicU32::new(NO_TASK),
        })
    }

    /// Stream id
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Handle resolving to this stream
    pub const fn handle(&self) -> StreamHandle {
        StreamHandle(self.id)
    }

    /// Owning context
    pub const fn context(&self) -> ContextHandle {
        self.context
    }

    /// Device the queue pair lives on
    pub fn device_id(&self) -> u32 {
        self.device.id()
    }

    /// Submit-queue id
    ///
    /// # Errors
    ///
    /// `StreamNull` once the stream has been released.
    pub fn sq_id(&self) -> Result<u32> {
        match self.sq_id.load(Ordering::Acquire) {
            SQ_ID_NONE => Err(RtError::StreamNull),
            sq => Ok(sq),
        }
    }

    /// Completion-queue id
    pub const fn cq_id(&self) -> u32 {
        self.cq_id
    }

    /// Priority
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    /// Flags
    pub const fn flags(&self) -> u32 {
        self.flags
    }

    /// Workspace, if one was requested
    pub const fn workspace(&self) -> Option<Workspace> {
        self.workspace
    }

    /// Id of the last task posted
    pub fn last_task_id(&self) -> Option<u32> {
        match self.last_task_id.load(Ordering::Acquire) {
            NO_TASK => None,
            task => Some(task),
        }
    }

    /// Thread subscribed for `kind`
    pub fn subscriber(&self, kind: ReportKind) -> Option<u64> {
        match self.subscribers[kind.index()].load(Ordering::Acquire) {
            THREAD_ID_UNSUBSCRIBED => None,
            thread_id => Some(thread_id),
        }
    }

    /// Whether the queue pair has been freed
    pub fn is_released(&self) -> bool {
        self.sq_id.load(Ordering::Acquire) == SQ_ID_NONE
    }

    /// Claim the `kind` slot for `thread_id`.
    pub(crate) fn claim_subscriber(&self, kind: ReportKind, thread_id: u64) -> Result<()> {
        self.subscribers[kind.index()]
            .compare_exchange(
                THREAD_ID_UNSUBSCRIBED,
                thread_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(drop)
            .map_err(|_| RtError::StreamAlreadySubscribed)
    }

    /// Record the driver subscribe id of the `kind` slot's holder.
    pub(crate) fn set_subscribe_id(&self, kind: ReportKind, subscribe_id: u64) {
        self.subscribe_ids[kind.index()].store(subscribe_id, Ordering::Release);
    }

    /// Give up the `kind` slot held by `thread_id`, returning the subscribe
    /// id recorded for it.
    pub(crate) fn release_subscriber(&self, kind: ReportKind, thread_id: u64) -> Result<u64> {
        let subscribe_id = self.subscribe_ids[kind.index()].load(Ordering::Acquire);
        self.subscribers[kind.index()]
            .compare_exchange(
                thread_id,
                THREAD_ID_UNSUBSCRIBED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| subscribe_id)
            .map_err(|_| RtError::StreamSubscribeMismatch)
    }

    pub(crate) fn hal_subscribe(&self, kind: ReportKind, subscribe_id: u64) -> Result<()> {
        let sq = self.sq_id()?;
        self.device
            .hal()
            .subscribe_tid(self.device.id(), sq, kind, subscribe_id)
            .map_err(RtError::from_drv)
    }

    pub(crate) fn hal_unsubscribe(&self, kind: ReportKind, subscribe_id: u64) -> Result<()> {
        let sq = self.sq_id()?;
        self.device
            .hal()
            .unsubscribe_tid(self.device.id(), sq, kind, subscribe_id)
            .map_err(RtError::from_drv)
    }

    /// Post a task, returning its id.
    pub(crate) fn submit(&self, task: TaskKind) -> Result<u32> {
        let sq = self.sq_id()?;
        let task_id = self
            .device
            .hal()
            .submit(self.device.id(), sq, task)
            .map_err(RtError::from_drv)?;
        self.last_task_id.store(task_id, Ordering::Release);
        Ok(task_id)
    }

    /// Block until everything posted so far has completed.
    ///
    /// # Errors
    ///
    /// `WaitTimeout` if `timeout` elapses first, `StreamNull` for a released
    /// stream, otherwise the translated driver error.
    pub fn synchronize(&self, timeout: Option<Duration>) -> Result<()> {
        let task_id = self.submit(TaskKind::Null)?;
        let sq = self.sq_id()?;
        self.device
            .hal()
            .wait_complete(self.device.id(), sq, task_id, timeout)
            .map_err(|e| match e {
                DrvError::WaitTimeout => RtError::WaitTimeout,
                other => RtError::from_drv(other),
            })
    }

    /// Free the queue pair and workspace. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the translated driver error of the queue free; the stream
    /// counts as released either way.
    pub fn release(&self) -> Result<()> {
        let sq = self.sq_id.swap(SQ_ID_NONE, Ordering::AcqRel);
        if sq == SQ_ID_NONE {
            return Ok(());
        }
        let hal = self.device.hal();
        if let Some(ws) = self.workspace {
            if let Err(e) = hal.mem_free(self.device.id(), ws.ptr) {
                warn!("Freeing workspace of stream {} failed: {e}", self.id);
            }
        }
        hal.sq_cq_free(self.device.id(), sq)
            .map_err(RtError::from_drv)?;
        debug!("Released stream {} (sq {sq})", self.id);
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Stream {} dropped with a failed release: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceTable;
    use crate::hals::{HalOp, SoftwareHal, SoftwareHalConfig};
    use crate::mem_pool::MemHandle;
    use crate::spin::SpinPolicy;

    fn device() -> (Arc<SoftwareHal>, DeviceTable, Arc<Device>) {
        let hal = Arc::new(SoftwareHal::new(SoftwareHalConfig::default()));
        let table = DeviceTable::new(hal.clone(), 1, SpinPolicy::DEFAULT);
        let device = table.retain(0).unwrap();
        (hal, table, device)
    }

    fn ctx() -> ContextHandle {
        ContextHandle::from(MemHandle::from_raw(1).unwrap())
    }

    #[test]
    fn release_frees_queue_and_workspace_once() {
        let (hal, _table, device) = device();
        let config = StreamConfig::default()
            .with_priority(3)
            .with_workspace_size(4096);
        let stream = Stream::create(9, ctx(), &device, &config).unwrap();
        let sq = stream.sq_id().unwrap();
        assert_eq!(hal.queue_priority(0, sq), Some(3));
        assert_eq!(hal.allocated_bytes(0), 4096);
        assert_eq!(stream.workspace().map(|w| w.size), Some(4096));

        stream.release().unwrap();
        stream.release().unwrap();
        assert!(stream.is_released());
        assert_eq!(stream.sq_id(), Err(RtError::StreamNull));
        assert!(!hal.has_queue(0, sq));
        assert_eq!(hal.allocated_bytes(0), 0);
    }

    #[test]
    fn drop_releases_the_queue() {
        let (hal, _table, device) = device();
        let stream = Stream::create(1, ctx(), &device, &StreamConfig::default()).unwrap();
        assert_eq!(hal.queue_count(0), 1);
        drop(stream);
        assert_eq!(hal.queue_count(0), 0);
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let (hal, _table, device) = device();
        let config = StreamConfig::default().with_priority(MAX_STREAM_PRIORITY + 1);
        assert_eq!(
            Stream::create(1, ctx(), &device, &config).unwrap_err(),
            RtError::InvalidParam
        );
        assert_eq!(hal.queue_count(0), 0);
    }

    #[test]
    fn workspace_failure_frees_the_queue() {
        let (hal, _table, device) = device();
        hal.fail_next(HalOp::MemAlloc, DrvError::OutOfMemory);
        let config = StreamConfig::default().with_workspace_size(64);
        assert_eq!(
            Stream::create(1, ctx(), &device, &config).unwrap_err(),
            RtError::MemoryAllocation
        );
        assert_eq!(hal.queue_count(0), 0);
    }

    #[test]
    fn synchronize_completes_and_tracks_task_ids() {
        let (_hal, _table, device) = device();
        let stream = Stream::create(1, ctx(), &device, &StreamConfig::default()).unwrap();
        assert_eq!(stream.last_task_id(), None);
        stream.synchronize(None).unwrap();
        stream.synchronize(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(stream.last_task_id(), Some(1));
    }

    #[test]
    fn synchronize_timeout_is_wait_timeout() {
        let (hal, _table, device) = device();
        let stream = Stream::create(1, ctx(), &device, &StreamConfig::default()).unwrap();
        hal.fail_next(HalOp::WaitComplete, DrvError::WaitTimeout);
        assert_eq!(stream.synchronize(None), Err(RtError::WaitTimeout));
        stream.release().unwrap();
        assert_eq!(stream.synchronize(None), Err(RtError::StreamNull));
    }

    #[test]
    fn subscriber_slots_are_independent() {
        let (_hal, _table, device) = device();
        let stream = Stream::create(1, ctx(), &device, &StreamConfig::default()).unwrap();
        stream.claim_subscriber(ReportKind::Callback, 10).unwrap();
        assert_eq!(
            stream.claim_subscriber(ReportKind::Callback, 11),
            Err(RtError::StreamAlreadySubscribed)
        );
        stream.claim_subscriber(ReportKind::HostFunc, 11).unwrap();
        stream.set_subscribe_id(ReportKind::HostFunc, 0x11);
        assert_eq!(
            stream.release_subscriber(ReportKind::Callback, 11),
            Err(RtError::StreamSubscribeMismatch)
        );
        assert_eq!(stream.subscriber(ReportKind::Callback), Some(10));
        stream.release_subscriber(ReportKind::Callback, 10).unwrap();
        assert_eq!(stream.subscriber(ReportKind::Callback), None);
        assert_eq!(stream.release_subscriber(ReportKind::HostFunc, 11), Ok(0x11));
    }

    #[test]
    fn handle_raw_encoding_skips_zero() {
        let h = StreamHandle::new(0);
        assert_eq!(h.to_raw(), 1);
        assert_eq!(StreamHandle::from_raw(1), Some(h));
        assert_eq!(StreamHandle::from_raw(0), None);
        assert_eq!(StreamHandle::from_raw(u64::MAX), None);
    }
}
