//! Host work delivered through completion reports
//!
//! Launching host work posts a host task on the stream's queue and records
//! the closure under `(device, sq, task)`. The driver delivers a report for
//! that task to the subscribed thread; the thread's `process` call looks the
//! closure up, runs it and releases the report, which unblocks the queue
//! for blocking launches.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use acrt_drv::{ReportKind, TaskKind};
use tracing::{debug, warn};

use crate::error::{Result, RtError};
use crate::hal::Hal;
use crate::stream::Stream;

/// Host closure run by the processing thread
pub type HostFn = Box<dyn FnOnce() + Send + 'static>;

type PendingKey = (u32, u32, u32);

struct PendingCall {
    stream_id: u32,
    func: HostFn,
}

#[derive(Default)]
pub(crate) struct ReportHub {
    pending: Mutex<HashMap<PendingKey, PendingCall>>,
}

impl fmt::Debug for ReportHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportHub")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ReportHub {
    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post `func` on `stream` for the subscriber of `kind`.
    ///
    /// Returns the task id.
    pub(crate) fn launch(
        &self,
        stream: &Stream,
        kind: ReportKind,
        blocking: bool,
        func: HostFn,
    ) -> Result<u32> {
        if stream.subscriber(kind).is_none() {
            return Err(RtError::StreamNoCallbackRegistered);
        }
        let sq = stream.sq_id()?;
        // Held across submit so the processing thread cannot look the task
        // up before it is recorded.
        let mut pending = self.lock();
        pending
            .try_reserve(1)
            .map_err(|_| RtError::MemoryAllocation)?;
        let task = stream.submit(TaskKind::Host { kind, blocking })?;
        pending.insert(
            (stream.device_id(), sq, task),
            PendingCall {
                stream_id: stream.id(),
                func,
            },
        );
        debug!(
            "Launched {kind:?} task {task} on stream {} (blocking: {blocking})",
            stream.id()
        );
        Ok(task)
    }

    /// Wait for one report of `kind` routed to `subscribe_id`, run its
    /// closure and release it.
    ///
    /// # Errors
    ///
    /// `ReportTimeout` if nothing arrives within `timeout`; `None` waits
    /// forever.
    pub(crate) fn process(
        &self,
        hal: &dyn Hal,
        device_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let report = hal
            .report_wait(device_id, kind, subscribe_id, timeout)
            .map_err(RtError::from_drv)?;
        let call = self
            .lock()
            .remove(&(device_id, report.sq_id, report.task_id));
        match call {
            Some(call) => (call.func)(),
            None => warn!(
                "No host function recorded for sq {} task {}",
                report.sq_id, report.task_id
            ),
        }
        hal.report_release(device_id, &report)
            .map_err(RtError::from_drv)
    }

    /// Drop closures of a destroyed stream that were never processed.
    pub(crate) fn discard_stream(&self, stream_id: u32) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, call| call.stream_id != stream_id);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!("Discarded {dropped} unprocessed host function(s) of stream {stream_id}");
        }
        dropped
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
