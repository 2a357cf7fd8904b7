//! Report subscriptions
//!
//! A thread subscribes to a stream's reports of one [`ReportKind`]. The
//! stream keeps the thread id in an atomic slot; the driver is told a
//! *subscribe id*, which is how it routes reports to the waiting thread.
//! The stream records the subscribe id next to the slot, so unsubscribing
//! never depends on the subscriber still being alive.
//!
//! Where subscribe ids come from depends on the platform:
//!
//! | Platform | Subscribe id |
//! |----------|--------------|
//! | hosted | allocated per thread id from a table, seeded with the process id |
//! | task table | the task id itself |
//!
//! A hosted table row lives while its thread holds a subscription. The row
//! of a thread that waited for reports is also dropped when the thread exits.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use acrt_drv::{ReportKind, THREAD_ID_UNSUBSCRIBED};
use tracing::{debug, info, warn};

use crate::config::Platform;
use crate::error::{Result, RtError};
use crate::stream::Stream;
use crate::thread::{current_thread_id, process_id};

/// Maps OS thread (or task) ids to driver subscribe ids.
pub(crate) trait SubscribeIds: Debug + Send + Sync {
    /// Subscribe id for one more subscription of `thread_id`, allocating
    /// one if needed.
    fn acquire(&self, thread_id: u64) -> Result<u64>;

    /// Give back a subscription taken with [`acquire`](Self::acquire).
    fn release(&self, thread_id: u64, subscribe_id: u64);

    /// Subscribe id of the calling thread if one exists.
    fn current(&self) -> Option<u64>;
}

/// Task-table platform: the task id is the subscribe id.
#[derive(Debug, Default)]
pub(crate) struct TaskIdSubscribeIds;

impl SubscribeIds for TaskIdSubscribeIds {
    fn acquire(&self, thread_id: u64) -> Result<u64> {
        Ok(thread_id)
    }

    fn release(&self, _thread_id: u64, _subscribe_id: u64) {}

    fn current(&self) -> Option<u64> {
        Some(current_thread_id())
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    thread_id: u64,
    subscribe_id: u64,
    subscriptions: u32,
}

#[derive(Debug)]
struct Table {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Table {
    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn position(entries: &[Entry], thread_id: u64) -> std::result::Result<usize, usize> {
        entries.binary_search_by_key(&thread_id, |e| e.thread_id)
    }

    fn find(&self, thread_id: u64) -> Option<u64> {
        let entries = self.lock();
        Self::position(&entries, thread_id)
            .ok()
            .map(|pos| entries[pos].subscribe_id)
    }

    fn acquire(&self, thread_id: u64) -> Result<u64> {
        let mut entries = self.lock();
        match Self::position(&entries, thread_id) {
            Ok(pos) => {
                let entry = &mut entries[pos];
                entry.subscriptions = entry
                    .subscriptions
                    .checked_add(1)
                    .ok_or(RtError::Internal)?;
                Ok(entry.subscribe_id)
            }
            Err(pos) => {
                entries
                    .try_reserve(1)
                    .map_err(|_| RtError::MemoryAllocation)?;
                let subscribe_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entries.insert(
                    pos,
                    Entry {
                        thread_id,
                        subscribe_id,
                        subscriptions: 1,
                    },
                );
                Ok(subscribe_id)
            }
        }
    }

    /// Rows are matched on both ids: a row recreated for a reused thread id
    /// is not charged for an older subscription.
    fn release(&self, thread_id: u64, subscribe_id: u64) {
        let mut entries = self.lock();
        let Ok(pos) = Self::position(&entries, thread_id) else {
            return;
        };
        let entry = &mut entries[pos];
        if entry.subscribe_id != subscribe_id {
            return;
        }
        entry.subscriptions = entry.subscriptions.saturating_sub(1);
        if entry.subscriptions == 0 {
            entries.remove(pos);
            debug!("Dropped subscribe id {subscribe_id:#x} of thread {thread_id}");
        }
    }

    fn remove(&self, thread_id: u64) {
        let mut entries = self.lock();
        if let Ok(pos) = Self::position(&entries, thread_id) {
            entries.remove(pos);
            debug!("Dropped subscribe id of exited thread {thread_id}");
        }
    }
}

/// Registered on a thread that touched a table. Dropping it (at thread
/// exit) removes the thread's row if the table is still alive.
struct ExitHook {
    table: Weak<Table>,
    thread_id: u64,
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.thread_id);
        }
    }
}

thread_local! {
    static EXIT_HOOKS: RefCell<Vec<ExitHook>> = const { RefCell::new(Vec::new()) };
}

/// Hosted platform: sorted `(thread id, subscribe id)` table.
#[derive(Debug, Clone)]
pub(crate) struct TableSubscribeIds {
    table: Arc<Table>,
}

impl TableSubscribeIds {
    pub(crate) fn new() -> Self {
        Self {
            table: Arc::new(Table {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(u64::from(process_id()) << 32),
            }),
        }
    }

    /// Make the calling thread's exit drop its row.
    fn hook_exit(&self, thread_id: u64) {
        // Thread-local storage is gone during thread teardown.
        let _ = EXIT_HOOKS.try_with(|hooks| {
            let mut hooks = hooks.borrow_mut();
            hooks.retain(|h| h.table.strong_count() > 0);
            let hooked = hooks
                .iter()
                .any(|h| std::ptr::eq(h.table.as_ptr(), Arc::as_ptr(&self.table)));
            if !hooked {
                hooks.push(ExitHook {
                    table: Arc::downgrade(&self.table),
                    thread_id,
                });
            }
        });
    }

    #[cfg(test)]
    fn lookup(&self, thread_id: u64) -> Option<u64> {
        self.table.find(thread_id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

impl SubscribeIds for TableSubscribeIds {
    fn acquire(&self, thread_id: u64) -> Result<u64> {
        let subscribe_id = self.table.acquire(thread_id)?;
        if thread_id == current_thread_id() {
            self.hook_exit(thread_id);
        }
        Ok(subscribe_id)
    }

    fn release(&self, thread_id: u64, subscribe_id: u64) {
        self.table.release(thread_id, subscribe_id);
    }

    fn current(&self) -> Option<u64> {
        let thread_id = current_thread_id();
        let subscribe_id = self.table.find(thread_id)?;
        self.hook_exit(thread_id);
        Some(subscribe_id)
    }
}

/// Binds threads to stream report slots and to the driver's routing.
#[derive(Debug)]
pub(crate) struct SubscribeManager {
    ids: Box<dyn SubscribeIds>,
}

impl SubscribeManager {
    pub(crate) fn new(platform: Platform) -> Self {
        let ids: Box<dyn SubscribeIds> = match platform {
            Platform::Hosted => Box::new(TableSubscribeIds::new()),
            Platform::TaskTable => Box::new(TaskIdSubscribeIds),
        };
        Self { ids }
    }

    /// Route `kind` reports of `stream` to `thread_id`.
    pub(crate) fn subscribe(
        &self,
        thread_id: u64,
        stream: &Stream,
        kind: ReportKind,
    ) -> Result<()> {
        if thread_id == THREAD_ID_UNSUBSCRIBED {
            return Err(RtError::InvalidParam);
        }
        stream.claim_subscriber(kind, thread_id)?;
        let subscribe_id = match self.ids.acquire(thread_id) {
            Ok(id) => id,
            Err(e) => {
                Self::unclaim(thread_id, stream, kind);
                return Err(e);
            }
        };
        stream.set_subscribe_id(kind, subscribe_id);
        if let Err(e) = stream.hal_subscribe(kind, subscribe_id) {
            Self::unclaim(thread_id, stream, kind);
            self.ids.release(thread_id, subscribe_id);
            return Err(e);
        }
        info!(
            "Thread {thread_id} subscribed to {kind:?} reports of stream {} (id {subscribe_id:#x})",
            stream.id()
        );
        Ok(())
    }

    fn unclaim(thread_id: u64, stream: &Stream, kind: ReportKind) {
        if stream.release_subscriber(kind, thread_id).is_err() {
            warn!("Subscriber slot of stream {} changed during unwind", stream.id());
        }
    }

    /// Undo [`subscribe`](Self::subscribe). The slot is cleared even if the
    /// driver then fails.
    pub(crate) fn unsubscribe(
        &self,
        thread_id: u64,
        stream: &Stream,
        kind: ReportKind,
    ) -> Result<()> {
        if stream.subscriber(kind) != Some(thread_id) {
            return Err(RtError::StreamSubscribeMismatch);
        }
        let subscribe_id = stream.release_subscriber(kind, thread_id)?;
        self.ids.release(thread_id, subscribe_id);
        stream.hal_unsubscribe(kind, subscribe_id)?;
        info!(
            "Thread {thread_id} unsubscribed from {kind:?} reports of stream {}",
            stream.id()
        );
        Ok(())
    }

    /// Subscribe id of the calling thread
    pub(crate) fn current_subscribe_id(&self) -> Option<u64> {
        self.ids.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextHandle;
    use crate::device::DeviceTable;
    use crate::hals::{HalOp, SoftwareHal, SoftwareHalConfig};
    use crate::mem_pool::MemHandle;
    use crate::spin::SpinPolicy;
    use crate::stream::StreamConfig;
    use acrt_drv::DrvError;

    fn stream() -> (Arc<SoftwareHal>, DeviceTable, Stream) {
        let hal = Arc::new(SoftwareHal::new(SoftwareHalConfig::default()));
        let table = DeviceTable::new(hal.clone(), 1, SpinPolicy::DEFAULT);
        let device = table.retain(0).unwrap();
        let ctx = ContextHandle::from(MemHandle::from_raw(1).unwrap());
        let stream = Stream::create(1, ctx, &device, &StreamConfig::default()).unwrap();
        (hal, table, stream)
    }

    fn hosted(ids: &TableSubscribeIds) -> SubscribeManager {
        SubscribeManager {
            ids: Box::new(ids.clone()),
        }
    }

    #[test]
    fn table_ids_are_stable_and_distinct() {
        let ids = TableSubscribeIds::new();
        let a = ids.acquire(100).unwrap();
        let b = ids.acquire(200).unwrap();
        assert_ne!(a, b);
        assert_eq!(ids.acquire(100).unwrap(), a);
        assert_eq!(ids.lookup(200), Some(b));
        assert_eq!(ids.lookup(300), None);
        assert_eq!(a >> 32, u64::from(process_id()));
    }

    #[test]
    fn rows_live_while_subscriptions_do() {
        let ids = TableSubscribeIds::new();
        let a = ids.acquire(100).unwrap();
        ids.acquire(100).unwrap();
        ids.release(100, a);
        assert_eq!(ids.lookup(100), Some(a));
        ids.release(100, a);
        assert_eq!(ids.len(), 0);

        // A later row for the same thread id is not charged for the old one
        let b = ids.acquire(100).unwrap();
        assert_ne!(a, b);
        ids.release(100, a);
        assert_eq!(ids.lookup(100), Some(b));
    }

    #[test]
    fn exited_threads_leave_the_table() {
        let ids = TableSubscribeIds::new();
        std::thread::scope(|s| {
            s.spawn(|| {
                let own = ids.acquire(current_thread_id()).unwrap();
                assert_eq!(ids.current(), Some(own));
                assert_eq!(ids.len(), 1);
            })
            .join()
            .unwrap();
        });
        assert_eq!(ids.len(), 0);
    }

    #[test]
    fn current_falls_back_to_the_table() {
        let ids = TableSubscribeIds::new();
        let tid = std::thread::scope(|s| {
            s.spawn(|| {
                let tid = current_thread_id();
                assert_eq!(ids.current(), None);
                tid
            })
            .join()
            .unwrap()
        });
        let id = ids.acquire(tid).unwrap();
        assert_eq!(ids.lookup(tid), Some(id));
        assert_eq!(TaskIdSubscribeIds.acquire(tid).unwrap(), tid);
    }

    #[test]
    fn rejected_subscriber_gets_no_row() {
        let (_hal, _table, stream) = stream();
        let ids = TableSubscribeIds::new();
        let manager = hosted(&ids);
        manager.subscribe(10, &stream, ReportKind::Callback).unwrap();
        assert_eq!(
            manager.subscribe(11, &stream, ReportKind::Callback),
            Err(RtError::StreamAlreadySubscribed)
        );
        assert_eq!(ids.lookup(11), None);
        assert_eq!(ids.len(), 1);

        manager.unsubscribe(10, &stream, ReportKind::Callback).unwrap();
        assert_eq!(ids.len(), 0);
    }

    #[test]
    fn subscriber_that_exited_can_still_be_unsubscribed() {
        let (hal, _table, stream) = stream();
        let ids = TableSubscribeIds::new();
        let manager = hosted(&ids);
        let sq = stream.sq_id().unwrap();
        let tid = std::thread::scope(|s| {
            s.spawn(|| {
                let tid = current_thread_id();
                manager.subscribe(tid, &stream, ReportKind::Callback).unwrap();
                assert!(manager.current_subscribe_id().is_some());
                tid
            })
            .join()
            .unwrap()
        });
        assert_eq!(ids.len(), 0);

        manager.unsubscribe(tid, &stream, ReportKind::Callback).unwrap();
        assert_eq!(stream.subscriber(ReportKind::Callback), None);
        assert_eq!(hal.subscriber(0, sq, ReportKind::Callback), None);
        manager.subscribe(current_thread_id(), &stream, ReportKind::Callback).unwrap();
    }

    #[test]
    fn second_subscriber_is_rejected_without_touching_the_driver() {
        let (hal, _table, stream) = stream();
        let manager = SubscribeManager::new(Platform::Hosted);
        manager.subscribe(10, &stream, ReportKind::Callback).unwrap();
        let routed = hal.subscriber(0, stream.sq_id().unwrap(), ReportKind::Callback);
        assert!(routed.is_some());

        assert_eq!(
            manager.subscribe(11, &stream, ReportKind::Callback),
            Err(RtError::StreamAlreadySubscribed)
        );
        assert_eq!(stream.subscriber(ReportKind::Callback), Some(10));
        assert_eq!(
            hal.subscriber(0, stream.sq_id().unwrap(), ReportKind::Callback),
            routed
        );
    }

    #[test]
    fn mismatched_unsubscribe_leaves_the_slot() {
        let (_hal, _table, stream) = stream();
        let manager = SubscribeManager::new(Platform::TaskTable);
        manager.subscribe(10, &stream, ReportKind::HostFunc).unwrap();
        assert_eq!(
            manager.unsubscribe(11, &stream, ReportKind::HostFunc),
            Err(RtError::StreamSubscribeMismatch)
        );
        assert_eq!(stream.subscriber(ReportKind::HostFunc), Some(10));
        manager.unsubscribe(10, &stream, ReportKind::HostFunc).unwrap();
        assert_eq!(stream.subscriber(ReportKind::HostFunc), None);
    }

    #[test]
    fn driver_failure_on_subscribe_restores_the_slot() {
        let (hal, _table, stream) = stream();
        let manager = SubscribeManager::new(Platform::Hosted);
        hal.fail_next(HalOp::SubscribeTid, DrvError::BusDown);
        assert_eq!(
            manager.subscribe(10, &stream, ReportKind::Callback),
            Err(RtError::LostHeartbeat)
        );
        assert_eq!(stream.subscriber(ReportKind::Callback), None);
    }

    #[test]
    fn driver_failure_on_unsubscribe_still_clears_the_slot() {
        let (hal, _table, stream) = stream();
        let manager = SubscribeManager::new(Platform::Hosted);
        manager.subscribe(10, &stream, ReportKind::Callback).unwrap();
        hal.fail_next(HalOp::UnsubscribeTid, DrvError::BusDown);
        assert_eq!(
            manager.unsubscribe(10, &stream, ReportKind::Callback),
            Err(RtError::LostHeartbeat)
        );
        assert_eq!(stream.subscriber(ReportKind::Callback), None);
    }

    #[test]
    fn unsubscribed_sentinel_is_not_a_thread() {
        let (_hal, _table, stream) = stream();
        let manager = SubscribeManager::new(Platform::Hosted);
        assert_eq!(
            manager.subscribe(THREAD_ID_UNSUBSCRIBED, &stream, ReportKind::Callback),
            Err(RtError::InvalidParam)
        );
    }
}
