//! "Current context" registries
//!
//! Every API call that works on "the current context" asks the registry.
//! Two backends exist:
//!
//! - [`ThreadLocalRegistry`]: one slot per OS thread in thread-local storage
//! - [`TaskTableRegistry`]: a sorted `(task id, context)` table under a mutex,
//!   for schedulers without native thread-local storage
//!
//! Both store the context's pool handle, so a registration left behind by a
//! destroyed context no longer resolves once its node is freed or reused.
//! A task's row in the task table is removed when the task exits, so a
//! reused task id starts with no current context.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::Platform;
use crate::context::ContextHandle;
use crate::error::{Result, RtError};
use crate::thread::current_thread_id;

/// Per-thread (or per-task) current context.
pub trait ContextRegistry: Debug + Send + Sync {
    /// Backend kind
    fn platform(&self) -> Platform;

    /// Context registered for the caller
    fn current(&self) -> Option<ContextHandle>;

    /// Register `ctx` for the caller, or clear with `None`
    ///
    /// # Errors
    ///
    /// Returns `MemoryAllocation` if the registry cannot grow.
    fn set_current(&self, ctx: Option<ContextHandle>) -> Result<()>;

    /// Clear the caller's registration if it is `ctx`. Returns whether it was.
    fn clear_if_current(&self, ctx: ContextHandle) -> bool;

    /// Drop every registration of `ctx` the backend can reach. Thread-local
    /// storage only reaches the caller's.
    fn forget(&self, ctx: ContextHandle) {
        self.clear_if_current(ctx);
    }
}

/// Registry for `platform`.
pub fn new_registry(platform: Platform) -> Box<dyn ContextRegistry> {
    match platform {
        Platform::Hosted => Box::new(ThreadLocalRegistry::new()),
        Platform::TaskTable => Box::new(TaskTableRegistry::new()),
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// `(registry id, context)` for every registry this thread touched.
    static CURRENT: RefCell<Vec<(u64, ContextHandle)>> = const { RefCell::new(Vec::new()) };
}

/// Thread-local current context.
///
/// Each registry instance gets its own id, so independent runtimes in one
/// process do not see each other's registrations.
#[derive(Debug)]
pub struct ThreadLocalRegistry {
    id: u64,
}

impl ThreadLocalRegistry {
    /// Fresh registry with no registrations.
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for ThreadLocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry for ThreadLocalRegistry {
    fn platform(&self) -> Platform {
        Platform::Hosted
    }

    fn current(&self) -> Option<ContextHandle> {
        CURRENT.with(|slots| {
            slots
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map(|&(_, ctx)| ctx)
        })
    }

    fn set_current(&self, ctx: Option<ContextHandle>) -> Result<()> {
        CURRENT.with(|slots| {
            let mut slots = slots.borrow_mut();
            let pos = slots.iter().position(|(id, _)| *id == self.id);
            match (pos, ctx) {
                (Some(pos), Some(ctx)) => slots[pos].1 = ctx,
                (Some(pos), None) => {
                    slots.swap_remove(pos);
                }
                (None, Some(ctx)) => {
                    slots
                        .try_reserve(1)
                        .map_err(|_| RtError::MemoryAllocation)?;
                    slots.push((self.id, ctx));
                }
                (None, None) => {}
            }
            Ok(())
        })
    }

    fn clear_if_current(&self, ctx: ContextHandle) -> bool {
        CURRENT.with(|slots| {
            let mut slots = slots.borrow_mut();
            match slots.iter().position(|&(id, c)| id == self.id && c == ctx) {
                Some(pos) => {
                    slots.swap_remove(pos);
                    true
                }
                None => false,
            }
        })
    }
}

type TaskRows = Mutex<Vec<(u64, ContextHandle)>>;

fn lock_rows(rows: &TaskRows) -> MutexGuard<'_, Vec<(u64, ContextHandle)>> {
    rows.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the owning task's row when the task exits.
struct TaskExit {
    rows: Weak<TaskRows>,
    task: u64,
}

impl Drop for TaskExit {
    fn drop(&mut self) {
        let Some(rows) = self.rows.upgrade() else {
            return;
        };
        let mut rows = lock_rows(&rows);
        if let Ok(pos) = rows.binary_search_by_key(&self.task, |&(t, _)| t) {
            rows.remove(pos);
        }
    }
}

thread_local! {
    static TASK_EXITS: RefCell<Vec<TaskExit>> = const { RefCell::new(Vec::new()) };
}

/// Task-id keyed current context.
#[derive(Debug, Default)]
pub struct TaskTableRegistry {
    rows: Arc<TaskRows>,
}

impl TaskTableRegistry {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks with a registration
    pub fn len(&self) -> usize {
        lock_rows(&self.rows).len()
    }

    /// Whether no task has a registration
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hook_exit(&self, task: u64) {
        // Thread-local storage is gone during thread teardown.
        let _ = TASK_EXITS.try_with(|exits| {
            let mut exits = exits.borrow_mut();
            exits.retain(|e| e.rows.strong_count() > 0);
            if !exits
                .iter()
                .any(|e| std::ptr::eq(e.rows.as_ptr(), Arc::as_ptr(&self.rows)))
            {
                exits.push(TaskExit {
                    rows: Arc::downgrade(&self.rows),
                    task,
                });
            }
        });
    }
}

impl ContextRegistry for TaskTableRegistry {
    fn platform(&self) -> Platform {
        Platform::TaskTable
    }

    fn current(&self) -> Option<ContextHandle> {
        let task = current_thread_id();
        let rows = lock_rows(&self.rows);
        rows.binary_search_by_key(&task, |&(t, _)| t)
            .ok()
            .map(|pos| rows[pos].1)
    }

    fn set_current(&self, ctx: Option<ContextHandle>) -> Result<()> {
        let task = current_thread_id();
        let mut rows = lock_rows(&self.rows);
        match (rows.binary_search_by_key(&task, |&(t, _)| t), ctx) {
            (Ok(pos), Some(ctx)) => rows[pos].1 = ctx,
            (Ok(pos), None) => {
                rows.remove(pos);
            }
            (Err(pos), Some(ctx)) => {
                rows.try_reserve(1).map_err(|_| RtError::MemoryAllocation)?;
                rows.insert(pos, (task, ctx));
                drop(rows);
                self.hook_exit(task);
            }
            (Err(_), None) => {}
        }
        Ok(())
    }

    fn clear_if_current(&self, ctx: ContextHandle) -> bool {
        let task = current_thread_id();
        let mut rows = lock_rows(&self.rows);
        match rows.binary_search_by_key(&task, |&(t, _)| t) {
            Ok(pos) if rows[pos].1 == ctx => {
                rows.remove(pos);
                true
            }
            _ => false,
        }
    }

    fn forget(&self, ctx: ContextHandle) {
        lock_rows(&self.rows).retain(|&(_, c)| c != ctx);
    }
}
