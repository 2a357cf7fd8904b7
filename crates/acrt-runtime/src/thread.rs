//! OS thread and process identity

/// Kernel thread id of the caller.
///
/// This is the id callers pass to `subscribe_report` for another thread,
/// and the task id keying the task-table registry.
#[must_use]
pub fn current_thread_id() -> u64 {
    u64::from(rustix::thread::gettid().as_raw_nonzero().get().unsigned_abs())
}

/// Process id of the caller.
pub(crate) fn process_id() -> u32 {
    rustix::process::getpid().as_raw_nonzero().get().unsigned_abs()
}
