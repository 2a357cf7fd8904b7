//! Submit/completion queue descriptors and completion reports.

/// Request for a submit-queue / completion-queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqCqRequest {
    /// Scheduling priority, passed through as a QoS hint.
    pub priority: u32,
    /// Stream flags of the owning stream.
    pub flags: u32,
}

/// Queue pair handed out by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqCqInfo {
    /// Submit-queue id.
    pub sq_id: u32,
    /// Completion-queue id.
    pub cq_id: u32,
}

/// Which kind of asynchronous completion a thread subscribes to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportKind {
    /// Callback reports (`rtCallbackLaunch` / `rtProcessReport`).
    Callback = 0,
    /// Host-function reports (`rtLaunchHostFunc` / `rtProcessHostFunc`).
    HostFunc = 1,
}

impl ReportKind {
    /// Both kinds, in slot order.
    pub const ALL: [Self; 2] = [Self::Callback, Self::HostFunc];

    /// Slot index on a stream.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Work posted to a submit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// No-op task, completes as soon as everything before it has.
    Null,
    /// Host-side work delivered as a report to the subscriber of `kind`.
    ///
    /// A blocking host task keeps the queue from completing anything after
    /// it until the report is released.
    Host {
        /// Subscription kind that receives the report.
        kind: ReportKind,
        /// Hold the queue until the report is released.
        blocking: bool,
    },
}

/// Completion report delivered to a subscribed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Subscription kind.
    pub kind: ReportKind,
    /// Submit queue the task was posted on.
    pub sq_id: u32,
    /// Task id returned by `submit`.
    pub task_id: u32,
    /// Whether the queue is held until the report is released.
    pub blocking: bool,
}
