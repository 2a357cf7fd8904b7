// SPDX-License-Identifier: AGPL-3.0-only

//! Software (simulated driver) HAL
//!
//! Implements [`Hal`] entirely in process memory so the runtime can be
//! exercised without hardware:
//!
//! 1. **Device lifecycle**: open/close with per-device counters, so tests can
//!    assert a device was brought up exactly once.
//!
//! 2. **Queues**: SQ/CQ pairs with a per-device limit, in-order task
//!    completion, and blocking host tasks that hold their queue until the
//!    report is released.
//!
//! 3. **Reports**: per `(kind, subscribe id)` queues with condvar waits, the
//!    same routing the driver does for subscribed threads.
//!
//! 4. **Memory**: a bump allocator over `BytesMut` regions with real reads
//!    and writes.
//!
//! 5. **Fault injection**: [`SoftwareHal::fail_next`] makes the next call of
//!    an operation fail with a chosen driver error.
//!
//! ## Completion model
//!
//! ```text
//! submit(Null)                 -> completes immediately
//! submit(Host { blocking })    -> report queued for the subscriber
//!                                 queue held until report_release
//! wait_complete(task)          -> returns once no held task <= task remains
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use acrt_drv::{
    DevicePtr, DrvError, DrvResult, MallocPolicy, MemAttr, MemInfo, Report, ReportKind, RunMode,
    SqCqInfo, SqCqRequest, TaskKind,
};
use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::hal::{Hal, HalType};

const MEM_BASE: u64 = 0x1_0000_0000;
const MEM_ALIGN: u64 = 512;

/// Simulated driver settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareHalConfig {
    /// Devices exposed
    pub device_count: u32,
    /// Device memory per device, in bytes
    pub memory_bytes: u64,
    /// Queue pairs per device
    pub max_queues: u32,
    /// Reported run mode
    pub run_mode: RunMode,
}

impl Default for SoftwareHalConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            memory_bytes: 256 << 20,
            max_queues: 1024,
            run_mode: RunMode::Online,
        }
    }
}

impl SoftwareHalConfig {
    /// Defaults with `ACRT_SIM_*` overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(mb) = env_u64("ACRT_SIM_MEMORY_MB") {
            config.memory_bytes = mb << 20;
        }
        if let Some(queues) = env_u64("ACRT_SIM_MAX_QUEUES") {
            config.max_queues = u32::try_from(queues).unwrap_or(u32::MAX);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    raw.trim()
        .parse()
        .map_err(|e| warn!("Ignoring {key}={raw}: {e}"))
        .ok()
}

/// HAL operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalOp {
    /// `device_open`
    DeviceOpen,
    /// `device_close`
    DeviceClose,
    /// `sq_cq_allocate`
    SqCqAllocate,
    /// `sq_cq_free`
    SqCqFree,
    /// `submit`
    Submit,
    /// `wait_complete`
    WaitComplete,
    /// `subscribe_tid`
    SubscribeTid,
    /// `unsubscribe_tid`
    UnsubscribeTid,
    /// `report_wait`
    ReportWait,
    /// `report_release`
    ReportRelease,
    /// `mem_alloc`
    MemAlloc,
    /// `mem_free`
    MemFree,
}

#[derive(Debug, Default)]
struct Queue {
    cq_id: u32,
    priority: u32,
    next_task_id: u32,
    held: BTreeSet<u32>,
    subscribers: [Option<u64>; 2],
}

#[derive(Debug)]
struct DeviceState {
    open: bool,
    open_count: u64,
    close_count: u64,
    next_sq_id: u32,
    queues: BTreeMap<u32, Queue>,
    reports: HashMap<(ReportKind, u64), VecDeque<Report>>,
    memory: BTreeMap<u64, BytesMut>,
    next_addr: u64,
    used_bytes: u64,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            open: false,
            open_count: 0,
            close_count: 0,
            next_sq_id: 0,
            queues: BTreeMap::new(),
            reports: HashMap::new(),
            memory: BTreeMap::new(),
            next_addr: MEM_BASE,
            used_bytes: 0,
        }
    }

    fn queue_mut(&mut self, sq_id: u32) -> DrvResult<&mut Queue> {
        self.queues.get_mut(&sq_id).ok_or(DrvError::InvalidValue)
    }

    /// Region containing `[ptr, ptr + len)` and the offset of `ptr` in it.
    fn region_mut(&mut self, ptr: DevicePtr, len: u64) -> DrvResult<(&mut BytesMut, usize)> {
        let addr = ptr.addr();
        let (&base, region) = self
            .memory
            .range_mut(..=addr)
            .next_back()
            .ok_or(DrvError::InvalidValue)?;
        let offset = addr - base;
        let end = offset.checked_add(len).ok_or(DrvError::InvalidValue)?;
        if end > region.len() as u64 {
            return Err(DrvError::InvalidValue);
        }
        let offset = usize::try_from(offset).map_err(|_| DrvError::InvalidValue)?;
        Ok((region, offset))
    }
}

#[derive(Debug)]
struct State {
    devices: Vec<DeviceState>,
    faults: HashMap<HalOp, VecDeque<DrvError>>,
}

impl State {
    fn device_mut(&mut self, device_id: u32) -> DrvResult<&mut DeviceState> {
        self.devices
            .get_mut(device_id as usize)
            .ok_or(DrvError::InvalidDevice)
    }

    fn open_device_mut(&mut self, device_id: u32) -> DrvResult<&mut DeviceState> {
        let device = self.device_mut(device_id)?;
        if device.open {
            Ok(device)
        } else {
            Err(DrvError::Uninit)
        }
    }

    fn inject(&mut self, op: HalOp) -> DrvResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!("SoftwareHal: injected {err} into {op:?}");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// Simulated driver
#[derive(Debug)]
pub struct SoftwareHal {
    config: SoftwareHalConfig,
    state: Mutex<State>,
    changed: Condvar,
}

impl SoftwareHal {
    /// Create a simulated driver with no device open.
    #[must_use]
    pub fn new(config: SoftwareHalConfig) -> Self {
        info!(
            "SoftwareHal: {} device(s), {} MiB each, {} queues per device",
            config.device_count,
            config.memory_bytes >> 20,
            config.max_queues
        );
        Self {
            config,
            state: Mutex::new(State {
                devices: (0..config.device_count).map(|_| DeviceState::new()).collect(),
                faults: HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Settings this driver was built with
    pub const fn config(&self) -> &SoftwareHalConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: HalOp, err: DrvError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Times `device_open` succeeded for a device
    pub fn open_count(&self, device_id: u32) -> u64 {
        self.lock()
            .devices
            .get(device_id as usize)
            .map_or(0, |d| d.open_count)
    }

    /// Times `device_close` succeeded for a device
    pub fn close_count(&self, device_id: u32) -> u64 {
        self.lock()
            .devices
            .get(device_id as usize)
            .map_or(0, |d| d.close_count)
    }

    /// Whether a device is currently open
    pub fn is_open(&self, device_id: u32) -> bool {
        self.lock()
            .devices
            .get(device_id as usize)
            .is_some_and(|d| d.open)
    }

    /// Allocated queue pairs on a device
    pub fn queue_count(&self, device_id: u32) -> usize {
        self.lock()
            .devices
            .get(device_id as usize)
            .map_or(0, |d| d.queues.len())
    }

    /// Whether a queue pair exists
    pub fn has_queue(&self, device_id: u32, sq_id: u32) -> bool {
        self.lock()
            .devices
            .get(device_id as usize)
            .is_some_and(|d| d.queues.contains_key(&sq_id))
    }

    /// Priority a queue pair was allocated with
    pub fn queue_priority(&self, device_id: u32, sq_id: u32) -> Option<u32> {
        self.lock()
            .devices
            .get(device_id as usize)
            .and_then(|d| d.queues.get(&sq_id))
            .map(|q| q.priority)
    }

    /// Subscribe id routed for a queue and report kind
    pub fn subscriber(&self, device_id: u32, sq_id: u32, kind: ReportKind) -> Option<u64> {
        self.lock()
            .devices
            .get(device_id as usize)
            .and_then(|d| d.queues.get(&sq_id))
            .and_then(|q| q.subscribers[kind.index()])
    }

    /// Bytes of device memory in use
    pub fn allocated_bytes(&self, device_id: u32) -> u64 {
        self.lock()
            .devices
            .get(device_id as usize)
            .map_or(0, |d| d.used_bytes)
    }

    /// Wait on the condvar until `deadline`. Returns the guard and whether
    /// the deadline passed.
    fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, State>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, State>, bool) {
        match deadline {
            None => (
                self.changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                false,
            ),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (guard, true);
                }
                let (guard, _) = self
                    .changed
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, false)
            }
        }
    }
}

impl Hal for SoftwareHal {
    fn hal_type(&self) -> HalType {
        HalType::Software
    }

    fn run_mode(&self) -> RunMode {
        self.config.run_mode
    }

    fn device_count(&self) -> DrvResult<u32> {
        Ok(self.config.device_count)
    }

    fn device_open(&self, device_id: u32) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::DeviceOpen)?;
        let device = state.device_mut(device_id)?;
        if device.open {
            return Err(DrvError::RepeatedInit);
        }
        device.open = true;
        device.open_count += 1;
        debug!("SoftwareHal: opened device {device_id}");
        Ok(())
    }

    fn device_close(&self, device_id: u32) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::DeviceClose)?;
        let device = state.open_device_mut(device_id)?;
        if !device.queues.is_empty() {
            warn!(
                "SoftwareHal: device {device_id} closed with {} queue(s) still allocated",
                device.queues.len()
            );
        }
        device.open = false;
        device.close_count += 1;
        device.queues.clear();
        device.reports.clear();
        device.memory.clear();
        device.used_bytes = 0;
        device.next_addr = MEM_BASE;
        drop(state);
        self.changed.notify_all();
        debug!("SoftwareHal: closed device {device_id}");
        Ok(())
    }

    fn sq_cq_allocate(&self, device_id: u32, request: &SqCqRequest) -> DrvResult<SqCqInfo> {
        let mut state = self.lock();
        state.inject(HalOp::SqCqAllocate)?;
        let limit = self.config.max_queues as usize;
        let device = state.open_device_mut(device_id)?;
        if device.queues.len() >= limit {
            return Err(DrvError::NoStreamResources);
        }
        let mut sq_id = device.next_sq_id;
        while device.queues.contains_key(&sq_id) {
            sq_id = sq_id.wrapping_add(1) % acrt_drv::SQ_ID_NONE;
        }
        device.next_sq_id = sq_id.wrapping_add(1) % acrt_drv::SQ_ID_NONE;
        device.queues.insert(
            sq_id,
            Queue {
                cq_id: sq_id,
                priority: request.priority,
                ..Queue::default()
            },
        );
        let cq_id = sq_id;
        Ok(SqCqInfo { sq_id, cq_id })
    }

    fn sq_cq_free(&self, device_id: u32, sq_id: u32) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::SqCqFree)?;
        let device = state.open_device_mut(device_id)?;
        let queue = device.queues.remove(&sq_id).ok_or(DrvError::InvalidValue)?;
        for reports in device.reports.values_mut() {
            reports.retain(|r| r.sq_id != sq_id);
        }
        drop(state);
        self.changed.notify_all();
        debug!("SoftwareHal: freed queue {sq_id} (cq {})", queue.cq_id);
        Ok(())
    }

    fn submit(&self, device_id: u32, sq_id: u32, task: TaskKind) -> DrvResult<u32> {
        let mut state = self.lock();
        state.inject(HalOp::Submit)?;
        let device = state.open_device_mut(device_id)?;
        let queue = device.queue_mut(sq_id)?;
        let task_id = queue.next_task_id;
        let report = match task {
            TaskKind::Null => None,
            TaskKind::Host { kind, blocking } => {
                let subscribe_id = queue.subscribers[kind.index()].ok_or(DrvError::NotExist)?;
                if blocking {
                    queue.held.insert(task_id);
                }
                Some((
                    subscribe_id,
                    Report {
                        kind,
                        sq_id,
                        task_id,
                        blocking,
                    },
                ))
            }
        };
        queue.next_task_id = task_id.wrapping_add(1);
        if let Some((subscribe_id, report)) = report {
            device
                .reports
                .entry((report.kind, subscribe_id))
                .or_default()
                .push_back(report);
            drop(state);
            self.changed.notify_all();
        }
        Ok(task_id)
    }

    fn wait_complete(
        &self,
        device_id: u32,
        sq_id: u32,
        task_id: u32,
        timeout: Option<Duration>,
    ) -> DrvResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        state.inject(HalOp::WaitComplete)?;
        loop {
            let device = state.open_device_mut(device_id)?;
            let queue = device.queue_mut(sq_id)?;
            if queue.held.range(..=task_id).next().is_none() {
                return Ok(());
            }
            let (guard, expired) = self.wait_until(state, deadline);
            state = guard;
            if expired {
                return Err(DrvError::WaitTimeout);
            }
        }
    }

    fn subscribe_tid(
        &self,
        device_id: u32,
        sq_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
    ) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::SubscribeTid)?;
        let queue = state.open_device_mut(device_id)?.queue_mut(sq_id)?;
        let slot = &mut queue.subscribers[kind.index()];
        if slot.is_some() {
            return Err(DrvError::RepeatedSubscribed);
        }
        *slot = Some(subscribe_id);
        Ok(())
    }

    fn unsubscribe_tid(
        &self,
        device_id: u32,
        sq_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
    ) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::UnsubscribeTid)?;
        let queue = state.open_device_mut(device_id)?.queue_mut(sq_id)?;
        let slot = &mut queue.subscribers[kind.index()];
        if *slot != Some(subscribe_id) {
            return Err(DrvError::InvalidValue);
        }
        *slot = None;
        Ok(())
    }

    fn report_wait(
        &self,
        device_id: u32,
        kind: ReportKind,
        subscribe_id: u64,
        timeout: Option<Duration>,
    ) -> DrvResult<Report> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        state.inject(HalOp::ReportWait)?;
        loop {
            let device = state.open_device_mut(device_id)?;
            if let Some(report) = device
                .reports
                .get_mut(&(kind, subscribe_id))
                .and_then(VecDeque::pop_front)
            {
                return Ok(report);
            }
            let (guard, expired) = self.wait_until(state, deadline);
            state = guard;
            if expired {
                return Err(DrvError::WaitTimeout);
            }
        }
    }

    fn report_release(&self, device_id: u32, report: &Report) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::ReportRelease)?;
        let queue = state.open_device_mut(device_id)?.queue_mut(report.sq_id)?;
        let released = queue.held.remove(&report.task_id);
        drop(state);
        if released {
            self.changed.notify_all();
        }
        Ok(())
    }

    fn mem_alloc(&self, device_id: u32, size: u64, policy: MallocPolicy) -> DrvResult<DevicePtr> {
        let mut state = self.lock();
        state.inject(HalOp::MemAlloc)?;
        if policy == MallocPolicy::HugeOnly {
            return Err(DrvError::InvalidMallocType);
        }
        let limit = self.config.memory_bytes;
        let device = state.open_device_mut(device_id)?;
        if size == 0 {
            return Err(DrvError::InvalidValue);
        }
        if device.used_bytes.saturating_add(size) > limit {
            return Err(DrvError::OutOfMemory);
        }
        let len = usize::try_from(size).map_err(|_| DrvError::OutOfMemory)?;
        let addr = device.next_addr;
        device.next_addr = (addr + size).next_multiple_of(MEM_ALIGN);
        device.memory.insert(addr, BytesMut::zeroed(len));
        device.used_bytes += size;
        Ok(DevicePtr::new(addr))
    }

    fn mem_free(&self, device_id: u32, ptr: DevicePtr) -> DrvResult<()> {
        let mut state = self.lock();
        state.inject(HalOp::MemFree)?;
        let device = state.open_device_mut(device_id)?;
        let region = device
            .memory
            .remove(&ptr.addr())
            .ok_or(DrvError::InvalidValue)?;
        device.used_bytes -= region.len() as u64;
        Ok(())
    }

    fn mem_set(&self, device_id: u32, ptr: DevicePtr, value: u8, count: u64) -> DrvResult<()> {
        let mut state = self.lock();
        let (region, offset) = state.open_device_mut(device_id)?.region_mut(ptr, count)?;
        let end = offset + usize::try_from(count).map_err(|_| DrvError::InvalidValue)?;
        region[offset..end].fill(value);
        Ok(())
    }

    fn mem_write(&self, device_id: u32, dst: DevicePtr, src: &[u8]) -> DrvResult<()> {
        let mut state = self.lock();
        let (region, offset) = state
            .open_device_mut(device_id)?
            .region_mut(dst, src.len() as u64)?;
        region[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn mem_read(&self, device_id: u32, src: DevicePtr, dst: &mut [u8]) -> DrvResult<()> {
        let mut state = self.lock();
        let (region, offset) = state
            .open_device_mut(device_id)?
            .region_mut(src, dst.len() as u64)?;
        dst.copy_from_slice(&region[offset..offset + dst.len()]);
        Ok(())
    }

    fn mem_copy(
        &self,
        device_id: u32,
        dst: DevicePtr,
        src: DevicePtr,
        count: u64,
    ) -> DrvResult<()> {
        let mut state = self.lock();
        let device = state.open_device_mut(device_id)?;
        let len = usize::try_from(count).map_err(|_| DrvError::InvalidValue)?;
        let bytes = {
            let (region, offset) = device.region_mut(src, count)?;
            region[offset..offset + len].to_vec()
        };
        let (region, offset) = device.region_mut(dst, count)?;
        region[offset..offset + len].copy_from_slice(&bytes);
        Ok(())
    }

    fn mem_info(&self, device_id: u32, attr: MemAttr) -> DrvResult<MemInfo> {
        let mut state = self.lock();
        let device = state.open_device_mut(device_id)?;
        Ok(match attr {
            MemAttr::Huge => MemInfo::default(),
            MemAttr::Normal | MemAttr::All => MemInfo {
                free: self.config.memory_bytes - device.used_bytes,
                total: self.config.memory_bytes,
            },
        })
    }
}
