//! Slab pool with sequence-stamped handles
//!
//! Nodes live in an arena that never moves: segment `k` holds
//! `16 << k` nodes and is allocated the first time it is needed, so a node
//! index resolves to its node without taking a lock.
//!
//! Each node carries a flag word:
//!
//! ```text
//!  63          32 31           1   0
//! +--------------+--------------+---+
//! |   sequence   |   reserved   | U |
//! +--------------+--------------+---+
//! ```
//!
//! `U` is set while the node is allocated and the sequence is the pool-wide
//! allocation stamp at the time. A [`MemHandle`] remembers both, so a handle
//! kept past its free no longer matches once the node is freed or reused.
//! The sequence is 32 bits and wraps; a handle that survives exactly 2^32
//! allocations of the same node would match again.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::spin::SpinLock;

/// Flag bit marking an allocated node.
pub const USED_FLAG: u64 = 0x1;
const IDLE_FLAG: u64 = 0;
const SEQ_SHIFT: u32 = 32;

const FIRST_SEGMENT_LEN: usize = 16;
const SEGMENT_COUNT: usize = 27;
const NO_NODE: u32 = u32::MAX;

/// Largest capacity the arena can address.
pub const MAX_POOL_CAPACITY: u32 = (FIRST_SEGMENT_LEN * ((1 << SEGMENT_COUNT) - 1)) as u32;

const fn used_flag(seq: u32) -> u64 {
    USED_FLAG | ((seq as u64) << SEQ_SHIFT)
}

/// Node index plus the allocation sequence it was handed out with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle {
    index: u32,
    seq: u32,
}

impl MemHandle {
    /// Arena index of the node.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Allocation sequence.
    #[must_use]
    pub const fn seq(self) -> u32 {
        self.seq
    }

    /// Pack into a non-zero word: `(index + 1) | seq << 32`.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.seq as u64) << SEQ_SHIFT) | (self.index as u64 + 1)
    }

    /// Inverse of [`to_raw`](Self::to_raw). Zero is not a handle.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let low = raw as u32;
        if low == 0 {
            return None;
        }
        Some(Self {
            index: low - 1,
            seq: (raw >> SEQ_SHIFT) as u32,
        })
    }
}

/// What happens to a node after it is freed. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolPolicy {
    /// Push freed nodes back on the free list.
    #[default]
    Reuse,
    /// Retire freed nodes; capacity is consumed for good.
    Release,
}

struct MemNode<T> {
    flag: AtomicU64,
    payload: RwLock<Option<Arc<T>>>,
    next_free: AtomicU32,
}

impl<T> MemNode<T> {
    fn idle() -> Self {
        Self {
            flag: AtomicU64::new(IDLE_FLAG),
            payload: RwLock::new(None),
            next_free: AtomicU32::new(NO_NODE),
        }
    }
}

struct FreeList {
    head: u32,
    created: u32,
    sequence: u32,
}

/// Fixed-capacity pool handing out [`MemHandle`]s.
pub struct MemPool<T> {
    name: &'static str,
    policy: PoolPolicy,
    capacity: u32,
    segments: [OnceLock<Box<[MemNode<T>]>>; SEGMENT_COUNT],
    state: SpinLock<FreeList>,
    live: AtomicU32,
}

/// `(segment, offset)` of an arena index.
fn locate(index: u32) -> (usize, usize) {
    let index = index as usize;
    let bucket = index / FIRST_SEGMENT_LEN + 1;
    let segment = (usize::BITS - 1 - bucket.leading_zeros()) as usize;
    let start = FIRST_SEGMENT_LEN * ((1 << segment) - 1);
    (segment, index - start)
}

impl<T> MemPool<T> {
    /// Empty pool. `capacity` is clamped to [`MAX_POOL_CAPACITY`].
    #[must_use]
    pub fn new(name: &'static str, capacity: u32, policy: PoolPolicy) -> Self {
        Self {
            name,
            policy,
            capacity: capacity.min(MAX_POOL_CAPACITY),
            segments: std::array::from_fn(|_| OnceLock::new()),
            state: SpinLock::new(FreeList {
                head: NO_NODE,
                created: 0,
                sequence: 0,
            }),
            live: AtomicU32::new(0),
        }
    }

    fn node(&self, index: u32) -> Option<&MemNode<T>> {
        let (segment, offset) = locate(index);
        self.segments.get(segment)?.get()?.get(offset)
    }

    /// Allocate a node holding `value`. `None` when the pool is exhausted.
    pub fn alloc(&self, value: T) -> Option<MemHandle> {
        let mut state = self.state.lock();
        let index = if state.head == NO_NODE {
            if state.created >= self.capacity {
                drop(state);
                warn!("{} pool exhausted at {} nodes", self.name, self.capacity);
                return None;
            }
            let index = state.created;
            let (segment, _) = locate(index);
            self.segments[segment].get_or_init(|| {
                (0..FIRST_SEGMENT_LEN << segment)
                    .map(|_| MemNode::idle())
                    .collect()
            });
            state.created += 1;
            index
        } else {
            let index = state.head;
            let next = self.node(index).map_or(NO_NODE, |n| n.next_free.load(Ordering::Relaxed));
            state.head = next;
            index
        };

        let node = self.node(index)?;
        let seq = state.sequence;
        state.sequence = seq.wrapping_add(1);
        *node.payload.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(value));
        node.flag.store(used_flag(seq), Ordering::Release);
        drop(state);

        self.live.fetch_add(1, Ordering::Relaxed);
        Some(MemHandle { index, seq })
    }

    /// Free a node, dropping its payload.
    pub fn free(&self, handle: MemHandle) -> bool {
        self.free_with(handle, drop)
    }

    /// Free a node and hand its payload to `destructor`.
    ///
    /// Only the caller whose handle still matches wins. Stale handles,
    /// foreign handles and double frees return `false` and leave
    /// `destructor` uncalled.
    pub fn free_with<F>(&self, handle: MemHandle, destructor: F) -> bool
    where
        F: FnOnce(Arc<T>),
    {
        let Some(node) = self.node(handle.index) else {
            return false;
        };
        if node
            .flag
            .compare_exchange(
                used_flag(handle.seq),
                IDLE_FLAG,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("{} pool: ignoring free of stale handle {handle:?}", self.name);
            return false;
        }

        let payload = node
            .payload
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(payload) = payload {
            destructor(payload);
        }

        if self.policy == PoolPolicy::Reuse {
            let mut state = self.state.lock();
            node.next_free.store(state.head, Ordering::Relaxed);
            state.head = handle.index;
        }
        self.live.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Payload of a live handle.
    pub fn get(&self, handle: MemHandle) -> Option<Arc<T>> {
        let node = self.node(handle.index)?;
        let payload = node.payload.read().unwrap_or_else(PoisonError::into_inner);
        if node.flag.load(Ordering::Acquire) != used_flag(handle.seq) {
            return None;
        }
        payload.clone()
    }

    /// Whether the handle's node is allocated, by whoever.
    pub fn mem_used(&self, handle: MemHandle) -> bool {
        self.node(handle.index)
            .is_some_and(|n| n.flag.load(Ordering::Acquire) & USED_FLAG != 0)
    }

    /// Whether the handle still names the allocation it was issued for.
    pub fn mem_match_seq(&self, handle: MemHandle) -> bool {
        self.node(handle.index)
            .is_some_and(|n| n.flag.load(Ordering::Acquire) == used_flag(handle.seq))
    }

    /// Handles of every allocated node.
    pub fn live_handles(&self) -> Vec<MemHandle> {
        let created = self.state.lock().created;
        (0..created)
            .filter_map(|index| {
                let flag = self.node(index)?.flag.load(Ordering::Acquire);
                #[allow(clippy::cast_possible_truncation)]
                let seq = (flag >> SEQ_SHIFT) as u32;
                (flag & USED_FLAG != 0).then_some(MemHandle { index, seq })
            })
            .collect()
    }

    /// Allocated node count.
    pub fn live_count(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// Nodes ever carved out of the arena.
    pub fn created_count(&self) -> u32 {
        self.state.lock().created
    }

    /// Upper bound on nodes.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Policy for freed nodes.
    pub const fn policy(&self) -> PoolPolicy {
        self.policy
    }
}

impl<T> fmt::Debug for MemPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("capacity", &self.capacity)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn locate_walks_doubling_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(15), (0, 15));
        assert_eq!(locate(16), (1, 0));
        assert_eq!(locate(47), (1, 31));
        assert_eq!(locate(48), (2, 0));
        assert_eq!(locate(111), (2, 63));
        assert_eq!(locate(112), (3, 0));
    }

    #[test]
    fn raw_encoding_is_never_zero() {
        let h = MemHandle { index: 0, seq: 0 };
        assert_ne!(h.to_raw(), 0);
        assert_eq!(MemHandle::from_raw(h.to_raw()), Some(h));
        assert_eq!(MemHandle::from_raw(0), None);
        assert_eq!(MemHandle::from_raw(7 << 32), None);
    }

    #[test]
    fn reused_node_gets_a_new_sequence() {
        let pool = MemPool::new("test", 4, PoolPolicy::Reuse);
        let first = pool.alloc(1u32).unwrap();
        assert!(pool.free(first));
        let second = pool.alloc(2u32).unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first.seq(), second.seq());
        assert!(!pool.mem_match_seq(first));
        assert!(pool.mem_match_seq(second));
        assert!(pool.mem_used(first));
        assert!(pool.get(first).is_none());
        assert_eq!(pool.get(second).as_deref(), Some(&2));
    }

    #[test]
    fn double_free_runs_destructor_once() {
        let pool = MemPool::new("test", 4, PoolPolicy::Reuse);
        let calls = AtomicUsize::new(0);
        let h = pool.alloc("payload").unwrap();
        assert!(pool.free_with(h, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!pool.free_with(h, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn capacity_bounds_allocation() {
        let pool = MemPool::new("test", 2, PoolPolicy::Reuse);
        let a = pool.alloc(()).unwrap();
        let _b = pool.alloc(()).unwrap();
        assert!(pool.alloc(()).is_none());
        pool.free(a);
        assert!(pool.alloc(()).is_some());
    }

    #[test]
    fn release_policy_retires_nodes() {
        let pool = MemPool::new("test", 2, PoolPolicy::Release);
        let a = pool.alloc(0u8).unwrap();
        pool.free(a);
        let b = pool.alloc(0u8).unwrap();
        assert_ne!(a.index(), b.index());
        pool.free(b);
        assert!(pool.alloc(0u8).is_none());
        assert_eq!(pool.policy(), PoolPolicy::Release);
    }

    #[test]
    fn live_handles_lists_allocated_nodes() {
        let pool = MemPool::new("test", 8, PoolPolicy::Reuse);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        let c = pool.alloc(3).unwrap();
        pool.free(b);
        let live: HashSet<_> = pool.live_handles().into_iter().collect();
        assert_eq!(live, HashSet::from([a, c]));
    }

    #[test]
    fn growth_crosses_segment_boundaries() {
        let pool = MemPool::new("test", 100, PoolPolicy::Reuse);
        let handles: Vec<_> = (0..100).map(|i| pool.alloc(i).unwrap()).collect();
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get(*h).as_deref(), Some(&i));
        }
        assert_eq!(pool.created_count(), 100);
    }

    #[test]
    fn concurrent_alloc_free_hands_out_unique_live_handles() {
        let pool = MemPool::new("test", 64, PoolPolicy::Reuse);
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let pool = &pool;
                s.spawn(move || {
                    for i in 0..500u32 {
                        let h = pool.alloc((t, i)).unwrap();
                        assert_eq!(pool.get(h).as_deref(), Some(&(t, i)));
                        assert!(pool.free(h));
                        assert!(!pool.mem_match_seq(h));
                    }
                });
            }
        });
        assert_eq!(pool.live_count(), 0);
        assert!(pool.created_count() <= 4);
    }
}
