//! Integration tests for device, context and stream lifecycles
//!
//! All tests run against the software HAL, which counts opens, closes and
//! queue allocations so teardown can be checked from the outside.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use acrt_runtime::hals::{HalOp, SoftwareHal, SoftwareHalConfig};
use acrt_runtime::{
    acrt_drv::DrvError, DeviceTable, Platform, RtError, Runtime, RuntimeConfig, SpinPolicy,
    StreamConfig,
};

fn runtime() -> (Runtime, Arc<SoftwareHal>) {
    Runtime::with_software_hal(RuntimeConfig::default(), SoftwareHalConfig::default())
        .expect("software runtime")
}

/// The canonical bring-up / tear-down sequence succeeds step by step
#[test]
fn test_full_lifecycle_sequence() {
    let (rt, hal) = runtime();

    rt.set_device(0).expect("set device");
    let ctx = rt.ctx_create(0, 0).expect("create context");
    assert_eq!(rt.ctx_get_current(), Ok(ctx));

    let stream = rt
        .stream_create(&StreamConfig::default())
        .expect("create stream");
    assert_eq!(rt.stream_context(stream), Ok(ctx));
    rt.stream_synchronize(stream).expect("synchronize");
    rt.stream_destroy(stream).expect("destroy stream");
    rt.ctx_destroy(ctx).expect("destroy context");
    rt.device_reset(0).expect("reset device");

    assert_eq!(rt.device_ref_count(0), 0);
    assert_eq!(rt.live_context_count(), 0);
    assert_eq!(hal.open_count(0), 1);
    assert_eq!(hal.close_count(0), 1);
    assert_eq!(hal.queue_count(0), 0);
}

/// Streams left behind are torn down with their context
#[test]
fn test_context_destroy_releases_remaining_streams() {
    let (rt, hal) = runtime();
    let ctx = rt.ctx_create(0, 0).expect("create context");

    let streams: Vec<_> = (0..5)
        .map(|_| rt.stream_create(&StreamConfig::default()).expect("create stream"))
        .collect();
    assert_eq!(hal.queue_count(0), 5);
    for &s in &streams[..4] {
        rt.stream_destroy(s).expect("destroy stream");
    }
    assert_eq!(rt.ctx_stream_count(ctx), Ok(1));

    let survivor = streams[4];
    let sq = rt.stream_sqid(survivor).expect("sq id");
    assert!(hal.has_queue(0, sq));

    rt.ctx_destroy(ctx).expect("destroy context");
    assert!(!hal.has_queue(0, sq));
    assert_eq!(hal.queue_count(0), 0);
    assert_eq!(rt.stream_sqid(survivor), Err(RtError::StreamNull));
    assert_eq!(rt.ctx_destroy(ctx), Err(RtError::ContextNull));
    assert!(!hal.is_open(0));
}

/// Destroying another context's stream fails and changes nothing
#[test]
fn test_stream_destroy_from_foreign_context() {
    let (rt, hal) = runtime();
    let a = rt.ctx_create(0, 0).expect("context a");
    let stream = rt
        .stream_create(&StreamConfig::default())
        .expect("create stream");

    let b = rt.ctx_create(0, 0).expect("context b");
    assert_eq!(rt.ctx_get_current(), Ok(b));
    assert_eq!(rt.stream_destroy(stream), Err(RtError::StreamContextMismatch));
    assert_eq!(rt.ctx_stream_count(a), Ok(1));
    assert_eq!(rt.ctx_stream_count(b), Ok(0));
    assert_eq!(hal.queue_count(0), 1);

    rt.ctx_set_current(Some(a)).expect("switch back");
    rt.stream_destroy(stream).expect("destroy from owner");
    assert_eq!(rt.ctx_stream_count(a), Ok(0));
}

/// Device refcount stays consistent under concurrent retain and release,
/// and the device is opened exactly once
#[test]
fn test_concurrent_device_retain_release() {
    const ITERATIONS: u64 = 1000;

    let hal = Arc::new(SoftwareHal::new(SoftwareHalConfig::default()));
    let table = DeviceTable::new(hal.clone(), 1, SpinPolicy::DEFAULT);
    table.retain(0).expect("initial retain");

    let released = AtomicU64::new(0);
    let barrier = Barrier::new(3);
    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..ITERATIONS {
                    table.retain(0).expect("retain");
                }
            });
        }
        s.spawn(|| {
            barrier.wait();
            for _ in 0..ITERATIONS {
                if table.ref_count(0) > 1 {
                    table.release(0).expect("release");
                    released.fetch_add(1, Ordering::Relaxed);
                }
                std::thread::yield_now();
            }
        });
    });

    let expected = 1 + 2 * ITERATIONS - released.load(Ordering::Relaxed);
    assert_eq!(table.ref_count(0), expected);
    assert_eq!(hal.open_count(0), 1);
    assert_eq!(hal.close_count(0), 0);

    for _ in 0..expected {
        table.release(0).expect("drain");
    }
    assert_eq!(hal.close_count(0), 1);
    assert_eq!(table.release(0), Err(RtError::InvalidParam));
}

/// A failed open leaves the slot empty and the next retain tries again
#[test]
fn test_failed_open_is_retried() {
    let (rt, hal) = runtime();
    hal.fail_next(HalOp::DeviceOpen, DrvError::InvalidValue);
    assert_eq!(rt.ctx_create(0, 0), Err(RtError::DevSetup));
    assert_eq!(rt.device_ref_count(0), 0);
    assert_eq!(rt.live_context_count(), 0);

    rt.ctx_create(0, 0).expect("second attempt");
    assert_eq!(rt.device_ref_count(0), 1);
    assert_eq!(hal.open_count(0), 1);
}

/// A stale context handle is rejected after its pool slot is reused
#[test]
fn test_reused_context_slot_rejects_old_handle() {
    let (rt, _hal) = runtime();
    let old = rt.ctx_create(0, 0).expect("create");
    rt.ctx_destroy(old).expect("destroy");
    let new = rt.ctx_create(0, 0).expect("create again");
    assert_ne!(old, new);
    assert_eq!(rt.ctx_set_current(Some(old)), Err(RtError::ContextNull));
    assert_eq!(rt.ctx_destroy(old), Err(RtError::ContextNull));
    assert_eq!(rt.ctx_get_current(), Ok(new));
}

/// Each thread sees its own current context
#[test]
fn test_current_context_is_per_thread() {
    for platform in [Platform::Hosted, Platform::TaskTable] {
        let config = RuntimeConfig::default().with_platform(platform);
        let (rt, _hal) = Runtime::with_software_hal(config, SoftwareHalConfig::default())
            .expect("software runtime");
        let main_ctx = rt.ctx_create(0, 0).expect("main context");

        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(rt.ctx_get_current(), Err(RtError::ContextNull));
                let own = rt.ctx_create(0, 0).expect("thread context");
                assert_eq!(rt.ctx_get_current(), Ok(own));
                rt.ctx_destroy(own).expect("destroy thread context");
                assert_eq!(rt.ctx_get_current(), Err(RtError::ContextNull));
            })
            .join()
            .expect("thread");
        });

        assert_eq!(rt.ctx_get_current(), Ok(main_ctx), "{platform}");
    }
}

/// Stream creation fails cleanly when the driver runs out of queues
#[test]
fn test_stream_queue_exhaustion() {
    let hal_config = SoftwareHalConfig {
        max_queues: 2,
        ..SoftwareHalConfig::default()
    };
    let (rt, hal) = Runtime::with_software_hal(RuntimeConfig::default(), hal_config)
        .expect("software runtime");
    let ctx = rt.ctx_create(0, 0).expect("create context");
    rt.stream_create(&StreamConfig::default()).expect("first");
    rt.stream_create(&StreamConfig::default()).expect("second");
    assert_eq!(
        rt.stream_create(&StreamConfig::default()),
        Err(RtError::StreamResourceExhausted)
    );
    assert_eq!(rt.ctx_stream_count(ctx), Ok(2));
    assert_eq!(hal.queue_count(0), 2);
}

/// A workspace is carved out of device memory and returned on destroy
#[test]
fn test_stream_workspace() {
    let (rt, hal) = runtime();
    rt.ctx_create(0, 0).expect("create context");
    let plain = rt
        .stream_create(&StreamConfig::default())
        .expect("plain stream");
    assert_eq!(rt.stream_workspace(plain), Ok(None));

    let config = StreamConfig::default()
        .with_priority(3)
        .with_workspace_size(4096);
    let with_ws = rt.stream_create(&config).expect("workspace stream");
    let ws = rt
        .stream_workspace(with_ws)
        .expect("workspace")
        .expect("reserved");
    assert_eq!(ws.size, 4096);
    assert!(!ws.ptr.is_null());
    assert!(hal.allocated_bytes(0) >= 4096);

    rt.stream_destroy(with_ws).expect("destroy");
    assert_eq!(hal.allocated_bytes(0), 0);
    assert_eq!(
        rt.stream_create(&StreamConfig::default().with_priority(8)),
        Err(RtError::InvalidParam)
    );
}
