//! Integration tests for the `rt*` C ABI
//!
//! These drive the process-wide runtime, so every test holds `SERIAL` for
//! its whole duration.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use acrt_runtime::ffi::*;
use acrt_runtime::{api, current_thread_id, RtError, RT_SUCCESS};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    if api::is_initialized() {
        api::deinit().expect("leftover runtime");
    }
    guard
}

/// init, device, context, stream and back down, all returning success
#[test]
fn test_c_abi_lifecycle() {
    let _serial = serial();
    unsafe {
        assert_eq!(rtInit(), RT_SUCCESS);
        assert_eq!(rtSetDevice(0), RT_SUCCESS);

        let mut ctx: rtContext_t = ptr::null_mut();
        assert_eq!(rtCtxCreateEx(&mut ctx, 0, 0), RT_SUCCESS);
        assert!(!ctx.is_null());

        let mut current: rtContext_t = ptr::null_mut();
        assert_eq!(rtCtxGetCurrent(&mut current), RT_SUCCESS);
        assert_eq!(current, ctx);

        let mut device = -1;
        assert_eq!(rtGetDevice(&mut device), RT_SUCCESS);
        assert_eq!(device, 0);

        let mut stream: rtStream_t = ptr::null_mut();
        assert_eq!(rtStreamCreateWithConfig(&mut stream, ptr::null()), RT_SUCCESS);
        assert!(!stream.is_null());
        assert_eq!(rtStreamSynchronize(stream), RT_SUCCESS);
        assert_eq!(rtStreamDestroy(stream), RT_SUCCESS);
        assert_eq!(rtCtxDestroyEx(ctx), RT_SUCCESS);
        assert_eq!(rtDeviceReset(0), RT_SUCCESS);
        assert_eq!(rtDeinit(), RT_SUCCESS);
    }
    assert!(!api::is_initialized());
}

/// Calls outside init/deinit report the not-initialized status
#[test]
fn test_c_abi_requires_init() {
    let _serial = serial();
    let not_init = RtError::NotInitialized.code();
    assert_eq!(rtSetDevice(0), not_init);
    assert_eq!(rtDeinit(), not_init);
    assert_eq!(rtProcessReport(0), not_init);
}

/// Bad arguments are rejected with their status codes
#[test]
fn test_c_abi_argument_checks() {
    let _serial = serial();
    assert_eq!(rtInit(), RT_SUCCESS);
    unsafe {
        assert_eq!(rtSetDevice(-1), RtError::InvalidDeviceId.code());
        assert_eq!(rtSetDevice(7), RtError::InvalidDeviceId.code());
        assert_eq!(rtCtxSetCurrent(ptr::null_mut()), RtError::InvalidParam.code());
        assert_eq!(rtCtxDestroyEx(ptr::null_mut()), RtError::ContextNull.code());
        assert_eq!(rtStreamDestroy(ptr::null_mut()), RtError::StreamNull.code());
        assert_eq!(
            rtCtxCreateEx(ptr::null_mut(), 0, 0),
            RtError::InvalidParam.code()
        );
        assert_eq!(rtProcessReport(-2), RtError::InvalidParam.code());

        let mut stream: rtStream_t = ptr::null_mut();
        assert_eq!(
            rtStreamCreateWithConfig(&mut stream, ptr::null()),
            RtError::ContextNull.code()
        );

        let mut mode = u32::MAX;
        assert_eq!(rtGetRunMode(&mut mode), RT_SUCCESS);
        assert_eq!(mode, acrt_runtime::acrt_drv::RunMode::Online.as_u32());
    }
    assert_eq!(rtDeinit(), RT_SUCCESS);
}

/// Stream config, queue id and workspace cross the boundary intact
#[test]
fn test_c_abi_stream_queries() {
    let _serial = serial();
    assert_eq!(rtInit(), RT_SUCCESS);
    unsafe {
        let mut ctx: rtContext_t = ptr::null_mut();
        assert_eq!(rtCtxCreateEx(&mut ctx, 0, 0), RT_SUCCESS);

        let config = rtStreamConfig {
            priority: 1,
            flags: 0,
            workspaceSize: 1024,
        };
        let mut stream: rtStream_t = ptr::null_mut();
        assert_eq!(rtStreamCreateWithConfig(&mut stream, &config), RT_SUCCESS);

        let mut sqid = u32::MAX;
        assert_eq!(rtStreamGetSqid(stream, &mut sqid), RT_SUCCESS);
        assert_ne!(sqid, u32::MAX);

        let mut ws: *mut c_void = ptr::null_mut();
        let mut size = 0u64;
        assert_eq!(rtStreamGetWorkspace(stream, &mut ws, &mut size), RT_SUCCESS);
        assert!(!ws.is_null());
        assert_eq!(size, 1024);

        assert_eq!(rtCtxDestroyEx(ctx), RT_SUCCESS);
        assert_eq!(
            rtStreamGetSqid(stream, &mut sqid),
            RtError::StreamNull.code()
        );
    }
    assert_eq!(rtDeinit(), RT_SUCCESS);
}

/// Device memory through malloc, memset, memcpy in every direction and free
#[test]
fn test_c_abi_memory() {
    let _serial = serial();
    assert_eq!(rtInit(), RT_SUCCESS);
    unsafe {
        let mut ctx: rtContext_t = ptr::null_mut();
        assert_eq!(rtCtxCreateEx(&mut ctx, 0, 0), RT_SUCCESS);

        let mut a: *mut c_void = ptr::null_mut();
        let mut b: *mut c_void = ptr::null_mut();
        assert_eq!(rtMalloc(&mut a, 64, 0), RT_SUCCESS);
        assert_eq!(rtMalloc(&mut b, 64, 2), RT_SUCCESS);
        assert_eq!(rtMalloc(&mut b, 64, 9), RtError::InvalidMallocType.code());

        assert_eq!(rtMemset(a, 64, 0x1ff, 64), RT_SUCCESS);
        let src = *b"device";
        assert_eq!(
            rtMemcpy(a, 64, src.as_ptr().cast(), src.len() as u64, 1),
            RT_SUCCESS
        );
        assert_eq!(rtMemcpy(b, 64, a, 64, 3), RT_SUCCESS);

        let mut out = [0u8; 8];
        assert_eq!(rtMemcpy(out.as_mut_ptr().cast(), 8, b, 8, 2), RT_SUCCESS);
        assert_eq!(&out, b"device\xff\xff");

        let mut copy = [0u8; 8];
        assert_eq!(
            rtMemcpy(copy.as_mut_ptr().cast(), 8, out.as_ptr().cast(), 8, 0),
            RT_SUCCESS
        );
        assert_eq!(copy, out);
        assert_eq!(
            rtMemcpy(copy.as_mut_ptr().cast(), 4, out.as_ptr().cast(), 8, 0),
            RtError::InvalidParam.code()
        );

        let (mut free, mut total) = (0u64, 0u64);
        assert_eq!(rtMemGetInfoEx(2, &mut free, &mut total), RT_SUCCESS);
        assert_eq!(total - free, 128);

        assert_eq!(rtFree(a), RT_SUCCESS);
        assert_eq!(rtFree(b), RT_SUCCESS);
        assert_eq!(rtFree(ptr::null_mut()), RtError::InvalidParam.code());
        assert_eq!(rtCtxDestroyEx(ctx), RT_SUCCESS);
    }
    assert_eq!(rtDeinit(), RT_SUCCESS);
}

static CALLBACK_HITS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn count_callback(data: *mut c_void) {
    let step = unsafe { *data.cast::<usize>() };
    CALLBACK_HITS.fetch_add(step, Ordering::SeqCst);
}

/// A C callback launched on a stream runs on the processing thread with its
/// user data
#[test]
fn test_c_abi_callback() {
    let _serial = serial();
    assert_eq!(rtInit(), RT_SUCCESS);
    CALLBACK_HITS.store(0, Ordering::SeqCst);
    let mut step = 3usize;
    unsafe {
        let mut ctx: rtContext_t = ptr::null_mut();
        assert_eq!(rtCtxCreateEx(&mut ctx, 0, 0), RT_SUCCESS);
        let mut stream: rtStream_t = ptr::null_mut();
        assert_eq!(rtStreamCreateWithConfig(&mut stream, ptr::null()), RT_SUCCESS);

        let tid = current_thread_id();
        assert_eq!(
            rtCallbackLaunch(Some(count_callback), ptr::null_mut(), stream, false),
            RtError::StreamNoCallbackRegistered.code()
        );
        assert_eq!(rtSubscribeReport(tid, stream), RT_SUCCESS);
        assert_eq!(
            rtCallbackLaunch(None, ptr::null_mut(), stream, false),
            RtError::InvalidParam.code()
        );
        assert_eq!(
            rtCallbackLaunch(
                Some(count_callback),
                ptr::addr_of_mut!(step).cast(),
                stream,
                false
            ),
            RT_SUCCESS
        );
        assert_eq!(rtProcessReport(-1), RT_SUCCESS);
        assert_eq!(rtProcessReport(10), RtError::ReportTimeout.code());
        assert_eq!(rtUnSubscribeReport(tid, stream), RT_SUCCESS);

        assert_eq!(rtSubscribeHostFunc(tid, stream), RT_SUCCESS);
        assert_eq!(
            rtLaunchHostFunc(stream, Some(count_callback), ptr::addr_of_mut!(step).cast()),
            RT_SUCCESS
        );
        assert_eq!(rtProcessHostFunc(1000), RT_SUCCESS);
        assert_eq!(rtStreamSynchronize(stream), RT_SUCCESS);
        assert_eq!(rtUnSubscribeHostFunc(tid, stream), RT_SUCCESS);

        assert_eq!(rtStreamDestroy(stream), RT_SUCCESS);
        assert_eq!(rtCtxDestroyEx(ctx), RT_SUCCESS);
    }
    assert_eq!(CALLBACK_HITS.load(Ordering::SeqCst), 6);
    assert_eq!(rtDeinit(), RT_SUCCESS);
}
