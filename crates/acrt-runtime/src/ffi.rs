//! C ABI
//!
//! Every entry point returns an `rtError_t`: `0` on success, otherwise the
//! [`RtError::code`] of the failure. Failures are logged through `tracing`
//! before they cross the boundary.
//!
//! Context and stream handles are opaque non-null words carried in pointer
//! sized slots. Device addresses cross the boundary as plain pointers.

#![allow(non_camel_case_types, non_snake_case)]
#![warn(unsafe_op_in_unsafe_fn)]

use std::ffi::c_void;
use std::ptr::NonNull;
use std::time::Duration;

use acrt_drv::{DevicePtr, MallocPolicy, MemAttr, MemcpyKind};

use crate::api;
use crate::context::ContextHandle;
use crate::error::{status, Result, RtError};
use crate::stream::{StreamConfig, StreamHandle};

/// Status code, `0` on success
pub type rtError_t = i32;

/// Opaque context handle
pub type rtContext_t = *mut c_void;

/// Opaque stream handle
pub type rtStream_t = *mut c_void;

/// Host callback
pub type rtCallback_t = Option<unsafe extern "C" fn(*mut c_void)>;

/// Stream creation parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct rtStreamConfig {
    /// Scheduling priority, `0` is highest
    pub priority: u32,
    /// Creation flags
    pub flags: u32,
    /// Bytes of device workspace to reserve, `0` for none
    pub workspaceSize: u64,
}

impl From<rtStreamConfig> for StreamConfig {
    fn from(c: rtStreamConfig) -> Self {
        Self::default()
            .with_priority(c.priority)
            .with_flags(c.flags)
            .with_workspace_size(c.workspaceSize)
    }
}

/// User data handed back to a host callback on the processing thread.
struct SendPtr(*mut c_void);

// SAFETY: the pointer is opaque to the runtime; the caller of the launch owns the
// pointee and its thread-safety.
unsafe impl Send for SendPtr {}

impl SendPtr {
    fn into_inner(self) -> *mut c_void {
        self.0
    }
}

fn word_to_ptr(word: u64) -> Result<*mut c_void> {
    usize::try_from(word)
        .map(|addr| addr as *mut c_void)
        .map_err(|_| RtError::Internal)
}

fn ptr_to_word(ptr: *const c_void) -> u64 {
    ptr as usize as u64
}

fn out_ptr<T>(ptr: *mut T) -> Result<NonNull<T>> {
    NonNull::new(ptr).ok_or(RtError::InvalidParam)
}

fn device_id(device: i32) -> Result<u32> {
    u32::try_from(device).map_err(|_| RtError::InvalidDeviceId)
}

fn context(ctx: rtContext_t) -> Result<ContextHandle> {
    ContextHandle::from_raw(ptr_to_word(ctx)).ok_or(RtError::ContextNull)
}

fn stream(stream: rtStream_t) -> Result<StreamHandle> {
    StreamHandle::from_raw(ptr_to_word(stream)).ok_or(RtError::StreamNull)
}

fn device_ptr(ptr: *const c_void) -> DevicePtr {
    DevicePtr::new(ptr_to_word(ptr))
}

/// `-1` waits forever, other negatives are rejected.
fn timeout_ms(timeout: i32) -> Result<Option<Duration>> {
    match timeout {
        -1 => Ok(None),
        t => u64::try_from(t)
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| RtError::InvalidParam),
    }
}

fn host_call(func: rtCallback_t, data: *mut c_void) -> Result<impl FnOnce() + Send + 'static> {
    let func = func.ok_or(RtError::InvalidParam)?;
    let data = SendPtr(data);
    Ok(move || {
        let data = data.into_inner();
        // SAFETY: the launcher vouched for `func` accepting `data`.
        unsafe { func(data) }
    })
}

/// Bring up the process-wide runtime.
#[no_mangle]
pub extern "C" fn rtInit() -> rtError_t {
    status("rtInit", &api::init())
}

/// Tear down the process-wide runtime.
#[no_mangle]
pub extern "C" fn rtDeinit() -> rtError_t {
    status("rtDeinit", &api::deinit())
}

/// Retain `device` and make its primary context current.
#[no_mangle]
pub extern "C" fn rtSetDevice(device: i32) -> rtError_t {
    let result = device_id(device).and_then(api::set_device);
    status("rtSetDevice", &result)
}

/// Undo one `rtSetDevice`.
#[no_mangle]
pub extern "C" fn rtDeviceReset(device: i32) -> rtError_t {
    let result = device_id(device).and_then(api::device_reset);
    status("rtDeviceReset", &result)
}

/// Device of the current context.
///
/// # Safety
///
/// `device` must be null or valid for a write of an `i32`.
#[no_mangle]
pub unsafe extern "C" fn rtGetDevice(device: *mut i32) -> rtError_t {
    let result = out_ptr(device).and_then(|out| {
        let id = i32::try_from(api::get_device()?).map_err(|_| RtError::Internal)?;
        // SAFETY: non-null and writable per the contract above.
        unsafe { out.as_ptr().write(id) };
        Ok(())
    });
    status("rtGetDevice", &result)
}

/// Where the host program runs relative to the device.
///
/// # Safety
///
/// `mode` must be null or valid for a write of a `u32`.
#[no_mangle]
pub unsafe extern "C" fn rtGetRunMode(mode: *mut u32) -> rtError_t {
    let result = out_ptr(mode).and_then(|out| {
        let value = api::get_run_mode()?.as_u32();
        // SAFETY: non-null and writable per the contract above.
        unsafe { out.as_ptr().write(value) };
        Ok(())
    });
    status("rtGetRunMode", &result)
}

/// Create a context on `device` and make it current.
///
/// # Safety
///
/// `ctx` must be null or valid for a write of an `rtContext_t`.
#[no_mangle]
pub unsafe extern "C" fn rtCtxCreateEx(
    ctx: *mut rtContext_t,
    flags: u32,
    device: i32,
) -> rtError_t {
    let result = out_ptr(ctx).and_then(|out| {
        let handle = api::ctx_create(flags, device_id(device)?)?;
        match word_to_ptr(handle.to_raw()) {
            Ok(raw) => {
                // SAFETY: non-null and writable per the contract above.
                unsafe { out.as_ptr().write(raw) };
                Ok(())
            }
            Err(e) => {
                api::ctx_destroy(handle)?;
                Err(e)
            }
        }
    });
    status("rtCtxCreateEx", &result)
}

/// Destroy a context and the streams it owns.
#[no_mangle]
pub extern "C" fn rtCtxDestroyEx(ctx: rtContext_t) -> rtError_t {
    let result = context(ctx).and_then(api::ctx_destroy);
    status("rtCtxDestroyEx", &result)
}

/// The caller's current context.
///
/// # Safety
///
/// `ctx` must be null or valid for a write of an `rtContext_t`.
#[no_mangle]
pub unsafe extern "C" fn rtCtxGetCurrent(ctx: *mut rtContext_t) -> rtError_t {
    let result = out_ptr(ctx).and_then(|out| {
        let raw = word_to_ptr(api::ctx_get_current()?.to_raw())?;
        // SAFETY: non-null and writable per the contract above.
        unsafe { out.as_ptr().write(raw) };
        Ok(())
    });
    status("rtCtxGetCurrent", &result)
}

/// Make `ctx` current for the calling thread.
#[no_mangle]
pub extern "C" fn rtCtxSetCurrent(ctx: rtContext_t) -> rtError_t {
    let result = if ctx.is_null() {
        Err(RtError::InvalidParam)
    } else {
        context(ctx).and_then(|handle| api::ctx_set_current(Some(handle)))
    };
    status("rtCtxSetCurrent", &result)
}

/// Create a stream in the current context. A null `config` uses defaults.
///
/// # Safety
///
/// `stream` must be null or valid for a write of an `rtStream_t`; `config`
/// must be null or point to a readable `rtStreamConfig`.
#[no_mangle]
pub unsafe extern "C" fn rtStreamCreateWithConfig(
    stream: *mut rtStream_t,
    config: *const rtStreamConfig,
) -> rtError_t {
    let result = out_ptr(stream).and_then(|out| {
        // SAFETY: null or readable per the contract above.
        let config = unsafe { config.as_ref() }
            .copied()
            .map(StreamConfig::from)
            .unwrap_or_default();
        let handle = api::stream_create(&config)?;
        let raw = word_to_ptr(handle.to_raw())?;
        // SAFETY: non-null and writable per the contract above.
        unsafe { out.as_ptr().write(raw) };
        Ok(())
    });
    status("rtStreamCreateWithConfig", &result)
}

/// Destroy a stream of the current context.
#[no_mangle]
pub extern "C" fn rtStreamDestroy(handle: rtStream_t) -> rtError_t {
    let result = stream(handle).and_then(api::stream_destroy);
    status("rtStreamDestroy", &result)
}

/// Block until all work posted to the stream has completed.
#[no_mangle]
pub extern "C" fn rtStreamSynchronize(handle: rtStream_t) -> rtError_t {
    let result = stream(handle).and_then(api::stream_synchronize);
    status("rtStreamSynchronize", &result)
}

/// Submit-queue id of a stream.
///
/// # Safety
///
/// `sqid` must be null or valid for a write of a `u32`.
#[no_mangle]
pub unsafe extern "C" fn rtStreamGetSqid(handle: rtStream_t, sqid: *mut u32) -> rtError_t {
    let result = out_ptr(sqid).and_then(|out| {
        let id = api::stream_sqid(stream(handle)?)?;
        // SAFETY: non-null and writable per the contract above.
        unsafe { out.as_ptr().write(id) };
        Ok(())
    });
    status("rtStreamGetSqid", &result)
}

/// Workspace reserved for a stream; null and `0` if it has none.
///
/// # Safety
///
/// `addr` and `size` must be null or valid for writes of their pointee.
#[no_mangle]
pub unsafe extern "C" fn rtStreamGetWorkspace(
    handle: rtStream_t,
    addr: *mut *mut c_void,
    size: *mut u64,
) -> rtError_t {
    let result = out_ptr(addr).and_then(|addr| {
        let size = out_ptr(size)?;
        let (ptr, bytes) = match api::stream_workspace(stream(handle)?)? {
            Some(ws) => (word_to_ptr(ws.ptr.addr())?, ws.size),
            None => (std::ptr::null_mut(), 0),
        };
        // SAFETY: both non-null and writable per the contract above.
        unsafe {
            addr.as_ptr().write(ptr);
            size.as_ptr().write(bytes);
        }
        Ok(())
    });
    status("rtStreamGetWorkspace", &result)
}

/// Route the stream's callback reports to `thread_id`.
#[no_mangle]
pub extern "C" fn rtSubscribeReport(thread_id: u64, handle: rtStream_t) -> rtError_t {
    let result = stream(handle).and_then(|s| api::subscribe_report(thread_id, s));
    status("rtSubscribeReport", &result)
}

/// Undo `rtSubscribeReport`.
#[no_mangle]
pub extern "C" fn rtUnSubscribeReport(thread_id: u64, handle: rtStream_t) -> rtError_t {
    let result = stream(handle).and_then(|s| api::unsubscribe_report(thread_id, s));
    status("rtUnSubscribeReport", &result)
}

/// Route the stream's host-function reports to `thread_id`.
#[no_mangle]
pub extern "C" fn rtSubscribeHostFunc(thread_id: u64, handle: rtStream_t) -> rtError_t {
    let result = stream(handle).and_then(|s| api::subscribe_host_func(thread_id, s));
    status("rtSubscribeHostFunc", &result)
}

/// Undo `rtSubscribeHostFunc`.
#[no_mangle]
pub extern "C" fn rtUnSubscribeHostFunc(thread_id: u64, handle: rtStream_t) -> rtError_t {
    let result = stream(handle).and_then(|s| api::unsubscribe_host_func(thread_id, s));
    status("rtUnSubscribeHostFunc", &result)
}

/// Post `func(data)` on the stream for its callback subscriber.
///
/// # Safety
///
/// `func` must be safe to call with `data` from the thread that processes
/// the report.
#[no_mangle]
pub unsafe extern "C" fn rtCallbackLaunch(
    func: rtCallback_t,
    data: *mut c_void,
    handle: rtStream_t,
    isBlock: bool,
) -> rtError_t {
    let result = host_call(func, data)
        .and_then(|call| api::callback_launch(stream(handle)?, isBlock, call));
    status("rtCallbackLaunch", &result)
}

/// Run one callback routed to the calling thread. `-1` waits forever.
#[no_mangle]
pub extern "C" fn rtProcessReport(timeout: i32) -> rtError_t {
    let result = timeout_ms(timeout).and_then(api::process_report);
    status("rtProcessReport", &result)
}

/// Post `func(data)` on the stream for its host-function subscriber.
///
/// # Safety
///
/// Same as [`rtCallbackLaunch`].
#[no_mangle]
pub unsafe extern "C" fn rtLaunchHostFunc(
    handle: rtStream_t,
    func: rtCallback_t,
    data: *mut c_void,
) -> rtError_t {
    let result =
        host_call(func, data).and_then(|call| api::launch_host_func(stream(handle)?, call));
    status("rtLaunchHostFunc", &result)
}

/// Run one host function routed to the calling thread. `-1` waits forever.
#[no_mangle]
pub extern "C" fn rtProcessHostFunc(timeout: i32) -> rtError_t {
    let result = timeout_ms(timeout).and_then(api::process_host_func);
    status("rtProcessHostFunc", &result)
}

/// Allocate device memory.
///
/// # Safety
///
/// `dev_ptr` must be null or valid for a write of a pointer.
#[no_mangle]
pub unsafe extern "C" fn rtMalloc(dev_ptr: *mut *mut c_void, size: u64, policy: u32) -> rtError_t {
    let result = out_ptr(dev_ptr).and_then(|out| {
        let policy = MallocPolicy::from_u32(policy).ok_or(RtError::InvalidMallocType)?;
        let ptr = api::malloc(size, policy)?;
        match word_to_ptr(ptr.addr()) {
            Ok(raw) => {
                // SAFETY: non-null and writable per the contract above.
                unsafe { out.as_ptr().write(raw) };
                Ok(())
            }
            Err(e) => {
                api::free(ptr)?;
                Err(e)
            }
        }
    });
    status("rtMalloc", &result)
}

/// Free device memory.
#[no_mangle]
pub extern "C" fn rtFree(dev_ptr: *mut c_void) -> rtError_t {
    status("rtFree", &api::free(device_ptr(dev_ptr)))
}

/// Fill `count` bytes of device memory with the low byte of `value`.
#[no_mangle]
pub extern "C" fn rtMemset(
    dev_ptr: *mut c_void,
    dest_max: u64,
    value: u32,
    count: u64,
) -> rtError_t {
    let byte = value.to_le_bytes()[0];
    let result = api::memset(device_ptr(dev_ptr), dest_max, byte, count);
    status("rtMemset", &result)
}

/// Copy `count` bytes in the direction given by `kind`.
///
/// # Safety
///
/// Host-side buffers must be valid for `count` bytes of reads (`src`) or
/// writes (`dst`) and must not be mutated concurrently.
#[no_mangle]
pub unsafe extern "C" fn rtMemcpy(
    dst: *mut c_void,
    dest_max: u64,
    src: *const c_void,
    count: u64,
    kind: u32,
) -> rtError_t {
    // SAFETY: forwarded contract.
    let result = unsafe { memcpy(dst, dest_max, src, count, kind) };
    status("rtMemcpy", &result)
}

unsafe fn memcpy(
    dst: *mut c_void,
    dest_max: u64,
    src: *const c_void,
    count: u64,
    kind: u32,
) -> Result<()> {
    let kind = MemcpyKind::from_u32(kind).ok_or(RtError::InvalidParam)?;
    if dst.is_null() || src.is_null() || count > dest_max {
        return Err(RtError::InvalidParam);
    }
    let len = usize::try_from(count).map_err(|_| RtError::InvalidParam)?;
    match kind {
        MemcpyKind::HostToHost => {
            // SAFETY: both host buffers cover `len` bytes per the contract.
            unsafe { std::ptr::copy(src.cast::<u8>(), dst.cast::<u8>(), len) };
            Ok(())
        }
        MemcpyKind::HostToDevice => {
            // SAFETY: `src` is readable for `len` bytes per the contract.
            let bytes = unsafe { std::slice::from_raw_parts(src.cast::<u8>(), len) };
            api::memcpy_to_device(device_ptr(dst), dest_max, bytes)
        }
        MemcpyKind::DeviceToHost => {
            // SAFETY: `dst` is writable for `len` bytes per the contract.
            let bytes = unsafe { std::slice::from_raw_parts_mut(dst.cast::<u8>(), len) };
            api::memcpy_to_host(bytes, device_ptr(src))
        }
        MemcpyKind::DeviceToDevice => {
            api::memcpy_on_device(device_ptr(dst), dest_max, device_ptr(src), count)
        }
    }
}

/// Free and total bytes of one memory class on the current device.
///
/// # Safety
///
/// `free` and `total` must be null or valid for writes of a `u64`.
#[no_mangle]
pub unsafe extern "C" fn rtMemGetInfoEx(attr: u32, free: *mut u64, total: *mut u64) -> rtError_t {
    let result = out_ptr(free).and_then(|free| {
        let total = out_ptr(total)?;
        let attr = MemAttr::from_u32(attr).ok_or(RtError::InvalidParam)?;
        let info = api::mem_get_info(attr)?;
        // SAFETY: both non-null and writable per the contract above.
        unsafe {
            free.as_ptr().write(info.free);
            total.as_ptr().write(info.total);
        }
        Ok(())
    });
    status("rtMemGetInfoEx", &result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_decoding() {
        assert_eq!(timeout_ms(-1), Ok(None));
        assert_eq!(timeout_ms(0), Ok(Some(Duration::ZERO)));
        assert_eq!(timeout_ms(250), Ok(Some(Duration::from_millis(250))));
        assert_eq!(timeout_ms(-2), Err(RtError::InvalidParam));
    }

    #[test]
    fn handle_words_survive_the_pointer_slot() {
        let raw = (3u64 + 1) | (9u64 << 32);
        let ptr = word_to_ptr(raw).unwrap();
        assert_eq!(context(ptr).unwrap().to_raw(), raw);
        assert_eq!(context(std::ptr::null_mut()), Err(RtError::ContextNull));
        assert_eq!(stream(std::ptr::null_mut()), Err(RtError::StreamNull));
        assert_eq!(stream(word_to_ptr(1).unwrap()).unwrap().id(), 0);
    }

    #[test]
    fn config_conversion_keeps_fields() {
        let c = StreamConfig::from(rtStreamConfig {
            priority: 2,
            flags: 8,
            workspaceSize: 4096,
        });
        assert_eq!((c.priority, c.flags, c.workspace_size), (2, 8, 4096));
    }

    #[test]
    fn missing_callback_is_rejected() {
        assert!(matches!(
            host_call(None, std::ptr::null_mut()),
            Err(RtError::InvalidParam)
        ));
    }

    #[test]
    fn out_pointers_must_be_non_null() {
        assert_eq!(
            out_ptr::<u32>(std::ptr::null_mut()).unwrap_err(),
            RtError::InvalidParam
        );
        // SAFETY: null out pointer is rejected before any write.
        assert_eq!(unsafe { rtGetDevice(std::ptr::null_mut()) }, 107_000);
    }
}
