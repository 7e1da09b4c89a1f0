//! C ABI of the engine.
//!
//! Every function returns `0` on success or a negative status code (see
//! [`EngineError::code`]). Strings handed back to the host point into
//! engine-owned slots: they stay valid until the next call that rewrites the
//! same slot and must not be freed by the host.
//!
//! All entry points work on one process-wide [`NetworkInstance`].

use std::ffi::{c_char, c_int, CStr};
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use crate::error::{EngineError, EngineResult};
use crate::instance::{panic_message, Callback, NetworkInstance};
use crate::logger::init_logger;

static INSTANCE: OnceLock<NetworkInstance> = OnceLock::new();

fn instance() -> &'static NetworkInstance {
    INSTANCE.get_or_init(NetworkInstance::new)
}

/// Convert a C string to a Rust string.
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

unsafe fn write_out(out: *mut *const c_char, value: *const c_char) {
    if !out.is_null() {
        *out = value;
    }
}

/// Run `op` and translate the outcome to a status code. `err_msg` is only
/// written on failure, where it points at the error slot.
unsafe fn guarded<F>(err_msg: *mut *const c_char, op: F) -> c_int
where
    F: FnOnce(&'static NetworkInstance) -> EngineResult<()>,
{
    let instance = instance();
    let outcome = catch_unwind(AssertUnwindSafe(|| op(instance)));
    let err = match outcome {
        Ok(Ok(())) => return 0,
        Ok(Err(err)) => err,
        Err(panic) => {
            let err = EngineError::Fatal(format!("panic: {}", panic_message(&*panic)));
            instance.record_external_error(&err);
            err
        }
    };
    write_out(err_msg, instance.latest_error_ptr());
    err.code()
}

/// Reject a bad argument the instance never saw.
fn reject(instance: &NetworkInstance, err: EngineError) -> EngineResult<()> {
    instance.record_external_error(&err);
    Err(err)
}

/// Start the network instance.
///
/// # Safety
/// - `cfg` must be null or a valid null-terminated UTF-8 TOML document.
/// - `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn run_network_instance(
    cfg: *const c_char,
    err_msg: *mut *const c_char,
) -> c_int {
    guarded(err_msg, |instance| match cstr_to_string(cfg) {
        Some(cfg) => instance.run(&cfg),
        None => reject(
            instance,
            EngineError::Config("configuration is null or not UTF-8".into()),
        ),
    })
}

/// Stop the network instance. Stopping a stopped instance succeeds.
#[no_mangle]
pub extern "C" fn stop_network_instance() -> c_int {
    // SAFETY: a null error pointer is never written.
    unsafe { guarded(std::ptr::null_mut(), |instance| instance.stop()) }
}

/// Replace the stop callback. A null callback is rejected.
///
/// # Safety
/// - `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn register_stop_callback(
    callback: Option<Callback>,
    err_msg: *mut *const c_char,
) -> c_int {
    guarded(err_msg, |instance| instance.register_stop_callback(callback))
}

/// Replace the running-info callback. A null callback is rejected.
///
/// # Safety
/// - `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn register_running_info_callback(
    callback: Option<Callback>,
    err_msg: *mut *const c_char,
) -> c_int {
    guarded(err_msg, |instance| {
        instance.register_running_info_callback(callback)
    })
}

/// Create a room named `name` and host it. On success `result` points at the
/// room code.
///
/// # Safety
/// - `name` must be null or a valid null-terminated string.
/// - `err_msg` and `result` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn create_room(
    name: *const c_char,
    err_msg: *mut *const c_char,
    result: *mut *const c_char,
) -> c_int {
    write_out(result, std::ptr::null());
    let status = guarded(err_msg, |instance| match cstr_to_string(name) {
        Some(name) => instance.create_room(&name).map(|_| ()),
        None => reject(
            instance,
            EngineError::NameRejected("room name is null or not UTF-8".into()),
        ),
    });
    if status == 0 {
        write_out(result, instance().room_result_ptr());
    }
    status
}

/// Join the room identified by `code`.
///
/// # Safety
/// - `code` must be null or a valid null-terminated string.
/// - `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn join_room(code: *const c_char, err_msg: *mut *const c_char) -> c_int {
    guarded(err_msg, |instance| match cstr_to_string(code) {
        Some(code) => instance.join_room(&code),
        None => reject(
            instance,
            EngineError::RoomNotFound("room code is null or not UTF-8".into()),
        ),
    })
}

/// Point `msg` at the most recent error message.
///
/// # Safety
/// - `msg` and `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn get_latest_error_msg(
    msg: *mut *const c_char,
    err_msg: *mut *const c_char,
) -> c_int {
    write_out(msg, std::ptr::null());
    guarded(err_msg, |instance| {
        let ptr = instance.latest_error_ptr();
        if ptr.is_null() {
            return Err(EngineError::NoData);
        }
        write_out(msg, ptr);
        Ok(())
    })
}

/// Point `info` at the latest running-info JSON document.
///
/// # Safety
/// - `info` and `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn get_running_info(
    info: *mut *const c_char,
    err_msg: *mut *const c_char,
) -> c_int {
    write_out(info, std::ptr::null());
    let status = guarded(std::ptr::null_mut(), |instance| {
        let ptr = instance.running_info_ptr();
        if ptr.is_null() {
            return Err(EngineError::NoData);
        }
        write_out(info, ptr);
        Ok(())
    });
    // NoData is not recorded; the error slot may hold an older failure.
    if status != 0 {
        write_out(err_msg, std::ptr::null());
    }
    status
}

/// Hand the engine the host's TUN descriptor. The engine never closes it.
///
/// # Safety
/// - `err_msg` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn set_tun_fd(fd: c_int, err_msg: *mut *const c_char) -> c_int {
    guarded(err_msg, |instance| instance.set_tun_fd(fd as RawFd))
}

/// Install the logger with a filter such as `"debug"`. Always returns 0.
///
/// # Safety
/// - `level` must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn init_rust_logger(level: *const c_char) -> c_int {
    let level = cstr_to_string(level);
    let _ = catch_unwind(|| init_logger(level.as_deref()));
    0
}
