//! Outcome publication and FFI result retrieval.

use tracing::{error, warn};
use wasmtime::Caller;

use runnr_common::{CapabilityError, RunErr};

use super::{BAD_ARGUMENT, INVALID_IDENT, resolve};
use crate::memory;
use crate::store::InstanceState;

pub(super) fn return_result(caller: &mut Caller<'_, InstanceState>, ptr: i32, len: i32, ident: i32) {
    let Some(slot) = resolve(caller, ident) else {
        return;
    };

    let published = match memory::read_caller(caller, ptr, len) {
        Ok(bytes) => slot.publish_result(bytes),
        Err(e) => slot.publish_error(RunErr::new(-1, format!("invalid result buffer: {e}"))),
    };
    if !published {
        warn!(ident, "return_result ignored, outcome already published");
    }
}

pub(super) fn return_error(
    caller: &mut Caller<'_, InstanceState>,
    code: i32,
    ptr: i32,
    len: i32,
    ident: i32,
) {
    let Some(slot) = resolve(caller, ident) else {
        return;
    };

    let message = memory::read_string(caller, ptr, len)
        .unwrap_or_else(|e| format!("invalid error buffer: {e}"));
    if !slot.publish_error(RunErr::new(code, message)) {
        warn!(ident, "return_error ignored, outcome already published");
    }
}

pub(super) fn return_abort(
    caller: &mut Caller<'_, InstanceState>,
    msg_ptr: i32,
    msg_len: i32,
    file_ptr: i32,
    file_len: i32,
    line: i32,
    col: i32,
    ident: i32,
) {
    let Some(slot) = resolve(caller, ident) else {
        return;
    };

    let msg = memory::read_string(caller, msg_ptr, msg_len).unwrap_or_default();
    let file = memory::read_string(caller, file_ptr, file_len).unwrap_or_default();
    let message = format!("runnable abort: {msg}; file: {file}, line: {line}, col: {col}");

    error!(ident, "{message}");
    slot.publish_error(RunErr::new(-1, message));
}

/// Copy the parked FFI result to `ptr`. Returns its length.
pub(super) fn get_ffi_result(caller: &mut Caller<'_, InstanceState>, ptr: i32, ident: i32) -> i32 {
    let Some(slot) = resolve(caller, ident) else {
        return INVALID_IDENT;
    };

    let Some(bytes) = slot.take_ffi_result() else {
        warn!(ident, "get_ffi_result called with no result pending");
        return CapabilityError::not_found("ffi result").sentinel();
    };

    let written = memory::caller_memory(caller).and_then(|m| memory::write(m, &mut *caller, ptr, &bytes));
    match written {
        Ok(()) => i32::try_from(bytes.len()).unwrap_or(BAD_ARGUMENT),
        Err(e) => {
            warn!(ident, error = %e, "failed to copy ffi result into guest memory");
            BAD_ARGUMENT
        }
    }
}
