//! Request field access and response headers.

use tracing::debug;
use wasmtime::Caller;

use super::{BAD_ARGUMENT, INVALID_IDENT, ffi_return, resolve_job};
use crate::memory;
use crate::store::InstanceState;

/// `request_get_field(field_type, key_ptr, key_len, ident)`.
///
/// Field types: 0 meta, 1 body, 2 header, 3 params, 4 state.
pub(super) fn request_get_field(
    caller: &mut Caller<'_, InstanceState>,
    field_type: i32,
    key_ptr: i32,
    key_len: i32,
    ident: i32,
) -> i32 {
    let Some((slot, caps)) = resolve_job(caller, ident) else {
        return INVALID_IDENT;
    };

    let Ok(key) = memory::read_string(caller, key_ptr, key_len) else {
        return BAD_ARGUMENT;
    };

    let result = caps.request_handler.get_field(field_type, &key);
    ffi_return(&slot, "request_get_field", result)
}

pub(super) fn resp_set_header(
    caller: &mut Caller<'_, InstanceState>,
    key_ptr: i32,
    key_len: i32,
    val_ptr: i32,
    val_len: i32,
    ident: i32,
) {
    let Some((_, caps)) = resolve_job(caller, ident) else {
        return;
    };

    let (Ok(key), Ok(value)) = (
        memory::read_string(caller, key_ptr, key_len),
        memory::read_string(caller, val_ptr, val_len),
    ) else {
        debug!(ident, "resp_set_header with unreadable arguments");
        return;
    };

    if let Err(e) = caps.request_handler.set_response_header(&key, &value) {
        debug!(ident, key, error = %e, "resp_set_header failed");
    }
}
