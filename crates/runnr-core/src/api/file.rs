//! Static file access.

use wasmtime::Caller;

use super::{BAD_ARGUMENT, INVALID_IDENT, ffi_return, resolve_job};
use crate::memory;
use crate::store::InstanceState;

/// `get_static_file(name_ptr, name_len, ident)`. Returns the file length.
pub(super) fn get_static_file(
    caller: &mut Caller<'_, InstanceState>,
    name_ptr: i32,
    name_len: i32,
    ident: i32,
) -> i32 {
    let Some((slot, caps)) = resolve_job(caller, ident) else {
        return INVALID_IDENT;
    };

    let Ok(name) = memory::read_string(caller, name_ptr, name_len) else {
        return BAD_ARGUMENT;
    };

    ffi_return(&slot, "get_static_file", caps.file_source.get_static(&name))
}
