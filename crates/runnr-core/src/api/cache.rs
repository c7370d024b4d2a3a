//! Cache host functions.

use tracing::debug;
use wasmtime::Caller;

use super::{BAD_ARGUMENT, INVALID_IDENT, ffi_return, resolve_job};
use crate::memory;
use crate::store::InstanceState;

/// `cache_set(key_ptr, key_len, val_ptr, val_len, ttl, ident)`. Returns 0 on success.
pub(super) async fn cache_set(
    caller: &mut Caller<'_, InstanceState>,
    key_ptr: i32,
    key_len: i32,
    val_ptr: i32,
    val_len: i32,
    ttl: i32,
    ident: i32,
) -> i32 {
    let Some((_, caps)) = resolve_job(caller, ident) else {
        return INVALID_IDENT;
    };

    let Ok(key) = memory::read_string(caller, key_ptr, key_len) else {
        return BAD_ARGUMENT;
    };
    let Ok(value) = memory::read_caller(caller, val_ptr, val_len) else {
        return BAD_ARGUMENT;
    };

    match caps.cache.set(&key, value, ttl).await {
        Ok(()) => 0,
        Err(e) => {
            debug!(ident, key, error = %e, "cache_set failed");
            e.sentinel()
        }
    }
}

/// `cache_get(key_ptr, key_len, ident)`. Returns the value length.
pub(super) async fn cache_get(
    caller: &mut Caller<'_, InstanceState>,
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

    let result = caps.cache.get(&key).await;
    ffi_return(&slot, "cache_get", result)
}
