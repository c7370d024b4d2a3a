//! The Runnable API: host functions imported by guests from `env`.
//!
//! Every function takes the caller's FFI identifier as its last argument and
//! is registered twice: under its own name, and with a `_swift` suffix
//! taking two extra trailing `i32`s (`swiftself`, `swifterr`) that are
//! ignored.
//!
//! Functions that produce bytes park them in the instance's FFI result slot
//! and return their length; the guest copies them out with
//! `get_ffi_result`. Failures return negative sentinels:
//!
//! | Sentinel | Meaning |
//! |---|---|
//! | `-1` | invalid identifier, or the capability is disabled |
//! | `-2` | bad argument or rule violation |
//! | `-3` | not found |
//! | `-4` | downstream failure |
//! | `-status` | non-2xx HTTP status |
//!
//! Host functions never trap the guest or panic the host.

mod cache;
mod file;
mod http;
mod log;
mod request;
mod result;

use std::sync::Arc;

use tracing::{debug, warn};
use wasmtime::{Caller, Linker};

use runnr_common::{CapabilityError, RuntimeError};
use runnr_host::Capabilities;

use crate::WasmEngine;
use crate::ffi::{self, InstanceSlot};
use crate::store::InstanceState;

/// Module name guests import the Runnable API from.
pub const IMPORT_MODULE: &str = "env";

/// Returned when the identifier does not resolve to the calling instance.
pub(crate) const INVALID_IDENT: i32 = -1;

/// Returned when a guest pointer or length is unusable.
pub(crate) const BAD_ARGUMENT: i32 = -2;

/// Register a synchronous host function and its `_swift` variant.
macro_rules! link_sync {
    ($linker:ident, $name:literal, $func:path, ($($arg:ident),*)) => {
        $linker
            .func_wrap(
                IMPORT_MODULE,
                $name,
                |mut caller: Caller<'_, InstanceState>, $($arg: i32),*| $func(&mut caller, $($arg),*),
            )
            .map_err(|e| link_error($name, &e))?;
        $linker
            .func_wrap(
                IMPORT_MODULE,
                concat!($name, "_swift"),
                |mut caller: Caller<'_, InstanceState>, $($arg: i32,)* _swiftself: i32, _swifterr: i32| {
                    $func(&mut caller, $($arg),*)
                },
            )
            .map_err(|e| link_error($name, &e))?;
    };
}

/// Register an async host function and its `_swift` variant.
macro_rules! link_async {
    (@i32 $arg:ident) => { i32 };
    ($linker:ident, $name:literal, $func:path, ($($arg:ident),*)) => {
        $linker
            .func_wrap_async(
                IMPORT_MODULE,
                $name,
                |mut caller: Caller<'_, InstanceState>, ($($arg,)*): ($(link_async!(@i32 $arg),)*)| {
                    Box::new(async move { $func(&mut caller, $($arg),*).await })
                },
            )
            .map_err(|e| link_error($name, &e))?;
        $linker
            .func_wrap_async(
                IMPORT_MODULE,
                concat!($name, "_swift"),
                |mut caller: Caller<'_, InstanceState>,
                 ($($arg,)* _swiftself, _swifterr): ($(link_async!(@i32 $arg),)* i32, i32)| {
                    Box::new(async move { $func(&mut caller, $($arg),*).await })
                },
            )
            .map_err(|e| link_error($name, &e))?;
    };
}

/// Build a linker with WASI preview1 and every Runnable API function.
///
/// # Errors
///
/// Returns an error if a function cannot be registered.
pub fn build_linker(engine: &WasmEngine) -> Result<Linker<InstanceState>, RuntimeError> {
    let mut linker: Linker<InstanceState> = Linker::new(engine.inner());

    wasmtime_wasi::preview1::add_to_linker_async(&mut linker, InstanceState::wasi_mut)
        .map_err(|e| link_error("wasi_snapshot_preview1", &e))?;

    link_sync!(linker, "return_result", result::return_result, (ptr, len, ident));
    link_sync!(linker, "return_error", result::return_error, (code, ptr, len, ident));
    link_sync!(
        linker,
        "return_abort",
        result::return_abort,
        (msg_ptr, msg_len, file_ptr, file_len, line, col, ident)
    );
    link_sync!(linker, "get_ffi_result", result::get_ffi_result, (ptr, ident));

    link_async!(
        linker,
        "fetch_url",
        http::fetch_url,
        (method, url_ptr, url_len, body_ptr, body_len, ident)
    );
    link_async!(
        linker,
        "graphql_query",
        http::graphql_query,
        (endpoint_ptr, endpoint_len, query_ptr, query_len, ident)
    );

    link_async!(
        linker,
        "cache_set",
        cache::cache_set,
        (key_ptr, key_len, val_ptr, val_len, ttl, ident)
    );
    link_async!(linker, "cache_get", cache::cache_get, (key_ptr, key_len, ident));

    link_sync!(
        linker,
        "request_get_field",
        request::request_get_field,
        (field_type, key_ptr, key_len, ident)
    );
    link_sync!(
        linker,
        "resp_set_header",
        request::resp_set_header,
        (key_ptr, key_len, val_ptr, val_len, ident)
    );

    link_sync!(linker, "get_static_file", file::get_static_file, (name_ptr, name_len, ident));
    link_sync!(linker, "log_msg", log::log_msg, (ptr, len, level, ident));

    debug!("runnable api linked");
    Ok(linker)
}

fn link_error(name: &str, error: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to link host function {name}: {error}"))
}

/// The slot for `ident`, if it belongs to the calling instance.
pub(crate) fn resolve(caller: &Caller<'_, InstanceState>, ident: i32) -> Option<Arc<InstanceSlot>> {
    ffi::resolve(ident, caller.data().slot())
}

/// The slot and capabilities for `ident`, if it belongs to the calling
/// instance and a job is bound to it.
pub(crate) fn resolve_job(
    caller: &Caller<'_, InstanceState>,
    ident: i32,
) -> Option<(Arc<InstanceSlot>, Capabilities)> {
    let slot = resolve(caller, ident)?;
    let capabilities = slot.capabilities()?;
    Some((slot, capabilities))
}

/// Park a capability result for the guest, or turn its error into a sentinel.
pub(crate) fn ffi_return(
    slot: &InstanceSlot,
    op: &'static str,
    result: Result<Vec<u8>, CapabilityError>,
) -> i32 {
    match result {
        Ok(bytes) => match i32::try_from(bytes.len()) {
            Ok(len) => {
                slot.set_ffi_result(bytes);
                len
            }
            Err(_) => {
                warn!(op, "result too large for the guest");
                CapabilityError::downstream("result too large").sentinel()
            }
        },
        Err(e) => {
            debug!(op, error = %e, sentinel = e.sentinel(), "host call failed");
            e.sentinel()
        }
    }
}
