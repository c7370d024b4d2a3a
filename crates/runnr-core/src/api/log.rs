//! Guest logging.

use tracing::warn;
use wasmtime::Caller;

use runnr_common::FieldType;
use runnr_host::{LogLevel, LogScope};

use super::resolve_job;
use crate::memory;
use crate::store::InstanceState;

/// `log_msg(ptr, len, level, ident)`.
///
/// Messages from an invalid identifier or with an unreadable buffer are
/// dropped. A logger failure is reported on the host side and never reaches
/// the guest.
pub(super) fn log_msg(caller: &mut Caller<'_, InstanceState>, ptr: i32, len: i32, level: i32, ident: i32) {
    let Some((_, caps)) = resolve_job(caller, ident) else {
        return;
    };
    let Ok(message) = memory::read_string(caller, ptr, len) else {
        return;
    };

    let mut scope = LogScope::new(ident);
    if let Some(request) = caps.request_handler.request() {
        if let Ok(id) = request.lock().field(FieldType::Meta, "id") {
            scope = scope.with_request_id(String::from_utf8_lossy(&id));
        }
    }

    if let Err(e) = caps.logger.log(LogLevel::from_code(level), &message, &scope) {
        warn!(ident, error = %e, "guest log message dropped");
    }
}
