//! Outbound HTTP and GraphQL.

use tracing::debug;
use wasmtime::Caller;

use runnr_host::{HttpMethod, HttpRequest};

use super::{BAD_ARGUMENT, INVALID_IDENT, ffi_return, resolve_job};
use crate::memory;
use crate::store::InstanceState;

/// `fetch_url(method, url_ptr, url_len, body_ptr, body_len, ident)`.
///
/// The URL buffer packs the URL followed by `::`-separated `Name:value`
/// headers. Returns the response body length.
pub(super) async fn fetch_url(
    caller: &mut Caller<'_, InstanceState>,
    method: i32,
    url_ptr: i32,
    url_len: i32,
    body_ptr: i32,
    body_len: i32,
    ident: i32,
) -> i32 {
    let Some((slot, caps)) = resolve_job(caller, ident) else {
        return INVALID_IDENT;
    };

    let Ok(packed) = memory::read_string(caller, url_ptr, url_len) else {
        return BAD_ARGUMENT;
    };
    let body = if body_len > 0 {
        match memory::read_caller(caller, body_ptr, body_len) {
            Ok(body) => body,
            Err(_) => return BAD_ARGUMENT,
        }
    } else {
        Vec::new()
    };

    let request = match HttpMethod::from_code(method)
        .and_then(|method| HttpRequest::from_packed(method, &packed, body))
    {
        Ok(request) => request,
        Err(e) => return ffi_return(&slot, "fetch_url", Err(e)),
    };

    debug!(ident, method = ?request.method, url = %request.url, "fetch_url");
    let result = caps
        .http
        .do_request(&*caps.auth, request)
        .await
        .map(|response| response.body);
    ffi_return(&slot, "fetch_url", result)
}

/// `graphql_query(endpoint_ptr, endpoint_len, query_ptr, query_len, ident)`.
///
/// Returns the length of the response JSON.
pub(super) async fn graphql_query(
    caller: &mut Caller<'_, InstanceState>,
    endpoint_ptr: i32,
    endpoint_len: i32,
    query_ptr: i32,
    query_len: i32,
    ident: i32,
) -> i32 {
    let Some((slot, caps)) = resolve_job(caller, ident) else {
        return INVALID_IDENT;
    };

    let (Ok(endpoint), Ok(query)) = (
        memory::read_string(caller, endpoint_ptr, endpoint_len),
        memory::read_string(caller, query_ptr, query_len),
    ) else {
        return BAD_ARGUMENT;
    };

    let result = caps.graphql.query(&*caps.auth, &endpoint, &query).await;
    ffi_return(&slot, "graphql_query", result)
}
