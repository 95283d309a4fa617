use super::{empty, internal_error, with_common_headers, ResponseBody};
use hyper::{Response, StatusCode};
use tracing::debug;

/// Answers CORS preflight requests for any path. User handlers never see OPTIONS requests.
pub(crate) fn handler(path: &str) -> Response<ResponseBody> {
    debug!("Preflight: {path}");

    with_common_headers(StatusCode::OK)
        .body(empty())
        .unwrap_or_else(|_| internal_error())
}
