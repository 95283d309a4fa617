//! Responders for the different kinds of requests the dev server accepts.

use crate::event::common_headers;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::http::response::Builder;
use hyper::{Response, StatusCode};
use tracing::error;

pub(crate) mod lambda_proxy;
pub(crate) mod landing;
pub(crate) mod mock_service;
pub(crate) mod preflight;

/// The response body type used by all handlers.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Returns an empty response body.
pub(crate) fn empty() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Returns an response body with contents of `chunk` which can be some type convertible into Bytes, e.g. &str.
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ResponseBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// A response builder with the CORS, content type and server headers already set.
pub(crate) fn with_common_headers(status: StatusCode) -> Builder {
    common_headers()
        .into_iter()
        .fold(Response::builder().status(status), |builder, (name, value)| {
            builder.header(name, value)
        })
}

/// The generic 500 response. The details go to the log, not to the client.
pub(crate) fn internal_error() -> Response<ResponseBody> {
    with_common_headers(StatusCode::INTERNAL_SERVER_ERROR)
        .body(full(r#"{"message":"Internal Server Error"}"#))
        .unwrap_or_else(|e| {
            error!("Failed to build the error response: {e}");
            let mut resp = Response::new(empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}
