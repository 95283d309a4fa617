use super::{full, internal_error, ResponseBody};
use crate::event::{common_headers, to_event, to_http_response, HttpReply, Identity};
use crate::lambda::{invoke, InvocationContext};
use crate::mocks::MockRegistry;
use crate::router::RouteBinding;
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-request inputs that do not come from the request itself.
pub(crate) struct ProxyContext<'a> {
    pub identity: &'a Identity,
    pub mocks: Arc<MockRegistry>,
    pub timeout: Option<Duration>,
    pub remote: Option<SocketAddr>,
}

/// Converts the HTTP request into an event, invokes the lambda of the route with Cognito mocked
/// and converts its result back into an HTTP response.
/// Any failure of the handler is logged and returned to the client as a generic 500.
pub(crate) async fn handler(
    req: Request<hyper::body::Incoming>,
    route: &RouteBinding,
    path_params: HashMap<String, String>,
    ctx: ProxyContext<'_>,
) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(v) => v.to_bytes(),
        Err(e) => {
            error!("Failed to read the request body: {:?}", e);
            return internal_error();
        }
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let event = to_event(
        &parts,
        &body,
        path_params,
        ctx.remote.map(|v| v.ip()),
        ctx.identity,
        &request_id,
    );

    let event = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to serialize the event: {e}");
            return internal_error();
        }
    };

    debug!("Invoking {} with request ID {request_id}", route.handler.name());

    // the dispatcher lives only as long as this invocation
    let lambda_ctx = InvocationContext::http(&request_id, route.handler.name(), ctx.mocks);
    let result = match invoke(&route.handler, event, lambda_ctx, ctx.timeout).await {
        Ok(v) => v,
        Err(e) => {
            error!("{} {}: {e}", parts.method, parts.uri.path());
            return internal_error();
        }
    };

    let reply = match to_http_response(&result) {
        Ok(v) => v,
        Err(e) => {
            error!("{} returned an invalid result: {e}\n{result}", route.handler.name());
            return internal_error();
        }
    };

    info!("{} {} -> {}", parts.method, parts.uri.path(), reply.status);

    into_response(reply)
}

/// Builds the HTTP response from the converted handler result.
/// The common headers are added unless the handler set a header with the same name.
pub(crate) fn into_response(reply: HttpReply) -> Response<ResponseBody> {
    let mut resp = Response::new(full(reply.body));
    *resp.status_mut() = reply.status;

    let headers = resp.headers_mut();

    for (name, value) in reply.headers {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid header name {name:?} dropped: {e}");
                continue;
            }
        };
        match HeaderValue::from_str(&value) {
            Ok(v) => {
                headers.append(name, v);
            }
            Err(e) => warn!("Invalid value of header {name} dropped: {e}"),
        }
    }

    for (name, value) in common_headers() {
        if !headers.contains_key(name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }

    resp
}
