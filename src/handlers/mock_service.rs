use super::{full, internal_error, ResponseBody};
use crate::event::SERVER_NAME;
use crate::mocks::MockRegistry;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// Content type of the AWS JSON 1.1 protocol used by Cognito.
const AMZ_JSON: &str = "application/x-amz-json-1.1";

/// Answers an AWS SDK call from a lambda running as a child process,
/// e.g. `X-Amz-Target: AWSCognitoIdentityProviderService.GetUser`.
/// Only the services in the registry are answered, everything else gets a 400 like AWS does for unknown operations.
pub(crate) async fn handler(req: Request<hyper::body::Incoming>, target: &str, mocks: &MockRegistry) -> Response<ResponseBody> {
    let Some((service, operation)) = mocks.resolve_target(target) else {
        warn!("Unsupported X-Amz-Target: {target}");
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"__type": "UnknownOperationException", "message": format!("{target} is not mocked")}),
        );
    };

    let body = match req.into_body().collect().await {
        Ok(v) => v.to_bytes(),
        Err(e) => {
            error!("Failed to read the mock request body: {:?}", e);
            return internal_error();
        }
    };

    // the SDKs send `{}` for calls without arguments, but some send nothing at all
    let args = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid JSON in {service}.{operation} call: {e}");
                return reply(
                    StatusCode::BAD_REQUEST,
                    json!({"__type": "SerializationException", "message": e.to_string()}),
                );
            }
        }
    };

    match mocks.mock(service, &operation, &args) {
        Some(v) => {
            info!("Mocked {service}.{operation}");
            reply(StatusCode::OK, v)
        }
        None => internal_error(),
    }
}

fn reply(status: StatusCode, body: Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", AMZ_JSON)
        .header("server", SERVER_NAME)
        .header("x-amzn-requestid", uuid::Uuid::new_v4().to_string())
        .body(full(body.to_string()))
        .unwrap_or_else(|_| internal_error())
}
