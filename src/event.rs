//! Conversion between HTTP requests / responses and the API Gateway style events
//! exchanged with the lambda handlers.

use base64::Engine;
use hyper::body::Bytes;
use hyper::http::request::Parts;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

/// The value of the `Server` header on all responses.
pub const SERVER_NAME: &str = "Cloudly Dev Server";

/// Account ID reported in the request context of every event.
pub const ACCOUNT_ID: &str = "123456789012";

/// CORS headers returned on preflight requests and added to all handler responses.
pub const CORS_HEADERS: [(&str, &str); 7] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "*"),
    ("access-control-allow-credentials", "true"),
    ("access-control-max-age", "86400"),
    ("access-control-expose-headers", "*"),
    (
        "vary",
        "Origin, Access-Control-Request-Method, Access-Control-Request-Headers",
    ),
];

/// All headers the dev server sets on its own: CORS + content type + server name.
pub fn common_headers() -> Vec<(&'static str, &'static str)> {
    let mut headers = CORS_HEADERS.to_vec();
    headers.push(("content-type", "application/json"));
    headers.push(("server", SERVER_NAME));
    headers
}

/// The caller identity used to synthesize JWT claims.
/// Nothing is signed or verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub username: Option<String>,
    pub groups: Vec<String>,
    pub client_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Space separated group names in square brackets, e.g. `[admin editors]`
    #[serde(rename = "cognito:groups")]
    pub groups: String,
    pub username: Option<String>,
    pub client_id: String,
}

impl From<&Identity> for Claims {
    fn from(identity: &Identity) -> Self {
        Self {
            groups: ["[", &identity.groups.join(" "), "]"].concat(),
            username: identity.username.clone(),
            client_id: identity.client_id.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jwt {
    pub claims: Claims,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Authorizer {
    pub jwt: Jwt,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpContext {
    pub source_ip: Option<String>,
    pub method: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub authorizer: Authorizer,
    pub account_id: String,
    pub request_id: String,
    pub http: HttpContext,
    pub path: String,
}

/// The event passed to HTTP handlers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEvent {
    pub path: String,
    pub http_method: String,
    /// Lower-case keys. Only the last value is kept for repeated headers.
    pub headers: HashMap<String, String>,
    /// Only the last value is kept for repeated keys.
    pub query_string_parameters: HashMap<String, String>,
    pub path_parameters: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub request_context: RequestContext,
}

/// Builds the handler event from the HTTP request.
/// * `path_params` - values captured from the route pattern
/// * `request_id` - goes into the request context and should match the one in the lambda context
pub fn to_event(
    parts: &Parts,
    body: &[u8],
    path_params: HashMap<String, String>,
    source_ip: Option<IpAddr>,
    identity: &Identity,
    request_id: &str,
) -> InvocationEvent {
    let path = parts.uri.path().to_owned();
    let method = parts.method.as_str().to_owned();

    // later values overwrite earlier ones
    let mut headers = HashMap::with_capacity(parts.headers.len());
    for (name, value) in parts.headers.iter() {
        headers.insert(
            name.as_str().to_ascii_lowercase(),
            String::from_utf8_lossy(value.as_bytes()).to_string(),
        );
    }

    let query_string_parameters = match parts.uri.query() {
        Some(query) => url::form_urlencoded::parse(query.as_bytes()).into_owned().collect(),
        None => HashMap::new(),
    };

    let body = if body.is_empty() {
        None
    } else {
        match String::from_utf8(body.to_vec()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Non-UTF-8 request body. {:?}\n{}", e, hex::encode(body));
                Some(String::from_utf8_lossy(body).to_string())
            }
        }
    };

    InvocationEvent {
        path: path.clone(),
        http_method: method.clone(),
        headers,
        query_string_parameters,
        path_parameters: path_params,
        body,
        request_context: RequestContext {
            authorizer: Authorizer {
                jwt: Jwt {
                    claims: Claims::from(identity),
                },
            },
            account_id: ACCOUNT_ID.to_owned(),
            request_id: request_id.to_owned(),
            http: HttpContext {
                source_ip: source_ip.map(|ip| ip.to_string()),
                method,
            },
            path,
        },
    }
}

/// A handler result converted into HTTP terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: StatusCode,
    /// One entry per header line. Repeated names are emitted as separate lines.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Reasons why a handler result cannot be turned into an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidResult {
    #[error("the handler must return a JSON object, got {0}")]
    NotAnObject(String),
    #[error("the handler result has no `body`")]
    MissingBody,
    #[error("invalid statusCode: {0}")]
    InvalidStatus(String),
    #[error("the body is flagged as base64 but cannot be decoded: {0}")]
    InvalidBase64(String),
}

/// Converts the handler result into the status, headers and body of the HTTP response.
/// `statusCode` defaults to 200, `body` is required.
pub fn to_http_response(result: &Value) -> Result<HttpReply, InvalidResult> {
    let result = match result {
        Value::Object(v) => v,
        other => return Err(InvalidResult::NotAnObject(type_name(other).to_owned())),
    };

    let status = match result.get("statusCode") {
        None | Some(Value::Null) => StatusCode::OK,
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .and_then(|n| StatusCode::from_u16(n).ok())
            .ok_or_else(|| InvalidResult::InvalidStatus(n.to_string()))?,
        Some(Value::String(s)) => s
            .trim()
            .parse::<u16>()
            .ok()
            .and_then(|n| StatusCode::from_u16(n).ok())
            .ok_or_else(|| InvalidResult::InvalidStatus(s.clone()))?,
        Some(other) => return Err(InvalidResult::InvalidStatus(other.to_string())),
    };

    let mut headers = Vec::new();
    if let Some(Value::Object(h)) = result.get("headers") {
        for (name, value) in h {
            push_header_values(&mut headers, name, value);
        }
    }
    if let Some(Value::Object(h)) = result.get("multiValueHeaders") {
        for (name, value) in h {
            push_header_values(&mut headers, name, value);
        }
    }

    let body = match result.get("body") {
        None => return Err(InvalidResult::MissingBody),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let is_base64 = matches!(result.get("isBase64Encoded"), Some(Value::Bool(true)));
    let body = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map(Bytes::from)
            .map_err(|e| InvalidResult::InvalidBase64(e.to_string()))?
    } else {
        Bytes::from(body)
    };

    Ok(HttpReply { status, headers, body })
}

/// Adds a header line per value. Arrays become multiple lines, scalars are stringified.
fn push_header_values(headers: &mut Vec<(String, String)>, name: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => headers.push((name.to_owned(), s.clone())),
        Value::Array(values) => {
            for v in values {
                push_header_values(headers, name, v);
            }
        }
        other => headers.push((name.to_owned(), other.to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
