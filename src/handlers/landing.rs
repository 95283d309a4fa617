use super::{full, internal_error, ResponseBody};
use crate::event::SERVER_NAME;
use hyper::{Method, Response, StatusCode};

const LANDING_PAGE: &str = "<html><body><h1>Cloudlydev</h1><p>Cloudlydev is running</p></body></html>";

/// Shows the landing page on `GET /`. Everything else that matched no route gets the same page with 404.
pub(crate) fn handler(method: &Method, path: &str) -> Response<ResponseBody> {
    let status = if method == Method::GET && path == "/" {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };

    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .header("server", SERVER_NAME)
        .body(full(LANDING_PAGE))
        .unwrap_or_else(|_| internal_error())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_ok_anything_else_is_not_found() {
        assert_eq!(handler(&Method::GET, "/").status(), StatusCode::OK);
        assert_eq!(handler(&Method::POST, "/").status(), StatusCode::NOT_FOUND);
        assert_eq!(handler(&Method::GET, "/nothing/here").status(), StatusCode::NOT_FOUND);
    }
}
