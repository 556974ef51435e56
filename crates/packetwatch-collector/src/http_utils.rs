// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{header, http, Response, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

/// Body type every handler returns.
pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to be
///    written, otherwise error will be written.
/// 2. Returns the given message in the body of JSON response with the given status code.
///
/// Response body format:
/// {
///     "message": message
/// }
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    with_cors(Response::builder().status(status)).body(Full::new(Bytes::from(body)))
}

/// Serializes `payload` into a JSON response with the given status code. A
/// serialization failure degrades to a 500 with a message body.
pub fn json_response<T: Serialize>(payload: &T, status: StatusCode) -> http::Result<HttpResponse> {
    let body = match serde_json::to_string(payload) {
        Ok(body) => body,
        Err(e) => {
            return log_and_create_http_response(
                &format!("Failed to serialize response: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
    };
    with_cors(Response::builder().status(status))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// Empty response for CORS preflight requests.
pub fn preflight_response() -> http::Result<HttpResponse> {
    with_cors(Response::builder().status(StatusCode::NO_CONTENT)).body(Full::new(Bytes::new()))
}

/// The dashboard is served from a different origin, so every response
/// carries the permissive CORS headers.
fn with_cors(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_as_string(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn message_response_carries_status_and_body() {
        let response =
            log_and_create_http_response("Not found", StatusCode::NOT_FOUND).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        assert_eq!(
            body_as_string(response).await,
            "{\"message\":\"Not found\"}".to_string()
        );
    }

    #[tokio::test]
    async fn json_response_serializes_payload() {
        let response = json_response(
            &json!({"status": "success", "message": "Database has been completely reset."}),
            StatusCode::OK,
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body: serde_json::Value =
            serde_json::from_str(&body_as_string(response).await).unwrap();
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn preflight_allows_dashboard_methods() {
        let response = preflight_response().unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .unwrap(),
            "GET, POST, OPTIONS"
        );
    }
}
