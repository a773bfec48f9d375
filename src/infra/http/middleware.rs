use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{Level, debug, event};
use uuid::Uuid;

use crate::application::error::ErrorReport;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const QUERY_ROUTE_PREFIX: &str = "/api/queries/";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Tag the request with an id, reusing one supplied by the dashboard front end.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let ctx = RequestContext { request_id };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log every response; failures carry the error report attached by the handler.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let params = request.uri().query().unwrap_or("").to_string();
    let start = Instant::now();
    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();
    let query = queried_name(&path).unwrap_or("").to_string();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();

    if !(status.is_client_error() || status.is_server_error()) {
        debug!(
            target = "dashcache::http::response",
            status = status.as_u16(),
            method = %method,
            path,
            query,
            elapsed_ms,
            request_id,
            "request served",
        );
        return response;
    }

    let (source, messages) = match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    macro_rules! log_failure {
        ($level:expr, $message:literal) => {
            event!(
                $level,
                target = "dashcache::http::response",
                status = status.as_u16(),
                method = %method,
                path,
                params,
                query,
                elapsed_ms,
                source,
                detail = %detail,
                chain = ?messages,
                request_id,
                $message,
            )
        };
    }
    if status.is_server_error() {
        log_failure!(Level::ERROR, "request failed");
    } else {
        log_failure!(Level::WARN, "client request error");
    }

    response
}

/// Query name addressed by a `/api/queries/{name}[/...]` path.
fn queried_name(path: &str) -> Option<&str> {
    path.strip_prefix(QUERY_ROUTE_PREFIX)
        .and_then(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::StatusCode, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn extracts_query_name_from_api_paths() {
        assert_eq!(
            queried_name("/api/queries/sales_by_region"),
            Some("sales_by_region")
        );
        assert_eq!(
            queried_name("/api/queries/sales_by_region/refresh"),
            Some("sales_by_region")
        );
        assert_eq!(queried_name("/api/queries/"), None);
        assert_eq!(queried_name("/health"), None);
    }

    #[tokio::test]
    async fn echoes_supplied_request_id() {
        let app = Router::new()
            .route("/", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn(set_request_context));

        let request = Request::builder()
            .uri("/")
            .header("x-request-id", "dash-42")
            .body(Body::empty())
            .expect("request should build");
        let response = app.oneshot(request).await.expect("router should respond");
        assert_eq!(
            response
                .headers()
                .get(&REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok()),
            Some("dash-42")
        );
    }
}
