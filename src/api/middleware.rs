use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{error, warn};

/// Logs control requests that were refused or failed, with their latency.
pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    let route = format!("{} {}", req.method(), req.uri().path());
    let started = Instant::now();

    let response = next.run(req).await;
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match status {
        400..=499 => warn!(%route, status, elapsed_ms, "Control request refused"),
        500..=599 => error!(%route, status, elapsed_ms, "Control request failed"),
        _ => {}
    }

    response
}
