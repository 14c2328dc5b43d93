use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use tracing::debug;

use loom_core::errors::GatewayError;

use crate::sse::ByteStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_client() -> Result<Client, GatewayError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))
}

/// Send a streaming request and hand back the body as bytes, mapping
/// transport and status failures onto [`GatewayError`].
pub async fn send_streaming(request: RequestBuilder) -> Result<ByteStream, GatewayError> {
    let resp = request.send().await.map_err(map_send_error)?;
    let resp = check_status(resp).await?;
    Ok(Box::pin(resp.bytes_stream()))
}

fn map_send_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(CONNECT_TIMEOUT)
    } else {
        GatewayError::NetworkError(e.to_string())
    }
}

async fn check_status(resp: Response) -> Result<Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %body, "provider returned error status");
    Err(match GatewayError::from_status(status.as_u16(), body) {
        GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after },
        other => other,
    })
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
