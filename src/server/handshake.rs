//! Upgrade handshake negotiation
//!
//! Validates the HTTP request that opens each WebSocket session before the
//! protocol library completes the upgrade. Runs as the header callback of
//! `accept_hdr_async_with_config`; returning an error response makes the
//! library write it to the client and fail the handshake.

use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tracing::warn;

use super::protocol::{WEBSOCKET_PATH, WEBSOCKET_VERSION};

/// Validate the upgrade request, passing the accept response through on
/// success
///
/// Rejections:
/// - wrong resource path, or missing/wrong `Upgrade` header: 400
/// - unsupported `Sec-WebSocket-Version`: 426, advertising version 13
pub fn negotiate(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    if path != WEBSOCKET_PATH {
        warn!("Rejecting handshake for unknown path {}", path);
        return Err(reject(StatusCode::BAD_REQUEST, "bad request"));
    }

    if !is_websocket_upgrade(request) {
        warn!("Rejecting handshake without websocket upgrade header");
        return Err(reject(StatusCode::BAD_REQUEST, "bad request"));
    }

    if let Some(version) = request.headers().get(header::SEC_WEBSOCKET_VERSION) {
        if version != WEBSOCKET_VERSION {
            warn!(
                "Rejecting handshake with unsupported websocket version {:?}",
                version
            );
            let mut response =
                reject(StatusCode::UPGRADE_REQUIRED, "unsupported websocket version");
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_static(WEBSOCKET_VERSION),
            );
            return Err(response);
        }
    }

    Ok(response)
}

/// True if the request carries `Upgrade: websocket` (value is
/// case-insensitive)
fn is_websocket_upgrade(request: &Request) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Build a rejection response; the reason travels as the body
fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
