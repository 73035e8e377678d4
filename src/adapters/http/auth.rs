//! Shared-secret API key check.
//!
//! Opaque comparison against the configured `SERVICE_API_KEY`; when no
//! key is configured the surface is open (local deployments). Failed
//! attempts are logged without echoing the presented key.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Validate the request's API key against the configured one.
///
/// # Errors
/// Returns `Err(())` when a key is required and missing or wrong; the
/// caller maps this to 401.
pub fn require_api_key(headers: &HeaderMap, required: Option<&str>) -> Result<(), ()> {
    let Some(required) = required else {
        return Ok(());
    };
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(presented) if presented.as_bytes().ct_eq(required.as_bytes()).into() => Ok(()),
        presented => {
            tracing::warn!(
                key_provided = presented.is_some(),
                "Rejected request with missing or invalid API key"
            );
            Err(())
        }
    }
}
