use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::api::handler::AppState;
use crate::error::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Guards trigger and write endpoints. When no key is configured the
/// endpoints are open (local development).
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !keys_match(provided, expected) {
            warn!("Rejected {} {}: bad or missing api key", req.method(), req.uri().path());
            return Err(AppError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}

/// Compares digests so timing does not depend on the common prefix length
fn keys_match(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}
