//! Bearer-token authentication middleware.
//!
//! Tokens are opaque API keys; only their sha-256 hash is stored. A valid,
//! unrevoked key resolves to an [`AuthContext`] that downstream handlers
//! pull out of request extensions.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use super::AppState;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::service::AuthContext;

/// Hex sha-256 of a presented token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    Metrics::incr(&state.metrics.requests);

    let Some(token) = bearer_token(&request) else {
        return Err(Error::Unauthorized("missing bearer token".into()));
    };

    let key = state
        .service
        .store()
        .find_api_key_by_hash(&hash_token(token))
        .await?
        .ok_or_else(|| Error::Unauthorized("unknown API key".into()))?;
    if key.revoked {
        return Err(Error::Unauthorized("revoked API key".into()));
    }

    let _ = state.service.store().touch_api_key(&key.id).await;

    request.extensions_mut().insert(AuthContext {
        user_id: key.user_id.clone(),
        key,
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_hex() {
        let hash = hash_token("lsk_secret");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_token("lsk_secret"));
        assert_ne!(hash, hash_token("lsk_other"));
    }
}
