use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::warn;

use parley_types::api::Claims;

use crate::AppState;
use crate::error::ApiError;

/// Extract and validate the identity provider's bearer token, then attach
/// the claims to the request. Also refreshes the local user directory row —
/// the only ingress for display fields.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Malformed Authorization header".into()))?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("Invalid token".into()))?;

    let claims = token_data.claims;

    // Directory refresh is best-effort: a failed upsert must not block the
    // request, it only staled display fields.
    let db_state = state.clone();
    let (id, username, avatar) = (
        claims.sub.to_string(),
        claims.username.clone(),
        claims.avatar_url.clone(),
    );
    let upsert = tokio::task::spawn_blocking(move || {
        db_state.db.upsert_user(&id, &username, avatar.as_deref())
    })
    .await;
    if let Ok(Err(e)) = upsert {
        warn!("User directory refresh failed for {}: {:#}", claims.sub, e);
    }

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
