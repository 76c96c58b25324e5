use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;

/// Header the identity proxy injects after verifying the caller's token.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Verified user identity. Handlers never trust a user-supplied identity;
/// this is the only way one enters.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or((StatusCode::UNAUTHORIZED, "missing identity".to_string()))
    }
}
