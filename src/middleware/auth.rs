use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::{collections::HashMap, num::NonZeroU32};
use tracing::warn;

use crate::errors::AppError;
use crate::AppState;

/// Authenticated caller; every record lookup is scoped to this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub i64);

/// Static bearer tokens plus a per-user request quota.
pub struct ApiAuth {
    tokens: HashMap<String, i64>,
    limiter: DefaultKeyedRateLimiter<i64>,
}

impl ApiAuth {
    pub fn new(tokens: HashMap<String, i64>, per_second: NonZeroU32) -> Self {
        Self {
            tokens,
            limiter: RateLimiter::keyed(Quota::per_second(per_second)),
        }
    }

    pub fn authenticate(&self, authorization: Option<&str>) -> Result<CurrentUser, AppError> {
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Unauthorized)?;

        let user_id = *self.tokens.get(token).ok_or(AppError::Unauthorized)?;

        if self.limiter.check_key(&user_id).is_err() {
            warn!(user_id, "API rate limit exceeded");
            return Err(AppError::RateLimited);
        }
        Ok(CurrentUser(user_id))
    }
}

pub async fn bearer_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let user = match state.auth.authenticate(header) {
        Ok(user) => user,
        Err(e) => {
            if matches!(e, AppError::Unauthorized) {
                warn!(path = %request.uri().path(), "Rejected request without a valid bearer token");
            }
            return Err(e);
        }
    };

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
