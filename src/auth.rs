//! 管理接口的共享令牌校验。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::middleware;
use axum::response::Response;
use std::sync::Arc;
use tracing::warn;

use crate::error::ApiError;

pub const ADMIN_PREFIX: &str = "/_admin/";
pub const ADMIN_TOKEN_HEADER: &str = "admin-api-token";

#[derive(Debug)]
pub struct AuthConfig {
    pub api_token: String,
}

/// 认证中间件：`/_admin/` 下的请求必须携带匹配的 `admin-api-token` 头。
pub async fn admin_token_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let authorized = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|token| token_matches(&auth, token));
    if !authorized {
        warn!(path = req.uri().path(), "admin request rejected: invalid token");
        return Err(ApiError::Auth);
    }
    Ok(next.run(req).await)
}

fn token_matches(auth: &AuthConfig, token: &str) -> bool {
    !auth.api_token.is_empty() && token == auth.api_token
}

fn is_auth_exempt_path(path: &str) -> bool {
    if path == "/_admin/ping" {
        return true;
    }
    !path.starts_with(ADMIN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_admin_paths_require_token() {
        assert!(is_auth_exempt_path("/"));
        assert!(is_auth_exempt_path("/images/a.png"));
        assert!(is_auth_exempt_path("/_adminx/file"));
        assert!(is_auth_exempt_path("/_admin/ping"));
        assert!(!is_auth_exempt_path("/_admin/upload"));
        assert!(!is_auth_exempt_path("/_admin/unknown"));
    }

    #[test]
    fn empty_configured_token_never_matches() {
        let auth = AuthConfig {
            api_token: String::new(),
        };
        assert!(!token_matches(&auth, ""));

        let auth = AuthConfig {
            api_token: "secret".into(),
        };
        assert!(token_matches(&auth, "secret"));
        assert!(!token_matches(&auth, "Secret"));
    }
}
