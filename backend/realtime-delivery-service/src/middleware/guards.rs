//! Request guards that resolve the caller before a handler runs.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, Error, FromRequest, HttpRequest};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Authenticated user, resolved from the session token.
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Session token from `Authorization: Bearer <token>` or, for browser
/// WebSocket clients that cannot set headers, the `token` query parameter.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .or_else(|| {
            web::Query::<TokenQuery>::from_query(req.query_string())
                .ok()
                .and_then(|q| q.into_inner().token)
        })
        .filter(|token| !token.is_empty())
}

impl FromRequest for User {
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let token = bearer_token(req);
        let state = req.app_data::<web::Data<AppState>>().cloned();

        Box::pin(async move {
            let state = state.ok_or(AppError::Internal)?;
            let token = token.ok_or(AppError::Unauthorized)?;
            let id = state.sessions.resolve(&token).await?;
            Ok(User { id })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_token_from_header_wins_over_query() {
        let req = TestRequest::default()
            .uri("/ws?token=from-query")
            .insert_header((AUTHORIZATION, "Bearer from-header"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_token_from_query() {
        let req = TestRequest::default()
            .uri("/ws?token=abc123")
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc123"));
    }

    #[test]
    fn test_missing_or_empty_token() {
        let req = TestRequest::default().uri("/ws").to_http_request();
        assert_eq!(bearer_token(&req), None);

        let req = TestRequest::default()
            .uri("/ws?token=")
            .to_http_request();
        assert_eq!(bearer_token(&req), None);
    }
}
