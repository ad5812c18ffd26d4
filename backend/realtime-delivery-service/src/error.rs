use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use event_bus::BusError;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("database error: {0}")]
    Database(String),

    #[error("redis error: {0}")]
    Redis(String),

    /// The broker did not accept a publish; the message itself may already be stored
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("membership lookup failed: {0}")]
    MembershipLookupFailed(String),

    #[error("presence lookup failed: {0}")]
    PresenceLookupFailed(String),

    #[error("internal server error")]
    Internal,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let status = ResponseError::status_code(self);
        // Internal details stay in the logs
        let message = if status.is_server_error() {
            status
                .canonical_reason()
                .unwrap_or("internal server error")
                .to_string()
        } else {
            self.to_string()
        };
        HttpResponse::build(status).json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }))
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Redis(e.to_string())
    }
}

impl From<BusError> for AppError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::BrokerUnavailable(msg) => AppError::BrokerUnavailable(msg),
            BusError::Closed => AppError::BrokerUnavailable("event bus is closed".into()),
            BusError::UnknownSubject(_) | BusError::InvalidConfig(_) => {
                AppError::Config(e.to_string())
            }
            BusError::Serialization(_) => AppError::Internal,
        }
    }
}

impl AppError {
    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::BrokerUnavailable(_) => 503,
            AppError::MembershipLookupFailed(_) | AppError::PresenceLookupFailed(_) => 503,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_errors_map_to_broker_unavailable() {
        let err = AppError::from(BusError::BrokerUnavailable("connection refused".into()));
        assert!(matches!(err, AppError::BrokerUnavailable(_)));
        assert_eq!(err.status_code(), 503);

        let err = AppError::from(BusError::Closed);
        assert!(matches!(err, AppError::BrokerUnavailable(_)));
    }

    #[test]
    fn test_client_error_status_codes() {
        assert_eq!(AppError::Unauthorized.status_code(), 401);
        assert_eq!(AppError::Forbidden.status_code(), 403);
        assert_eq!(AppError::BadRequest("empty body".into()).status_code(), 400);
    }

    #[test]
    fn test_server_error_response_hides_details() {
        let resp = AppError::Database("password authentication failed".into()).error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
