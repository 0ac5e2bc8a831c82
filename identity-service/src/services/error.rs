use service_core::error::AppError;
use thiserror::Error;

/// Failure kinds of the identity core. Every failure reaches the caller typed.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("OAuth state is unknown, expired or already used")]
    InvalidState,

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authorization grant rejected: {0}")]
    InvalidGrant(String),

    #[error("Email is already registered to a different identity")]
    EmailConflict,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid token")]
    Invalid,

    #[error("Refresh token reuse detected; session revoked")]
    ReuseDetected,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{component} unavailable: {reason}")]
    Unavailable {
        component: &'static str,
        reason: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn unavailable(component: &'static str, reason: impl std::fmt::Display) -> Self {
        ServiceError::Unavailable {
            component,
            reason: reason.to_string(),
        }
    }

    /// Only transient infrastructure failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable { .. } | ServiceError::ProviderUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound("Row"),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ServiceError::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                ServiceError::Conflict(db.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => ServiceError::unavailable("store", err),
            other => ServiceError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::unavailable("redis", err)
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidState => AppError::BadRequest(anyhow::anyhow!("Invalid OAuth state")),
            ServiceError::ProviderUnavailable(e) => AppError::BadGateway(e),
            ServiceError::InvalidGrant(e) => AppError::Unauthorized(anyhow::anyhow!(e)),
            ServiceError::EmailConflict => AppError::Conflict(anyhow::anyhow!(
                "Email is already registered to a different identity"
            )),
            ServiceError::Forbidden(e) => AppError::Forbidden(anyhow::anyhow!(e)),
            ServiceError::Expired => AppError::TokenExpired,
            ServiceError::Invalid => AppError::Unauthorized(anyhow::anyhow!("Invalid token")),
            ServiceError::ReuseDetected => AppError::SessionRevoked(anyhow::anyhow!(
                "Refresh token was already used"
            )),
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::Unavailable { component, .. } => {
                AppError::ServiceUnavailable(format!("{} unavailable", component))
            }
            ServiceError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            ServiceError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
