//! Error taxonomy for the edge pipeline
//!
//! Every user-visible failure maps onto a stable status class: 404 for an
//! unresolved domain, 403 for a filtering rejection, 5xx for origin or internal
//! failures. Internal causes vary, the client contract does not.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("domain not configured: {0}")]
    DomainNotConfigured(String),

    #[error("request blocked: {0}")]
    Blocked(String),

    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("origin request failed: {0}")]
    Origin(String),

    #[error("certificate error for {hostname}: {message}")]
    Certificate { hostname: String, message: String },

    #[error("invalid domain configuration: {0}")]
    InvalidConfig(String),

    #[error("shared store error: {0}")]
    Store(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EdgeError {
    /// Status code the client sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            EdgeError::DomainNotConfigured(_) => StatusCode::NOT_FOUND,
            EdgeError::Blocked(_) => StatusCode::FORBIDDEN,
            EdgeError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            EdgeError::BadRequest(_) | EdgeError::InvalidConfig(_) | EdgeError::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            EdgeError::Origin(_) => StatusCode::BAD_GATEWAY,
            EdgeError::Certificate { .. } | EdgeError::Store(_) | EdgeError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Body text sent with the status. Kept fixed per class so clients can
    /// match on it.
    pub fn public_message(&self) -> String {
        match self {
            EdgeError::DomainNotConfigured(_) => "Domain Not Configured".to_string(),
            EdgeError::Blocked(reason) => format!("Forbidden: {}", reason),
            EdgeError::RateLimited(_) => "Too Many Requests".to_string(),
            EdgeError::Origin(_) => "Bad Gateway".to_string(),
            EdgeError::BadRequest(msg) | EdgeError::InvalidConfig(msg) => msg.clone(),
            EdgeError::Json(_) => "Invalid JSON body".to_string(),
            EdgeError::Certificate { .. } | EdgeError::Store(_) | EdgeError::Io(_) => {
                "Internal Server Error".to_string()
            }
        }
    }
}

impl From<rusqlite::Error> for EdgeError {
    fn from(err: rusqlite::Error) -> Self {
        EdgeError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EdgeError>;
