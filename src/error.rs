use serde_json::json;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};

/// Everything that can stop a request before it reaches a response body.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} is not configured")]
    Configuration(&'static str),
    #[error("unable to reach the plate recognizer: {0}")]
    UpstreamUnavailable(String),
    #[error("plate recognizer answered {status}")]
    UpstreamRejected { status: u16, body: String },
    #[error("unexpected plate recognizer response: {0}")]
    UpstreamMalformed(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl ScanError {
    pub fn status(&self) -> StatusCode {
        match self {
            ScanError::Validation(_) => StatusCode::BAD_REQUEST,
            ScanError::Configuration(_) | ScanError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ScanError::UpstreamUnavailable(_) | ScanError::UpstreamMalformed(_) => {
                StatusCode::BAD_GATEWAY
            }
            ScanError::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub fn into_reply(self) -> WithStatus<Json> {
        let status = self.status();
        let body = match &self {
            ScanError::UpstreamRejected { status, body } => json!({
                "error": self.to_string(),
                "status_code": status,
                "detail": body,
            }),
            ScanError::UpstreamUnavailable(detail) => json!({
                "error": "unable to reach the plate recognizer",
                "detail": detail,
            }),
            // Keep driver details out of client responses.
            ScanError::Database(_) => json!({ "error": "database error" }),
            _ => json!({ "error": self.to_string() }),
        };
        warp::reply::with_status(warp::reply::json(&body), status)
    }
}
