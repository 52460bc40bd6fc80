use thiserror::Error;

/// Failure of a remote fetch or of the coordinated write that follows it.
///
/// `Clone` because a single coordinated outcome is handed to every caller
/// that joined the in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unauthorized - credentials missing or expired")]
    Unauthorized,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Defect: {0}")]
    Defect(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => FetchError::Unauthorized,
            403 => FetchError::Forbidden(truncated),
            404 => FetchError::NotFound(truncated),
            429 => FetchError::RateLimited,
            500..=599 => FetchError::Server(truncated),
            _ => FetchError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Transient failures where falling back to cached data is the right call.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FetchError::Connection(_) | FetchError::RateLimited | FetchError::Server(_)
        )
    }

    /// Failures that need the user to re-authenticate before retrying.
    pub fn needs_authentication(&self) -> bool {
        matches!(self, FetchError::Unauthorized | FetchError::Forbidden(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::from_status(status, "")
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert_eq!(
            FetchError::from_status(StatusCode::UNAUTHORIZED, "nope"),
            FetchError::Unauthorized
        );
        assert_eq!(
            FetchError::from_status(StatusCode::FORBIDDEN, "nope"),
            FetchError::Forbidden("nope".to_string())
        );
        assert_eq!(
            FetchError::from_status(StatusCode::NOT_FOUND, "gone"),
            FetchError::NotFound("gone".to_string())
        );
        assert_eq!(
            FetchError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            FetchError::RateLimited
        );
        assert!(matches!(
            FetchError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            FetchError::Server(_)
        ));
        assert!(matches!(
            FetchError::from_status(StatusCode::IM_A_TEAPOT, ""),
            FetchError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        let truncated = FetchError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("510 total bytes"));

        // Multi-byte characters must not be split
        let umlauts = "ü".repeat(MAX_ERROR_BODY_LENGTH);
        let truncated = FetchError::truncate_body(&umlauts);
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn test_error_classification() {
        assert!(FetchError::Connection("offline".into()).is_recoverable());
        assert!(FetchError::Server("502".into()).is_recoverable());
        assert!(!FetchError::NotFound("x".into()).is_recoverable());
        assert!(!FetchError::Defect("x".into()).is_recoverable());
        assert!(FetchError::Unauthorized.needs_authentication());
        assert!(FetchError::Forbidden("x".into()).needs_authentication());
        assert!(!FetchError::RateLimited.needs_authentication());
    }
}
