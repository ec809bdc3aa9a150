use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Transport,
    RateLimited,
    Unauthorized,
    ServerError,
    HttpStatus,
    EmptyResponse,
    MaxRetriesExceeded,
    Cancelled,
    Protocol,
    AuthMissing,
    MalformedToolCallArguments,
    ToolNotFound,
    ToolArgumentsInvalid,
    SchemaInvalid,
    Config,
}

impl ErrorCode {
    /// Maps a non-success HTTP status onto the closed error kinds.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorCode::Unauthorized,
            429 => ErrorCode::RateLimited,
            500..=599 => ErrorCode::ServerError,
            _ => ErrorCode::HttpStatus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TributaryError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TributaryError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status_code: None,
            retry_after: None,
            details: None,
        }
    }

    /// Builds an error for a non-success HTTP response, keeping the raw
    /// `Retry-After` header value for the retry controller.
    pub fn http(status: u16, body: impl Into<String>, retry_after: Option<String>) -> Self {
        let body = body.into();
        Self {
            code: ErrorCode::from_status(status),
            message: format!("HTTP {status}: {body}"),
            status_code: Some(status),
            retry_after,
            details: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "request cancelled")
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for TributaryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{:?} ({status}): {}", self.code, self.message),
            None => write!(f, "{:?}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for TributaryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_closed_error_kinds() {
        assert_eq!(ErrorCode::from_status(401), ErrorCode::Unauthorized);
        assert_eq!(ErrorCode::from_status(429), ErrorCode::RateLimited);
        assert_eq!(ErrorCode::from_status(503), ErrorCode::ServerError);
        assert_eq!(ErrorCode::from_status(404), ErrorCode::HttpStatus);
    }

    #[test]
    fn compact_json_round_trips_status_and_retry_after() {
        let error = TributaryError::http(429, "slow down", Some("3".to_string()));
        let parsed: TributaryError = serde_json::from_str(&error.as_compact_json()).unwrap();
        assert_eq!(parsed, error);
        assert_eq!(parsed.to_string(), "RateLimited (429): HTTP 429: slow down");
    }
}
