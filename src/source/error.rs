use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryAction;
use crate::types::ErrorClass;

/// Fallback wait when a rate-limited response carries no `Retry-After`.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

/// Errors raised by a [`Source`](super::Source) while listing or streaming.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by {context}")]
    RateLimited {
        context: String,
        retry_after: Option<Duration>,
    },

    #[error("HTTP {status} from {context}")]
    HttpStatus { status: u16, context: String },

    /// The API answered but refused the request (e.g. unknown channel).
    #[error("{context} rejected the request: {message}")]
    Api { context: String, message: String },

    /// The API answered with a temporary failure inside a 200 response.
    #[error("{0} is temporarily unavailable")]
    Unavailable(String),

    #[error("no download available for {0}")]
    NotDownloadable(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SourceError::Auth(_) | SourceError::Api { .. } => ErrorClass::Fatal,
            SourceError::HttpStatus { status, .. } => match *status {
                401 => ErrorClass::Fatal,
                s if s == 429 || s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Skip,
            },
            SourceError::NotDownloadable(_) => ErrorClass::Skip,
            SourceError::RateLimited { .. }
            | SourceError::Unavailable(_)
            | SourceError::Http(_)
            | SourceError::Json(_)
            | SourceError::Io(_) => ErrorClass::Transient,
        }
    }

    /// Classifier for [`retry_with_backoff`](crate::retry::retry_with_backoff).
    pub fn retry_action(&self) -> RetryAction {
        match self {
            SourceError::RateLimited { retry_after, .. } => {
                RetryAction::RetryAfter(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT))
            }
            _ if self.class() == ErrorClass::Transient => RetryAction::Retry,
            _ => RetryAction::Abort,
        }
    }

    /// Minimum wait before the next poll cycle after a failed listing.
    pub fn backoff_hint(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after, .. } => {
                Some(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> SourceError {
        SourceError::HttpStatus {
            status: code,
            context: "files.get".into(),
        }
    }

    #[test]
    fn unauthorized_is_fatal() {
        assert_eq!(status(401).class(), ErrorClass::Fatal);
        assert_eq!(SourceError::Auth("expired".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn server_errors_are_transient() {
        assert_eq!(status(500).class(), ErrorClass::Transient);
        assert_eq!(status(503).class(), ErrorClass::Transient);
        assert_eq!(status(429).class(), ErrorClass::Transient);
        assert_eq!(status(503).retry_action(), RetryAction::Retry);
    }

    #[test]
    fn missing_or_forbidden_items_are_skipped() {
        assert_eq!(status(404).class(), ErrorClass::Skip);
        assert_eq!(status(403).class(), ErrorClass::Skip);
        assert_eq!(status(404).retry_action(), RetryAction::Abort);
        assert_eq!(
            SourceError::NotDownloadable("F1".into()).class(),
            ErrorClass::Skip
        );
    }

    #[test]
    fn rate_limit_uses_server_hint() {
        let e = SourceError::RateLimited {
            context: "conversations.history".into(),
            retry_after: Some(Duration::from_secs(12)),
        };
        assert_eq!(e.class(), ErrorClass::Transient);
        assert_eq!(
            e.retry_action(),
            RetryAction::RetryAfter(Duration::from_secs(12))
        );
        assert_eq!(e.backoff_hint(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn rate_limit_without_hint_uses_default() {
        let e = SourceError::RateLimited {
            context: "files.list".into(),
            retry_after: None,
        };
        assert_eq!(e.backoff_hint(), Some(DEFAULT_RATE_LIMIT_WAIT));
    }

    #[test]
    fn api_rejection_is_fatal() {
        let e = SourceError::Api {
            context: "conversations.history".into(),
            message: "channel_not_found".into(),
        };
        assert_eq!(e.class(), ErrorClass::Fatal);
        assert_eq!(e.retry_action(), RetryAction::Abort);
    }
}
