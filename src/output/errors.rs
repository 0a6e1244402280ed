// Error taxonomy for Sylva

use std::path::PathBuf;

use thiserror::Error;

/// All error types in Sylva
///
/// Errors are `Clone` so a single connection failure can be handed to every
/// caller that was queued behind the same connection attempt.
#[derive(Debug, Clone, Error)]
pub enum SylvaError {
    /// Connection refused, authentication failure, failed channel or transfer
    #[error("remote error on {host}: {message}")]
    Transport {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A caller waited too long for the remote session to become ready
    #[error("remote session not ready after {waited_secs}s")]
    ConnectionTimeout { waited_secs: u64 },

    /// Too many callers already queued behind a pending connection
    #[error("remote session wait queue is full ({capacity} waiters)")]
    QueueFull { capacity: usize },

    /// Remote output did not match the expected textual protocol
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Local filesystem errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Document store errors
    #[error("store error: {message}")]
    Store { message: String },

    #[error("{what} not found")]
    NotFound {
        what: String,
        string_code: &'static str,
    },

    #[error("{message}")]
    Conflict {
        message: String,
        string_code: &'static str,
    },

    #[error("{message}")]
    BadRequest {
        message: String,
        string_code: &'static str,
    },

    #[error("invalid role")]
    Forbidden,

    #[error("invalid authorization header")]
    Unauthorized,

    #[error("configuration error: {message}")]
    Config { message: String },
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Offending input, truncated for logging
    pub input: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Submission output without a `job <id>` line
    MissingJobId,
    /// Queue listing without its header line
    MissingHeader,
    InvalidJson,
    InvalidTemplate,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParseErrorKind::MissingJobId => "missing job id",
            ParseErrorKind::MissingHeader => "missing header",
            ParseErrorKind::InvalidJson => "invalid JSON",
            ParseErrorKind::InvalidTemplate => "invalid template",
        };
        f.write_str(name)
    }
}

const MAX_INPUT_PREVIEW: usize = 200;

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: &str) -> Self {
        let preview: String = input.chars().take(MAX_INPUT_PREVIEW).collect();
        self.input = Some(preview);
        self
    }
}

impl SylvaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        SylvaError::NotFound {
            what: what.into(),
            string_code: "not_found",
        }
    }

    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        SylvaError::Io {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        SylvaError::Store {
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            SylvaError::NotFound { .. } => 404,
            SylvaError::Conflict { .. } => 409,
            SylvaError::BadRequest { .. } => 400,
            SylvaError::Forbidden => 403,
            SylvaError::Unauthorized => 401,
            SylvaError::ConnectionTimeout { .. } | SylvaError::QueueFull { .. } => 503,
            SylvaError::Transport { .. } => 502,
            SylvaError::Parse(_)
            | SylvaError::Io { .. }
            | SylvaError::Store { .. }
            | SylvaError::Config { .. } => 500,
        }
    }

    /// Machine-readable code returned to API clients
    pub fn string_code(&self) -> &'static str {
        match self {
            SylvaError::NotFound { string_code, .. }
            | SylvaError::Conflict { string_code, .. }
            | SylvaError::BadRequest { string_code, .. } => string_code,
            SylvaError::Forbidden => "invalid_role",
            SylvaError::Unauthorized => "not_authorized",
            SylvaError::ConnectionTimeout { .. } => "connection_timeout",
            SylvaError::QueueFull { .. } => "connection_busy",
            SylvaError::Transport { .. } => "remote_error",
            SylvaError::Parse(_) => "parse_error",
            SylvaError::Io { .. } | SylvaError::Store { .. } | SylvaError::Config { .. } => {
                "internal_error"
            }
        }
    }

    /// Hint for operators, logged next to the error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            SylvaError::Transport { suggestion, .. } => suggestion.as_deref(),
            SylvaError::ConnectionTimeout { .. } => {
                Some("Check that the cluster login node is reachable")
            }
            SylvaError::Parse(err) if err.kind == ParseErrorKind::MissingJobId => {
                Some("Check that the submit command prints 'Submitted batch job <id>'")
            }
            _ => None,
        }
    }
}

/// Suggest a fix for a failed TCP connect to the cluster
pub fn connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the cluster host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_codes() {
        let err = SylvaError::not_found("Scenario");
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.string_code(), "not_found");
        assert_eq!(err.to_string(), "Scenario not found");

        assert_eq!(SylvaError::Unauthorized.status_code(), 401);
        assert_eq!(SylvaError::Unauthorized.string_code(), "not_authorized");

        let timeout = SylvaError::ConnectionTimeout { waited_secs: 5 };
        assert_eq!(timeout.string_code(), "connection_timeout");
        assert!(timeout.suggestion().is_some());
    }

    #[test]
    fn test_parse_error_display() {
        let err: SylvaError = ParseError::new(ParseErrorKind::MissingJobId, "no job line")
            .with_input("sbatch: error")
            .into();

        assert_eq!(err.to_string(), "missing job id: no job line");
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.string_code(), "parse_error");
    }

    #[test]
    fn test_input_preview_is_truncated() {
        let long = "x".repeat(1000);
        let err = ParseError::new(ParseErrorKind::MissingHeader, "empty").with_input(&long);
        assert_eq!(err.input.map(|s| s.len()), Some(MAX_INPUT_PREVIEW));
    }
}
