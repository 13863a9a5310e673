use std::io;

pub type Result<T> = std::result::Result<T, ServiceError>;

// ---------------------------------------------------------------------------
// Service error
// ---------------------------------------------------------------------------

/// Every failure that can cross a handler boundary.
///
/// Each variant maps to one HTTP status and one stable error code; the
/// `kind()` label feeds the error counter so operators can slice failures
/// by class rather than by message text.
#[derive(Debug)]
pub enum ServiceError {
    /// Missing/ill-typed body field, bad player URL, bad JSON, bad cache type.
    Validation { code: &'static str, message: String },
    /// Authorization header absent or wrong.
    Unauthorized,
    /// A lookup that can legitimately come up empty did (e.g. no STS pattern).
    NotFound { code: &'static str, message: String },
    /// Request body was not JSON.
    UnsupportedMediaType,
    /// Sliding-window limit exceeded for this (client, path).
    RateLimited { retry_after_secs: u64 },
    /// Player-script fetch failed: non-2xx upstream or network error.
    Upstream { status: Option<u16>, message: String },
    /// Worker queue is at capacity; the caller should back off.
    QueueFull,
    /// Everything else: extraction failures, exhausted retries, I/O.
    Internal { code: &'static str, message: String },
}

impl ServiceError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Internal {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        ServiceError::NotFound {
            code,
            message: message.into(),
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::Validation { .. } => 400,
            ServiceError::Unauthorized => 401,
            ServiceError::NotFound { .. } => 404,
            ServiceError::UnsupportedMediaType => 415,
            ServiceError::RateLimited { .. } => 429,
            ServiceError::Upstream { .. } => 502,
            ServiceError::QueueFull => 503,
            ServiceError::Internal { .. } => 500,
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation { code, .. } => code,
            ServiceError::Unauthorized => "UNAUTHORIZED",
            ServiceError::NotFound { code, .. } => code,
            ServiceError::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ServiceError::RateLimited { .. } => "RATE_LIMITED",
            ServiceError::Upstream { .. } => "FETCH_FAILED",
            ServiceError::QueueFull => "QUEUE_FULL",
            ServiceError::Internal { code, .. } => code,
        }
    }

    /// Coarse class label for the error metric.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation { .. } => "validation",
            ServiceError::Unauthorized => "auth",
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::UnsupportedMediaType => "validation",
            ServiceError::RateLimited { .. } => "resource_exhausted",
            ServiceError::Upstream { .. } => "upstream",
            ServiceError::QueueFull => "resource_exhausted",
            ServiceError::Internal { .. } => "internal",
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Validation { message, .. } => write!(f, "{message}"),
            ServiceError::Unauthorized => write!(f, "invalid or missing API token"),
            ServiceError::NotFound { message, .. } => write!(f, "{message}"),
            ServiceError::UnsupportedMediaType => {
                write!(f, "request body must be application/json")
            }
            ServiceError::RateLimited { retry_after_secs } => {
                write!(f, "rate limit exceeded, retry in {retry_after_secs}s")
            }
            ServiceError::Upstream { status, message } => match status {
                Some(s) => write!(f, "upstream fetch failed with status {s}: {message}"),
                None => write!(f, "upstream fetch failed: {message}"),
            },
            ServiceError::QueueFull => write!(f, "preprocessing queue is full"),
            ServiceError::Internal { message, .. } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<io::Error> for ServiceError {
    fn from(e: io::Error) -> Self {
        ServiceError::Internal {
            code: "IO_FAILED",
            message: format!("filesystem error: {e}"),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        ServiceError::Upstream {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}
