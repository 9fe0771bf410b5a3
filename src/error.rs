use thiserror::Error;

/// Type alias for Result with MonitorError
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Error types for the inbox monitoring engine
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Mail provider API returned an error
    #[error("mail API error: {0}")]
    MailApi(String),

    /// Rate limited by the mail provider and retries were exhausted
    #[error("mail API rate limited after {attempts} attempts: {path}")]
    RateLimited { attempts: u32, path: String },

    /// Mail provider returned a non-success HTTP status
    #[error("mail API returned HTTP {status}: {message}")]
    MailStatus { status: u16, message: String },

    /// Network-level failure (connect, timeout, TLS)
    #[error("network error: {0}")]
    Network(String),

    /// LLM endpoint failure
    #[error("LLM error: {0}")]
    Llm(String),

    /// LLM replied with something that could not be parsed as a classification
    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    /// Requested entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Caller tried to create something that already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Repository uniqueness conflict
    #[error("repository conflict: {0}")]
    Conflict(String),

    /// Repository error that is expected to clear on retry
    #[error("transient repository error: {0}")]
    Transient(String),

    /// Permanent repository error
    #[error("repository error: {0}")]
    Repository(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Input failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Scan orchestration error
    #[error("scan error: {0}")]
    Scan(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    /// Check if the error is transient and safe to retry
    pub fn is_transient(&self) -> bool {
        match self {
            MonitorError::RateLimited { .. }
            | MonitorError::Network(_)
            | MonitorError::Transient(_) => true,
            MonitorError::MailStatus { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            return MonitorError::Network(error.to_string());
        }
        if let Some(status) = error.status() {
            return MonitorError::MailStatus {
                status: status.as_u16(),
                message: error.to_string(),
            };
        }
        MonitorError::Network(error.to_string())
    }
}
