//! Error types for mailclerk.

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mail(#[from] MailError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// POP3 transport and protocol errors.
///
/// These are the transient failures the mailbox adapter retries; whatever
/// survives the retry ladder propagates out of the fetch operation.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("POP3 settings are not configured (host and username required)")]
    NotConfigured,

    #[error("Connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Server rejected {command}: {reply}")]
    Rejected { command: String, reply: String },

    #[error("Server closed the connection unexpectedly")]
    Disconnected,

    #[error("Malformed server response to {command}: {reply}")]
    BadResponse { command: String, reply: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch task failed: {0}")]
    Task(String),

    #[error("Record store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Message parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unparseable message structure for uid {uid}")]
    Structure { uid: String },
}

/// LLM provider and analysis errors.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model {model} not available on {provider} (available: {available})")]
    ModelNotAvailable {
        provider: String,
        model: String,
        available: String,
    },

    #[error("Analysis gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("AI settings are not configured for provider {provider}")]
    NotConfigured { provider: String },

    #[error("Settings read failed: {0}")]
    Settings(#[from] DatabaseError),
}

/// Notion delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Notion settings are not configured (API key and database id required)")]
    NotConfigured,

    #[error("Notion API request failed: {0}")]
    Http(String),

    #[error("Notion API returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Pipeline orchestration errors.
///
/// The first three are reprocess validation failures and surface to the
/// caller directly instead of being written as new audit rows.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Record {id} not found")]
    RecordNotFound { id: i64 },

    #[error("Record {id} has status {status}; only error records can be reprocessed")]
    NotRetryable { id: i64, status: String },

    #[error("Message with uid {uid} is no longer on the server")]
    MessageGone { uid: String },

    #[error("Mailbox error: {0}")]
    Mail(#[from] MailError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid schedule interval: {minutes} minutes")]
    InvalidInterval { minutes: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
