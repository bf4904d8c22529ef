//! Error types for Tether

use thiserror::Error;

/// Tether error types
///
/// Anything that can go wrong for a single target is a [`TransportError`] and
/// never leaves the dispatcher as an error; it becomes a failed
/// [`TargetResult`](crate::result::TargetResult) instead.
#[derive(Error, Debug)]
pub enum TetherError {
    /// Malformed request: bad action fields, parameter types, unknown transport
    #[error("Validation error: {0}")]
    Validation(String),

    /// Project configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Inventory file or target-set expression problems
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// Unknown transport scheme or kind
    #[error("Unknown transport '{0}'")]
    UnknownTransport(String),

    /// Option not declared in a transport's schema or of the wrong type
    #[error("Invalid option '{option}' for {transport} transport: {reason}")]
    InvalidOption {
        transport: String,
        option: String,
        reason: String,
    },

    /// Task could not be located in the project
    #[error("Could not find a task named '{0}'")]
    TaskNotFound(String),

    /// Plan could not be located in the project
    #[error("Could not find a plan named '{0}'")]
    PlanNotFound(String),

    /// Plan definition is malformed
    #[error("Plan '{plan}' is invalid: {reason}")]
    InvalidPlan { plan: String, reason: String },

    /// Plan file exceeded size limit
    #[error("Plan YAML exceeds 1MB limit (size: {0} bytes)")]
    PlanSizeExceeded(usize),

    /// Step count exceeded limit
    #[error("Step count {count} exceeds limit of {limit}")]
    StepCountExceeded { count: usize, limit: usize },

    /// Expression could not be parsed or evaluated
    #[error("Expression error: {0}")]
    Expression(String),

    /// A plan halted on a failing step
    #[error("{0}")]
    PlanHalted(Box<crate::plan::PlanFailure>),

    /// Rerun state is absent or unreadable
    #[error("Rerun state error: {0}")]
    Rerun(String),

    /// Two ResultSets addressed the same target
    #[error("Duplicate result for target '{0}'")]
    DuplicateTarget(String),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using TetherError
pub type Result<T> = std::result::Result<T, TetherError>;

/// Errors raised by a transport or the connection pool for one target
#[derive(Error, Debug)]
pub enum TransportError {
    /// Session could not be established
    #[error("Failed to connect to {target}: {message}")]
    Connection { target: String, message: String },

    /// Credentials were rejected; never retried
    #[error("Authentication failed for {target}: {message}")]
    Authentication { target: String, message: String },

    /// An established session died underneath us
    #[error("Connection to {target} was lost: {message}")]
    ConnectionLost { target: String, message: String },

    /// Remote side reported a failure while running the action
    #[error("{0}")]
    Execution(String),

    /// Connect or run exceeded its bound
    #[error("Timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Transport does not implement the requested action
    #[error("The {transport} transport does not support {action}")]
    Unsupported { transport: String, action: String },

    /// Local I/O errors while staging files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the session is unusable and must leave the pool
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost { .. })
    }
}
