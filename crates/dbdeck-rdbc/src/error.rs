//! Error types for dbdeck-rdbc
//!
//! Every driver failure is normalized into a closed taxonomy before it leaves
//! an adapter:
//! - Connectivity: authentication, unknown database, refused, timeout, lost
//! - Statement: syntax, missing object, constraint violation
//! - Configuration: unsupported driver type, invalid settings
//!
//! Codes that have no mapping fall through to [`Error::Unknown`], which keeps
//! the driver name, the original code and the original message.

use std::fmt;
use thiserror::Error;

use crate::connection::DatabaseType;

/// Result type for dbdeck-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Normalized error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    /// Credentials rejected
    AuthenticationFailed,
    /// Named database/schema does not exist
    DatabaseNotFound,
    /// Target host/port unreachable
    ConnectionRefused,
    /// Connect or query exceeded its bound
    ConnectionTimeout,
    /// Established connection dropped mid-operation
    ConnectionLost,
    /// Malformed query text
    SyntaxError,
    /// Referenced table/object missing
    ObjectNotFound,
    /// Uniqueness/integrity violation
    ConstraintViolation,
    /// Requested driver type has no adapter
    UnsupportedType,
    /// Pool closed, exhausted or operation cancelled
    Pool,
    /// Invalid configuration
    Configuration,
    /// Unmapped underlying error
    Unknown,
}

impl ErrorCategory {
    /// Whether errors in this category leave the connection unusable
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::DatabaseNotFound
                | Self::ConnectionRefused
                | Self::ConnectionTimeout
                | Self::ConnectionLost
        )
    }
}

/// Main error type for dbdeck-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Credentials rejected by the server
    #[error("Authentication failed: Invalid credentials")]
    AuthenticationFailed { code: Option<String> },

    /// Named database does not exist
    #[error("Database not found: {database}")]
    DatabaseNotFound {
        database: String,
        code: Option<String>,
    },

    /// Host/port unreachable
    #[error("Connection refused: {host}:{port}")]
    ConnectionRefused {
        host: String,
        port: u16,
        code: Option<String>,
    },

    /// Connect or query timed out
    #[error("Connection timeout")]
    ConnectionTimeout {
        message: String,
        code: Option<String>,
    },

    /// Connection dropped mid-operation
    #[error("Connection lost")]
    ConnectionLost {
        message: String,
        code: Option<String>,
    },

    /// Malformed SQL
    #[error("SQL syntax error")]
    SyntaxError {
        message: String,
        code: Option<String>,
    },

    /// Referenced table does not exist
    #[error("Table does not exist")]
    ObjectNotFound {
        message: String,
        code: Option<String>,
    },

    /// Unique or integrity constraint violated
    #[error("Duplicate entry")]
    ConstraintViolation {
        message: String,
        code: Option<String>,
    },

    /// No adapter for the requested type
    #[error("Unsupported database type: {type_name}")]
    UnsupportedType { type_name: String },

    /// Unmapped driver error
    #[error("{driver} Error [{code}]: {message}")]
    Unknown {
        driver: String,
        code: String,
        message: String,
    },

    /// Pool has been closed
    #[error("Pool closed")]
    PoolClosed,

    /// No connection became available in time
    #[error("Pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthenticationFailed { .. } => ErrorCategory::AuthenticationFailed,
            Self::DatabaseNotFound { .. } => ErrorCategory::DatabaseNotFound,
            Self::ConnectionRefused { .. } => ErrorCategory::ConnectionRefused,
            Self::ConnectionTimeout { .. } => ErrorCategory::ConnectionTimeout,
            Self::ConnectionLost { .. } => ErrorCategory::ConnectionLost,
            Self::SyntaxError { .. } => ErrorCategory::SyntaxError,
            Self::ObjectNotFound { .. } => ErrorCategory::ObjectNotFound,
            Self::ConstraintViolation { .. } => ErrorCategory::ConstraintViolation,
            Self::UnsupportedType { .. } => ErrorCategory::UnsupportedType,
            // a caller that waited too long sees the same category as a slow server
            Self::PoolExhausted { .. } => ErrorCategory::ConnectionTimeout,
            Self::PoolClosed | Self::Cancelled => ErrorCategory::Pool,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Unknown { .. } | Self::Internal { .. } => ErrorCategory::Unknown,
        }
    }

    /// Original driver code, when the error came from a driver
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::AuthenticationFailed { code }
            | Self::DatabaseNotFound { code, .. }
            | Self::ConnectionRefused { code, .. }
            | Self::ConnectionTimeout { code, .. }
            | Self::ConnectionLost { code, .. }
            | Self::SyntaxError { code, .. }
            | Self::ObjectNotFound { code, .. }
            | Self::ConstraintViolation { code, .. } => code.as_deref(),
            Self::Unknown { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the connection that produced this error must be discarded
    #[inline]
    pub fn is_fatal(&self) -> bool {
        // no connection was handed out
        !matches!(self, Self::PoolExhausted { .. }) && self.category().is_fatal()
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::ConnectionTimeout {
            message: message.into(),
            code: None,
        }
    }

    /// Create a connection-lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
            code: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported type error
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationFailed => write!(f, "authentication_failed"),
            Self::DatabaseNotFound => write!(f, "database_not_found"),
            Self::ConnectionRefused => write!(f, "connection_refused"),
            Self::ConnectionTimeout => write!(f, "connection_timeout"),
            Self::ConnectionLost => write!(f, "connection_lost"),
            Self::SyntaxError => write!(f, "syntax_error"),
            Self::ObjectNotFound => write!(f, "object_not_found"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::UnsupportedType => write!(f, "unsupported_type"),
            Self::Pool => write!(f, "pool"),
            Self::Configuration => write!(f, "configuration"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Target details used to fill in normalized messages
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Host the driver was talking to
    pub host: String,
    /// Port the driver was talking to
    pub port: u16,
    /// Database named in the configuration
    pub database: String,
}

impl ErrorContext {
    /// Create a context for a target
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
        }
    }
}

/// Translate a driver-reported code into the normalized taxonomy.
///
/// `code` is the symbolic code the adapter extracted (MySQL error name,
/// PostgreSQL SQLSTATE, or a transport code such as `ECONNREFUSED`).
pub fn normalize(driver: DatabaseType, code: &str, message: &str, ctx: &ErrorContext) -> Error {
    let owned = Some(code.to_string());
    match code {
        // transport codes, shared by every driver
        "ECONNREFUSED" => Error::ConnectionRefused {
            host: ctx.host.clone(),
            port: ctx.port,
            code: owned,
        },
        "ETIMEDOUT" => Error::ConnectionTimeout {
            message: message.to_string(),
            code: owned,
        },
        "PROTOCOL_CONNECTION_LOST" | "ECONNRESET" | "EPIPE" => Error::ConnectionLost {
            message: message.to_string(),
            code: owned,
        },

        // MySQL
        "ER_ACCESS_DENIED_ERROR" | "ER_DBACCESS_DENIED_ERROR" | "ER_NOT_SUPPORTED_AUTH_MODE"
            if driver == DatabaseType::MySql =>
        {
            Error::AuthenticationFailed { code: owned }
        }
        "ER_BAD_DB_ERROR" if driver == DatabaseType::MySql => Error::DatabaseNotFound {
            database: ctx.database.clone(),
            code: owned,
        },
        "ER_PARSE_ERROR" if driver == DatabaseType::MySql => Error::SyntaxError {
            message: message.to_string(),
            code: owned,
        },
        "ER_NO_SUCH_TABLE" if driver == DatabaseType::MySql => Error::ObjectNotFound {
            message: message.to_string(),
            code: owned,
        },
        "ER_DUP_ENTRY" if driver == DatabaseType::MySql => Error::ConstraintViolation {
            message: message.to_string(),
            code: owned,
        },
        "ER_SERVER_SHUTDOWN" | "CR_SERVER_GONE_ERROR" | "CR_SERVER_LOST"
            if driver == DatabaseType::MySql =>
        {
            Error::ConnectionLost {
                message: message.to_string(),
                code: owned,
            }
        }

        // PostgreSQL SQLSTATE
        "28P01" | "28000" if driver == DatabaseType::Postgres => {
            Error::AuthenticationFailed { code: owned }
        }
        "3D000" if driver == DatabaseType::Postgres => Error::DatabaseNotFound {
            database: ctx.database.clone(),
            code: owned,
        },
        "42601" if driver == DatabaseType::Postgres => Error::SyntaxError {
            message: message.to_string(),
            code: owned,
        },
        "42P01" if driver == DatabaseType::Postgres => Error::ObjectNotFound {
            message: message.to_string(),
            code: owned,
        },
        "23505" if driver == DatabaseType::Postgres => Error::ConstraintViolation {
            message: message.to_string(),
            code: owned,
        },
        "57P01" | "08006" | "08003" if driver == DatabaseType::Postgres => Error::ConnectionLost {
            message: message.to_string(),
            code: owned,
        },
        "57014" if driver == DatabaseType::Postgres => Error::ConnectionTimeout {
            message: message.to_string(),
            code: owned,
        },

        _ => Error::Unknown {
            driver: driver.display_name().to_string(),
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

/// Map an I/O error kind to a transport code understood by [`normalize`]
pub fn io_error_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Some("ECONNRESET"),
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::UnexpectedEof => Some("PROTOCOL_CONNECTION_LOST"),
        _ => None,
    }
}
