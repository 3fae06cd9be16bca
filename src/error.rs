//! Error types for the data-access layer.
//!
//! This module defines all error types using `thiserror`. Server faults keep
//! their native number/state/severity so callers can classify them; the two
//! intentionally-silent classes (cooperative cancellation and user-raised
//! error 50000) get their own treatment in the command executor.

use crate::driver::{DriverError, SqlFault};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// A fault raised by the database engine itself.
    #[error("{fault}")]
    Sql { fault: SqlFault },

    /// Transport or driver-level failure outside the engine.
    #[error("Connection failure: {message}")]
    Connection { message: String },

    /// The command was cancelled cooperatively via `Command::cancel`.
    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },

    #[error("Parameter '{name}' not found")]
    ParameterNotFound { name: String },

    #[error("Column '{column}' not found in result set")]
    ColumnNotFound { column: String },

    #[error("Unexpected null for column '{column}'")]
    NullColumn { column: String },

    #[error("Column '{column}' holds {actual}, expected {expected}")]
    ColumnType {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A row-to-record assignment failure, wrapped with the offending column.
    #[error("Exception while mapping column '{column}': {message}")]
    Mapping { column: String, message: String },

    /// Contract violation by the caller; raised before any I/O occurs.
    #[error("Invalid usage: {message}")]
    Usage { message: String },
}

impl DbError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn parameter_not_found(name: impl Into<String>) -> Self {
        Self::ParameterNotFound { name: name.into() }
    }

    pub fn column_not_found(column: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            column: column.into(),
        }
    }

    pub fn null_column(column: impl Into<String>) -> Self {
        Self::NullColumn {
            column: column.into(),
        }
    }

    pub fn column_type(
        column: impl Into<String>,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        Self::ColumnType {
            column: column.into(),
            expected,
            actual,
        }
    }

    pub fn mapping(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mapping {
            column: column.into(),
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// True for the cooperative-cancellation signal. The queue listener uses
    /// this to suppress logging of its own shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The native fault, when the error originated in the database engine.
    pub fn sql_fault(&self) -> Option<&SqlFault> {
        match self {
            Self::Sql { fault } => Some(fault),
            _ => None,
        }
    }
}

/// Convert driver errors to DbError. This is a structural conversion only;
/// classification (cancellation, user-raised faults) happens in the command
/// executor where the cancellation flag is visible.
impl From<DriverError> for DbError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Server(fault) => DbError::Sql { fault },
            DriverError::Transport(message) => DbError::Connection { message },
        }
    }
}

/// Result type alias for data-access operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_fault_display() {
        let err = DbError::from(DriverError::Server(SqlFault {
            number: 2627,
            state: 1,
            class: 14,
            message: "Violation of PRIMARY KEY constraint".to_string(),
        }));
        let text = err.to_string();
        assert!(text.contains("2627"));
        assert!(text.contains("severity 14"));
    }

    #[test]
    fn test_cancelled_classification() {
        assert!(DbError::cancelled("stopped").is_cancelled());
        assert!(!DbError::connection("lost").is_cancelled());
    }

    #[test]
    fn test_mapping_error_names_column() {
        let err = DbError::mapping("Qty", "cannot convert string to int");
        assert!(err.to_string().contains("'Qty'"));
    }
}
