use thiserror::Error;

use crate::types::{TableId, Timestamp};

/// Convenience alias for `Result<T, RestoreError>`.
pub type RestoreResult<T> = Result<T, RestoreError>;

/// Terminal errors of a restore run. Every variant aborts the whole
/// operation; the only silently-skipped conditions (unrelated DDL,
/// out-of-fence rows, pre-window events) never surface here.
#[derive(Error, Debug)]
pub enum RestoreError {
    /// The requested window starts beyond what the log durably resolved.
    #[error("invalid restore window: start ts {start_ts} is greater than resolved ts {resolved_ts}")]
    InvalidWindow {
        start_ts: Timestamp,
        resolved_ts: Timestamp,
    },

    /// A log file (metadata, DDL, or row-change) failed to decode.
    #[error("failed to decode log file {file}: {reason}")]
    Decode { file: String, reason: String },

    /// A schema expected on the restore cluster does not exist.
    #[error("schema does not exist: {0}")]
    SchemaNotExists(String),

    /// A replayed DDL statement failed on the restore cluster. The schema
    /// may be half-applied; the restore is not resumable past this point.
    #[error("ddl execution failed for {statement:?}: {reason}")]
    DdlExecution { statement: String, reason: String },

    /// Row-to-KV encoding failed (type cast or generated-expression
    /// evaluation). Dropping the row would corrupt index consistency.
    #[error("encoding failed for {table} column {column}: {reason}")]
    Encoding {
        table: TableId,
        column: String,
        reason: String,
    },

    /// Sub-range ingestion did not converge within the configured retry
    /// budget.
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A sibling worker failed first and cancelled this one.
    #[error("restore cancelled")]
    Cancelled,
}

impl RestoreError {
    /// Decode error with file context, from any displayable cause.
    pub fn decode(file: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            file: file.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RestoreError::InvalidWindow {
            start_ts: Timestamp(500),
            resolved_ts: Timestamp(400),
        };
        assert!(err.to_string().contains("start ts 500"));

        let err = RestoreError::decode("ddls/ddl.abc", "bad suffix");
        assert!(err.to_string().contains("ddls/ddl.abc"));
    }
}
