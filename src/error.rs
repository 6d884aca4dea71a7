//! Error types for the analytics engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("failed to read event source {path}: {source}")]
    DataLoad {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("event source is missing required column `{0}`")]
    MissingColumn(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// A single malformed record. Recovered locally by dropping the row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowParseError {
    #[error("row {line}: missing user_id")]
    MissingUserId { line: u64 },

    #[error("row {line}: missing event_type")]
    MissingEventType { line: u64 },

    #[error("row {line}: unparsable timestamp `{value}`")]
    BadTimestamp { line: u64, value: String },

    #[error("row {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_column_names_the_column() {
        let err = AnalyticsError::MissingColumn("timestamp");
        assert!(err.to_string().contains("`timestamp`"));
    }

    #[test]
    fn row_errors_carry_line_numbers() {
        let err = RowParseError::BadTimestamp {
            line: 7,
            value: "yesterday".to_string(),
        };
        assert_eq!(err.to_string(), "row 7: unparsable timestamp `yesterday`");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AnalyticsError = io.into();
        assert!(matches!(err, AnalyticsError::Io(_)));
    }
}
