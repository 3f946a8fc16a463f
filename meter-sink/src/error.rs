use rdkafka::error::KafkaError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a [`SinkError`], used for metric labels and for
/// deciding whether a failure aborts the current flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigInvalid,
    Decode,
    Validation,
    Persistence,
    Dedupe,
    Transient,
    Kafka,
    IllegalState,
    Notification,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::Decode => "decode",
            ErrorKind::Validation => "validation",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Dedupe => "dedupe",
            ErrorKind::Transient => "transient",
            ErrorKind::Kafka => "kafka",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::Notification => "notification",
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to decode message: {message}")]
    Decode {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("failed to persist batch: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("deduplication store error: {message}")]
    Dedupe {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("cannot {action} while {state}")]
    IllegalState {
        state: &'static str,
        action: &'static str,
    },

    #[error("flush handler {handler} failed: {message}")]
    Notification { handler: String, message: String },

    #[error("{}", join_messages(.0))]
    Multiple(Vec<SinkError>),
}

fn join_messages(errors: &[SinkError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SinkError {
    pub fn decode(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SinkError::Decode {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn persistence(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SinkError::Persistence {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn dedupe(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SinkError::Dedupe {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        SinkError::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Collapses a list of errors: none is `Ok`, one is returned as-is,
    /// several are wrapped in [`SinkError::Multiple`].
    pub fn join(mut errors: Vec<SinkError>) -> Result<(), SinkError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SinkError::Multiple(errors)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            SinkError::Decode { .. } => ErrorKind::Decode,
            SinkError::Validation(_) => ErrorKind::Validation,
            SinkError::Persistence { .. } => ErrorKind::Persistence,
            SinkError::Dedupe { .. } => ErrorKind::Dedupe,
            SinkError::Transient { .. } => ErrorKind::Transient,
            SinkError::Kafka(_) => ErrorKind::Kafka,
            SinkError::IllegalState { .. } => ErrorKind::IllegalState,
            SinkError::Notification { .. } => ErrorKind::Notification,
            SinkError::Multiple(errors) => errors
                .first()
                .map(SinkError::kind)
                .unwrap_or(ErrorKind::Notification),
        }
    }

    /// Whether this error stops consumption when it reaches the ingestion loop.
    /// Everything else is logged and the loop carries on.
    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::ConfigInvalid(_)
            | SinkError::Persistence { .. }
            | SinkError::Kafka(_)
            | SinkError::IllegalState { .. } => true,
            SinkError::Multiple(errors) => errors.iter().any(SinkError::is_fatal),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_collapses_single_error() {
        assert!(SinkError::join(vec![]).is_ok());

        let err = SinkError::join(vec![SinkError::transient("boom")]).unwrap_err();
        assert!(matches!(err, SinkError::Transient { .. }));

        let err = SinkError::join(vec![
            SinkError::Validation("first".to_string()),
            SinkError::Validation("second".to_string()),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "first; second");
    }

    #[test]
    fn test_fatal_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        assert!(SinkError::persistence("insert failed", io).is_fatal());
        assert!(!SinkError::transient("retry later").is_fatal());
        assert!(!SinkError::Validation("bad".to_string()).is_fatal());
        assert_eq!(
            SinkError::IllegalState {
                state: "closed",
                action: "start"
            }
            .to_string(),
            "cannot start while closed"
        );
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let err = SinkError::dedupe("set failed", io);
        let source = std::error::Error::source(&err).expect("source should be kept");
        assert_eq!(source.to_string(), "connection reset");
        assert_eq!(err.kind(), ErrorKind::Dedupe);
    }
}
