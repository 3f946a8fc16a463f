use regex::Regex;

use crate::error::SinkError;
use crate::kafka::LogRecord;

/// Record header carrying the tenant namespace.
pub const NAMESPACE_HEADER: &str = "namespace";

/// Ingest topics are named `om_<namespace>_events`.
pub const DEFAULT_TOPIC_PATTERN: &str = r"^om_([A-Za-z0-9]+(?:_[A-Za-z0-9]+)*)_events$";

/// Works out which tenant a record belongs to: the `namespace` header when
/// present, otherwise the first capture group of the topic pattern.
#[derive(Debug, Clone)]
pub struct NamespaceResolver {
    topic_pattern: Regex,
}

impl NamespaceResolver {
    pub fn new(topic_pattern: &str) -> Result<Self, SinkError> {
        let topic_pattern = Regex::new(topic_pattern).map_err(|e| {
            SinkError::ConfigInvalid(format!("invalid namespace topic pattern: {e}"))
        })?;
        if topic_pattern.captures_len() < 2 {
            return Err(SinkError::ConfigInvalid(
                "namespace topic pattern needs a capture group for the namespace".to_string(),
            ));
        }
        Ok(Self { topic_pattern })
    }

    pub fn pattern(&self) -> &str {
        self.topic_pattern.as_str()
    }

    pub fn resolve(&self, record: &LogRecord) -> Option<String> {
        let from_header = record
            .header(NAMESPACE_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .map(str::trim)
            .filter(|ns| !ns.is_empty());
        if let Some(namespace) = from_header {
            return Some(namespace.to_string());
        }

        self.topic_pattern
            .captures(record.coordinate.topic())
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|ns| !ns.is_empty())
    }
}
