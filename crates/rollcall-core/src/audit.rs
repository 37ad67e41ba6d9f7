//! Audit record model: one row per observation, whatever the outcome.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

/// Column names of the audit log, in field order.
pub const AUDIT_COLUMNS: [&str; 6] = ["ts", "user_id", "name", "distance", "confidence", "event"];

/// Display name recorded for observations that matched nobody.
pub const UNKNOWN_NAME: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Sent,
    Debounced,
    Ignored,
    IgnoredEmptyRoster,
}

impl OutcomeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeTag::Sent => "sent",
            OutcomeTag::Debounced => "debounced",
            OutcomeTag::Ignored => "ignored",
            OutcomeTag::IgnoredEmptyRoster => "ignored_empty_roster",
        }
    }
}

impl std::fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub identity_id: Option<i64>,
    pub display_name: String,
    pub distance: Option<f64>,
    pub confidence: Option<f64>,
    pub event: OutcomeTag,
}

impl AuditRecord {
    /// Render the record as text fields in [`AUDIT_COLUMNS`] order.
    /// Absent values render as empty strings.
    pub fn fields(&self) -> [String; 6] {
        [
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.identity_id.map(|id| id.to_string()).unwrap_or_default(),
            self.display_name.clone(),
            self.distance.map(|d| d.to_string()).unwrap_or_default(),
            self.confidence.map(|c| c.to_string()).unwrap_or_default(),
            self.event.as_str().to_string(),
        ]
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit io: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit store: {0}")]
    Store(String),
}

/// Append-only destination for audit records.
pub trait AuditSink: Send {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError>;

    fn flush(&mut self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// In-memory sink.
impl AuditSink for Vec<AuditRecord> {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        self.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fields_for_ignored_record() {
        let record = AuditRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            identity_id: None,
            display_name: UNKNOWN_NAME.into(),
            distance: Some(0.75),
            confidence: None,
            event: OutcomeTag::Ignored,
        };
        assert_eq!(
            record.fields(),
            [
                "2024-03-01T08:00:00.000000Z".to_string(),
                String::new(),
                "unknown".to_string(),
                "0.75".to_string(),
                String::new(),
                "ignored".to_string(),
            ]
        );
    }

    #[test]
    fn test_vec_sink_appends() {
        let mut sink: Vec<AuditRecord> = Vec::new();
        let record = AuditRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            identity_id: Some(3),
            display_name: "Alice".into(),
            distance: Some(0.25),
            confidence: Some(0.75),
            event: OutcomeTag::Sent,
        };
        sink.record(&record).unwrap();
        sink.record(&record).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink[1].event.to_string(), "sent");
    }
}
