//! Record types that flow between pipeline stages.
//!
//! ParsedUnit → ExtractedRecord → PreparedRecord → BatchOutcome

use serde::{Deserialize, Serialize};

/// One decoded source document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedUnit {
    /// Normalized unit id (the source file path)
    pub id: String,

    /// Sender header, decoded
    pub from: String,

    /// Subject header, decoded
    pub subject: String,

    /// Date header as found in the message
    pub date: String,

    /// Plain-text body (may be empty)
    pub body_text: String,

    /// HTML body (may be empty)
    pub body_html: String,
}

/// Kind of entity referenced by an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Hotel,
    Company,
    Contact,
}

/// An entity mention, optionally matched against the reference dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub name: String,
    /// Remote id of the matched reference entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_id: Option<i64>,
}

/// One article extracted from a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub headline: String,
    pub text: String,
    #[serde(default)]
    pub entities: Vec<EntityRef>,
}

impl ExtractedRecord {
    /// Matched remote ids for one entity kind, deduplicated in first-seen order.
    pub fn matched_ids(&self, kind: EntityKind) -> Vec<i64> {
        let mut ids = Vec::new();
        for id in self
            .entities
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.matched_id)
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// A record ready for delivery. This is the element type of the output file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreparedRecord {
    pub headline: String,
    pub article_text: String,

    /// Subject of the source message
    #[serde(default)]
    pub source_subject: String,

    /// Sender of the source message
    #[serde(default)]
    pub source_from: String,

    /// Publication date, RFC 3339 when the source date could be parsed
    #[serde(default)]
    pub publish_date: String,

    /// Unit id the record came from
    #[serde(default)]
    pub source_unit: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hotels: Vec<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub companies: Vec<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<i64>,

    /// Collaborator-specific fields carried through untouched
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result of delivering one batch.
///
/// `succeeded + failed` equals the batch length for well-behaved sinks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Remote ids assigned to the succeeded records
    #[serde(default)]
    pub remote_ids: Vec<String>,
    /// Per-item or whole-batch error messages
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BatchOutcome {
    /// Whole batch rejected with a single reason.
    pub fn failed_all(len: usize, error: impl Into<String>) -> Self {
        Self {
            succeeded: 0,
            failed: len,
            remote_ids: Vec::new(),
            errors: vec![error.into()],
        }
    }

    /// First error message, or a placeholder.
    pub fn first_error(&self) -> String {
        self.errors
            .first()
            .cloned()
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matched_ids_filters_by_kind_and_dedups() {
        let record = ExtractedRecord {
            headline: "h".into(),
            text: "t".into(),
            entities: vec![
                EntityRef { kind: EntityKind::Hotel, name: "A".into(), matched_id: Some(7) },
                EntityRef { kind: EntityKind::Hotel, name: "A'".into(), matched_id: Some(7) },
                EntityRef { kind: EntityKind::Hotel, name: "B".into(), matched_id: None },
                EntityRef { kind: EntityKind::Company, name: "C".into(), matched_id: Some(9) },
            ],
        };
        assert_eq!(record.matched_ids(EntityKind::Hotel), vec![7]);
        assert_eq!(record.matched_ids(EntityKind::Company), vec![9]);
        assert!(record.matched_ids(EntityKind::Contact).is_empty());
    }

    #[test]
    fn test_prepared_record_keeps_extra_fields() {
        let json = r#"{"headline":"H","article_text":"T","Region":"EMEA"}"#;
        let record: PreparedRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra.get("Region").and_then(|v| v.as_str()), Some("EMEA"));

        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["Region"], "EMEA");
        assert!(out.get("hotels").is_none());
    }
}
