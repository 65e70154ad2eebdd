//! Phase-1 processing stages.
//!
//! A unit flows read → parse → enrich → validate → prepare. Each stage is a trait so the
//! extraction pipeline can be driven by the default stages below or by
//! anything else that honors the same contract: `Ok` with zero or more
//! records, or `Err` to fail just this unit.

use crate::models::{
    EntityKind, ExtractedRecord, MailsiftError, ParsedUnit, PreparedRecord, Result,
};
use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use tracing::debug;

/// Splits a decoded unit into articles.
pub trait ArticleParser: Send + Sync {
    fn parse(&self, unit: &ParsedUnit) -> Result<Vec<ExtractedRecord>>;
}

/// Adds entity information to an article. May call remote services.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, record: ExtractedRecord) -> Result<ExtractedRecord>;
}

/// Checks an enriched article before it is prepared.
///
/// May rewrite the record (for example drop doubtful entity refs). `Err`
/// rejects the article and fails its unit.
pub trait Validator: Send + Sync {
    fn validate(&self, record: ExtractedRecord) -> Result<ExtractedRecord>;
}

/// Maps an enriched article to the record written to the output file.
pub trait RecordPreparer: Send + Sync {
    fn prepare(&self, unit: &ParsedUnit, record: ExtractedRecord) -> Result<PreparedRecord>;
}

/// Treats the whole message as a single article.
///
/// Headline is the subject; text is the plain body, or the HTML body with
/// markup stripped when there is no plain part.
pub struct WholeMessageParser {
    block_re: Regex,
    tag_re: Regex,
    space_re: Regex,
}

impl WholeMessageParser {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| MailsiftError::Internal(format!("Bad pattern {pattern}: {e}")))
        };
        Ok(Self {
            block_re: compile(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>")?,
            tag_re: compile(r"(?s)<[^>]*>")?,
            space_re: compile(r"[ \t\r\f\v]+")?,
        })
    }

    /// Drop markup, keep the visible text.
    pub fn strip_html(&self, html: &str) -> String {
        let text = self.block_re.replace_all(html, " ");
        let text = self.tag_re.replace_all(&text, " ");
        let text = text
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&amp;", "&");

        text.lines()
            .map(|line| self.space_re.replace_all(line, " ").trim().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ArticleParser for WholeMessageParser {
    fn parse(&self, unit: &ParsedUnit) -> Result<Vec<ExtractedRecord>> {
        let text = if !unit.body_text.trim().is_empty() {
            unit.body_text.trim().to_string()
        } else {
            self.strip_html(&unit.body_html)
        };

        if text.is_empty() {
            return Err(MailsiftError::ParseError(format!(
                "No article content in {}",
                unit.id
            )));
        }

        let headline = match unit.subject.trim() {
            "" => "(no subject)".to_string(),
            s => s.to_string(),
        };

        Ok(vec![ExtractedRecord {
            headline,
            text,
            entities: Vec::new(),
        }])
    }
}

/// Leaves records unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughEnricher;

#[async_trait]
impl Enricher for PassThroughEnricher {
    async fn enrich(&self, record: ExtractedRecord) -> Result<ExtractedRecord> {
        Ok(record)
    }
}

/// Keeps only entity refs that were matched to a reference entry and
/// rejects articles without a headline or text.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchedEntityValidator;

impl Validator for MatchedEntityValidator {
    fn validate(&self, mut record: ExtractedRecord) -> Result<ExtractedRecord> {
        if record.headline.trim().is_empty() {
            return Err(MailsiftError::InvalidInput("Article has no headline".into()));
        }
        if record.text.trim().is_empty() {
            return Err(MailsiftError::InvalidInput(format!(
                "Article '{}' has no text",
                record.headline
            )));
        }

        let before = record.entities.len();
        record.entities.retain(|e| e.matched_id.is_some());
        let dropped = before - record.entities.len();
        if dropped > 0 {
            debug!(headline = %record.headline, dropped, "Dropped unmatched entities");
        }
        Ok(record)
    }
}

/// Copies source metadata and matched entity ids onto the record.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourcePreparer;

impl RecordPreparer for SourcePreparer {
    fn prepare(&self, unit: &ParsedUnit, record: ExtractedRecord) -> Result<PreparedRecord> {
        Ok(PreparedRecord {
            hotels: record.matched_ids(EntityKind::Hotel),
            companies: record.matched_ids(EntityKind::Company),
            contacts: record.matched_ids(EntityKind::Contact),
            headline: record.headline,
            article_text: record.text,
            source_subject: unit.subject.clone(),
            source_from: unit.from.clone(),
            publish_date: normalize_date(&unit.date),
            source_unit: unit.id.clone(),
            extra: Default::default(),
        })
    }
}

/// RFC 3339 when `raw` is an RFC 2822 or RFC 3339 date, otherwise `raw` as is.
pub fn normalize_date(raw: &str) -> String {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityRef;

    fn unit(subject: &str, text: &str, html: &str) -> ParsedUnit {
        ParsedUnit {
            id: "/mail/a.eml".into(),
            from: "news@example.com".into(),
            subject: subject.into(),
            date: "Tue, 1 Jul 2025 10:52:37 +0200".into(),
            body_text: text.into(),
            body_html: html.into(),
        }
    }

    #[test]
    fn test_parser_prefers_plain_text() {
        let parser = WholeMessageParser::new().unwrap();
        let records = parser
            .parse(&unit("Hotel opens", "  Body text  ", "<p>ignored</p>"))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].headline, "Hotel opens");
        assert_eq!(records[0].text, "Body text");
    }

    #[test]
    fn test_parser_falls_back_to_html() {
        let parser = WholeMessageParser::new().unwrap();
        let html = "<html><head><title>x</title></head><body><style>p{}</style>\
                    <p>Deal&nbsp;closed</p>\n<p>A &amp; B</p></body></html>";
        let records = parser.parse(&unit("", "", html)).unwrap();
        assert_eq!(records[0].headline, "(no subject)");
        assert_eq!(records[0].text, "Deal closed\nA & B");
    }

    #[test]
    fn test_parser_rejects_empty_message() {
        let parser = WholeMessageParser::new().unwrap();
        let result = parser.parse(&unit("Subject", " ", ""));
        assert!(matches!(result, Err(MailsiftError::ParseError(_))));
    }

    #[test]
    fn test_preparer_copies_metadata_and_ids() {
        let record = ExtractedRecord {
            headline: "H".into(),
            text: "T".into(),
            entities: vec![
                EntityRef { kind: EntityKind::Hotel, name: "Ritz".into(), matched_id: Some(11) },
                EntityRef { kind: EntityKind::Contact, name: "Jo".into(), matched_id: Some(3) },
            ],
        };
        let prepared = SourcePreparer.prepare(&unit("S", "T", ""), record).unwrap();

        assert_eq!(prepared.headline, "H");
        assert_eq!(prepared.source_from, "news@example.com");
        assert_eq!(prepared.source_unit, "/mail/a.eml");
        assert_eq!(prepared.publish_date, "2025-07-01T10:52:37+02:00");
        assert_eq!(prepared.hotels, vec![11]);
        assert!(prepared.companies.is_empty());
        assert_eq!(prepared.contacts, vec![3]);
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2025-07-01T08:52:37Z"), "2025-07-01T08:52:37+00:00");
        assert_eq!(normalize_date("last tuesday"), "last tuesday");
        assert_eq!(normalize_date(""), "");
    }

    #[test]
    fn test_validator_drops_unmatched_entities() {
        let record = ExtractedRecord {
            headline: "H".into(),
            text: "T".into(),
            entities: vec![
                EntityRef { kind: EntityKind::Hotel, name: "Ritz".into(), matched_id: Some(11) },
                EntityRef { kind: EntityKind::Company, name: "Acme".into(), matched_id: None },
            ],
        };
        let validated = MatchedEntityValidator.validate(record).unwrap();

        assert_eq!(validated.entities.len(), 1);
        assert_eq!(validated.entities[0].name, "Ritz");
    }

    #[test]
    fn test_validator_rejects_blank_text() {
        let record = ExtractedRecord {
            headline: "H".into(),
            text: "  ".into(),
            entities: vec![],
        };
        let result = MatchedEntityValidator.validate(record);
        assert!(matches!(result, Err(MailsiftError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_pass_through_enricher() {
        let record = ExtractedRecord {
            headline: "H".into(),
            text: "T".into(),
            entities: vec![],
        };
        let out = PassThroughEnricher.enrich(record).await.unwrap();
        assert_eq!(out.headline, "H");
    }
}
