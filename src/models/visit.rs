//! Visit history record

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One visited URL.
///
/// History lines are `<rfc3339 timestamp> <url>`; files written before
/// timestamps were recorded hold only the URL, so `timestamp` is optional
/// and the URL is always the last token of the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub url: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl VisitRecord {
    /// Stamped with millisecond precision, matching what is written to disk.
    pub fn now(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timestamp: Some(Utc::now().trunc_subsecs(3)),
        }
    }

    /// Parse a history line; blank lines yield `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let first = tokens.next()?;
        let (url, timestamp) = match tokens.last() {
            Some(url) => (
                url,
                DateTime::parse_from_rfc3339(first)
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc)),
            ),
            None => (first, None),
        };
        Some(Self {
            url: url.to_string(),
            timestamp,
        })
    }

    /// Serialize to a single newline-terminated history line.
    pub fn to_line(&self) -> String {
        match &self.timestamp {
            Some(ts) => format!(
                "{} {}\n",
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                self.url
            ),
            None => format!("{}\n", self.url),
        }
    }
}
