//! In-band progress reports.
//!
//! Long-running server-side procedures report progress by emitting an
//! informational message shaped like
//! `<ProgressReport Status="Loading" Total="44" Progress="1" />`. The tag
//! is fixed; text that does not start with it is simply not a progress
//! report. Parsing never fails loudly - unparseable input yields `None` and
//! the message falls through to the ordinary logging path.

use serde::{Deserialize, Serialize};

const TAG: &str = "<ProgressReport";

/// A parsed progress message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Status text set by the procedure.
    pub status: String,
    /// Total number of items being processed.
    pub total: i32,
    /// Current item number.
    pub progress: i32,
    /// Reporting connection's application name, when the driver supplies it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ProgressReport {
    pub fn new(status: impl Into<String>, progress: i32, total: i32) -> Self {
        Self {
            status: status.into(),
            total,
            progress,
            source: None,
        }
    }

    /// Percent complete; 100 when the total is zero.
    pub fn percent_complete(&self) -> f64 {
        if self.total > 0 {
            (f64::from(self.progress) / f64::from(self.total)) * 100.0
        } else {
            100.0
        }
    }

    /// Parse a progress message. Returns `None` for anything that is not a
    /// well-formed report starting with the fixed tag.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix(TAG)?;
        // the tag must end the element name: "<ProgressReportX" is not ours
        if !rest.starts_with(|c: char| c.is_whitespace() || c == '/' || c == '>') {
            return None;
        }

        let mut report = Self::new("", 0, 0);
        let mut cursor = rest.trim_start();
        loop {
            if cursor.starts_with('>') || cursor.starts_with("/>") || cursor.is_empty() {
                break;
            }
            let eq = cursor.find('=')?;
            let name = cursor[..eq].trim();
            let quoted = cursor[eq + 1..].trim_start().strip_prefix('"')?;
            let end = quoted.find('"')?;
            let value = &quoted[..end];
            match name {
                "Status" => report.status = unescape(value),
                "Total" => report.total = value.parse().ok()?,
                "Progress" => report.progress = value.parse().ok()?,
                _ => {}
            }
            cursor = quoted[end + 1..].trim_start();
        }
        Some(report)
    }

    /// Render the wire format emitted by the server-side reporting procedure.
    pub fn to_xml(&self) -> String {
        format!(
            "<ProgressReport Status=\"{}\" Total=\"{}\" Progress=\"{}\" />",
            escape(&self.status),
            self.total,
            self.progress
        )
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed() {
        let report =
            ProgressReport::parse("<ProgressReport Status=\"Posting\" Total=\"44\" Progress=\"11\" />")
                .unwrap();
        assert_eq!(report.status, "Posting");
        assert_eq!(report.total, 44);
        assert_eq!(report.progress, 11);
        assert_eq!(report.percent_complete(), 25.0);
    }

    #[test]
    fn test_parse_rejects_other_text() {
        assert!(ProgressReport::parse("Warning: Null value is eliminated").is_none());
        assert!(ProgressReport::parse("").is_none());
        assert!(ProgressReport::parse("<ProgressReporter x=\"1\"/>").is_none());
    }

    #[test]
    fn test_parse_rejects_non_numeric_counts() {
        assert!(ProgressReport::parse("<ProgressReport Status=\"a\" Total=\"x\" Progress=\"1\"/>").is_none());
    }

    #[test]
    fn test_zero_total_is_complete() {
        let report = ProgressReport::new("done", 0, 0);
        assert_eq!(report.percent_complete(), 100.0);
    }

    #[test]
    fn test_round_trip_with_escaping() {
        let report = ProgressReport::new("a \"quoted\" <status>", 3, 9);
        let parsed = ProgressReport::parse(&report.to_xml()).unwrap();
        assert_eq!(parsed.status, report.status);
        assert_eq!(parsed.total, 9);
    }
}
