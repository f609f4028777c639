//! Splitting a finished assistant answer into display text and structured
//! sections (Insights, KPI, Charts).
//!
//! The model embeds structured data inline in its plain text, either with
//! `### Start Of <NAME> ###` / `### End Of <NAME> ###` sentinel fences or as
//! one JSON object (whole-buffer with a `markdown_full` field, or trailing
//! after the prose). Extraction runs the strategies in a fixed priority
//! order - markers first (stripping their span from the text), then
//! whole-buffer JSON, then trailing JSON - and merges deterministically,
//! with marker-derived fields winning for their own keys.
//!
//! Extraction never fails: a KPI or Charts segment that defeats both the
//! strict and the lenient JSON parse is kept verbatim under its `*_raw`
//! field so the UI can still show something.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Insights,
    Kpi,
    Charts,
}

/// Start/end marker pairs in extraction priority order. Matching is
/// case-insensitive and tolerant of irregular spacing, but the `###` fences
/// and the `Start`/`End Of <NAME>` tokens are required literally.
static MARKERS: Lazy<Vec<(SectionKind, Regex, Regex)>> = Lazy::new(|| {
    [
        (SectionKind::Insights, "insights"),
        (SectionKind::Kpi, "kpi"),
        (SectionKind::Charts, "charts"),
    ]
    .into_iter()
    .map(|(kind, name)| {
        let start = Regex::new(&format!(r"(?i)###\s*start\s+of\s+{}\s*###", name))
            .expect("Invalid start marker pattern");
        let end = Regex::new(&format!(r"(?i)###\s*end\s+of\s+{}\s*###", name))
            .expect("Invalid end marker pattern");
        (kind, start, end)
    })
    .collect()
});

/// Quotes a bare numeral after a `"Value":` key. Lossy by design: it cannot
/// tell a numeral that upstream meant as a string from one it meant as a
/// number, so it is only applied after the strict parse fails, and its scope
/// is deliberately not expanded beyond numerals.
static KPI_VALUE_REPAIR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)("value"\s*:\s*)(-?\d+(?:\.\d+)?)"#).expect("Invalid KPI repair pattern")
});

/// One KPI tile.
///
/// Upstream emits capitalized keys (`"Title"`, `"Value"`); lowercase is
/// accepted too.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KpiItem {
    #[serde(default, alias = "Title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, alias = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, alias = "Subtitle", skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, alias = "Message", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One data point in a chart series - upstream mixes numbers and strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChartPoint {
    Number(f64),
    Text(String),
}

/// One named series of a chart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChartSeries {
    #[serde(default, alias = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "Data", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<ChartPoint>>,
}

/// Chart specification embedded by the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChartSpec {
    #[serde(default, alias = "Title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, alias = "Categories", skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, alias = "Series", skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<ChartSeries>>,
}

/// Structured sections recovered from an answer buffer.
///
/// A `*_raw` field holds the unparsed segment text when JSON decoding of
/// that segment failed, so the caller can still display it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedSections {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpi: Option<Vec<KpiItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpi_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts: Option<ChartSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_full: Option<String>,
}

impl ExtractedSections {
    /// True when no field is populated.
    pub fn is_empty(&self) -> bool {
        self.insights.is_none()
            && self.kpi.is_none()
            && self.kpi_raw.is_none()
            && self.charts.is_none()
            && self.charts_raw.is_none()
            && self.markdown_full.is_none()
    }
}

/// Result of extraction: display text plus optional structured sections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    /// Plain text for display, with marker spans removed
    pub text: String,
    /// Structured sections, or None when nothing structured was found
    pub sections: Option<ExtractedSections>,
}

/// Split a finalized answer buffer into display text and sections.
///
/// Pure function of its input: running it twice yields identical output.
pub fn extract(raw: &str) -> Extracted {
    let normalized = normalize(raw);
    let mut working = normalized.clone();
    let mut marker_sections = ExtractedSections::default();

    // Pass 1: sentinel markers, stripped out of the working text. A start
    // marker with no matching end marker leaves the construct untouched so a
    // truncated stream does not corrupt the output. Only the first
    // well-formed pair per section is honored.
    for (kind, start_re, end_re) in MARKERS.iter() {
        let Some(start) = start_re.find(&working) else {
            continue;
        };
        let (outer_start, inner_start) = (start.start(), start.end());
        let Some(end) = end_re.find(&working[inner_start..]) else {
            continue;
        };
        let (inner_end, outer_end) = (inner_start + end.start(), inner_start + end.end());

        let segment = working[inner_start..inner_end].trim().to_string();
        let mut rest = String::with_capacity(working.len());
        rest.push_str(&working[..outer_start]);
        rest.push_str(&working[outer_end..]);
        working = rest;

        // A whitespace-only segment is absent, not an empty string.
        if segment.is_empty() {
            continue;
        }
        match kind {
            SectionKind::Insights => marker_sections.insights = Some(segment),
            SectionKind::Kpi => match parse_kpi(&segment) {
                Some(items) => marker_sections.kpi = Some(items),
                None => marker_sections.kpi_raw = Some(segment),
            },
            SectionKind::Charts => match serde_json::from_str::<ChartSpec>(&segment) {
                Ok(spec) => marker_sections.charts = Some(spec),
                Err(err) => {
                    tracing::warn!(error = %err, "charts segment kept raw");
                    marker_sections.charts_raw = Some(segment);
                }
            },
        }
    }

    let mut text = working.trim().to_string();
    let mut base: Option<ExtractedSections> = None;

    // Pass 2: the original buffer as one JSON object with markdown_full.
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&normalized) {
        if object.get("markdown_full").and_then(Value::as_str).is_some() {
            let sections = sections_from_value(&Value::Object(object));
            text = sections.markdown_full.clone().unwrap_or_default();
            base = Some(sections);
        }
    }

    // Pass 3: trailing JSON object after the prose.
    if base.is_none() {
        if let Some(brace) = working.rfind('{') {
            if let Ok(value @ Value::Object(_)) =
                serde_json::from_str::<Value>(working[brace..].trim())
            {
                base = Some(sections_from_value(&value));
                text = working[..brace].trim().to_string();
            }
        }
    }

    // Merge: marker-derived fields take precedence for their own keys.
    let mut sections = base.unwrap_or_default();
    if marker_sections.insights.is_some() {
        sections.insights = marker_sections.insights;
    }
    if marker_sections.kpi.is_some() {
        sections.kpi = marker_sections.kpi;
    }
    if marker_sections.kpi_raw.is_some() {
        sections.kpi_raw = marker_sections.kpi_raw;
    }
    if marker_sections.charts.is_some() {
        sections.charts = marker_sections.charts;
    }
    if marker_sections.charts_raw.is_some() {
        sections.charts_raw = marker_sections.charts_raw;
    }

    Extracted {
        text,
        sections: if sections.is_empty() {
            None
        } else {
            Some(sections)
        },
    }
}

/// Non-breaking spaces to regular spaces, line endings (`\r\n` and bare
/// `\r`) to `\n`, trimmed.
fn normalize(raw: &str) -> String {
    raw.replace('\u{a0}', " ")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

/// Strict KPI parse, then one lenient repair pass for bare `"Value":`
/// numerals. Returns None when both fail; the caller keeps the raw text.
fn parse_kpi(segment: &str) -> Option<Vec<KpiItem>> {
    if let Ok(items) = serde_json::from_str::<Vec<KpiItem>>(segment) {
        return Some(items);
    }
    let repaired = KPI_VALUE_REPAIR.replace_all(segment, r#"${1}"${2}""#);
    match serde_json::from_str::<Vec<KpiItem>>(&repaired) {
        Ok(items) => {
            tracing::warn!("KPI segment parsed only after lenient value repair");
            Some(items)
        }
        Err(err) => {
            tracing::warn!(error = %err, "KPI segment kept raw");
            None
        }
    }
}

/// Best-effort conversion of a JSON object into sections, field by field.
/// A field that fails to typecheck degrades to its `*_raw` sibling instead
/// of discarding the rest of the record.
fn sections_from_value(value: &Value) -> ExtractedSections {
    let mut sections = ExtractedSections::default();
    sections.markdown_full = value
        .get("markdown_full")
        .and_then(Value::as_str)
        .map(str::to_string);
    sections.insights = value
        .get("insights")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(kpi) = value.get("kpi") {
        match serde_json::from_value::<Vec<KpiItem>>(kpi.clone()) {
            Ok(items) => sections.kpi = Some(items),
            Err(err) => {
                tracing::warn!(error = %err, "embedded kpi field kept raw");
                sections.kpi_raw = Some(kpi.to_string());
            }
        }
    }
    if let Some(charts) = value.get("charts") {
        match serde_json::from_value::<ChartSpec>(charts.clone()) {
            Ok(spec) => sections.charts = Some(spec),
            Err(err) => {
                tracing::warn!(error = %err, "embedded charts field kept raw");
                sections.charts_raw = Some(charts.to_string());
            }
        }
    }
    sections
}
