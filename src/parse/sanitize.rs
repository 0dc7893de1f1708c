//! Response sanitization: key normalization, numeric coercion, placeholder
//! removal, score snapping, and page-bounds enforcement.
//!
//! Sanitization is shape-aware. Only the fields of the closed record shapes
//! are read; anything else in the decoded value is dropped on the floor.

use serde_json::{Map, Value};

use crate::models::{AnalysisMode, ChunkRecords, Connection, Finding, PrimaryPage};

/// Page-count limits used to reject hallucinated page references.
#[derive(Debug, Clone, Copy)]
pub struct PageBounds {
    /// Total pages of the primary document.
    pub primary_pages: u32,
    /// Pages in the partner chunk the response refers to.
    pub chunk_pages: u32,
}

/// Tie handling for scores that land between the grid maximum and the
/// exception value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundaryPolicy {
    /// Values above `max` but below `exception` snap down to `max`.
    #[default]
    ClampToGrid,
    /// Values at or past the midpoint round up to `exception`.
    NearestIncludingException,
}

/// Discrete score grid with one exception value above the normal maximum.
///
/// The normal range snaps to multiples of `step` within `[step, max]`. The
/// `exception` value is reserved for one designated condition (an identical
/// shared figure) and is only ever emitted exactly; inputs beyond it clamp
/// back down rather than passing through verbatim.
#[derive(Debug, Clone, Copy)]
pub struct ScoreGrid {
    pub step: u32,
    pub max: u32,
    pub exception: u32,
    pub boundary: BoundaryPolicy,
}

impl Default for ScoreGrid {
    fn default() -> Self {
        Self {
            step: 5,
            max: 100,
            exception: 110,
            boundary: BoundaryPolicy::default(),
        }
    }
}

impl ScoreGrid {
    /// Snap a raw score onto the grid. `None` means the value is unusable
    /// and the record carrying it should be dropped.
    pub fn snap(&self, raw: i64) -> Option<u32> {
        if raw <= 0 {
            return None;
        }
        let value = u32::try_from(raw).unwrap_or(u32::MAX);
        if value == self.exception {
            return Some(self.exception);
        }
        if value > self.exception {
            return Some(self.exception);
        }
        if value > self.max {
            return match self.boundary {
                BoundaryPolicy::ClampToGrid => Some(self.max),
                BoundaryPolicy::NearestIncludingException => {
                    if value >= self.max + (self.exception - self.max).div_ceil(2) {
                        Some(self.exception)
                    } else {
                        Some(self.max)
                    }
                }
            };
        }
        let snapped = ((value + self.step / 2) / self.step).max(1) * self.step;
        Some(snapped.min(self.max))
    }
}

/// Values that stand in for a missing answer and must not survive.
const PLACEHOLDERS: &[&str] = &["", "n/a", "na", "null", "none", "unknown", "-"];

fn canonical_key(key: &str) -> &str {
    match key {
        "relevance_score" | "relevance" => "score",
        "page_number" | "page_num" | "partner_page" => "page",
        "partner_doc" | "document" | "filename" | "doc_name" => "doc",
        "title" | "name" => "label",
        "text" | "content" => "excerpt",
        "description" | "reasoning" => "reason",
        "primary_pages" => "pages",
        "related_pages" | "matches" => "related",
        other => other,
    }
}

/// First value present under any spelling of a canonical key.
fn field<'a>(obj: &'a Map<String, Value>, canonical: &str) -> Option<&'a Value> {
    obj.iter()
        .find(|(k, _)| canonical_key(k) == canonical)
        .map(|(_, v)| v)
}

/// Coerce a numeric-looking value to an integer.
fn as_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}

/// A string field with placeholders treated as absent.
fn as_text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if PLACEHOLDERS.contains(&s.to_lowercase().as_str()) {
        None
    } else {
        Some(s)
    }
}

fn sanitize_connection(
    value: &Value,
    bounds: &PageBounds,
    grid: &ScoreGrid,
    fallback_doc: Option<&str>,
) -> Option<Connection> {
    let obj = value.as_object()?;
    let page = field(obj, "page").and_then(as_number)?;
    if page < 1 || page > bounds.chunk_pages as i64 {
        tracing::debug!("Dropping connection with out-of-range page {}", page);
        return None;
    }
    let score = grid.snap(field(obj, "score").and_then(as_number)?)?;
    let doc = field(obj, "doc")
        .and_then(as_text)
        .or_else(|| fallback_doc.map(str::to_string))?;
    let reason = field(obj, "reason").and_then(as_text).unwrap_or_default();
    Some(Connection {
        doc,
        page: page as u32,
        reason,
        score,
    })
}

fn sanitize_finding(
    value: &Value,
    bounds: &PageBounds,
    grid: &ScoreGrid,
    fallback_doc: Option<&str>,
) -> Option<Finding> {
    let obj = value.as_object()?;
    let finding = Finding {
        label: field(obj, "label").and_then(as_text)?,
        excerpt: field(obj, "excerpt").and_then(as_text)?,
        summary: field(obj, "summary").and_then(as_text)?,
        connections: field(obj, "connections")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| sanitize_connection(c, bounds, grid, fallback_doc))
                    .collect()
            })
            .unwrap_or_default(),
    };
    finding.is_complete().then_some(finding)
}

fn sanitize_primary_page(
    value: &Value,
    bounds: &PageBounds,
    grid: &ScoreGrid,
    fallback_doc: Option<&str>,
) -> Option<PrimaryPage> {
    let obj = value.as_object()?;
    let page = field(obj, "primary_page")
        .or_else(|| field(obj, "page"))
        .and_then(as_number)?;
    if page < 1 || page > bounds.primary_pages as i64 {
        tracing::debug!("Dropping page record with out-of-range page {}", page);
        return None;
    }
    let findings: Vec<Finding> = field(obj, "findings")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|f| sanitize_finding(f, bounds, grid, fallback_doc))
                .collect()
        })
        .unwrap_or_default();
    if findings.is_empty() {
        return None;
    }
    Some(PrimaryPage {
        page: page as u32,
        findings,
    })
}

/// Turn a decoded response value into validated records for the mode.
///
/// `fallback_doc` fills a missing `doc` field on connections, since the
/// service only ever sees one partner document per request.
pub fn sanitize_records(
    value: &Value,
    mode: AnalysisMode,
    bounds: &PageBounds,
    grid: &ScoreGrid,
    fallback_doc: Option<&str>,
) -> ChunkRecords {
    match mode {
        AnalysisMode::PrimaryCentric => {
            let pages = value
                .as_object()
                .and_then(|obj| field(obj, "pages"))
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| sanitize_primary_page(p, bounds, grid, fallback_doc))
                        .collect()
                })
                .unwrap_or_default();
            ChunkRecords::PrimaryCentric { pages }
        }
        AnalysisMode::PartnerCentric => {
            let related = value
                .as_object()
                .and_then(|obj| field(obj, "related"))
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|c| sanitize_connection(c, bounds, grid, fallback_doc))
                        .collect()
                })
                .unwrap_or_default();
            ChunkRecords::PartnerCentric { related }
        }
    }
}

/// Heuristic for low-quality output that warrants one regeneration attempt:
/// nothing decoded, or content too thin to be a real analysis.
pub fn is_suspicious(records: &ChunkRecords) -> bool {
    match records {
        ChunkRecords::PrimaryCentric { pages } => {
            if pages.is_empty() {
                return true;
            }
            let content_len: usize = pages
                .iter()
                .flat_map(|p| p.findings.iter())
                .map(|f| f.excerpt.len() + f.summary.len())
                .sum();
            content_len < 20
        }
        ChunkRecords::PartnerCentric { related } => {
            related.is_empty() || related.iter().all(|c| c.reason.is_empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bounds() -> PageBounds {
        PageBounds {
            primary_pages: 10,
            chunk_pages: 40,
        }
    }

    #[test]
    fn snaps_to_nearest_grid_value() {
        let grid = ScoreGrid::default();
        assert_eq!(grid.snap(67), Some(65));
        assert_eq!(grid.snap(68), Some(70));
        assert_eq!(grid.snap(5), Some(5));
        assert_eq!(grid.snap(100), Some(100));
        assert_eq!(grid.snap(1), Some(5));
    }

    #[test]
    fn exception_value_passes_and_overshoot_clamps() {
        let grid = ScoreGrid::default();
        assert_eq!(grid.snap(110), Some(110));
        // Never accepted verbatim.
        assert_eq!(grid.snap(111), Some(110));
        assert_eq!(grid.snap(9999), Some(110));
    }

    #[test]
    fn boundary_band_follows_policy() {
        let clamp = ScoreGrid::default();
        assert_eq!(clamp.snap(104), Some(100));
        assert_eq!(clamp.snap(109), Some(100));

        let nearest = ScoreGrid {
            boundary: BoundaryPolicy::NearestIncludingException,
            ..ScoreGrid::default()
        };
        assert_eq!(nearest.snap(104), Some(100));
        assert_eq!(nearest.snap(105), Some(110));
    }

    #[test]
    fn non_positive_scores_are_unusable() {
        let grid = ScoreGrid::default();
        assert_eq!(grid.snap(0), None);
        assert_eq!(grid.snap(-5), None);
    }

    #[test]
    fn coerces_numeric_strings_and_key_variants() {
        let value = json!({
            "pages": [{
                "page": "3",
                "findings": [{
                    "title": "Q7",
                    "text": "What is the capital?",
                    "summary": "geography recall",
                    "connections": [
                        {"doc": "b.pdf", "page_number": "12", "relevance_score": "82", "reason": "same topic"}
                    ]
                }]
            }]
        });
        let records = sanitize_records(
            &value,
            AnalysisMode::PrimaryCentric,
            &bounds(),
            &ScoreGrid::default(),
            None,
        );
        let ChunkRecords::PrimaryCentric { pages } = records else {
            panic!("wrong mode");
        };
        assert_eq!(pages[0].page, 3);
        let conn = &pages[0].findings[0].connections[0];
        assert_eq!(conn.page, 12);
        assert_eq!(conn.score, 80);
        assert_eq!(pages[0].findings[0].label, "Q7");
    }

    #[test]
    fn drops_placeholder_fields_and_incomplete_findings() {
        let value = json!({
            "pages": [{
                "primary_page": 2,
                "findings": [
                    {"label": "Q1", "excerpt": "real content", "summary": "fine"},
                    {"label": "Q2", "excerpt": "N/A", "summary": "missing the answer"}
                ]
            }]
        });
        let records = sanitize_records(
            &value,
            AnalysisMode::PrimaryCentric,
            &bounds(),
            &ScoreGrid::default(),
            None,
        );
        assert_eq!(records.record_count(), 1);
    }

    #[test]
    fn drops_out_of_bounds_page_references() {
        let value = json!({
            "pages": [
                {"primary_page": 99, "findings": [{"label": "a", "excerpt": "b", "summary": "c"}]},
                {"primary_page": 4, "findings": [{
                    "label": "a", "excerpt": "b", "summary": "c",
                    "connections": [
                        {"doc": "b.pdf", "page": 41, "score": 80},
                        {"doc": "b.pdf", "page": 40, "score": 80}
                    ]
                }]}
            ]
        });
        let records = sanitize_records(
            &value,
            AnalysisMode::PrimaryCentric,
            &bounds(),
            &ScoreGrid::default(),
            None,
        );
        let ChunkRecords::PrimaryCentric { pages } = records else {
            panic!("wrong mode");
        };
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].findings[0].connections.len(), 1);
        assert_eq!(pages[0].findings[0].connections[0].page, 40);
    }

    #[test]
    fn fallback_doc_fills_missing_document_names() {
        let value = json!({"related": [{"page": 3, "score": 75, "reason": "overlap"}]});
        let records = sanitize_records(
            &value,
            AnalysisMode::PartnerCentric,
            &bounds(),
            &ScoreGrid::default(),
            Some("partner.pdf"),
        );
        let ChunkRecords::PartnerCentric { related } = records else {
            panic!("wrong mode");
        };
        assert_eq!(related[0].doc, "partner.pdf");
    }

    #[test]
    fn empty_results_are_suspicious() {
        assert!(is_suspicious(&ChunkRecords::PrimaryCentric { pages: vec![] }));
        assert!(is_suspicious(&ChunkRecords::PartnerCentric { related: vec![] }));
        let healthy = ChunkRecords::PrimaryCentric {
            pages: vec![PrimaryPage {
                page: 1,
                findings: vec![Finding {
                    label: "Q1".into(),
                    excerpt: "a real excerpt of the question".into(),
                    summary: "covers the same derivation".into(),
                    connections: vec![],
                }],
            }],
        };
        assert!(!is_suspicious(&healthy));
    }
}
