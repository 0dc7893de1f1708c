//! Response parsing with staged repair and partial recovery.
//!
//! Stages run in order until one yields a usable value: direct decode of the
//! unwrapped text, decode after corruption cleanup, decode of the largest
//! balanced region, and finally per-record salvage. Whatever decodes is then
//! sanitized against the closed record shapes.

mod partial;
mod repair;
mod sanitize;

pub use sanitize::{is_suspicious, BoundaryPolicy, PageBounds, ScoreGrid};

use serde_json::Value;
use thiserror::Error;

use crate::models::{AnalysisMode, ChunkRecords};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parsable content in response ({response_len} chars)")]
    Unrecoverable { response_len: usize },
}

/// Outcome of parsing one chunk response.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub records: ChunkRecords,
    /// True when the records were salvaged from a malformed response.
    pub is_partial: bool,
}

/// Whether a decoded value plausibly is a whole response rather than a
/// fragment pulled out of one.
fn looks_like_sheet(value: &Value, mode: AnalysisMode) -> bool {
    let Some(obj) = value.as_object() else {
        return value.is_array();
    };
    let key = match mode {
        AnalysisMode::PrimaryCentric => ["pages", "primary_pages"],
        AnalysisMode::PartnerCentric => ["related", "related_pages"],
    };
    key.iter().any(|k| obj.contains_key(*k))
}

/// Wrap a bare records array into the top-level sheet shape.
fn coerce_sheet(value: Value, mode: AnalysisMode) -> Value {
    if value.is_array() {
        let key = match mode {
            AnalysisMode::PrimaryCentric => "pages",
            AnalysisMode::PartnerCentric => "related",
        };
        serde_json::json!({ key: value })
    } else {
        value
    }
}

/// Parse and sanitize one raw response.
///
/// Full and partial successes both return records; a response that yields
/// zero salvageable records is an error, which the caller downgrades to an
/// empty chunk contribution.
pub fn parse(
    raw: &str,
    mode: AnalysisMode,
    bounds: &PageBounds,
    grid: &ScoreGrid,
    fallback_doc: Option<&str>,
) -> Result<Parsed, ParseError> {
    let stripped = repair::strip_wrappers(raw);

    // Stage 1: the unwrapped text decodes as-is.
    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        if looks_like_sheet(&value, mode) {
            let value = coerce_sheet(value, mode);
            return Ok(Parsed {
                records: sanitize::sanitize_records(&value, mode, bounds, grid, fallback_doc),
                is_partial: false,
            });
        }
    }

    // Stage 2: decode after corruption cleanup.
    let normalized = repair::normalize(stripped);
    if let Ok(value) = serde_json::from_str::<Value>(&normalized) {
        if looks_like_sheet(&value, mode) {
            let value = coerce_sheet(value, mode);
            tracing::debug!("Response decoded after normalization");
            return Ok(Parsed {
                records: sanitize::sanitize_records(&value, mode, bounds, grid, fallback_doc),
                is_partial: false,
            });
        }
    }

    // Stage 3: decode the largest balanced brace-delimited region.
    if let Some(region) = repair::largest_balanced_region(&normalized) {
        if let Ok(value) = serde_json::from_str::<Value>(region) {
            if looks_like_sheet(&value, mode) {
                tracing::debug!(
                    "Response decoded from balanced region ({} of {} chars)",
                    region.len(),
                    normalized.len()
                );
                return Ok(Parsed {
                    records: sanitize::sanitize_records(
                        &value, mode, bounds, grid, fallback_doc,
                    ),
                    is_partial: false,
                });
            }
        }
    }

    // Stage 4: per-record salvage.
    let salvaged = match mode {
        AnalysisMode::PrimaryCentric => {
            let candidates = partial::recover_primary_pages(&normalized);
            (!candidates.is_empty()).then(|| serde_json::json!({ "pages": candidates }))
        }
        AnalysisMode::PartnerCentric => partial::close_progressively(&normalized, "related"),
    };
    if let Some(value) = salvaged {
        let records = sanitize::sanitize_records(&value, mode, bounds, grid, fallback_doc);
        if !records.is_empty() {
            tracing::info!(
                "Partial recovery salvaged {} records from a malformed response",
                records.record_count()
            );
            return Ok(Parsed {
                records,
                is_partial: true,
            });
        }
    }

    Err(ParseError::Unrecoverable {
        response_len: raw.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> PageBounds {
        PageBounds {
            primary_pages: 50,
            chunk_pages: 40,
        }
    }

    fn grid() -> ScoreGrid {
        ScoreGrid::default()
    }

    fn page_json(page: u32, label: &str) -> String {
        format!(
            r#"{{"primary_page": {page}, "findings": [{{"label": "{label}", "excerpt": "what is shown in figure {page}", "summary": "same derivation as the partner", "connections": [{{"doc": "b.pdf", "page": 2, "reason": "same figure", "score": 80}}]}}]}}"#
        )
    }

    #[test]
    fn well_formed_input_is_complete() {
        let raw = format!(r#"{{"pages": [{}, {}]}}"#, page_json(1, "Q1"), page_json(2, "Q2"));
        let parsed = parse(&raw, AnalysisMode::PrimaryCentric, &bounds(), &grid(), None).unwrap();
        assert!(!parsed.is_partial);
        assert_eq!(parsed.records.record_count(), 2);
    }

    #[test]
    fn fenced_response_decodes_without_partial() {
        let raw = format!("```json\n{{\"pages\": [{}]}}\n```", page_json(3, "Q3"));
        let parsed = parse(&raw, AnalysisMode::PrimaryCentric, &bounds(), &grid(), None).unwrap();
        assert!(!parsed.is_partial);
        assert_eq!(parsed.records.record_count(), 1);
    }

    #[test]
    fn trailing_commas_are_repaired() {
        let raw = format!(r#"{{"pages": [{},]}}"#, page_json(1, "Q1"));
        let parsed = parse(&raw, AnalysisMode::PrimaryCentric, &bounds(), &grid(), None).unwrap();
        assert!(!parsed.is_partial);
        assert_eq!(parsed.records.record_count(), 1);
    }

    #[test]
    fn truncated_third_record_recovers_exactly_two() {
        let raw = format!(
            r#"{{"pages": [{}, {}, {{"primary_page": 3, "findings": [{{"label": "Q3", "exce"#,
            page_json(1, "Q1"),
            page_json(2, "Q2")
        );
        let parsed = parse(&raw, AnalysisMode::PrimaryCentric, &bounds(), &grid(), None).unwrap();
        assert!(parsed.is_partial);
        assert_eq!(parsed.records.record_count(), 2);
    }

    #[test]
    fn truncated_partner_response_recovers_leading_records() {
        let raw = r#"{"related": [
            {"doc": "b.pdf", "page": 4, "reason": "same topic", "score": 80},
            {"doc": "b.pdf", "page": 9, "reason": "shared fig", "score": 110},
            {"doc": "b.pdf", "page": 11, "reason": "trunc"#;
        let parsed = parse(raw, AnalysisMode::PartnerCentric, &bounds(), &grid(), None).unwrap();
        assert!(parsed.is_partial);
        assert_eq!(parsed.records.record_count(), 2);
    }

    #[test]
    fn hopeless_text_is_an_error_not_a_panic() {
        let err = parse(
            "the model apologizes and returns prose",
            AnalysisMode::PrimaryCentric,
            &bounds(),
            &grid(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Unrecoverable { .. }));
    }

    #[test]
    fn empty_record_list_is_ok_but_flagged_suspicious() {
        let parsed = parse(
            r#"{"pages": []}"#,
            AnalysisMode::PrimaryCentric,
            &bounds(),
            &grid(),
            None,
        )
        .unwrap();
        assert!(!parsed.is_partial);
        assert!(parsed.records.is_empty());
        assert!(is_suspicious(&parsed.records));
    }

    #[test]
    fn bare_array_is_coerced_into_a_sheet() {
        let raw = format!("[{}]", page_json(5, "Q5"));
        let parsed = parse(&raw, AnalysisMode::PrimaryCentric, &bounds(), &grid(), None).unwrap();
        assert_eq!(parsed.records.record_count(), 1);
    }
}
