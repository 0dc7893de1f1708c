//! Merging per-chunk outcomes into one ordered, deduplicated result.
//!
//! Chunk-local partner page references are mapped back into the owning
//! document's coordinate space, references that land outside the document
//! are dropped, records are grouped by the mode's composite key, and each
//! group's connection list is deduplicated and score-filtered.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{
    AnalysisMode, ChunkRecords, Connection, Finding, MergedPage, MergedResult, TaskOutcome,
};

/// Inputs the merger needs beyond the outcomes themselves.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub mode: AnalysisMode,
    pub primary_doc: String,
    /// Page counts per partner document, for bounds checks after offsetting.
    pub partner_page_counts: HashMap<String, u32>,
    pub min_score: u32,
    pub max_per_group: usize,
}

/// Remove connections below `min_score`, keep the top `max_per_group` by
/// score descending with ties in original order.
///
/// Idempotent: filtering an already-filtered list changes nothing.
pub fn filter_by_score(
    connections: Vec<Connection>,
    min_score: u32,
    max_per_group: usize,
) -> Vec<Connection> {
    let mut kept: Vec<Connection> = connections
        .into_iter()
        .filter(|c| c.score >= min_score)
        .collect();
    kept.sort_by(|a, b| b.score.cmp(&a.score));
    kept.truncate(max_per_group);
    kept
}

fn offset_connections(
    connections: &[Connection],
    offset: u32,
    page_counts: &HashMap<String, u32>,
) -> Vec<Connection> {
    connections
        .iter()
        .filter_map(|c| {
            let page = c.page + offset;
            let limit = page_counts.get(&c.doc).copied().unwrap_or(u32::MAX);
            if page < 1 || page > limit {
                tracing::debug!(
                    "Dropping reference to {} page {} beyond {} pages",
                    c.doc,
                    page,
                    limit
                );
                return None;
            }
            Some(Connection {
                page,
                ..c.clone()
            })
        })
        .collect()
}

fn dedup_connections(connections: Vec<Connection>) -> Vec<Connection> {
    let mut seen = HashSet::new();
    connections
        .into_iter()
        .filter(|c| seen.insert((c.doc.to_lowercase(), c.page)))
        .collect()
}

fn merge_primary(outcomes: &[TaskOutcome], ctx: &MergeContext) -> Vec<MergedPage> {
    // page -> label -> finding, keeping both levels ordered.
    let mut grouped: BTreeMap<u32, BTreeMap<String, Finding>> = BTreeMap::new();

    for outcome in outcomes {
        let Some(ChunkRecords::PrimaryCentric { pages }) = &outcome.records else {
            continue;
        };
        let offset = outcome.chunk.page_offset();
        for page in pages {
            let findings = grouped.entry(page.page).or_default();
            for finding in &page.findings {
                let connections =
                    offset_connections(&finding.connections, offset, &ctx.partner_page_counts);
                match findings.get_mut(&finding.label) {
                    Some(existing) => existing.connections.extend(connections),
                    None => {
                        let mut merged = finding.clone();
                        merged.connections = connections;
                        findings.insert(finding.label.clone(), merged);
                    }
                }
            }
        }
    }

    grouped
        .into_iter()
        .map(|(page, findings)| MergedPage {
            page,
            findings: findings
                .into_values()
                .map(|mut finding| {
                    finding.connections = filter_by_score(
                        dedup_connections(finding.connections),
                        ctx.min_score,
                        ctx.max_per_group,
                    );
                    finding
                })
                .collect(),
        })
        .collect()
}

fn merge_partner(outcomes: &[TaskOutcome], ctx: &MergeContext) -> Vec<Connection> {
    let mut collected = Vec::new();
    for outcome in outcomes {
        let Some(ChunkRecords::PartnerCentric { related }) = &outcome.records else {
            continue;
        };
        collected.extend(offset_connections(
            related,
            outcome.chunk.page_offset(),
            &ctx.partner_page_counts,
        ));
    }
    let deduped = dedup_connections(collected);

    // Score-filter per partner document, then restore (doc, page) order.
    let mut by_doc: BTreeMap<String, Vec<Connection>> = BTreeMap::new();
    for connection in deduped {
        by_doc.entry(connection.doc.clone()).or_default().push(connection);
    }
    let mut merged = Vec::new();
    for (_, group) in by_doc {
        let mut filtered = filter_by_score(group, ctx.min_score, ctx.max_per_group);
        filtered.sort_by_key(|c| c.page);
        merged.extend(filtered);
    }
    merged
}

/// Combine outcomes, in task order, into the final result.
pub fn merge_chunk_results(outcomes: &[TaskOutcome], ctx: &MergeContext) -> MergedResult {
    let failed_chunks = outcomes.iter().filter(|o| !o.succeeded()).count();
    let partial_chunks = outcomes.iter().filter(|o| o.is_partial).count();

    let (pages, related) = match ctx.mode {
        AnalysisMode::PrimaryCentric => (merge_primary(outcomes, ctx), Vec::new()),
        AnalysisMode::PartnerCentric => (Vec::new(), merge_partner(outcomes, ctx)),
    };

    if failed_chunks > 0 {
        tracing::warn!(
            "Merged {} chunks with {} failures ({} partial)",
            outcomes.len(),
            failed_chunks,
            partial_chunks
        );
    }

    MergedResult {
        mode: ctx.mode,
        primary_doc: ctx.primary_doc.clone(),
        pages,
        related,
        failed_chunks,
        partial_chunks,
        generated_at: chrono::Utc::now(),
    }
}
