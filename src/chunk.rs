//! Chunk planning: split a document into bounded, non-overlapping page ranges.

use crate::error::AnalysisError;
use crate::models::ChunkDescriptor;

/// Split a document of `page_count` pages into consecutive chunks of at most
/// `max_pages_per_chunk` pages.
///
/// A document that fits within the limit yields a single chunk spanning the
/// whole document. The chunks cover pages `1..=page_count` exactly, with no
/// gaps or overlaps; the last chunk may be shorter.
pub fn plan(
    doc_id: &str,
    page_count: u32,
    max_pages_per_chunk: u32,
) -> Result<Vec<ChunkDescriptor>, AnalysisError> {
    if page_count == 0 {
        return Err(AnalysisError::invalid_document(
            doc_id,
            "page count could not be determined",
        ));
    }
    let chunk_size = max_pages_per_chunk.max(1);

    if page_count <= chunk_size {
        return Ok(vec![ChunkDescriptor {
            doc_id: doc_id.to_string(),
            chunk_index: 0,
            start_page: 1,
            end_page: page_count,
        }]);
    }

    let mut chunks = Vec::with_capacity(page_count.div_ceil(chunk_size) as usize);
    let mut start = 1u32;
    while start <= page_count {
        let end = (start + chunk_size - 1).min(page_count);
        chunks.push(ChunkDescriptor {
            doc_id: doc_id.to_string(),
            chunk_index: chunks.len(),
            start_page: start,
            end_page: end,
        });
        start = end + 1;
    }

    tracing::debug!(
        "Planned {} chunks of <= {} pages for {} ({} pages)",
        chunks.len(),
        chunk_size,
        doc_id,
        page_count
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(chunks: &[ChunkDescriptor], page_count: u32) {
        assert_eq!(chunks[0].start_page, 1);
        assert_eq!(chunks.last().unwrap().end_page, page_count);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_page, pair[0].end_page + 1);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert!(c.start_page <= c.end_page);
        }
    }

    #[test]
    fn single_chunk_when_document_fits() {
        let chunks = plan("a.pdf", 30, 40).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_page, 1);
        assert_eq!(chunks[0].end_page, 30);
    }

    #[test]
    fn exact_multiple_splits_evenly() {
        let chunks = plan("a.pdf", 80, 40).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_exact_cover(&chunks, 80);
        assert_eq!(chunks[1].start_page, 41);
    }

    #[test]
    fn last_chunk_may_be_shorter() {
        let chunks = plan("a.pdf", 95, 40).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_exact_cover(&chunks, 95);
        assert_eq!(chunks[2].page_span(), 15);
    }

    #[test]
    fn chunk_count_matches_ceiling_division() {
        for (pages, size) in [(1u32, 1u32), (7, 3), (100, 40), (41, 40), (200, 7)] {
            let chunks = plan("a.pdf", pages, size).unwrap();
            assert_eq!(chunks.len() as u32, pages.div_ceil(size));
            assert_exact_cover(&chunks, pages);
        }
    }

    #[test]
    fn zero_pages_is_invalid() {
        let err = plan("broken.pdf", 0, 40).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::InvalidDocument { .. }
        ));
    }

    #[test]
    fn page_offset_maps_back_to_document_space() {
        let chunks = plan("a.pdf", 95, 40).unwrap();
        assert_eq!(chunks[0].page_offset(), 0);
        assert_eq!(chunks[1].page_offset(), 40);
        assert_eq!(chunks[2].page_offset(), 80);
    }
}
