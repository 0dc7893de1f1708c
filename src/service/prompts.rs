//! Built-in prompt templates for the two analysis modes.
//!
//! Placeholders: `{primary}` and `{partner}` are document display names,
//! `{start_page}` and `{end_page}` are the partner chunk's page range in
//! its own coordinate space.

use crate::models::{AnalysisMode, ChunkDescriptor};

/// Prompt for primary-centric analysis: walk the primary document page by
/// page and connect each notable item to pages of the partner excerpt.
pub const PRIMARY_CENTRIC_PROMPT: &str = r#"You are comparing two PDF documents. The first is the primary document "{primary}". The second is an excerpt of the partner document "{partner}" covering its pages {start_page}-{end_page}; page 1 of the excerpt is page {start_page} of the partner document, but number partner pages starting from 1 as they appear in the excerpt.

Go through the primary document in page order. For every notable item (a question, figure, claim, or section) that has related material in the partner excerpt, report it.

Score each connection on a 5-step scale from 5 (barely related) to 100 (directly related). Use the special score 110 only when the two pages share an identical figure or table.

Respond with ONLY JSON in this exact shape:
{
  "pages": [
    {
      "page": <primary page number>,
      "findings": [
        {
          "label": "<short identifier of the item>",
          "excerpt": "<the item's text or a description of it>",
          "summary": "<why it matters>",
          "connections": [
            {"doc": "{partner}", "page": <excerpt page number>, "reason": "<relationship>", "score": <5-100 or 110>}
          ]
        }
      ]
    }
  ]
}
Skip primary pages with no findings. No prose outside the JSON."#;

/// Prompt for partner-centric analysis: list partner excerpt pages relevant
/// to the primary document.
pub const PARTNER_CENTRIC_PROMPT: &str = r#"You are comparing two PDF documents. The first is the primary document "{primary}". The second is an excerpt of the partner document "{partner}" covering its pages {start_page}-{end_page}; number partner pages starting from 1 as they appear in the excerpt.

List every excerpt page that is relevant to the primary document, scoring relevance on a 5-step scale from 5 (barely related) to 100 (directly related). Use the special score 110 only for an identical shared figure or table.

Respond with ONLY JSON in this exact shape:
{
  "related": [
    {"doc": "{partner}", "page": <excerpt page number>, "reason": "<relationship>", "score": <5-100 or 110>}
  ]
}
No prose outside the JSON."#;

/// Fill the template for one chunk task.
pub fn build_prompt(
    mode: AnalysisMode,
    template: Option<&str>,
    primary_name: &str,
    chunk: &ChunkDescriptor,
) -> String {
    let template = template.unwrap_or(match mode {
        AnalysisMode::PrimaryCentric => PRIMARY_CENTRIC_PROMPT,
        AnalysisMode::PartnerCentric => PARTNER_CENTRIC_PROMPT,
    });
    template
        .replace("{primary}", primary_name)
        .replace("{partner}", &chunk.doc_id)
        .replace("{start_page}", &chunk.start_page.to_string())
        .replace("{end_page}", &chunk.end_page.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_filled() {
        let chunk = ChunkDescriptor {
            doc_id: "partner.pdf".into(),
            chunk_index: 1,
            start_page: 41,
            end_page: 80,
        };
        let prompt = build_prompt(AnalysisMode::PrimaryCentric, None, "primary.pdf", &chunk);
        assert!(prompt.contains("\"primary.pdf\""));
        assert!(prompt.contains("pages 41-80"));
        assert!(!prompt.contains("{partner}"));
    }

    #[test]
    fn custom_template_overrides_builtin() {
        let chunk = ChunkDescriptor {
            doc_id: "b.pdf".into(),
            chunk_index: 0,
            start_page: 1,
            end_page: 10,
        };
        let prompt = build_prompt(
            AnalysisMode::PartnerCentric,
            Some("compare {primary} to {partner}"),
            "a.pdf",
            &chunk,
        );
        assert_eq!(prompt, "compare a.pdf to b.pdf");
    }
}
