use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collaborators::{Retriever, retrieve_or_empty};
use crate::config::CitationThresholds;
use crate::enforcement::placeholder::PlaceholderScanner;
use crate::enforcement::similarity::{PhraseOverlapScorer, TextSimilarityScorer};
use crate::model::{
    AttributedParagraph, AttributionStatus, ChunkAttribution, RetrievedChunk, SectionCoverage,
    SectionRecord, SourceContribution,
};
use crate::store::ProposalStore;
use crate::text::{HtmlStripper, count_words, normalize_whitespace, split_paragraphs, truncate_chars};
use crate::util::now_utc_string;

pub const ATTRIBUTION_FAILED: &str = "ATTRIBUTION_FAILED";
pub const CONTAINS_PLACEHOLDER: &str = "CONTAINS_PLACEHOLDER";
const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationMapping {
    pub paragraphs: Vec<AttributedParagraph>,
    pub section_coverage: SectionCoverage,
}

/// Post-hoc attribution of stored section text to knowledge-base chunks.
pub struct CitationMapper<'a> {
    thresholds: CitationThresholds,
    scorer: PhraseOverlapScorer,
    scanner: PlaceholderScanner,
    html: HtmlStripper,
    retriever: &'a dyn Retriever,
    store: &'a dyn ProposalStore,
}

impl<'a> CitationMapper<'a> {
    pub fn new(
        thresholds: CitationThresholds,
        retriever: &'a dyn Retriever,
        store: &'a dyn ProposalStore,
    ) -> Result<Self> {
        Ok(Self {
            scorer: PhraseOverlapScorer {
                jaccard_weight: thresholds.jaccard_weight,
                phrase_weight: thresholds.phrase_weight,
            },
            thresholds,
            scanner: PlaceholderScanner::new()?,
            html: HtmlStripper::new()?,
            retriever,
            store,
        })
    }

    pub fn store(&self) -> &'a dyn ProposalStore {
        self.store
    }

    pub fn html(&self) -> &HtmlStripper {
        &self.html
    }

    /// Attribution of `generated_text` against `chunks`. No retrieval, no persistence.
    pub fn map_citations(
        &self,
        section: &SectionRecord,
        generated_text: &str,
        chunks: &[RetrievedChunk],
    ) -> CitationMapping {
        let paragraphs = split_paragraphs(&self.html.strip(generated_text))
            .into_iter()
            .filter(|paragraph| count_words(paragraph) >= self.thresholds.min_paragraph_words)
            .enumerate()
            .map(|(index, text)| self.attribute_paragraph(section, index, text, chunks))
            .collect::<Vec<AttributedParagraph>>();

        let section_coverage = section_coverage(section, &paragraphs);
        CitationMapping {
            paragraphs,
            section_coverage,
        }
    }

    /// Maps the section and replaces its stored attribution. With no `chunks`, retrieves by the
    /// section's name and description first.
    pub fn map_and_persist(
        &self,
        section: &SectionRecord,
        generated_text: &str,
        chunks: &[RetrievedChunk],
    ) -> Result<CitationMapping> {
        let retrieved;
        let chunks = if chunks.is_empty() {
            let proposal = self.store.load_proposal(&section.proposal_id)?;
            let query = format!("{} {}", section.name, section.description);
            retrieved = retrieve_or_empty(
                self.retriever,
                query.trim(),
                &proposal.organization_id,
                self.thresholds.top_k,
            );
            debug!(
                section_id = %section.section_id,
                retrieved = retrieved.len(),
                "citation mapper retrieved its own chunks"
            );
            retrieved.as_slice()
        } else {
            chunks
        };

        let mapping = self.map_citations(section, generated_text, chunks);
        self.store.replace_section_attribution(
            &section.section_id,
            &mapping.paragraphs,
            &mapping.section_coverage,
        )?;

        info!(
            section_id = %section.section_id,
            paragraphs = mapping.section_coverage.total_paragraphs,
            coverage = mapping.section_coverage.coverage_score,
            "section attribution stored"
        );
        Ok(mapping)
    }

    fn attribute_paragraph(
        &self,
        section: &SectionRecord,
        index: usize,
        text: String,
        chunks: &[RetrievedChunk],
    ) -> AttributedParagraph {
        let paragraph_id = format!("{}-p{index}", section.section_id);
        let mut flags = Vec::new();

        if chunks.is_empty() {
            flags.push(ATTRIBUTION_FAILED.to_string());
            return AttributedParagraph {
                paragraph_id,
                section_id: section.section_id.clone(),
                proposal_id: section.proposal_id.clone(),
                index,
                text,
                status: AttributionStatus::Failed,
                best_similarity: 0.0,
                sources: Vec::new(),
                flags,
            };
        }

        let scored_text = self.scanner.replace_all(&text, " ");
        if scored_text != text {
            flags.push(CONTAINS_PLACEHOLDER.to_string());
        }

        let mut scored = chunks
            .iter()
            .map(|chunk| (self.scorer.score(&scored_text, &chunk.content), chunk))
            .collect::<Vec<(f64, &RetrievedChunk)>>();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        let best_similarity = scored.first().map(|(score, _)| *score).unwrap_or(0.0);
        let status = if best_similarity >= self.thresholds.grounded_similarity {
            AttributionStatus::Grounded
        } else if best_similarity >= self.thresholds.partial_similarity {
            AttributionStatus::Partial
        } else {
            AttributionStatus::Ungrounded
        };

        let sources = scored
            .iter()
            .filter(|(score, _)| *score > 0.0)
            .take(self.thresholds.max_sources)
            .map(|(score, chunk)| ChunkAttribution {
                document_id: chunk.document_id.clone(),
                filename: chunk.filename.clone(),
                similarity: *score,
                excerpt: truncate_chars(&normalize_whitespace(&chunk.content), EXCERPT_CHARS),
            })
            .collect::<Vec<ChunkAttribution>>();

        AttributedParagraph {
            paragraph_id,
            section_id: section.section_id.clone(),
            proposal_id: section.proposal_id.clone(),
            index,
            text,
            status,
            best_similarity,
            sources,
            flags,
        }
    }
}

/// `round(100 * (grounded + 0.5 * partial) / total)`, 0 for an empty section.
pub fn coverage_score(grounded: usize, partial: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let weighted = grounded as f64 + 0.5 * partial as f64;
    (100.0 * weighted / total as f64).round().clamp(0.0, 100.0) as u32
}

fn section_coverage(section: &SectionRecord, paragraphs: &[AttributedParagraph]) -> SectionCoverage {
    let count = |status: AttributionStatus| {
        paragraphs
            .iter()
            .filter(|paragraph| paragraph.status == status)
            .count()
    };
    let grounded = count(AttributionStatus::Grounded);
    let partial = count(AttributionStatus::Partial);

    // document_id -> (filename, paragraphs it supports)
    let mut contributions = BTreeMap::<String, (String, usize)>::new();
    for paragraph in paragraphs.iter().filter(|paragraph| {
        matches!(
            paragraph.status,
            AttributionStatus::Grounded | AttributionStatus::Partial
        )
    }) {
        let mut seen = Vec::<&str>::new();
        for source in &paragraph.sources {
            if seen.contains(&source.document_id.as_str()) {
                continue;
            }
            seen.push(&source.document_id);
            let entry = contributions
                .entry(source.document_id.clone())
                .or_insert_with(|| (source.filename.clone(), 0));
            entry.1 += 1;
        }
    }

    let mut source_documents = contributions
        .into_iter()
        .map(|(document_id, (filename, paragraph_count))| SourceContribution {
            document_id,
            filename,
            paragraph_count,
        })
        .collect::<Vec<SourceContribution>>();
    source_documents.sort_by(|left, right| {
        right
            .paragraph_count
            .cmp(&left.paragraph_count)
            .then_with(|| left.document_id.cmp(&right.document_id))
    });

    SectionCoverage {
        section_id: section.section_id.clone(),
        proposal_id: section.proposal_id.clone(),
        section_name: section.name.clone(),
        coverage_score: coverage_score(grounded, partial, paragraphs.len()),
        total_paragraphs: paragraphs.len(),
        grounded,
        partial,
        ungrounded: count(AttributionStatus::Ungrounded),
        failed: count(AttributionStatus::Failed),
        source_documents,
        computed_at: now_utc_string(),
    }
}
