use anyhow::Result;

use crate::config::GroundingThresholds;
use crate::enforcement::placeholder::{PlaceholderScanner, create_placeholder, placeholder_id};
use crate::enforcement::similarity::{FastJaccardScorer, TextSimilarityScorer};
use crate::model::{
    EnforcedParagraph, ParagraphStatus, PlaceholderType, RetrievedChunk, SupportingChunk,
};
use crate::text::{normalize_whitespace, significant_words, split_paragraphs, truncate_chars};

/// Paragraphs with fewer significant words than this once tokens are removed count as
/// placeholder-only.
const MIN_RESIDUAL_WORDS: usize = 3;

pub struct ParagraphGrounder {
    thresholds: GroundingThresholds,
    scanner: PlaceholderScanner,
    scorer: Box<dyn TextSimilarityScorer + Send + Sync>,
}

impl ParagraphGrounder {
    pub fn new(thresholds: GroundingThresholds) -> Result<Self> {
        Ok(Self {
            thresholds,
            scanner: PlaceholderScanner::new()?,
            scorer: Box::new(FastJaccardScorer),
        })
    }

    pub fn scanner(&self) -> &PlaceholderScanner {
        &self.scanner
    }

    pub fn enforce_paragraph_grounding(
        &self,
        text: &str,
        chunks: &[RetrievedChunk],
    ) -> Vec<EnforcedParagraph> {
        split_paragraphs(text)
            .into_iter()
            .enumerate()
            .map(|(index, paragraph)| self.ground_paragraph(index, paragraph, chunks))
            .collect()
    }

    fn ground_paragraph(
        &self,
        index: usize,
        paragraph: String,
        chunks: &[RetrievedChunk],
    ) -> EnforcedParagraph {
        let residual = self.scanner.replace_all(&paragraph, " ");
        let has_placeholder = residual != paragraph;
        if has_placeholder && significant_words(&residual).len() < MIN_RESIDUAL_WORDS {
            return EnforcedParagraph {
                index,
                enforced_text: paragraph.clone(),
                original_text: paragraph,
                status: ParagraphStatus::Placeholder,
                best_similarity: 0.0,
                supporting_chunks: Vec::new(),
            };
        }

        let mut scored = chunks
            .iter()
            .map(|chunk| (self.scorer.score(&residual, &chunk.content), chunk))
            .collect::<Vec<(f64, &RetrievedChunk)>>();
        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        let best_similarity = scored.first().map(|(score, _)| *score).unwrap_or(0.0);
        let supporting_chunks = scored
            .iter()
            .filter(|(score, _)| *score > self.thresholds.supporting_min_similarity)
            .take(self.thresholds.max_supporting_chunks)
            .map(|(score, chunk)| SupportingChunk {
                document_id: chunk.document_id.clone(),
                filename: chunk.filename.clone(),
                similarity: *score,
            })
            .collect::<Vec<SupportingChunk>>();

        let status = if best_similarity >= self.thresholds.grounded_threshold {
            ParagraphStatus::Grounded
        } else if best_similarity >= self.thresholds.partial_threshold {
            ParagraphStatus::Partial
        } else {
            ParagraphStatus::Ungrounded
        };

        let enforced_text = if status == ParagraphStatus::Ungrounded {
            self.ungrounded_placeholder(index, &paragraph)
        } else {
            paragraph.clone()
        };

        EnforcedParagraph {
            index,
            original_text: paragraph,
            enforced_text,
            status,
            best_similarity,
            supporting_chunks,
        }
    }

    /// MISSING_DATA token keeping the start of the original for reviewers.
    fn ungrounded_placeholder(&self, index: usize, paragraph: &str) -> String {
        let preview = truncate_chars(
            &normalize_whitespace(&self.scanner.replace_all(paragraph, "...")),
            self.thresholds.preview_chars,
        );
        let description =
            format!("Unsupported content needs source material. Original: {preview}");
        let id = placeholder_id(PlaceholderType::MissingData, &description, index);
        create_placeholder(PlaceholderType::MissingData, &description, &id)
    }
}

pub fn assemble_paragraphs(paragraphs: &[EnforcedParagraph]) -> String {
    paragraphs
        .iter()
        .map(|paragraph| paragraph.enforced_text.as_str())
        .collect::<Vec<&str>>()
        .join("\n\n")
}
