use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{EnforcementConfig, RetrievalThresholds};
use crate::enforcement::claims::{ClaimExtractor, LlmClaimEnhancer};
use crate::enforcement::evidence::EvidenceMatcher;
use crate::enforcement::grounding::{ParagraphGrounder, assemble_paragraphs};
use crate::enforcement::placeholder::{create_placeholder, placeholder_id};
use crate::model::{
    ClaimType, EnforcedParagraph, ExtractedClaim, GenerationMetadata, ParagraphStatus,
    Placeholder, PlaceholderType, ReplacedClaim, RetrievedChunk, RiskLevel,
};
use crate::util::now_utc_string;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSufficiency {
    pub retrieved: usize,
    pub relevant: usize,
    pub required: usize,
    pub min_relevance_score: f64,
    pub sufficient: bool,
}

/// Whether enough chunks clear the relevance bar for generation to proceed at all.
pub fn check_retrieval_sufficiency(
    chunks: &[RetrievedChunk],
    thresholds: &RetrievalThresholds,
) -> RetrievalSufficiency {
    let relevant = chunks
        .iter()
        .filter(|chunk| chunk.score >= thresholds.min_relevance_score)
        .count();
    RetrievalSufficiency {
        retrieved: chunks.len(),
        relevant,
        required: thresholds.min_relevant_chunks,
        min_relevance_score: thresholds.min_relevance_score,
        sufficient: relevant >= thresholds.min_relevant_chunks && relevant > 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementOutcome {
    pub enforced_text: String,
    pub metadata: GenerationMetadata,
    pub paragraphs: Vec<EnforcedParagraph>,
    pub replaced_claims: Vec<ReplacedClaim>,
    pub placeholders: Vec<Placeholder>,
}

/// Generation-time orchestrator: claim replacement, then paragraph grounding.
pub struct ContentEnforcer {
    retrieval: RetrievalThresholds,
    extractor: ClaimExtractor,
    matcher: EvidenceMatcher,
    grounder: ParagraphGrounder,
}

impl ContentEnforcer {
    pub fn new(config: &EnforcementConfig) -> Result<Self> {
        Ok(Self {
            retrieval: config.retrieval.clone(),
            extractor: ClaimExtractor::new()?,
            matcher: EvidenceMatcher::new(config.evidence.clone())?,
            grounder: ParagraphGrounder::new(config.grounding.clone())?,
        })
    }

    pub fn extractor(&self) -> &ClaimExtractor {
        &self.extractor
    }

    pub fn matcher(&self) -> &EvidenceMatcher {
        &self.matcher
    }

    pub fn grounder(&self) -> &ParagraphGrounder {
        &self.grounder
    }

    pub fn retrieval_thresholds(&self) -> &RetrievalThresholds {
        &self.retrieval
    }

    pub fn enforce_generation(
        &self,
        raw_text: &str,
        chunks: &[RetrievedChunk],
        enhancer: Option<&LlmClaimEnhancer<'_>>,
    ) -> EnforcementOutcome {
        let claims = self.extractor.extract_with(raw_text, enhancer);
        let (claim_enforced, replaced_claims) =
            self.enforce_claim_verification(raw_text, &claims, chunks);

        let paragraphs = self
            .grounder
            .enforce_paragraph_grounding(&claim_enforced, chunks);
        let enforced_text = assemble_paragraphs(&paragraphs);

        let suggested_sources = top_filenames(chunks, 3);
        let placeholders = self
            .grounder
            .scanner()
            .detect(&enforced_text)
            .into_iter()
            .map(|mut placeholder| {
                placeholder.suggested_sources = suggested_sources.clone();
                placeholder
            })
            .collect::<Vec<Placeholder>>();

        let sufficiency = check_retrieval_sufficiency(chunks, &self.retrieval);
        let paragraphs_placeholdered = paragraphs
            .iter()
            .filter(|paragraph| paragraph.status == ParagraphStatus::Ungrounded)
            .count();
        let (similarity_min, similarity_max, similarity_avg) = score_stats(chunks);

        let metadata = GenerationMetadata {
            proposal_id: None,
            section_id: None,
            retrieved_chunk_count: chunks.len(),
            relevant_chunk_count: sufficiency.relevant,
            used_generic_knowledge: !sufficiency.sufficient,
            similarity_min,
            similarity_max,
            similarity_avg,
            claims_replaced: replaced_claims.len(),
            paragraphs_placeholdered,
            policy_override: false,
            refused: false,
            created_at: now_utc_string(),
        };

        debug!(
            claims = claims.len(),
            claims_replaced = metadata.claims_replaced,
            paragraphs = paragraphs.len(),
            paragraphs_placeholdered,
            "generation enforcement complete"
        );

        EnforcementOutcome {
            enforced_text,
            metadata,
            paragraphs,
            replaced_claims,
            placeholders,
        }
    }

    /// Replaces every unsupported claim with a placeholder. `claims` must be extracted from `text`
    /// and ordered by descending start offset.
    pub fn enforce_claim_verification(
        &self,
        text: &str,
        claims: &[ExtractedClaim],
        chunks: &[RetrievedChunk],
    ) -> (String, Vec<ReplacedClaim>) {
        let protected = self.grounder.scanner().spans(text);
        let mut enforced = text.to_string();
        let mut replaced = Vec::new();
        let mut replaced_floor = usize::MAX;

        for claim in claims {
            let span = claim.position;
            if span.end > replaced_floor || span.end > text.len() {
                continue;
            }
            if protected.iter().any(|token| token.overlaps(&span)) {
                continue;
            }
            if self.matcher.is_claim_supported(claim, chunks) {
                continue;
            }

            let placeholder_type = placeholder_type_for(claim);
            let description = format!(
                "Supply a sourced {} for this statement",
                claim_label(claim.claim_type)
            );
            let id = placeholder_id(placeholder_type, &description, span.start);
            enforced.replace_range(
                span.start..span.end,
                &create_placeholder(placeholder_type, &description, &id),
            );
            replaced_floor = span.start;

            replaced.push(ReplacedClaim {
                claim: claim.clone(),
                placeholder_id: id,
                placeholder_type,
            });
        }

        (enforced, replaced)
    }
}

fn placeholder_type_for(claim: &ExtractedClaim) -> PlaceholderType {
    if claim.claim_type.is_person() {
        return PlaceholderType::UserInputRequired;
    }
    match claim.risk_level {
        RiskLevel::High => PlaceholderType::MissingData,
        RiskLevel::Medium | RiskLevel::Low => PlaceholderType::VerificationNeeded,
    }
}

fn claim_label(claim_type: ClaimType) -> &'static str {
    match claim_type {
        ClaimType::Number => "number",
        ClaimType::Percentage => "percentage",
        ClaimType::Currency => "dollar amount",
        ClaimType::Date => "date",
        ClaimType::NamedOrg => "organization name",
        ClaimType::NamedPerson => "person name",
        ClaimType::StaffName => "staff name",
        ClaimType::Outcome => "outcome figure",
        ClaimType::Location => "location",
    }
}

fn score_stats(chunks: &[RetrievedChunk]) -> (f64, f64, f64) {
    if chunks.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let min = chunks
        .iter()
        .map(|chunk| chunk.score)
        .fold(f64::INFINITY, f64::min);
    let max = chunks
        .iter()
        .map(|chunk| chunk.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let avg = chunks.iter().map(|chunk| chunk.score).sum::<f64>() / chunks.len() as f64;
    (min, max, avg)
}

fn top_filenames(chunks: &[RetrievedChunk], limit: usize) -> Vec<String> {
    let mut ranked = chunks.iter().collect::<Vec<&RetrievedChunk>>();
    ranked.sort_by(|left, right| right.score.total_cmp(&left.score));

    let mut names = Vec::new();
    for chunk in ranked {
        if names.len() == limit {
            break;
        }
        if !chunk.filename.is_empty() && !names.contains(&chunk.filename) {
            names.push(chunk.filename.clone());
        }
    }
    names
}
