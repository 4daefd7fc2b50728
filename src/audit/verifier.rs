use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collaborators::{Retriever, retrieve_or_empty};
use crate::config::{EnforcementConfig, VerificationThresholds};
use crate::enforcement::claims::ClaimExtractor;
use crate::enforcement::evidence::EvidenceMatcher;
use crate::enforcement::placeholder::PlaceholderScanner;
use crate::model::{
    AttributedParagraph, ClaimEvidence, ClaimStatus, ClaimType, EvidenceMatchKind,
    ExtractedClaim, RetrievedChunk, RiskLevel, VerifiedClaim,
};
use crate::store::ProposalStore;
use crate::text::{bounded_matches, normalize_whitespace, significant_words, truncate_chars, word_set};
use crate::util::short_digest;

const RETRIEVAL_WEIGHT: f64 = 0.5;
const EXACT_BOOST: f64 = 0.5;
const NUMERIC_BOOST: f64 = 0.3;
const NAME_BOOST: f64 = 0.4;
const EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimVerificationSummary {
    pub proposal_id: String,
    pub paragraphs_processed: usize,
    pub total_claims: usize,
    pub verified: usize,
    pub unverified: usize,
    pub conflicting: usize,
    pub outdated: usize,
    pub verification_rate: f64,
    pub high_risk_unverified: usize,
    pub medium_risk_unverified: usize,
}

impl ClaimVerificationSummary {
    pub fn from_claims(proposal_id: &str, paragraphs: usize, claims: &[VerifiedClaim]) -> Self {
        let count = |status: ClaimStatus| claims.iter().filter(|claim| claim.status == status).count();
        let unverified_at = |risk: RiskLevel| {
            claims
                .iter()
                .filter(|claim| claim.claim.risk_level == risk && claim.status != ClaimStatus::Verified)
                .count()
        };
        let verified = count(ClaimStatus::Verified);

        Self {
            proposal_id: proposal_id.to_string(),
            paragraphs_processed: paragraphs,
            total_claims: claims.len(),
            verified,
            unverified: count(ClaimStatus::Unverified),
            conflicting: count(ClaimStatus::Conflicting),
            outdated: count(ClaimStatus::Outdated),
            verification_rate: if claims.is_empty() {
                1.0
            } else {
                verified as f64 / claims.len() as f64
            },
            high_risk_unverified: unverified_at(RiskLevel::High),
            medium_risk_unverified: unverified_at(RiskLevel::Medium),
        }
    }
}

/// Proposal-wide claim audit with fresh retrieval per claim.
pub struct ClaimVerifier<'a> {
    thresholds: VerificationThresholds,
    extractor: ClaimExtractor,
    matcher: EvidenceMatcher,
    scanner: PlaceholderScanner,
    retriever: &'a dyn Retriever,
    store: &'a dyn ProposalStore,
}

impl<'a> ClaimVerifier<'a> {
    pub fn new(
        config: &EnforcementConfig,
        retriever: &'a dyn Retriever,
        store: &'a dyn ProposalStore,
    ) -> Result<Self> {
        Ok(Self {
            thresholds: config.verification.clone(),
            extractor: ClaimExtractor::new()?,
            matcher: EvidenceMatcher::new(config.evidence.clone())?,
            scanner: PlaceholderScanner::new()?,
            retriever,
            store,
        })
    }

    pub fn extract_and_verify_proposal(&self, proposal_id: &str) -> Result<ClaimVerificationSummary> {
        let proposal = self.store.load_proposal(proposal_id)?;
        let paragraphs = self.store.load_attributed_paragraphs(proposal_id)?;

        let current = paragraphs
            .iter()
            .map(|paragraph| paragraph.paragraph_id.as_str())
            .collect::<HashSet<&str>>();
        let stale = self
            .store
            .load_verified_claims(proposal_id)?
            .into_iter()
            .map(|claim| claim.paragraph_id)
            .filter(|paragraph_id| !current.contains(paragraph_id.as_str()))
            .collect::<BTreeSet<String>>();
        for paragraph_id in &stale {
            self.store.replace_paragraph_claims(paragraph_id, &[])?;
        }

        let mut all_claims = Vec::new();
        for paragraph in &paragraphs {
            let verified = self.verify_paragraph(paragraph, &proposal.organization_id);
            self.store
                .replace_paragraph_claims(&paragraph.paragraph_id, &verified)?;
            all_claims.extend(verified);
        }

        let summary = ClaimVerificationSummary::from_claims(proposal_id, paragraphs.len(), &all_claims);
        info!(
            proposal_id,
            claims = summary.total_claims,
            verified = summary.verified,
            high_risk_unverified = summary.high_risk_unverified,
            stale_paragraphs = stale.len(),
            "claim verification complete"
        );
        Ok(summary)
    }

    /// Claims of one stored paragraph, skipping anything inside placeholder tokens.
    pub fn verify_paragraph(
        &self,
        paragraph: &AttributedParagraph,
        organization_id: &str,
    ) -> Vec<VerifiedClaim> {
        let protected = self.scanner.spans(&paragraph.text);
        self.extractor
            .extract_claims(&paragraph.text)
            .into_iter()
            .filter(|claim| !protected.iter().any(|span| span.overlaps(&claim.position)))
            .map(|claim| {
                let query = normalize_whitespace(&format!("{} {}", claim.value, claim.context));
                let chunks = retrieve_or_empty(
                    self.retriever,
                    &query,
                    organization_id,
                    self.thresholds.top_k,
                );
                let evidence = self.score_evidence(&claim, &chunks);
                let (status, verification_score) = self.classify(&evidence);

                VerifiedClaim {
                    claim_id: format!(
                        "claim-{}",
                        short_digest(
                            &[
                                &paragraph.paragraph_id,
                                claim.claim_type.as_str(),
                                &claim.position.start.to_string(),
                                &claim.value
                            ],
                            16
                        )
                    ),
                    proposal_id: paragraph.proposal_id.clone(),
                    section_id: paragraph.section_id.clone(),
                    paragraph_id: paragraph.paragraph_id.clone(),
                    claim,
                    status,
                    evidence,
                    verification_score,
                }
            })
            .collect()
    }

    /// Confidence-ranked evidence above the floor, at most `max_evidence` items.
    pub fn score_evidence(&self, claim: &ExtractedClaim, chunks: &[RetrievedChunk]) -> Vec<ClaimEvidence> {
        let mut evidence = chunks
            .iter()
            .map(|chunk| self.score_chunk(claim, chunk))
            .filter(|item| item.confidence >= self.thresholds.evidence_floor)
            .collect::<Vec<ClaimEvidence>>();
        evidence.sort_by(|left, right| right.confidence.total_cmp(&left.confidence));
        evidence.truncate(self.thresholds.max_evidence);
        evidence
    }

    /// Status and score from ranked evidence.
    pub fn classify(&self, evidence: &[ClaimEvidence]) -> (ClaimStatus, f64) {
        let Some(best) = evidence.first().map(|item| item.confidence) else {
            return (ClaimStatus::Unverified, 0.0);
        };
        if best >= self.thresholds.verified_confidence {
            return (ClaimStatus::Verified, best);
        }

        let documents = evidence
            .iter()
            .map(|item| item.document_id.as_str())
            .collect::<HashSet<&str>>();
        if documents.len() >= 2 && best < self.thresholds.conflict_confidence {
            return (ClaimStatus::Conflicting, best);
        }
        (ClaimStatus::Unverified, best)
    }

    fn score_chunk(&self, claim: &ExtractedClaim, chunk: &RetrievedChunk) -> ClaimEvidence {
        let base = RETRIEVAL_WEIGHT * chunk.score.clamp(0.0, 1.0);
        let (boost, match_kind) = self.boost(claim, &chunk.content);

        ClaimEvidence {
            chunk_excerpt: truncate_chars(&normalize_whitespace(&chunk.content), EXCERPT_CHARS),
            document_id: chunk.document_id.clone(),
            filename: chunk.filename.clone(),
            retrieval_score: chunk.score,
            confidence: (base + boost).clamp(0.0, 1.0),
            match_kind,
        }
    }

    fn boost(&self, claim: &ExtractedClaim, content: &str) -> (f64, EvidenceMatchKind) {
        let value = normalize_whitespace(&claim.value).to_lowercase();
        if !bounded_matches(&normalize_whitespace(content).to_lowercase(), &value).is_empty() {
            return (EXACT_BOOST, EvidenceMatchKind::Exact);
        }

        if let Some(number) = self.matcher.claim_number(claim) {
            let tolerance = self.thresholds.numeric_tolerance;
            let close = self
                .matcher
                .numbers_in(content)
                .into_iter()
                .any(|(candidate, _, _)| within_tolerance(candidate, number, tolerance));
            if close {
                return (NUMERIC_BOOST, EvidenceMatchKind::NumericClose);
            }
        }

        if matches!(
            claim.claim_type,
            ClaimType::NamedOrg | ClaimType::NamedPerson | ClaimType::StaffName
        ) {
            let name = if claim.claim_type.is_person() {
                self.matcher.person_name(&claim.value)
            } else {
                claim.value.clone()
            };
            let tokens = significant_words(&name);
            if !tokens.is_empty() {
                let content_words = word_set(content);
                let present = tokens
                    .iter()
                    .filter(|token| content_words.contains(*token))
                    .count();
                if present > 0 {
                    let fraction = present as f64 / tokens.len() as f64;
                    debug!(claim = %claim.value, fraction, "partial name overlap");
                    return (NAME_BOOST * fraction, EvidenceMatchKind::NameOverlap);
                }
            }
        }

        (0.0, EvidenceMatchKind::RetrievalOnly)
    }
}

fn within_tolerance(candidate: f64, target: f64, tolerance: f64) -> bool {
    if target == 0.0 {
        return candidate == 0.0;
    }
    ((candidate - target) / target).abs() <= tolerance
}
