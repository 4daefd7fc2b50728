use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::{ChatCompletion, Retriever, retrieve_or_empty};
use crate::enforcement::claims::LlmClaimEnhancer;
use crate::enforcement::enforcer::{
    ContentEnforcer, EnforcementOutcome, RetrievalSufficiency, check_retrieval_sufficiency,
};
use crate::enforcement::placeholder::{create_placeholder, placeholder_id};
use crate::enforcement::sanitizer::{InstructionSanitizer, SanitizationResult};
use crate::model::{GenerationMetadata, PlaceholderType, RetrievedChunk, SectionRecord};
use crate::store::ProposalStore;
use crate::text::truncate_chars;
use crate::util::now_utc_string;

const PROMPT_EXCERPT_CHARS: usize = 1_500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionGenerationRequest {
    pub proposal_id: String,
    pub section_id: String,
    /// Retrieval query; the section name and description when empty.
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub custom_instructions: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    Enforced,
    Refused,
    Failed,
}

/// What the caller may show the user. `content` is always enforced or placeholder-only text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub status: GenerationStatus,
    pub content: String,
    pub sufficiency: RetrievalSufficiency,
    pub sanitization: SanitizationResult,
    pub metadata: GenerationMetadata,
    pub enforcement: Option<EnforcementOutcome>,
}

/// Generation-time entry point: nothing the model writes reaches a caller without passing
/// sanitization, the sufficiency check and enforcement.
pub struct GenerationGate<'a> {
    enforcer: &'a ContentEnforcer,
    sanitizer: &'a InstructionSanitizer,
    retriever: &'a dyn Retriever,
    generator: &'a dyn ChatCompletion,
    claim_llm: Option<&'a dyn ChatCompletion>,
    store: &'a dyn ProposalStore,
}

impl<'a> GenerationGate<'a> {
    pub fn new(
        enforcer: &'a ContentEnforcer,
        sanitizer: &'a InstructionSanitizer,
        retriever: &'a dyn Retriever,
        generator: &'a dyn ChatCompletion,
        store: &'a dyn ProposalStore,
    ) -> Self {
        Self {
            enforcer,
            sanitizer,
            retriever,
            generator,
            claim_llm: None,
            store,
        }
    }

    /// Enables the model-assisted claim pass during enforcement.
    pub fn with_claim_enhancer(mut self, llm: &'a dyn ChatCompletion) -> Self {
        self.claim_llm = Some(llm);
        self
    }

    pub fn generate_section(&self, request: &SectionGenerationRequest) -> Result<GenerationOutcome> {
        let proposal = self.store.load_proposal(&request.proposal_id)?;
        let section = self.store.load_section(&request.section_id)?;
        if section.proposal_id != proposal.proposal_id {
            bail!(
                "section {} does not belong to proposal {}",
                section.section_id,
                proposal.proposal_id
            );
        }

        let sanitization = self
            .sanitizer
            .sanitize_custom_instructions(&request.custom_instructions);

        let query = if request.query.trim().is_empty() {
            format!("{} {}", section.name, section.description)
        } else {
            request.query.clone()
        };
        let chunks = retrieve_or_empty(
            self.retriever,
            &query,
            &proposal.organization_id,
            self.enforcer.retrieval_thresholds().top_k,
        );
        let sufficiency = check_retrieval_sufficiency(&chunks, self.enforcer.retrieval_thresholds());

        if !sufficiency.sufficient {
            info!(
                proposal_id = %request.proposal_id,
                section_id = %request.section_id,
                relevant = sufficiency.relevant,
                required = sufficiency.required,
                "refusing generation: insufficient source material"
            );
            let content = refusal_placeholder(&section);
            let metadata = self.placeholder_metadata(request, &chunks, &sufficiency, &sanitization, true);
            return self.persist(
                request,
                GenerationOutcome {
                    status: GenerationStatus::Refused,
                    content,
                    sufficiency,
                    sanitization,
                    metadata,
                    enforcement: None,
                },
            );
        }

        let (system_prompt, user_prompt) = build_prompts(&section, &sanitization.sanitized, &chunks);
        let raw = match self.generator.complete(&system_prompt, &user_prompt) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    proposal_id = %request.proposal_id,
                    section_id = %request.section_id,
                    error = %err,
                    "generation collaborator failed; storing placeholder content"
                );
                if let Err(flag_err) = self
                    .store
                    .set_enforcement_failed(&request.proposal_id, true)
                {
                    warn!(error = %flag_err, "failed to flag proposal after generation failure");
                }
                let content = failure_placeholder(&section);
                let metadata =
                    self.placeholder_metadata(request, &chunks, &sufficiency, &sanitization, false);
                return self.persist(
                    request,
                    GenerationOutcome {
                        status: GenerationStatus::Failed,
                        content,
                        sufficiency,
                        sanitization,
                        metadata,
                        enforcement: None,
                    },
                );
            }
        };

        let enhancer = self.claim_llm.map(LlmClaimEnhancer::new);
        let mut outcome = self
            .enforcer
            .enforce_generation(&raw, &chunks, enhancer.as_ref());
        outcome.metadata.proposal_id = Some(request.proposal_id.clone());
        outcome.metadata.section_id = Some(request.section_id.clone());
        outcome.metadata.policy_override = sanitization.policy_override;

        self.persist(
            request,
            GenerationOutcome {
                status: GenerationStatus::Enforced,
                content: outcome.enforced_text.clone(),
                sufficiency,
                sanitization,
                metadata: outcome.metadata.clone(),
                enforcement: Some(outcome),
            },
        )
    }

    /// Persists metadata (best effort) and content, then hands back the outcome.
    fn persist(
        &self,
        request: &SectionGenerationRequest,
        outcome: GenerationOutcome,
    ) -> Result<GenerationOutcome> {
        if let Err(err) = self.store.save_generation_metadata(&outcome.metadata) {
            warn!(
                proposal_id = %request.proposal_id,
                section_id = %request.section_id,
                error = %err,
                "failed to persist generation metadata"
            );
        }

        self.store.update_section_content(
            &request.section_id,
            &outcome.content,
            outcome.metadata.used_generic_knowledge,
        )?;

        info!(
            proposal_id = %request.proposal_id,
            section_id = %request.section_id,
            status = ?outcome.status,
            claims_replaced = outcome.metadata.claims_replaced,
            paragraphs_placeholdered = outcome.metadata.paragraphs_placeholdered,
            policy_override = outcome.metadata.policy_override,
            "section generation complete"
        );

        Ok(outcome)
    }

    fn placeholder_metadata(
        &self,
        request: &SectionGenerationRequest,
        chunks: &[RetrievedChunk],
        sufficiency: &RetrievalSufficiency,
        sanitization: &SanitizationResult,
        refused: bool,
    ) -> GenerationMetadata {
        let scores = chunks.iter().map(|chunk| chunk.score).collect::<Vec<f64>>();
        let (min, max, avg) = if scores.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                scores.iter().copied().fold(f64::INFINITY, f64::min),
                scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                scores.iter().sum::<f64>() / scores.len() as f64,
            )
        };

        GenerationMetadata {
            proposal_id: Some(request.proposal_id.clone()),
            section_id: Some(request.section_id.clone()),
            retrieved_chunk_count: chunks.len(),
            relevant_chunk_count: sufficiency.relevant,
            used_generic_knowledge: false,
            similarity_min: min,
            similarity_max: max,
            similarity_avg: avg,
            claims_replaced: 0,
            paragraphs_placeholdered: 1,
            policy_override: sanitization.policy_override,
            refused,
            created_at: now_utc_string(),
        }
    }
}

fn refusal_placeholder(section: &SectionRecord) -> String {
    let description = format!(
        "No supporting source material was found for the {} section. Upload relevant documents or write this section directly",
        section.name
    );
    let id = placeholder_id(PlaceholderType::UserInputRequired, &description, 0);
    create_placeholder(PlaceholderType::UserInputRequired, &description, &id)
}

fn failure_placeholder(section: &SectionRecord) -> String {
    let description = format!(
        "Content generation failed for the {} section. Regenerate it or write it directly",
        section.name
    );
    let id = placeholder_id(PlaceholderType::UserInputRequired, &description, 0);
    create_placeholder(PlaceholderType::UserInputRequired, &description, &id)
}

fn build_prompts(
    section: &SectionRecord,
    instructions: &str,
    chunks: &[RetrievedChunk],
) -> (String, String) {
    let mut system_prompt = String::from(
        "You write sections of grant proposals using only the source excerpts provided. \
         Never invent numbers, dates, names, organizations or outcomes. \
         Where a fact is not in the sources, write [[PLACEHOLDER:MISSING_DATA:short description:id]] instead. \
         Separate paragraphs with a blank line.",
    );
    let instructions = instructions.trim();
    if !instructions.is_empty() {
        system_prompt.push_str("\n\nAdditional writing instructions from the user:\n");
        system_prompt.push_str(instructions);
    }

    let mut user_prompt = format!("Section: {}\n", section.name);
    if !section.description.trim().is_empty() {
        user_prompt.push_str(&format!("Guidance: {}\n", section.description.trim()));
    }
    if let Some(limit) = section.word_limit {
        user_prompt.push_str(&format!("Word limit: {limit}\n"));
    }
    user_prompt.push_str("\nSources:\n");
    for (index, chunk) in chunks.iter().enumerate() {
        user_prompt.push_str(&format!(
            "[{}] {}:\n{}\n\n",
            index + 1,
            chunk.filename,
            truncate_chars(&chunk.content, PROMPT_EXCERPT_CHARS)
        ));
    }

    (system_prompt, user_prompt)
}
