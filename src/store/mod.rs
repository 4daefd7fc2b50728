//! Persistence for proposals, enforcement results, audits and the local knowledge base.

use anyhow::Result;

use crate::model::{
    AmbiguityFlag, AttestationRecord, AttributedParagraph, ExportAuditRecord, GenerationMetadata,
    ProposalRecord, RfpRequirement, SectionCoverage, SectionRecord, VerifiedClaim,
};

mod embedding;
mod knowledge;
mod schema;
mod sqlite;
#[cfg(test)]
mod tests;

pub use embedding::{EmbeddingModel, cosine_similarity};
pub use knowledge::{
    DEFAULT_CHUNK_WORDS, IngestedDocument, KnowledgeBaseRetriever, KnowledgeBaseStats, chunk_text,
};
pub use schema::DB_SCHEMA_VERSION;
pub use sqlite::SqliteStore;

/// Proposal-scoped reads and writes used by every enforcement pass.
///
/// `replace_*` methods delete the existing rows for their key and insert the new set atomically.
pub trait ProposalStore {
    fn load_proposal(&self, proposal_id: &str) -> Result<ProposalRecord>;
    fn upsert_proposal(&self, proposal: &ProposalRecord) -> Result<()>;
    fn set_enforcement_failed(&self, proposal_id: &str, failed: bool) -> Result<()>;

    /// Sections ordered by `order_index`, then id.
    fn load_sections(&self, proposal_id: &str) -> Result<Vec<SectionRecord>>;
    fn load_section(&self, section_id: &str) -> Result<SectionRecord>;
    /// Changing stored content drops the section's attribution, coverage and claims.
    fn upsert_section(&self, section: &SectionRecord) -> Result<()>;
    fn update_section_content(
        &self,
        section_id: &str,
        content: &str,
        used_generic_knowledge: bool,
    ) -> Result<()>;

    fn load_rfp_requirements(&self, proposal_id: &str) -> Result<Vec<RfpRequirement>>;
    fn replace_rfp_requirements(
        &self,
        proposal_id: &str,
        requirements: &[RfpRequirement],
    ) -> Result<()>;

    fn save_generation_metadata(&self, metadata: &GenerationMetadata) -> Result<()>;
    fn load_generation_metadata(&self, proposal_id: &str) -> Result<Vec<GenerationMetadata>>;

    /// Claims of paragraphs whose text changed or disappeared are dropped as well.
    fn replace_section_attribution(
        &self,
        section_id: &str,
        paragraphs: &[AttributedParagraph],
        coverage: &SectionCoverage,
    ) -> Result<()>;
    fn load_section_coverages(&self, proposal_id: &str) -> Result<Vec<SectionCoverage>>;
    fn load_attributed_paragraphs(&self, proposal_id: &str) -> Result<Vec<AttributedParagraph>>;

    fn replace_paragraph_claims(&self, paragraph_id: &str, claims: &[VerifiedClaim])
    -> Result<()>;
    fn load_verified_claims(&self, proposal_id: &str) -> Result<Vec<VerifiedClaim>>;

    fn replace_ambiguity_flags(&self, proposal_id: &str, flags: &[AmbiguityFlag]) -> Result<()>;
    fn load_ambiguity_flags(&self, proposal_id: &str) -> Result<Vec<AmbiguityFlag>>;
    fn resolve_ambiguity_flag(
        &self,
        flag_id: &str,
        resolution: &str,
        resolved_by: &str,
        resolved_at: &str,
    ) -> Result<AmbiguityFlag>;

    fn append_export_audit(&self, record: &ExportAuditRecord) -> Result<()>;
    fn load_export_audit(&self, audit_id: &str) -> Result<Option<ExportAuditRecord>>;
    fn list_export_audits(&self, proposal_id: &str) -> Result<Vec<ExportAuditRecord>>;

    fn append_attestation(&self, attestation: &AttestationRecord) -> Result<()>;
    fn load_attestations(&self, audit_id: &str) -> Result<Vec<AttestationRecord>>;
}
