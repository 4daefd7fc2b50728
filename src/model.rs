use serde::{Deserialize, Serialize};

/// Unit of source material handed over by the retrieval collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub score: f64,
    pub document_id: String,
    pub filename: String,
    #[serde(default)]
    pub document_type: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimType {
    Number,
    Percentage,
    Currency,
    Date,
    NamedOrg,
    NamedPerson,
    StaffName,
    Outcome,
    Location,
}

impl ClaimType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Number => "NUMBER",
            Self::Percentage => "PERCENTAGE",
            Self::Currency => "CURRENCY",
            Self::Date => "DATE",
            Self::NamedOrg => "NAMED_ORG",
            Self::NamedPerson => "NAMED_PERSON",
            Self::StaffName => "STAFF_NAME",
            Self::Outcome => "OUTCOME",
            Self::Location => "LOCATION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NUMBER" => Some(Self::Number),
            "PERCENTAGE" => Some(Self::Percentage),
            "CURRENCY" => Some(Self::Currency),
            "DATE" => Some(Self::Date),
            "NAMED_ORG" => Some(Self::NamedOrg),
            "NAMED_PERSON" => Some(Self::NamedPerson),
            "STAFF_NAME" => Some(Self::StaffName),
            "OUTCOME" => Some(Self::Outcome),
            "LOCATION" => Some(Self::Location),
            _ => None,
        }
    }

    /// Fixed risk table.
    pub fn risk_level(self) -> RiskLevel {
        match self {
            Self::Number
            | Self::Percentage
            | Self::Currency
            | Self::Outcome
            | Self::NamedPerson
            | Self::StaffName => RiskLevel::High,
            Self::NamedOrg | Self::Date => RiskLevel::Medium,
            Self::Location => RiskLevel::Low,
        }
    }

    pub fn is_person(self) -> bool {
        matches!(self, Self::NamedPerson | Self::StaffName)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Byte offsets into the text a claim or placeholder was found in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn overlaps(&self, other: &TextSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedClaim {
    pub claim_type: ClaimType,
    pub value: String,
    pub context: String,
    pub position: TextSpan,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacedClaim {
    pub claim: ExtractedClaim,
    pub placeholder_id: String,
    pub placeholder_type: PlaceholderType,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Verified,
    Unverified,
    Conflicting,
    Outdated,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "VERIFIED",
            Self::Unverified => "UNVERIFIED",
            Self::Conflicting => "CONFLICTING",
            Self::Outdated => "OUTDATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "VERIFIED" => Some(Self::Verified),
            "UNVERIFIED" => Some(Self::Unverified),
            "CONFLICTING" => Some(Self::Conflicting),
            "OUTDATED" => Some(Self::Outdated),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceMatchKind {
    Exact,
    NumericClose,
    NameOverlap,
    RetrievalOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimEvidence {
    pub chunk_excerpt: String,
    pub document_id: String,
    pub filename: String,
    pub retrieval_score: f64,
    pub confidence: f64,
    pub match_kind: EvidenceMatchKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedClaim {
    pub claim_id: String,
    pub proposal_id: String,
    pub section_id: String,
    pub paragraph_id: String,
    pub claim: ExtractedClaim,
    pub status: ClaimStatus,
    pub evidence: Vec<ClaimEvidence>,
    pub verification_score: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParagraphStatus {
    Grounded,
    Partial,
    Ungrounded,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportingChunk {
    pub document_id: String,
    pub filename: String,
    pub similarity: f64,
}

/// Generation-time grounding verdict for one paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcedParagraph {
    pub index: usize,
    pub original_text: String,
    pub enforced_text: String,
    pub status: ParagraphStatus,
    pub best_similarity: f64,
    pub supporting_chunks: Vec<SupportingChunk>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributionStatus {
    Grounded,
    Partial,
    Ungrounded,
    Failed,
}

impl AttributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grounded => "GROUNDED",
            Self::Partial => "PARTIAL",
            Self::Ungrounded => "UNGROUNDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GROUNDED" => Some(Self::Grounded),
            "PARTIAL" => Some(Self::Partial),
            "UNGROUNDED" => Some(Self::Ungrounded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAttribution {
    pub document_id: String,
    pub filename: String,
    pub similarity: f64,
    pub excerpt: String,
}

/// Persisted post-hoc attribution of one stored paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedParagraph {
    pub paragraph_id: String,
    pub section_id: String,
    pub proposal_id: String,
    pub index: usize,
    pub text: String,
    pub status: AttributionStatus,
    pub best_similarity: f64,
    pub sources: Vec<ChunkAttribution>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub document_id: String,
    pub filename: String,
    pub paragraph_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionCoverage {
    pub section_id: String,
    pub proposal_id: String,
    pub section_name: String,
    pub coverage_score: u32,
    pub total_paragraphs: usize,
    pub grounded: usize,
    pub partial: usize,
    pub ungrounded: usize,
    pub failed: usize,
    pub source_documents: Vec<SourceContribution>,
    pub computed_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowestSection {
    pub section_id: String,
    pub section_name: String,
    pub coverage_score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalCoverage {
    pub proposal_id: String,
    pub overall_score: u32,
    pub total_paragraphs: usize,
    pub sections: Vec<SectionCoverage>,
    pub lowest_section: Option<LowestSection>,
    pub documents_used: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaceholderType {
    MissingData,
    UserInputRequired,
    VerificationNeeded,
}

impl PlaceholderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingData => "MISSING_DATA",
            Self::UserInputRequired => "USER_INPUT_REQUIRED",
            Self::VerificationNeeded => "VERIFICATION_NEEDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MISSING_DATA" => Some(Self::MissingData),
            "USER_INPUT_REQUIRED" => Some(Self::UserInputRequired),
            "VERIFICATION_NEEDED" => Some(Self::VerificationNeeded),
            _ => None,
        }
    }

    pub fn blocks_export(self) -> bool {
        matches!(self, Self::MissingData | Self::UserInputRequired)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    pub placeholder_type: PlaceholderType,
    pub description: String,
    pub id: String,
    pub suggested_sources: Vec<String>,
    pub position: TextSpan,
    pub resolved: bool,
    pub legacy: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmbiguityType {
    Contradictory,
    Vague,
    Implicit,
    ScopeUnclear,
}

impl AmbiguityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contradictory => "CONTRADICTORY",
            Self::Vague => "VAGUE",
            Self::Implicit => "IMPLICIT",
            Self::ScopeUnclear => "SCOPE_UNCLEAR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CONTRADICTORY" => Some(Self::Contradictory),
            "VAGUE" => Some(Self::Vague),
            "IMPLICIT" => Some(Self::Implicit),
            "SCOPE_UNCLEAR" => Some(Self::ScopeUnclear),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagOrigin {
    Rule,
    Llm,
}

impl FlagOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "RULE",
            Self::Llm => "LLM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RULE" => Some(Self::Rule),
            "LLM" => Some(Self::Llm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityFlag {
    pub flag_id: String,
    pub proposal_id: String,
    pub ambiguity_type: AmbiguityType,
    pub description: String,
    pub source_texts: Vec<String>,
    pub suggested_resolutions: Vec<String>,
    pub requires_user_input: bool,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<String>,
    pub origin: FlagOrigin,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceOverall {
    Complete,
    Incomplete,
    Violations,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    Word,
    Char,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitViolation {
    pub section_id: Option<String>,
    pub section_name: String,
    pub limit_type: LimitType,
    pub limit: usize,
    pub actual: usize,
    pub overage_percent: u32,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionCompliance {
    pub section_id: String,
    pub section_name: String,
    pub required: bool,
    pub word_count: usize,
    pub char_count: usize,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceStatus {
    pub proposal_id: String,
    pub overall_status: ComplianceOverall,
    pub sections: Vec<SectionCompliance>,
    pub missing_sections: Vec<String>,
    pub empty_sections: Vec<String>,
    pub limit_violations: Vec<LimitViolation>,
    pub compliance_score: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Warn,
    Block,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Warn => "WARN",
            Self::Block => "BLOCK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ALLOW" => Some(Self::Allow),
            "WARN" => Some(Self::Warn),
            "BLOCK" => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBlock {
    pub rule_id: String,
    pub ac_reference: String,
    pub reason: String,
    pub affected_items: Vec<String>,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportWarning {
    pub rule_id: String,
    pub ac_reference: String,
    pub reason: String,
    pub affected_items: Vec<String>,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportGateResult {
    pub decision: Decision,
    pub allowed: bool,
    pub blocks: Vec<ExportBlock>,
    pub warnings: Vec<ExportWarning>,
    pub attestation_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportAuditRecord {
    pub audit_id: String,
    pub proposal_id: String,
    pub user_id: String,
    pub format: String,
    pub created_at: String,
    pub decision: Decision,
    pub blocks: Vec<ExportBlock>,
    pub warnings: Vec<ExportWarning>,
    pub attestation_required: bool,
    pub enforcement_snapshot: serde_json::Value,
    pub evaluation_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub audit_id: String,
    pub user_id: String,
    pub attestation_text: String,
    pub attested_at: String,
}

/// Audit trail of one generation-time enforcement pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub proposal_id: Option<String>,
    pub section_id: Option<String>,
    pub retrieved_chunk_count: usize,
    pub relevant_chunk_count: usize,
    pub used_generic_knowledge: bool,
    pub similarity_min: f64,
    pub similarity_max: f64,
    pub similarity_avg: f64,
    pub claims_replaced: usize,
    pub paragraphs_placeholdered: usize,
    pub policy_override: bool,
    pub refused: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub proposal_id: String,
    pub organization_id: String,
    pub title: String,
    #[serde(default)]
    pub enforcement_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub section_id: String,
    pub proposal_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub word_limit: Option<usize>,
    #[serde(default)]
    pub char_limit: Option<usize>,
    #[serde(default)]
    pub used_generic_knowledge: bool,
    #[serde(default)]
    pub order_index: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfpRequirement {
    pub section_name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub word_limit: Option<usize>,
    #[serde(default)]
    pub char_limit: Option<usize>,
}

fn default_true() -> bool {
    true
}
