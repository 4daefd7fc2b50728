//! Generation-time enforcement: nothing a model writes is shown before it passes through here.

pub mod claims;
pub mod enforcer;
pub mod evidence;
pub mod generation;
pub mod grounding;
pub mod placeholder;
pub mod sanitizer;
pub mod similarity;
#[cfg(test)]
mod tests;

pub use claims::{ClaimExtractor, LlmClaimEnhancer};
pub use enforcer::{
    ContentEnforcer, EnforcementOutcome, RetrievalSufficiency, check_retrieval_sufficiency,
};
pub use evidence::EvidenceMatcher;
pub use generation::{
    GenerationGate, GenerationOutcome, GenerationStatus, SectionGenerationRequest,
};
pub use grounding::ParagraphGrounder;
pub use placeholder::{PlaceholderCounts, PlaceholderScanner, create_placeholder};
pub use sanitizer::{InstructionSanitizer, SanitizationResult};
pub use similarity::{FastJaccardScorer, PhraseOverlapScorer, TextSimilarityScorer};
