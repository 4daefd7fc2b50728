//! Post-generation audit passes over stored proposal content.

pub mod ambiguity;
pub mod citation;
pub mod compliance;
pub mod coverage;
pub mod verifier;

pub use ambiguity::{AmbiguityDetector, AmbiguitySummary};
pub use citation::{CitationMapper, CitationMapping, coverage_score};
pub use compliance::{check_compliance, evaluate_compliance};
pub use coverage::{aggregate_coverage, compute_proposal_coverage, recompute_all_sections};
pub use verifier::{ClaimVerificationSummary, ClaimVerifier};
