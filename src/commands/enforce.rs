use std::fs;

use anyhow::{Context, Result};

use grantgate::collaborators::ChatCompletion;
use grantgate::enforcement::{
    ContentEnforcer, GenerationGate, InstructionSanitizer, SectionGenerationRequest,
};
use grantgate::store::KnowledgeBaseRetriever;

use crate::cli::EnforceArgs;
use crate::commands::Session;

/// Stands in for the completion endpoint with a draft written earlier.
struct RecordedDraft(String);

impl ChatCompletion for RecordedDraft {
    fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub fn run(session: &Session, args: EnforceArgs) -> Result<()> {
    let draft = fs::read_to_string(&args.draft)
        .with_context(|| format!("failed to read {}", args.draft.display()))?;

    let enforcer = ContentEnforcer::new(&session.config)?;
    let sanitizer = InstructionSanitizer::new()?;
    let retriever = KnowledgeBaseRetriever::new(&session.store);
    let generator = RecordedDraft(draft);
    let gate = GenerationGate::new(&enforcer, &sanitizer, &retriever, &generator, &session.store);

    let outcome = gate.generate_section(&SectionGenerationRequest {
        proposal_id: args.proposal_id,
        section_id: args.section_id,
        query: args.query,
        custom_instructions: args.instructions,
    })?;
    session.emit(&outcome)
}
