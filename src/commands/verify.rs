use anyhow::Result;

use grantgate::audit::ClaimVerifier;
use grantgate::store::KnowledgeBaseRetriever;

use crate::cli::ProposalArgs;
use crate::commands::Session;

pub fn run(session: &Session, args: ProposalArgs) -> Result<()> {
    let retriever = KnowledgeBaseRetriever::new(&session.store);
    let verifier = ClaimVerifier::new(&session.config, &retriever, &session.store)?;
    session.emit(&verifier.extract_and_verify_proposal(&args.proposal_id)?)
}
