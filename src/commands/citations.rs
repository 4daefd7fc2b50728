use anyhow::{Result, bail};

use grantgate::audit::{CitationMapper, compute_proposal_coverage, recompute_all_sections};
use grantgate::store::{KnowledgeBaseRetriever, ProposalStore};

use crate::cli::{MapCitationsArgs, ProposalArgs};
use crate::commands::Session;

pub fn run(session: &Session, args: MapCitationsArgs) -> Result<()> {
    let retriever = KnowledgeBaseRetriever::new(&session.store);
    let mapper = CitationMapper::new(session.config.citation.clone(), &retriever, &session.store)?;

    let Some(section_id) = args.section_id else {
        let coverage = recompute_all_sections(&mapper, &args.proposal_id)?;
        return session.emit(&coverage);
    };

    let section = session.store.load_section(&section_id)?;
    if section.proposal_id != args.proposal_id {
        bail!(
            "section {section_id} belongs to proposal {}, not {}",
            section.proposal_id,
            args.proposal_id
        );
    }
    let mapping = mapper.map_and_persist(&section, &section.content, &[])?;
    session.emit(&mapping)
}

pub fn coverage(session: &Session, args: ProposalArgs) -> Result<()> {
    session.store.load_proposal(&args.proposal_id)?;
    session.emit(&compute_proposal_coverage(&session.store, &args.proposal_id)?)
}
