use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use grantgate::model::{ProposalRecord, RfpRequirement, SectionRecord};
use grantgate::store::ProposalStore;
use grantgate::util::read_json_file;

use crate::cli::ImportProposalArgs;
use crate::commands::Session;

#[derive(Debug, Deserialize)]
struct ProposalImport {
    proposal: ProposalRecord,
    #[serde(default)]
    sections: Vec<SectionRecord>,
    #[serde(default)]
    rfp_requirements: Vec<RfpRequirement>,
}

#[derive(Debug, Serialize)]
struct ImportSummary {
    proposal_id: String,
    sections: usize,
    rfp_requirements: usize,
}

pub fn run(session: &Session, args: ImportProposalArgs) -> Result<()> {
    let import: ProposalImport = read_json_file(&args.input)?;
    let proposal_id = import.proposal.proposal_id.clone();

    if let Some(section) = import
        .sections
        .iter()
        .find(|section| section.proposal_id != proposal_id)
    {
        bail!(
            "section {} belongs to proposal {}, not {proposal_id}",
            section.section_id,
            section.proposal_id
        );
    }

    session.store.upsert_proposal(&import.proposal)?;
    for section in &import.sections {
        session.store.upsert_section(section)?;
    }
    session
        .store
        .replace_rfp_requirements(&proposal_id, &import.rfp_requirements)?;

    info!(
        proposal_id = %proposal_id,
        sections = import.sections.len(),
        requirements = import.rfp_requirements.len(),
        "proposal imported"
    );
    session.emit(&ImportSummary {
        proposal_id,
        sections: import.sections.len(),
        rfp_requirements: import.rfp_requirements.len(),
    })
}
