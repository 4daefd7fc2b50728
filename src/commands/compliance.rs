use anyhow::Result;

use grantgate::audit::check_compliance;

use crate::cli::ProposalArgs;
use crate::commands::Session;

pub fn run(session: &Session, args: ProposalArgs) -> Result<()> {
    session.emit(&check_compliance(
        &session.store,
        &args.proposal_id,
        &session.config,
    )?)
}
