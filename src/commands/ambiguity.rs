use std::fs;

use anyhow::{Context, Result};

use grantgate::audit::AmbiguityDetector;

use crate::cli::{AmbiguityArgs, ResolveAmbiguityArgs};
use crate::commands::Session;

pub fn run(session: &Session, args: AmbiguityArgs) -> Result<()> {
    let rfp_text = fs::read_to_string(&args.rfp)
        .with_context(|| format!("failed to read {}", args.rfp.display()))?;
    let detector = AmbiguityDetector::new(session.config.ambiguity.clone(), &session.store)?;
    session.emit(&detector.analyze_and_persist(&args.proposal_id, &rfp_text)?)
}

pub fn resolve(session: &Session, args: ResolveAmbiguityArgs) -> Result<()> {
    let detector = AmbiguityDetector::new(session.config.ambiguity.clone(), &session.store)?;
    session.emit(&detector.resolve_flag(&args.flag_id, &args.resolution, &args.resolved_by)?)
}
