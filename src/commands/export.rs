use anyhow::Result;
use tracing::warn;

use grantgate::gate::ExportGatekeeper;

use crate::cli::{AttestArgs, ExportGateArgs};
use crate::commands::Session;

pub fn run(session: &Session, args: ExportGateArgs) -> Result<()> {
    let gatekeeper = ExportGatekeeper::new(&session.config, &session.store)?;
    let evaluation =
        gatekeeper.evaluate_export_gate(&args.proposal_id, &args.user_id, args.format.as_str())?;

    if !evaluation.gate_result.allowed {
        warn!(
            proposal_id = %args.proposal_id,
            audit_id = %evaluation.audit_record.audit_id,
            blocks = evaluation.gate_result.blocks.len(),
            "export blocked"
        );
    } else if evaluation.gate_result.attestation_required {
        warn!(
            audit_id = %evaluation.audit_record.audit_id,
            "export needs an attestation before it may proceed"
        );
    }
    session.emit(&evaluation)
}

pub fn attest(session: &Session, args: AttestArgs) -> Result<()> {
    let gatekeeper = ExportGatekeeper::new(&session.config, &session.store)?;
    session.emit(&gatekeeper.record_attestation(&args.audit_id, &args.user_id, &args.text)?)
}
