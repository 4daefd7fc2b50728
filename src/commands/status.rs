use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use grantgate::audit::compute_proposal_coverage;
use grantgate::model::Decision;
use grantgate::store::{DB_SCHEMA_VERSION, KnowledgeBaseStats, ProposalStore};

use crate::cli::StatusArgs;
use crate::commands::Session;

const TABLES: &[&str] = &[
    "proposals",
    "sections",
    "generation_metadata",
    "paragraph_attributions",
    "section_coverage",
    "verified_claims",
    "ambiguity_flags",
    "export_audits",
    "export_attestations",
];

#[derive(Debug, Serialize)]
struct StatusReport {
    db_path: String,
    db_schema_version: Option<String>,
    table_rows: BTreeMap<String, usize>,
    knowledge_base: KnowledgeBaseStats,
    proposal: Option<ProposalStatus>,
}

#[derive(Debug, Serialize)]
struct ProposalStatus {
    proposal_id: String,
    enforcement_failed: bool,
    sections: usize,
    generations: usize,
    overall_coverage: u32,
    unresolved_flags: usize,
    export_audits: usize,
    last_decision: Option<Decision>,
}

pub fn run(session: &Session, args: StatusArgs) -> Result<()> {
    let store = &session.store;
    let db_schema_version = store.metadata_value("db_schema_version")?;
    if db_schema_version.as_deref() != Some(DB_SCHEMA_VERSION) {
        warn!(
            found = ?db_schema_version,
            expected = DB_SCHEMA_VERSION,
            "database schema version differs from this build"
        );
    }

    let mut table_rows = BTreeMap::new();
    for table in TABLES {
        table_rows.insert(table.to_string(), store.count_rows(table)?);
    }

    let proposal = match &args.proposal_id {
        Some(proposal_id) => Some(proposal_status(store, proposal_id)?),
        None => None,
    };

    let report = StatusReport {
        db_path: session.db_path.display().to_string(),
        db_schema_version,
        table_rows,
        knowledge_base: store.knowledge_base_stats(args.organization_id.as_deref())?,
        proposal,
    };
    info!(
        proposals = report.table_rows.get("proposals").copied().unwrap_or(0),
        kb_documents = report.knowledge_base.documents,
        "status collected"
    );
    session.emit(&report)
}

fn proposal_status(store: &dyn ProposalStore, proposal_id: &str) -> Result<ProposalStatus> {
    let proposal = store.load_proposal(proposal_id)?;
    let audits = store.list_export_audits(proposal_id)?;

    Ok(ProposalStatus {
        proposal_id: proposal.proposal_id,
        enforcement_failed: proposal.enforcement_failed,
        sections: store.load_sections(proposal_id)?.len(),
        generations: store.load_generation_metadata(proposal_id)?.len(),
        overall_coverage: compute_proposal_coverage(store, proposal_id)?.overall_score,
        unresolved_flags: store
            .load_ambiguity_flags(proposal_id)?
            .iter()
            .filter(|flag| !flag.resolved)
            .count(),
        export_audits: audits.len(),
        last_decision: audits.last().map(|audit| audit.decision),
    })
}
