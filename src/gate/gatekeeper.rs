use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::audit::compliance::evaluate_compliance;
use crate::audit::coverage::aggregate_coverage;
use crate::config::EnforcementConfig;
use crate::enforcement::placeholder::PlaceholderScanner;
use crate::gate::rules::{
    ENFORCEMENT_FAILURE, EnforcementData, ExportRule, RuleAction, export_rule_table,
};
use crate::model::{
    AttestationRecord, ClaimStatus, Decision, ExportAuditRecord, ExportBlock, ExportGateResult,
    ExportWarning, RiskLevel, Severity,
};
use crate::store::ProposalStore;
use crate::text::HtmlStripper;
use crate::util::{now_utc_string, short_digest, utc_compact_string};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEvaluation {
    pub gate_result: ExportGateResult,
    pub audit_record: ExportAuditRecord,
}

/// Sole export entry point. Gathers every enforcement result, runs the rule table and writes one
/// audit record per evaluation.
pub struct ExportGatekeeper<'a> {
    config: EnforcementConfig,
    scanner: PlaceholderScanner,
    html: HtmlStripper,
    rules: Vec<ExportRule>,
    store: &'a dyn ProposalStore,
}

impl<'a> ExportGatekeeper<'a> {
    pub fn new(config: &EnforcementConfig, store: &'a dyn ProposalStore) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            scanner: PlaceholderScanner::new()?,
            html: HtmlStripper::new()?,
            rules: export_rule_table(),
            store,
        })
    }

    pub fn with_rules(mut self, rules: Vec<ExportRule>) -> Self {
        self.rules = rules;
        self
    }

    /// All-or-nothing read of the data the rules need.
    pub fn gather(&self, proposal_id: &str) -> Result<EnforcementData> {
        let proposal = self
            .store
            .load_proposal(proposal_id)
            .context("failed to load proposal")?;
        let sections = self
            .store
            .load_sections(proposal_id)
            .context("failed to load sections")?;
        let coverage = aggregate_coverage(
            proposal_id,
            self.store
                .load_section_coverages(proposal_id)
                .context("failed to load section coverage")?,
        );
        let claims = self
            .store
            .load_verified_claims(proposal_id)
            .context("failed to load verified claims")?;
        let flags = self
            .store
            .load_ambiguity_flags(proposal_id)
            .context("failed to load ambiguity flags")?;
        let requirements = self
            .store
            .load_rfp_requirements(proposal_id)
            .context("failed to load RFP requirements")?;
        let compliance =
            evaluate_compliance(proposal_id, &sections, &requirements, &self.config, &self.html);
        let placeholders = sections
            .iter()
            .map(|section| {
                (
                    section.name.clone(),
                    self.scanner.counts(&self.html.strip(&section.content)),
                )
            })
            .collect();

        Ok(EnforcementData {
            proposal,
            sections,
            coverage,
            claims,
            flags,
            compliance,
            placeholders,
        })
    }

    /// Runs every rule in order. A rule that errors or panics is logged and counts as not fired.
    pub fn evaluate_rules(&self, data: &EnforcementData) -> ExportGateResult {
        let mut blocks = Vec::new();
        let mut warnings = Vec::new();

        for rule in &self.rules {
            let outcome = catch_unwind(AssertUnwindSafe(|| (rule.check)(data, &self.config.gate)));
            let affected_items = match outcome {
                Ok(Ok(Some(items))) => items,
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => {
                    warn!(rule_id = rule.id, error = %err, "export rule failed; treating as not fired");
                    continue;
                }
                Err(_) => {
                    error!(rule_id = rule.id, "export rule panicked; treating as not fired");
                    continue;
                }
            };

            match rule.action {
                RuleAction::Block => blocks.push(ExportBlock {
                    rule_id: rule.id.to_string(),
                    ac_reference: rule.ac_reference.to_string(),
                    reason: rule.message.to_string(),
                    affected_items,
                    resolution: rule.resolution.to_string(),
                }),
                RuleAction::Warn => warnings.push(ExportWarning {
                    rule_id: rule.id.to_string(),
                    ac_reference: rule.ac_reference.to_string(),
                    reason: rule.message.to_string(),
                    affected_items,
                    severity: rule.severity,
                }),
            }
        }

        gate_result(blocks, warnings)
    }

    pub fn evaluate_export_gate(
        &self,
        proposal_id: &str,
        user_id: &str,
        format: &str,
    ) -> Result<ExportEvaluation> {
        let (gate_result, snapshot, evaluation_failed) = match self.gather(proposal_id) {
            Ok(data) => {
                let result = self.evaluate_rules(&data);
                (result, self.snapshot(&data), false)
            }
            Err(err) => {
                error!(
                    proposal_id,
                    user_id,
                    error = %format!("{err:#}"),
                    "enforcement data unavailable; blocking export"
                );
                (
                    failure_result(proposal_id, &err),
                    json!({ "error": format!("{err:#}") }),
                    true,
                )
            }
        };

        let now = Utc::now();
        let audit_record = ExportAuditRecord {
            audit_id: format!(
                "audit-{}-{}",
                utc_compact_string(now),
                short_digest(
                    &[
                        proposal_id,
                        user_id,
                        format,
                        &now.timestamp_nanos_opt().unwrap_or_default().to_string()
                    ],
                    12
                )
            ),
            proposal_id: proposal_id.to_string(),
            user_id: user_id.to_string(),
            format: format.to_string(),
            created_at: now_utc_string(),
            decision: gate_result.decision,
            blocks: gate_result.blocks.clone(),
            warnings: gate_result.warnings.clone(),
            attestation_required: gate_result.attestation_required,
            enforcement_snapshot: snapshot,
            evaluation_failed,
        };
        self.store
            .append_export_audit(&audit_record)
            .context("failed to write export audit record; export is not allowed")?;

        info!(
            proposal_id,
            user_id,
            format,
            audit_id = %audit_record.audit_id,
            decision = gate_result.decision.as_str(),
            blocks = gate_result.blocks.len(),
            warnings = gate_result.warnings.len(),
            "export gate evaluated"
        );
        Ok(ExportEvaluation {
            gate_result,
            audit_record,
        })
    }

    /// Records the user's acknowledgment of a WARN decision that required one.
    pub fn record_attestation(
        &self,
        audit_id: &str,
        user_id: &str,
        attestation_text: &str,
    ) -> Result<AttestationRecord> {
        let Some(audit) = self.store.load_export_audit(audit_id)? else {
            bail!("export audit not found: {audit_id}");
        };
        if audit.decision != Decision::Warn || !audit.attestation_required {
            bail!(
                "export audit {audit_id} has decision {} and does not accept an attestation",
                audit.decision.as_str()
            );
        }
        let attestation_text = attestation_text.trim();
        if attestation_text.is_empty() {
            bail!("attestation text is required for export audit {audit_id}");
        }

        let attestation = AttestationRecord {
            audit_id: audit_id.to_string(),
            user_id: user_id.to_string(),
            attestation_text: attestation_text.to_string(),
            attested_at: now_utc_string(),
        };
        self.store.append_attestation(&attestation)?;
        info!(audit_id, user_id, "export attestation recorded");
        Ok(attestation)
    }

    pub fn list_audits(&self, proposal_id: &str) -> Result<Vec<ExportAuditRecord>> {
        self.store.list_export_audits(proposal_id)
    }

    fn snapshot(&self, data: &EnforcementData) -> serde_json::Value {
        let unverified_at = |risk: RiskLevel| {
            data.claims
                .iter()
                .filter(|claim| {
                    claim.claim.risk_level == risk && claim.status != ClaimStatus::Verified
                })
                .count()
        };

        json!({
            "enforcement_failed": data.proposal.enforcement_failed,
            "coverage": {
                "overall_score": data.coverage.overall_score,
                "total_paragraphs": data.coverage.total_paragraphs,
                "documents_used": data.coverage.documents_used,
                "sections": data.coverage.sections.iter().map(|section| json!({
                    "section_id": section.section_id,
                    "coverage_score": section.coverage_score,
                })).collect::<Vec<serde_json::Value>>(),
            },
            "claims": {
                "total": data.claims.len(),
                "verified": data.claims.iter().filter(|claim| claim.status == ClaimStatus::Verified).count(),
                "high_risk_unverified": unverified_at(RiskLevel::High),
                "medium_risk_unverified": unverified_at(RiskLevel::Medium),
            },
            "compliance": {
                "overall_status": data.compliance.overall_status,
                "compliance_score": data.compliance.compliance_score,
            },
            "placeholders": data.placeholder_totals(),
            "ambiguity": {
                "total": data.flags.len(),
                "unresolved_requiring_input": data.flags.iter().filter(|flag| flag.requires_user_input && !flag.resolved).count(),
            },
            "generic_knowledge_sections": data.sections.iter().filter(|section| section.used_generic_knowledge).map(|section| section.section_id.clone()).collect::<Vec<String>>(),
            "thresholds": self.config.gate,
        })
    }
}

fn gate_result(blocks: Vec<ExportBlock>, warnings: Vec<ExportWarning>) -> ExportGateResult {
    let decision = if !blocks.is_empty() {
        Decision::Block
    } else if !warnings.is_empty() {
        Decision::Warn
    } else {
        Decision::Allow
    };
    let attestation_required = decision == Decision::Warn
        && warnings
            .iter()
            .any(|warning| warning.severity == Severity::High);

    ExportGateResult {
        decision,
        allowed: decision != Decision::Block,
        blocks,
        warnings,
        attestation_required,
    }
}

fn failure_result(proposal_id: &str, err: &anyhow::Error) -> ExportGateResult {
    gate_result(
        vec![ExportBlock {
            rule_id: ENFORCEMENT_FAILURE.to_string(),
            ac_reference: "AC-1.1".to_string(),
            reason: format!("Enforcement data could not be gathered: {err:#}"),
            affected_items: vec![proposal_id.to_string()],
            resolution: "Retry the export; if it keeps failing, re-run enforcement for this proposal"
                .to_string(),
        }],
        Vec::new(),
    )
}
