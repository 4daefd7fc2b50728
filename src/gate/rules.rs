//! Ordered export rule table.
//!
//! Each rule's check returns the affected items when it fires and `None` when it does not.

use std::collections::HashSet;

use anyhow::{Result, bail};

use crate::config::GateThresholds;
use crate::enforcement::placeholder::PlaceholderCounts;
use crate::model::{
    AmbiguityFlag, ClaimStatus, ComplianceStatus, LimitType, LimitViolation, ProposalCoverage,
    ProposalRecord, RiskLevel, SectionCompliance, SectionRecord, Severity, VerifiedClaim,
};

pub const ENFORCEMENT_FAILURE: &str = "ENFORCEMENT_FAILURE";

/// Everything the rules look at, gathered in one pass before any rule runs.
#[derive(Debug, Clone)]
pub struct EnforcementData {
    pub proposal: ProposalRecord,
    pub sections: Vec<SectionRecord>,
    pub coverage: ProposalCoverage,
    pub claims: Vec<VerifiedClaim>,
    pub flags: Vec<AmbiguityFlag>,
    pub compliance: ComplianceStatus,
    /// Placeholder counts per section name, in section order.
    pub placeholders: Vec<(String, PlaceholderCounts)>,
}

impl EnforcementData {
    pub fn placeholder_totals(&self) -> PlaceholderCounts {
        let mut totals = PlaceholderCounts::default();
        for (_, counts) in &self.placeholders {
            totals.add(counts);
        }
        totals
    }

    fn sections_with_content(&self) -> impl Iterator<Item = &SectionCompliance> {
        self.compliance
            .sections
            .iter()
            .filter(|section| section.char_count > 0)
    }

    fn unverified_at(&self, risk: RiskLevel) -> Vec<&VerifiedClaim> {
        self.claims
            .iter()
            .filter(|claim| claim.claim.risk_level == risk && claim.status != ClaimStatus::Verified)
            .collect()
    }

    /// Overall coverage when any section has been mapped.
    fn mapped_coverage(&self) -> Result<Option<u32>> {
        if self.coverage.sections.is_empty() {
            return Ok(None);
        }
        if self.coverage.overall_score > 100 {
            bail!(
                "coverage score {} for proposal {} is out of range",
                self.coverage.overall_score,
                self.proposal.proposal_id
            );
        }
        Ok(Some(self.coverage.overall_score))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RuleAction {
    Block,
    Warn,
}

pub type RuleCheck = fn(&EnforcementData, &GateThresholds) -> Result<Option<Vec<String>>>;

#[derive(Clone)]
pub struct ExportRule {
    pub id: &'static str,
    pub ac_reference: &'static str,
    pub action: RuleAction,
    pub severity: Severity,
    pub message: &'static str,
    pub resolution: &'static str,
    pub check: RuleCheck,
}

pub fn export_rule_table() -> Vec<ExportRule> {
    vec![
        ExportRule {
            id: "ENFORCEMENT_FAILURE_FLAG",
            ac_reference: "AC-1.2",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "A previous enforcement pass failed for this proposal",
            resolution: "Regenerate the affected sections so enforcement completes",
            check: enforcement_failed,
        },
        ExportRule {
            id: "NULL_COVERAGE_DATA",
            ac_reference: "AC-2.1",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Sections have content but no current source coverage",
            resolution: "Run citation mapping for every section before exporting",
            check: null_coverage,
        },
        ExportRule {
            id: "GENERIC_KNOWLEDGE_CONTENT",
            ac_reference: "AC-1.3",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Sections were written without organization source material",
            resolution: "Upload supporting documents and regenerate these sections",
            check: generic_knowledge,
        },
        ExportRule {
            id: "HIGH_RISK_UNVERIFIED",
            ac_reference: "AC-3.1",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "High-risk claims are not verified against source documents",
            resolution: "Add evidence for these claims or remove them",
            check: high_risk_unverified,
        },
        ExportRule {
            id: "COVERAGE_CRITICAL",
            ac_reference: "AC-2.2",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Source coverage is below the export minimum",
            resolution: "Ground more paragraphs in uploaded documents or rewrite them",
            check: coverage_critical,
        },
        ExportRule {
            id: "REQUIRED_SECTION_MISSING",
            ac_reference: "AC-4.1",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Sections required by the RFP are missing",
            resolution: "Add the missing sections",
            check: required_missing,
        },
        ExportRule {
            id: "REQUIRED_SECTION_EMPTY",
            ac_reference: "AC-4.2",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Required sections are empty or too short",
            resolution: "Write content for these sections",
            check: required_empty,
        },
        ExportRule {
            id: "WORD_LIMIT_CRITICAL",
            ac_reference: "AC-4.3",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Sections exceed their length limits",
            resolution: "Shorten these sections to within their limits",
            check: limit_critical,
        },
        ExportRule {
            id: "UNRESOLVED_PLACEHOLDER",
            ac_reference: "AC-5.1",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "Content still contains placeholders that need data or user input",
            resolution: "Replace every MISSING_DATA and USER_INPUT_REQUIRED placeholder",
            check: blocking_placeholders,
        },
        ExportRule {
            id: "UNRESOLVED_AMBIGUITY",
            ac_reference: "AC-5.2",
            action: RuleAction::Block,
            severity: Severity::High,
            message: "RFP ambiguities that need a decision are unresolved",
            resolution: "Resolve each flagged ambiguity",
            check: unresolved_ambiguity,
        },
        ExportRule {
            id: "COVERAGE_LOW",
            ac_reference: "AC-2.3",
            action: RuleAction::Warn,
            severity: Severity::High,
            message: "Source coverage is low",
            resolution: "Review ungrounded paragraphs before submitting",
            check: coverage_low,
        },
        ExportRule {
            id: "UNVERIFIED_MEDIUM_CLAIMS",
            ac_reference: "AC-3.2",
            action: RuleAction::Warn,
            severity: Severity::Medium,
            message: "Medium-risk claims are not verified",
            resolution: "Confirm these names and dates against your records",
            check: medium_risk_unverified,
        },
        ExportRule {
            id: "WORD_LIMIT_WARN",
            ac_reference: "AC-4.4",
            action: RuleAction::Warn,
            severity: Severity::Medium,
            message: "Sections slightly exceed their length limits",
            resolution: "Trim these sections if the funder enforces limits strictly",
            check: limit_warn,
        },
        ExportRule {
            id: "VERIFICATION_PLACEHOLDERS",
            ac_reference: "AC-5.3",
            action: RuleAction::Warn,
            severity: Severity::Low,
            message: "Many statements are marked for verification",
            resolution: "Verify the marked statements before submitting",
            check: verification_placeholders,
        },
    ]
}

fn fired(items: Vec<String>) -> Option<Vec<String>> {
    if items.is_empty() { None } else { Some(items) }
}

fn enforcement_failed(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(data
        .proposal
        .enforcement_failed
        .then(|| vec![data.proposal.proposal_id.clone()]))
}

/// Sections with content and no coverage row, whether or not other sections were mapped.
fn null_coverage(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    let mapped = data
        .coverage
        .sections
        .iter()
        .map(|coverage| coverage.section_id.as_str())
        .collect::<HashSet<&str>>();
    Ok(fired(
        data.sections_with_content()
            .filter(|section| !mapped.contains(section.section_id.as_str()))
            .map(|section| section.section_name.clone())
            .collect(),
    ))
}

fn generic_knowledge(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(fired(
        data.sections
            .iter()
            .filter(|section| section.used_generic_knowledge)
            .map(|section| section.name.clone())
            .collect(),
    ))
}

fn claim_items(claims: Vec<&VerifiedClaim>) -> Vec<String> {
    claims
        .into_iter()
        .map(|claim| {
            format!(
                "{} \"{}\" in {} ({})",
                claim.claim.claim_type.as_str(),
                claim.claim.value,
                claim.paragraph_id,
                claim.status.as_str()
            )
        })
        .collect()
}

fn high_risk_unverified(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(fired(claim_items(data.unverified_at(RiskLevel::High))))
}

fn medium_risk_unverified(
    data: &EnforcementData,
    _: &GateThresholds,
) -> Result<Option<Vec<String>>> {
    Ok(fired(claim_items(data.unverified_at(RiskLevel::Medium))))
}

fn coverage_items(data: &EnforcementData, below: u32, overall: u32) -> Vec<String> {
    let mut items = vec![format!("overall coverage {overall}%")];
    items.extend(
        data.coverage
            .sections
            .iter()
            .filter(|section| section.total_paragraphs > 0 && section.coverage_score < below)
            .map(|section| format!("{}: {}%", section.section_name, section.coverage_score)),
    );
    items
}

fn coverage_critical(
    data: &EnforcementData,
    thresholds: &GateThresholds,
) -> Result<Option<Vec<String>>> {
    Ok(data
        .mapped_coverage()?
        .filter(|overall| *overall < thresholds.coverage_block)
        .map(|overall| coverage_items(data, thresholds.coverage_block, overall)))
}

fn coverage_low(data: &EnforcementData, thresholds: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(data
        .mapped_coverage()?
        .filter(|overall| {
            *overall >= thresholds.coverage_block && *overall < thresholds.coverage_warn
        })
        .map(|overall| coverage_items(data, thresholds.coverage_warn, overall)))
}

fn required_missing(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(fired(data.compliance.missing_sections.clone()))
}

fn required_empty(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(fired(data.compliance.empty_sections.clone()))
}

fn violation_item(violation: &LimitViolation) -> String {
    let unit = match violation.limit_type {
        LimitType::Word => "words",
        LimitType::Char => "characters",
    };
    format!(
        "{}: {} of {} {unit} (+{}%)",
        violation.section_name, violation.actual, violation.limit, violation.overage_percent
    )
}

fn limit_critical(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(fired(
        data.compliance
            .limit_violations
            .iter()
            .filter(|violation| violation.blocking)
            .map(violation_item)
            .collect(),
    ))
}

fn limit_warn(data: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(fired(
        data.compliance
            .limit_violations
            .iter()
            .filter(|violation| !violation.blocking)
            .map(violation_item)
            .collect(),
    ))
}

fn blocking_placeholders(
    data: &EnforcementData,
    _: &GateThresholds,
) -> Result<Option<Vec<String>>> {
    Ok(fired(
        data.placeholders
            .iter()
            .filter(|(_, counts)| counts.blocking() > 0)
            .map(|(section_name, counts)| {
                format!(
                    "{section_name}: {} missing data, {} user input",
                    counts.missing_data, counts.user_input_required
                )
            })
            .collect(),
    ))
}

fn unresolved_ambiguity(
    data: &EnforcementData,
    _: &GateThresholds,
) -> Result<Option<Vec<String>>> {
    Ok(fired(
        data.flags
            .iter()
            .filter(|flag| flag.requires_user_input && !flag.resolved)
            .map(|flag| format!("{}: {}", flag.ambiguity_type.as_str(), flag.description))
            .collect(),
    ))
}

fn verification_placeholders(
    data: &EnforcementData,
    thresholds: &GateThresholds,
) -> Result<Option<Vec<String>>> {
    let total = data.placeholder_totals().verification_needed;
    if total <= thresholds.max_verification_placeholders {
        return Ok(None);
    }
    Ok(Some(
        data.placeholders
            .iter()
            .filter(|(_, counts)| counts.verification_needed > 0)
            .map(|(section_name, counts)| {
                format!("{section_name}: {} to verify", counts.verification_needed)
            })
            .collect(),
    ))
}
