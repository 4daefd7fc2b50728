use anyhow::Result;
use tracing::info;

use crate::config::EnforcementConfig;
use crate::model::{
    ComplianceOverall, ComplianceStatus, LimitType, LimitViolation, RfpRequirement,
    SectionCompliance, SectionRecord,
};
use crate::store::ProposalStore;
use crate::text::{HtmlStripper, count_words, normalize_section_name};

pub fn check_compliance(
    store: &dyn ProposalStore,
    proposal_id: &str,
    config: &EnforcementConfig,
) -> Result<ComplianceStatus> {
    store.load_proposal(proposal_id)?;
    let sections = store.load_sections(proposal_id)?;
    let requirements = store.load_rfp_requirements(proposal_id)?;

    let html = HtmlStripper::new()?;
    let status = evaluate_compliance(proposal_id, &sections, &requirements, config, &html);
    info!(
        proposal_id,
        status = ?status.overall_status,
        score = status.compliance_score,
        missing = status.missing_sections.len(),
        empty = status.empty_sections.len(),
        limit_violations = status.limit_violations.len(),
        "compliance checked"
    );
    Ok(status)
}

/// Pure compliance pass over already-loaded sections and RFP requirements.
pub fn evaluate_compliance(
    proposal_id: &str,
    sections: &[SectionRecord],
    requirements: &[RfpRequirement],
    config: &EnforcementConfig,
    html: &HtmlStripper,
) -> ComplianceStatus {
    let min_length = config.compliance.min_content_length;
    let block_percent = config.gate.limit_block_percent;

    let mut section_results = Vec::with_capacity(sections.len());
    let mut empty_sections = Vec::new();
    let mut limit_violations = Vec::new();
    let mut limits_checked = 0usize;
    let mut incomplete_optional = false;

    for section in sections {
        let key = normalize_section_name(&section.name);
        let requirement = requirements
            .iter()
            .find(|requirement| normalize_section_name(&requirement.section_name) == key);

        let text = html.strip(&section.content);
        let trimmed = text.trim();
        let word_count = count_words(trimmed);
        let char_count = trimmed.chars().count();
        let is_complete = char_count >= min_length;
        let required = section.required || requirement.is_some_and(|requirement| requirement.required);

        if !is_complete {
            if required {
                empty_sections.push(section.name.clone());
            } else {
                incomplete_optional = true;
            }
        }

        let limits = [
            (
                LimitType::Word,
                section.word_limit.or(requirement.and_then(|requirement| requirement.word_limit)),
                word_count,
            ),
            (
                LimitType::Char,
                section.char_limit.or(requirement.and_then(|requirement| requirement.char_limit)),
                char_count,
            ),
        ];
        for (limit_type, limit, actual) in limits {
            let Some(limit) = limit.filter(|limit| *limit > 0) else {
                continue;
            };
            limits_checked += 1;
            if actual <= limit {
                continue;
            }
            let overage_percent =
                (100.0 * (actual - limit) as f64 / limit as f64).round() as u32;
            limit_violations.push(LimitViolation {
                section_id: Some(section.section_id.clone()),
                section_name: section.name.clone(),
                limit_type,
                limit,
                actual,
                overage_percent,
                blocking: overage_percent > block_percent,
            });
        }

        section_results.push(SectionCompliance {
            section_id: section.section_id.clone(),
            section_name: section.name.clone(),
            required,
            word_count,
            char_count,
            is_complete,
        });
    }

    let missing_sections = requirements
        .iter()
        .filter(|requirement| requirement.required)
        .filter(|requirement| {
            let key = normalize_section_name(&requirement.section_name);
            !sections
                .iter()
                .any(|section| normalize_section_name(&section.name) == key)
        })
        .map(|requirement| requirement.section_name.clone())
        .collect::<Vec<String>>();

    let required_total = section_results.iter().filter(|section| section.required).count()
        + missing_sections.len();
    let required_complete = section_results
        .iter()
        .filter(|section| section.required && section.is_complete)
        .count();
    let completion = ratio_or_full(required_complete, required_total);
    let limit_ratio = ratio_or_full(limits_checked - limit_violations.len(), limits_checked);
    let compliance_score = (50.0 * completion + 50.0 * limit_ratio).round().clamp(0.0, 100.0) as u32;

    let any_blocking = limit_violations.iter().any(|violation| violation.blocking);
    let overall_status = if !missing_sections.is_empty() || !empty_sections.is_empty() || any_blocking {
        ComplianceOverall::Violations
    } else if !limit_violations.is_empty() || incomplete_optional {
        ComplianceOverall::Incomplete
    } else {
        ComplianceOverall::Complete
    };

    ComplianceStatus {
        proposal_id: proposal_id.to_string(),
        overall_status,
        sections: section_results,
        missing_sections,
        empty_sections,
        limit_violations,
        compliance_score,
    }
}

fn ratio_or_full(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}
