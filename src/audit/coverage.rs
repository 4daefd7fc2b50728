use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{debug, info};

use crate::audit::citation::CitationMapper;
use crate::model::{LowestSection, ProposalCoverage, SectionCoverage};
use crate::store::ProposalStore;

/// Paragraph-weighted aggregate over the stored section coverage rows.
pub fn compute_proposal_coverage(
    store: &dyn ProposalStore,
    proposal_id: &str,
) -> Result<ProposalCoverage> {
    let sections = store.load_section_coverages(proposal_id)?;
    Ok(aggregate_coverage(proposal_id, sections))
}

pub fn aggregate_coverage(proposal_id: &str, sections: Vec<SectionCoverage>) -> ProposalCoverage {
    let total_paragraphs = sections
        .iter()
        .map(|section| section.total_paragraphs)
        .sum::<usize>();
    let weighted = sections
        .iter()
        .map(|section| section.grounded as f64 + 0.5 * section.partial as f64)
        .sum::<f64>();
    let overall_score = if total_paragraphs == 0 {
        0
    } else {
        (100.0 * weighted / total_paragraphs as f64)
            .round()
            .clamp(0.0, 100.0) as u32
    };

    let lowest_section = sections
        .iter()
        .filter(|section| section.total_paragraphs > 0)
        .min_by_key(|section| section.coverage_score)
        .map(|section| LowestSection {
            section_id: section.section_id.clone(),
            section_name: section.section_name.clone(),
            coverage_score: section.coverage_score,
        });

    let documents_used = sections
        .iter()
        .flat_map(|section| section.source_documents.iter())
        .map(|contribution| contribution.document_id.as_str())
        .collect::<BTreeSet<&str>>()
        .len();

    ProposalCoverage {
        proposal_id: proposal_id.to_string(),
        overall_score,
        total_paragraphs,
        lowest_section,
        documents_used,
        sections,
    }
}

/// Re-maps every section with content, then re-aggregates. Used after the knowledge base changes.
pub fn recompute_all_sections(
    mapper: &CitationMapper<'_>,
    proposal_id: &str,
) -> Result<ProposalCoverage> {
    let store = mapper.store();
    let sections = store.load_sections(proposal_id)?;

    let mut recomputed = 0usize;
    for section in &sections {
        if mapper.html().strip(&section.content).trim().is_empty() {
            debug!(section_id = %section.section_id, "skipping empty section");
            continue;
        }
        mapper.map_and_persist(section, &section.content, &[])?;
        recomputed += 1;
    }

    let coverage = compute_proposal_coverage(store, proposal_id)?;
    info!(
        proposal_id,
        sections = recomputed,
        overall_score = coverage.overall_score,
        "recomputed proposal coverage"
    );
    Ok(coverage)
}
