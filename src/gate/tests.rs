use anyhow::{Result, bail};

use super::*;
use crate::audit::{CitationMapper, ClaimVerifier};
use crate::collaborators::Retriever;
use crate::config::{EnforcementConfig, GateThresholds};
use crate::enforcement::placeholder::create_placeholder;
use crate::model::{
    AmbiguityFlag, AmbiguityType, AttestationRecord, AttributedParagraph, Decision,
    ExportAuditRecord, ExportBlock, ExportWarning, FlagOrigin, GenerationMetadata, PlaceholderType, ProposalRecord,
    RetrievedChunk, RfpRequirement, SectionCoverage, SectionRecord, Severity, VerifiedClaim,
};
use crate::store::{ProposalStore, SqliteStore};

const GROUNDED: &str =
    "The after-school program served 1,200 students across Dayton schools in 2023.";
const UNGROUNDED: &str = "Volunteers painted murals near the river every spring weekend.";

struct FixedRetriever(Vec<RetrievedChunk>);

impl Retriever for FixedRetriever {
    fn retrieve(&self, _: &str, _: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        Ok(self.0.iter().take(top_k).cloned().collect())
    }
}

/// SQLite store whose claim reads or audit writes can be made to fail.
struct FaultyStore {
    inner: SqliteStore,
    fail_claims: bool,
    fail_audits: bool,
}

impl ProposalStore for FaultyStore {
    fn load_proposal(&self, proposal_id: &str) -> Result<ProposalRecord> {
        self.inner.load_proposal(proposal_id)
    }
    fn upsert_proposal(&self, proposal: &ProposalRecord) -> Result<()> {
        self.inner.upsert_proposal(proposal)
    }
    fn set_enforcement_failed(&self, proposal_id: &str, failed: bool) -> Result<()> {
        self.inner.set_enforcement_failed(proposal_id, failed)
    }
    fn load_sections(&self, proposal_id: &str) -> Result<Vec<SectionRecord>> {
        self.inner.load_sections(proposal_id)
    }
    fn load_section(&self, section_id: &str) -> Result<SectionRecord> {
        self.inner.load_section(section_id)
    }
    fn upsert_section(&self, section: &SectionRecord) -> Result<()> {
        self.inner.upsert_section(section)
    }
    fn update_section_content(&self, section_id: &str, content: &str, generic: bool) -> Result<()> {
        self.inner.update_section_content(section_id, content, generic)
    }
    fn load_rfp_requirements(&self, proposal_id: &str) -> Result<Vec<RfpRequirement>> {
        self.inner.load_rfp_requirements(proposal_id)
    }
    fn replace_rfp_requirements(&self, proposal_id: &str, requirements: &[RfpRequirement]) -> Result<()> {
        self.inner.replace_rfp_requirements(proposal_id, requirements)
    }
    fn save_generation_metadata(&self, metadata: &GenerationMetadata) -> Result<()> {
        self.inner.save_generation_metadata(metadata)
    }
    fn load_generation_metadata(&self, proposal_id: &str) -> Result<Vec<GenerationMetadata>> {
        self.inner.load_generation_metadata(proposal_id)
    }
    fn replace_section_attribution(
        &self,
        section_id: &str,
        paragraphs: &[AttributedParagraph],
        coverage: &SectionCoverage,
    ) -> Result<()> {
        self.inner.replace_section_attribution(section_id, paragraphs, coverage)
    }
    fn load_section_coverages(&self, proposal_id: &str) -> Result<Vec<SectionCoverage>> {
        self.inner.load_section_coverages(proposal_id)
    }
    fn load_attributed_paragraphs(&self, proposal_id: &str) -> Result<Vec<AttributedParagraph>> {
        self.inner.load_attributed_paragraphs(proposal_id)
    }
    fn replace_paragraph_claims(&self, paragraph_id: &str, claims: &[VerifiedClaim]) -> Result<()> {
        self.inner.replace_paragraph_claims(paragraph_id, claims)
    }
    fn load_verified_claims(&self, proposal_id: &str) -> Result<Vec<VerifiedClaim>> {
        if self.fail_claims {
            bail!("database is locked");
        }
        self.inner.load_verified_claims(proposal_id)
    }
    fn replace_ambiguity_flags(&self, proposal_id: &str, flags: &[AmbiguityFlag]) -> Result<()> {
        self.inner.replace_ambiguity_flags(proposal_id, flags)
    }
    fn load_ambiguity_flags(&self, proposal_id: &str) -> Result<Vec<AmbiguityFlag>> {
        self.inner.load_ambiguity_flags(proposal_id)
    }
    fn resolve_ambiguity_flag(
        &self,
        flag_id: &str,
        resolution: &str,
        resolved_by: &str,
        resolved_at: &str,
    ) -> Result<AmbiguityFlag> {
        self.inner
            .resolve_ambiguity_flag(flag_id, resolution, resolved_by, resolved_at)
    }
    fn append_export_audit(&self, record: &ExportAuditRecord) -> Result<()> {
        if self.fail_audits {
            bail!("disk I/O error");
        }
        self.inner.append_export_audit(record)
    }
    fn load_export_audit(&self, audit_id: &str) -> Result<Option<ExportAuditRecord>> {
        self.inner.load_export_audit(audit_id)
    }
    fn list_export_audits(&self, proposal_id: &str) -> Result<Vec<ExportAuditRecord>> {
        self.inner.list_export_audits(proposal_id)
    }
    fn append_attestation(&self, attestation: &AttestationRecord) -> Result<()> {
        self.inner.append_attestation(attestation)
    }
    fn load_attestations(&self, audit_id: &str) -> Result<Vec<AttestationRecord>> {
        self.inner.load_attestations(audit_id)
    }
}

fn section(section_id: &str, name: &str, content: &str, order_index: i64) -> SectionRecord {
    SectionRecord {
        section_id: section_id.to_string(),
        proposal_id: "prop-1".to_string(),
        name: name.to_string(),
        description: String::new(),
        content: content.to_string(),
        required: true,
        word_limit: None,
        char_limit: None,
        used_generic_knowledge: false,
        order_index,
    }
}

fn words(count: usize) -> String {
    vec!["outcome"; count].join(" ")
}

/// Proposal whose sections are stored and mapped against chunks equal to `sources`.
fn mapped_store(sections: &[SectionRecord], sources: &[&str]) -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("in-memory store should open");
    store
        .upsert_proposal(&ProposalRecord {
            proposal_id: "prop-1".to_string(),
            organization_id: "org-1".to_string(),
            title: "Youth Futures".to_string(),
            enforcement_failed: false,
        })
        .expect("proposal should insert");
    for section in sections {
        store.upsert_section(section).expect("section should insert");
    }

    let retriever = FixedRetriever(
        sources
            .iter()
            .map(|content| RetrievedChunk {
                content: content.to_string(),
                score: 0.8,
                document_id: "doc-annual".to_string(),
                filename: "annual-report.pdf".to_string(),
                document_type: "report".to_string(),
            })
            .collect(),
    );
    let mapper = CitationMapper::new(EnforcementConfig::default().citation, &retriever, &store)
        .expect("mapper should build");
    for section in sections.iter().filter(|section| !section.content.trim().is_empty()) {
        mapper
            .map_and_persist(section, &section.content, &[])
            .expect("mapping should persist");
    }
    store
}

fn block_ids(blocks: &[ExportBlock]) -> Vec<String> {
    blocks.iter().map(|block| block.rule_id.clone()).collect()
}

fn warning_ids(warnings: &[ExportWarning]) -> Vec<String> {
    warnings.iter().map(|warning| warning.rule_id.clone()).collect()
}

fn evaluate(store: &dyn ProposalStore) -> ExportEvaluation {
    ExportGatekeeper::new(&EnforcementConfig::default(), store)
        .expect("gatekeeper should build")
        .evaluate_export_gate("prop-1", "user-7", "docx")
        .expect("evaluation should be audited")
}

#[test]
fn grounded_complete_proposal_is_allowed() {
    let store = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);

    let evaluation = evaluate(&store);

    assert_eq!(evaluation.gate_result.decision, Decision::Allow);
    assert!(evaluation.gate_result.allowed);
    assert!(evaluation.gate_result.blocks.is_empty());
    assert!(!evaluation.gate_result.attestation_required);
    assert!(!evaluation.audit_record.evaluation_failed);
    assert_eq!(evaluation.audit_record.enforcement_snapshot["coverage"]["overall_score"], 100);
}

#[test]
fn gather_failure_fails_closed_with_an_audit_record() {
    let inner = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);
    let store = FaultyStore {
        inner,
        fail_claims: true,
        fail_audits: false,
    };

    let evaluation = evaluate(&store);

    let result = &evaluation.gate_result;
    assert_eq!(result.decision, Decision::Block);
    assert!(!result.allowed);
    assert_eq!(block_ids(&result.blocks), vec![ENFORCEMENT_FAILURE]);
    assert!(result.blocks[0].reason.contains("database is locked"));
    assert!(evaluation.audit_record.evaluation_failed);

    let audits = store.list_export_audits("prop-1").expect("audits should list");
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].decision, Decision::Block);
}

#[test]
fn unknown_proposal_fails_closed() {
    let store = SqliteStore::open_in_memory().expect("in-memory store should open");

    let evaluation = ExportGatekeeper::new(&EnforcementConfig::default(), &store)
        .expect("gatekeeper should build")
        .evaluate_export_gate("prop-missing", "user-7", "pdf")
        .expect("evaluation should be audited");

    assert_eq!(evaluation.gate_result.blocks[0].rule_id, ENFORCEMENT_FAILURE);
    assert_eq!(
        store
            .list_export_audits("prop-missing")
            .expect("audits should list")
            .len(),
        1
    );
}

#[test]
fn audit_write_failure_is_an_error() {
    let inner = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);
    let store = FaultyStore {
        inner,
        fail_claims: false,
        fail_audits: true,
    };

    let outcome = ExportGatekeeper::new(&EnforcementConfig::default(), &store)
        .expect("gatekeeper should build")
        .evaluate_export_gate("prop-1", "user-7", "docx");

    assert!(outcome.is_err());
}

#[test]
fn empty_required_section_blocks_export() {
    let store = mapped_store(
        &[
            section("sec-need", "Statement of Need", GROUNDED, 0),
            section("sec-eval", "Evaluation Plan", "", 1),
        ],
        &[GROUNDED],
    );

    let evaluation = evaluate(&store);

    assert_eq!(evaluation.gate_result.decision, Decision::Block);
    let blocks = block_ids(&evaluation.gate_result.blocks);
    assert_eq!(blocks, vec!["REQUIRED_SECTION_EMPTY".to_string()]);
    assert_eq!(
        evaluation.gate_result.blocks[0].affected_items,
        vec!["Evaluation Plan".to_string()]
    );
}

#[test]
fn word_limits_block_or_warn_by_overage() {
    let mut over = section("sec-need", "Statement of Need", &words(120), 0);
    over.word_limit = Some(100);
    let blocked = evaluate(&mapped_store(std::slice::from_ref(&over), &[over.content.as_str()]));
    assert_eq!(blocked.gate_result.decision, Decision::Block);
    assert!(
        block_ids(&blocked.gate_result.blocks)
            .contains(&"WORD_LIMIT_CRITICAL".to_string())
    );
    assert!(blocked.gate_result.warnings.is_empty());

    let mut slightly_over = section("sec-need", "Statement of Need", &words(105), 0);
    slightly_over.word_limit = Some(100);
    let warned = evaluate(&mapped_store(
        std::slice::from_ref(&slightly_over),
        &[slightly_over.content.as_str()],
    ));
    assert_eq!(warned.gate_result.decision, Decision::Warn);
    assert!(warned.gate_result.allowed);
    assert_eq!(
        warning_ids(&warned.gate_result.warnings),
        vec!["WORD_LIMIT_WARN".to_string()]
    );
    assert!(!warned.gate_result.attestation_required);
}

#[test]
fn low_coverage_warning_requires_attestation() {
    let content = format!("{GROUNDED}\n\n{UNGROUNDED}");
    let store = mapped_store(&[section("sec-need", "Statement of Need", &content, 0)], &[GROUNDED]);
    let gatekeeper = ExportGatekeeper::new(&EnforcementConfig::default(), &store)
        .expect("gatekeeper should build");

    let evaluation = gatekeeper
        .evaluate_export_gate("prop-1", "user-7", "docx")
        .expect("evaluation should be audited");

    let result = &evaluation.gate_result;
    assert_eq!(result.decision, Decision::Warn);
    assert_eq!(result.warnings[0].rule_id, "COVERAGE_LOW");
    assert_eq!(result.warnings[0].severity, Severity::High);
    assert!(result.attestation_required);

    let audit_id = &evaluation.audit_record.audit_id;
    assert!(gatekeeper.record_attestation(audit_id, "user-7", "  ").is_err());
    let attestation = gatekeeper
        .record_attestation(audit_id, "user-7", "I reviewed the ungrounded paragraphs.")
        .expect("attestation should record");
    assert_eq!(attestation.audit_id, *audit_id);
    assert_eq!(
        store.load_attestations(audit_id).expect("attestations should load").len(),
        1
    );

    let audits = gatekeeper.list_audits("prop-1").expect("audits should list");
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].audit_id, *audit_id);
}

#[test]
fn attestation_is_refused_for_allowed_exports() {
    let store = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);
    let gatekeeper = ExportGatekeeper::new(&EnforcementConfig::default(), &store)
        .expect("gatekeeper should build");
    let evaluation = gatekeeper
        .evaluate_export_gate("prop-1", "user-7", "docx")
        .expect("evaluation should be audited");

    assert!(
        gatekeeper
            .record_attestation(&evaluation.audit_record.audit_id, "user-7", "Looks fine.")
            .is_err()
    );
    assert!(gatekeeper.record_attestation("audit-unknown", "user-7", "Looks fine.").is_err());
}

#[test]
fn placeholders_ambiguity_and_failed_enforcement_block() {
    let token = create_placeholder(PlaceholderType::MissingData, "number of students", "ph-1");
    let content = format!("{GROUNDED} {token}");
    let store = mapped_store(&[section("sec-need", "Statement of Need", &content, 0)], &[GROUNDED]);
    store
        .set_enforcement_failed("prop-1", true)
        .expect("flag should set");
    store
        .replace_ambiguity_flags(
            "prop-1",
            &[AmbiguityFlag {
                flag_id: "amb-1".to_string(),
                proposal_id: "prop-1".to_string(),
                ambiguity_type: AmbiguityType::Contradictory,
                description: "Brief and comprehensive narrative requested".to_string(),
                source_texts: Vec::new(),
                suggested_resolutions: Vec::new(),
                requires_user_input: true,
                resolved: false,
                resolution: None,
                resolved_by: None,
                resolved_at: None,
                origin: FlagOrigin::Rule,
            }],
        )
        .expect("flags should store");

    let evaluation = evaluate(&store);

    let blocks = block_ids(&evaluation.gate_result.blocks);
    assert_eq!(
        blocks,
        vec![
            "ENFORCEMENT_FAILURE_FLAG".to_string(),
            "UNRESOLVED_PLACEHOLDER".to_string(),
            "UNRESOLVED_AMBIGUITY".to_string(),
        ]
    );
}

#[test]
fn content_without_coverage_rows_blocks() {
    let store = mapped_store(&[], &[]);
    store
        .upsert_section(&section("sec-need", "Statement of Need", GROUNDED, 0))
        .expect("section should insert");

    let evaluation = evaluate(&store);

    assert_eq!(
        block_ids(&evaluation.gate_result.blocks),
        vec!["NULL_COVERAGE_DATA".to_string()]
    );
}

#[test]
fn editing_mapped_content_invalidates_its_coverage_and_claims() {
    let store = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);
    let retriever = FixedRetriever(vec![RetrievedChunk {
        content: GROUNDED.to_string(),
        score: 0.8,
        document_id: "doc-annual".to_string(),
        filename: "annual-report.pdf".to_string(),
        document_type: "report".to_string(),
    }]);
    ClaimVerifier::new(&EnforcementConfig::default(), &retriever, &store)
        .expect("verifier should build")
        .extract_and_verify_proposal("prop-1")
        .expect("claims should verify");
    assert!(!store.load_verified_claims("prop-1").expect("claims should load").is_empty());
    assert_eq!(evaluate(&store).gate_result.decision, Decision::Allow);

    store
        .update_section_content(
            "sec-need",
            "Our clinic served 9,000 veterans and cut readmissions by 45% with 30 counselors.",
            false,
        )
        .expect("content should update");

    assert!(store.load_section_coverages("prop-1").expect("coverage should load").is_empty());
    assert!(store.load_attributed_paragraphs("prop-1").expect("paragraphs should load").is_empty());
    assert!(store.load_verified_claims("prop-1").expect("claims should load").is_empty());
    let evaluation = evaluate(&store);
    assert_eq!(evaluation.gate_result.decision, Decision::Block);
    let stale = evaluation
        .gate_result
        .blocks
        .iter()
        .find(|block| block.rule_id == "NULL_COVERAGE_DATA")
        .expect("edited section should lack coverage");
    assert_eq!(stale.affected_items, vec!["Statement of Need".to_string()]);
}

#[test]
fn rewriting_identical_content_keeps_coverage() {
    let need = section("sec-need", "Statement of Need", GROUNDED, 0);
    let store = mapped_store(&[need.clone()], &[GROUNDED]);

    store.upsert_section(&need).expect("section should upsert");
    store
        .update_section_content("sec-need", GROUNDED, false)
        .expect("content should update");

    assert_eq!(store.load_section_coverages("prop-1").expect("coverage should load").len(), 1);
    assert_eq!(evaluate(&store).gate_result.decision, Decision::Allow);
}

#[test]
fn unmapped_section_blocks_even_when_another_is_mapped() {
    let store = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);
    store
        .upsert_section(&section("sec-plan", "Project Plan", GROUNDED, 1))
        .expect("section should insert");

    let evaluation = evaluate(&store);

    let stale = evaluation
        .gate_result
        .blocks
        .iter()
        .find(|block| block.rule_id == "NULL_COVERAGE_DATA")
        .expect("unmapped section should block");
    assert_eq!(stale.affected_items, vec!["Project Plan".to_string()]);
}

fn panicking_check(_: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    panic!("malformed coverage row")
}

fn failing_check(_: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    bail!("claim row missing risk level")
}

fn always_fires(_: &EnforcementData, _: &GateThresholds) -> Result<Option<Vec<String>>> {
    Ok(Some(vec!["sec-need".to_string()]))
}

#[test]
fn broken_rules_are_treated_as_not_fired() {
    let store = mapped_store(&[section("sec-need", "Statement of Need", GROUNDED, 0)], &[GROUNDED]);
    let rule = |id: &'static str, action: RuleAction, check: RuleCheck| ExportRule {
        id,
        ac_reference: "AC-9.9",
        action,
        severity: Severity::Medium,
        message: "test rule",
        resolution: "none",
        check,
    };
    let gatekeeper = ExportGatekeeper::new(&EnforcementConfig::default(), &store)
        .expect("gatekeeper should build")
        .with_rules(vec![
            rule("PANICS", RuleAction::Block, panicking_check),
            rule("ERRORS", RuleAction::Block, failing_check),
            rule("FIRES", RuleAction::Warn, always_fires),
        ]);

    let evaluation = gatekeeper
        .evaluate_export_gate("prop-1", "user-7", "docx")
        .expect("evaluation should be audited");

    assert_eq!(evaluation.gate_result.decision, Decision::Warn);
    assert!(evaluation.gate_result.blocks.is_empty());
    assert_eq!(evaluation.gate_result.warnings[0].rule_id, "FIRES");
    assert!(!evaluation.gate_result.attestation_required);
}

#[test]
fn rule_table_order_is_stable() {
    let ids = export_rule_table()
        .iter()
        .map(|rule| rule.id)
        .collect::<Vec<&str>>();
    assert_eq!(ids.first(), Some(&"ENFORCEMENT_FAILURE_FLAG"));
    assert_eq!(ids.last(), Some(&"VERIFICATION_PLACEHOLDERS"));
    assert_eq!(ids.len(), 14);
}
