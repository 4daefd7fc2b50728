use super::*;
use crate::collaborators::Retriever;
use crate::model::{
    AmbiguityType, AttributionStatus, ChunkAttribution, ClaimEvidence, ClaimStatus, ClaimType,
    Decision, EvidenceMatchKind, ExtractedClaim, FlagOrigin, RiskLevel, SourceContribution,
    TextSpan,
};
use crate::store::knowledge::chunk_text;

fn store_with_proposal() -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("in-memory store should open");
    store
        .upsert_proposal(&ProposalRecord {
            proposal_id: "prop-1".to_string(),
            organization_id: "org-1".to_string(),
            title: "Youth Futures".to_string(),
            enforcement_failed: false,
        })
        .expect("proposal should insert");
    for (index, (section_id, name)) in [("sec-need", "Statement of Need"), ("sec-budget", "Budget")]
        .into_iter()
        .enumerate()
    {
        store
            .upsert_section(&SectionRecord {
                section_id: section_id.to_string(),
                proposal_id: "prop-1".to_string(),
                name: name.to_string(),
                description: String::new(),
                content: String::new(),
                required: true,
                word_limit: Some(250),
                char_limit: None,
                used_generic_knowledge: false,
                order_index: index as i64,
            })
            .expect("section should insert");
    }
    store
}

fn audit(audit_id: &str, decision: Decision) -> ExportAuditRecord {
    ExportAuditRecord {
        audit_id: audit_id.to_string(),
        proposal_id: "prop-1".to_string(),
        user_id: "user-7".to_string(),
        format: "docx".to_string(),
        created_at: "2026-03-01T12:00:00Z".to_string(),
        decision,
        blocks: Vec::new(),
        warnings: Vec::new(),
        attestation_required: decision == Decision::Warn,
        enforcement_snapshot: serde_json::json!({ "coverage": 72 }),
        evaluation_failed: false,
    }
}

#[test]
fn fresh_store_records_schema_version() {
    let store = SqliteStore::open_in_memory().expect("in-memory store should open");
    let version = store
        .metadata_value("db_schema_version")
        .expect("metadata should read");
    assert_eq!(version.as_deref(), Some(DB_SCHEMA_VERSION));
    assert_eq!(store.count_rows("proposals").expect("count"), 0);
}

#[test]
fn sections_load_in_order_and_content_updates() {
    let store = store_with_proposal();
    let sections = store.load_sections("prop-1").expect("sections should load");
    assert_eq!(
        sections
            .iter()
            .map(|section| section.section_id.as_str())
            .collect::<Vec<&str>>(),
        vec!["sec-need", "sec-budget"]
    );
    assert_eq!(sections[0].word_limit, Some(250));

    store
        .update_section_content("sec-budget", "Personnel costs dominate.", true)
        .expect("content should update");
    let budget = store.load_section("sec-budget").expect("section should load");
    assert_eq!(budget.content, "Personnel costs dominate.");
    assert!(budget.used_generic_knowledge);

    assert!(store.update_section_content("sec-missing", "x", false).is_err());
    assert!(store.load_section("sec-missing").is_err());
}

#[test]
fn sections_require_an_existing_proposal() {
    let store = SqliteStore::open_in_memory().expect("in-memory store should open");
    let orphan = SectionRecord {
        section_id: "sec-orphan".to_string(),
        proposal_id: "prop-none".to_string(),
        name: "Orphan".to_string(),
        description: String::new(),
        content: String::new(),
        required: false,
        word_limit: None,
        char_limit: None,
        used_generic_knowledge: false,
        order_index: 0,
    };
    assert!(store.upsert_section(&orphan).is_err());
}

#[test]
fn enforcement_failed_flag_is_sticky_until_reimport() {
    let store = store_with_proposal();
    store
        .set_enforcement_failed("prop-1", true)
        .expect("flag should set");
    assert!(store.load_proposal("prop-1").expect("load").enforcement_failed);

    store
        .upsert_proposal(&ProposalRecord {
            proposal_id: "prop-1".to_string(),
            organization_id: "org-1".to_string(),
            title: "Youth Futures".to_string(),
            enforcement_failed: false,
        })
        .expect("proposal should re-import");
    assert!(!store.load_proposal("prop-1").expect("load").enforcement_failed);
    assert!(store.set_enforcement_failed("prop-none", true).is_err());
}

#[test]
fn rfp_requirements_are_replaced_wholesale() {
    let store = store_with_proposal();
    let first = vec![
        RfpRequirement {
            section_name: "Budget".to_string(),
            required: true,
            word_limit: Some(300),
            char_limit: None,
        },
        RfpRequirement {
            section_name: "Evaluation Plan".to_string(),
            required: true,
            word_limit: None,
            char_limit: Some(2_000),
        },
    ];
    store
        .replace_rfp_requirements("prop-1", &first)
        .expect("requirements should store");
    assert_eq!(store.load_rfp_requirements("prop-1").expect("load"), first);

    store
        .replace_rfp_requirements("prop-1", &first[..1])
        .expect("requirements should replace");
    assert_eq!(store.load_rfp_requirements("prop-1").expect("load").len(), 1);
}

#[test]
fn attribution_replace_overwrites_previous_run() {
    let store = store_with_proposal();
    let paragraph = |index: usize, status: AttributionStatus| AttributedParagraph {
        paragraph_id: format!("sec-need-p{index}"),
        section_id: "sec-need".to_string(),
        proposal_id: "prop-1".to_string(),
        index,
        text: format!("Paragraph {index}"),
        status,
        best_similarity: 0.4,
        sources: vec![ChunkAttribution {
            document_id: "doc-1".to_string(),
            filename: "report.pdf".to_string(),
            similarity: 0.4,
            excerpt: "excerpt".to_string(),
        }],
        flags: Vec::new(),
    };
    let coverage = |score: u32, total: usize| SectionCoverage {
        section_id: "sec-need".to_string(),
        proposal_id: "prop-1".to_string(),
        section_name: "Statement of Need".to_string(),
        coverage_score: score,
        total_paragraphs: total,
        grounded: total,
        partial: 0,
        ungrounded: 0,
        failed: 0,
        source_documents: vec![SourceContribution {
            document_id: "doc-1".to_string(),
            filename: "report.pdf".to_string(),
            paragraph_count: total,
        }],
        computed_at: "2026-03-01T12:00:00Z".to_string(),
    };

    store
        .replace_section_attribution(
            "sec-need",
            &[
                paragraph(0, AttributionStatus::Grounded),
                paragraph(1, AttributionStatus::Grounded),
            ],
            &coverage(100, 2),
        )
        .expect("first attribution should store");
    store
        .replace_section_attribution(
            "sec-need",
            &[paragraph(0, AttributionStatus::Partial)],
            &coverage(50, 1),
        )
        .expect("second attribution should replace");

    let paragraphs = store
        .load_attributed_paragraphs("prop-1")
        .expect("paragraphs should load");
    assert_eq!(paragraphs.len(), 1);
    assert_eq!(paragraphs[0].status, AttributionStatus::Partial);
    assert_eq!(paragraphs[0].sources[0].filename, "report.pdf");

    let coverages = store
        .load_section_coverages("prop-1")
        .expect("coverage should load");
    assert_eq!(coverages.len(), 1);
    assert_eq!(coverages[0].coverage_score, 50);
    assert_eq!(coverages[0].source_documents[0].paragraph_count, 1);
}

#[test]
fn verified_claims_round_trip_with_evidence() {
    let store = store_with_proposal();
    let claim = VerifiedClaim {
        claim_id: "claim-abc".to_string(),
        proposal_id: "prop-1".to_string(),
        section_id: "sec-need".to_string(),
        paragraph_id: "sec-need-p0".to_string(),
        claim: ExtractedClaim {
            claim_type: ClaimType::Percentage,
            value: "42%".to_string(),
            context: "Attendance rose 42% last year".to_string(),
            position: TextSpan { start: 16, end: 19 },
            risk_level: RiskLevel::High,
        },
        status: ClaimStatus::Verified,
        evidence: vec![ClaimEvidence {
            chunk_excerpt: "attendance rose 42%".to_string(),
            document_id: "doc-1".to_string(),
            filename: "report.pdf".to_string(),
            retrieval_score: 0.8,
            confidence: 0.92,
            match_kind: EvidenceMatchKind::Exact,
        }],
        verification_score: 0.92,
    };

    store
        .replace_paragraph_claims("sec-need-p0", std::slice::from_ref(&claim))
        .expect("claims should store");
    store
        .replace_paragraph_claims("sec-need-p0", std::slice::from_ref(&claim))
        .expect("claims should replace idempotently");

    let loaded = store
        .load_verified_claims("prop-1")
        .expect("claims should load");
    assert_eq!(loaded, vec![claim]);
}

#[test]
fn resolving_a_flag_records_who_and_when() {
    let store = store_with_proposal();
    let flag = AmbiguityFlag {
        flag_id: "amb-1".to_string(),
        proposal_id: "prop-1".to_string(),
        ambiguity_type: AmbiguityType::Vague,
        description: "\"as appropriate\" is undefined".to_string(),
        source_texts: vec!["Include letters as appropriate.".to_string()],
        suggested_resolutions: vec!["Ask the program officer".to_string()],
        requires_user_input: true,
        resolved: false,
        resolution: None,
        resolved_by: None,
        resolved_at: None,
        origin: FlagOrigin::Rule,
    };
    store
        .replace_ambiguity_flags("prop-1", std::slice::from_ref(&flag))
        .expect("flags should store");

    let resolved = store
        .resolve_ambiguity_flag("amb-1", "Two letters", "user-7", "2026-03-02T09:00:00Z")
        .expect("flag should resolve");
    assert!(resolved.resolved);
    assert_eq!(resolved.resolution.as_deref(), Some("Two letters"));
    assert_eq!(resolved.resolved_by.as_deref(), Some("user-7"));
    assert_eq!(resolved.source_texts, flag.source_texts);

    assert!(
        store
            .resolve_ambiguity_flag("amb-missing", "x", "user-7", "2026-03-02T09:00:00Z")
            .is_err()
    );
}

#[test]
fn audits_are_append_only_and_attestations_need_an_audit() {
    let store = store_with_proposal();
    store
        .append_export_audit(&audit("audit-1", Decision::Warn))
        .expect("audit should append");
    assert!(
        store
            .append_export_audit(&audit("audit-1", Decision::Allow))
            .is_err()
    );

    let loaded = store
        .load_export_audit("audit-1")
        .expect("audit should load")
        .expect("audit should exist");
    assert_eq!(loaded.decision, Decision::Warn);
    assert_eq!(loaded.enforcement_snapshot["coverage"], 72);
    assert!(store.load_export_audit("audit-404").expect("load").is_none());

    let attestation = AttestationRecord {
        audit_id: "audit-1".to_string(),
        user_id: "user-7".to_string(),
        attestation_text: "I reviewed the flagged claims.".to_string(),
        attested_at: "2026-03-01T12:05:00Z".to_string(),
    };
    store
        .append_attestation(&attestation)
        .expect("attestation should append");
    assert_eq!(
        store.load_attestations("audit-1").expect("load"),
        vec![attestation.clone()]
    );

    let dangling = AttestationRecord {
        audit_id: "audit-404".to_string(),
        ..attestation
    };
    assert!(store.append_attestation(&dangling).is_err());
    assert_eq!(store.list_export_audits("prop-1").expect("list").len(), 1);
}

#[test]
fn chunk_text_packs_paragraphs_under_word_budget() {
    let text = "one two three\n\nfour five\n\nsix seven eight nine ten eleven";
    let chunks = chunk_text(text, 5);
    assert_eq!(
        chunks,
        vec![
            "one two three\n\nfour five".to_string(),
            "six seven eight nine ten".to_string(),
            "eleven".to_string(),
        ]
    );
    assert!(chunk_text("   ", 5).is_empty());
}

#[test]
fn knowledge_base_retrieval_is_scoped_to_organization() {
    let store = store_with_proposal();
    let model = EmbeddingModel::default();
    let first = store
        .ingest_document(
            "org-1",
            "annual-report.txt",
            "report",
            "Our youth mentoring program served 1,200 students across Dayton schools.\n\n\
             Facilities were renovated with county support.",
            &model,
            180,
        )
        .expect("document should ingest");
    assert_eq!(first.chunk_count, 1);
    assert_eq!(first.replaced_chunks, 0);

    let retriever = KnowledgeBaseRetriever::new(&store);
    let chunks = retriever
        .retrieve("youth mentoring program", "org-1", 5)
        .expect("retrieval should succeed");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].filename, "annual-report.txt");
    assert_eq!(chunks[0].document_id, first.document_id);
    assert!(chunks[0].score >= 0.6 && chunks[0].score <= 1.0);

    let other_org = retriever
        .retrieve("youth mentoring program", "org-2", 5)
        .expect("retrieval should succeed");
    assert!(other_org.is_empty());

    let again = store
        .ingest_document("org-1", "annual-report.txt", "report", "Updated text only.", &model, 180)
        .expect("document should re-ingest");
    assert_eq!(again.document_id, first.document_id);
    assert_eq!(again.replaced_chunks, 1);

    let stats = store
        .knowledge_base_stats(Some("org-1"))
        .expect("stats should load");
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.embeddings, 1);
}
