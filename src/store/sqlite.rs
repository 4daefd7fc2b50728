use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::model::{
    AmbiguityFlag, AmbiguityType, AttestationRecord, AttributedParagraph, AttributionStatus,
    ClaimStatus, ClaimType, Decision, ExportAuditRecord, ExtractedClaim, FlagOrigin,
    GenerationMetadata, ProposalRecord, RfpRequirement, RiskLevel, SectionCoverage,
    SectionRecord, TextSpan, VerifiedClaim,
};
use crate::store::ProposalStore;
use crate::store::schema::{check_schema_version, configure_connection, ensure_schema};
use crate::util::{ensure_directory, now_utc_string};

/// Single-connection SQLite store. The mutex serializes every read and write.
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_directory(parent)?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open database: {}", path.display()))?;
        configure_connection(&connection)?;
        Self::initialize(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys")?;
        Self::initialize(connection)
    }

    fn initialize(connection: Connection) -> Result<Self> {
        check_schema_version(&connection)?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    pub fn metadata_value(&self, key: &str) -> Result<Option<String>> {
        let connection = self.lock()?;
        connection
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read metadata key {key}"))
    }

    pub fn count_rows(&self, table: &str) -> Result<usize> {
        let connection = self.lock()?;
        let count: i64 = connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(to_usize(count))
    }
}

pub(crate) fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn optional_i64(value: Option<usize>) -> Option<i64> {
    value.map(to_i64)
}

fn optional_usize(value: Option<i64>) -> Option<usize> {
    value.map(to_usize)
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {what}"))
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to parse stored {what}"))
}

fn section_from_row(row: &Row<'_>) -> rusqlite::Result<SectionRecord> {
    Ok(SectionRecord {
        section_id: row.get(0)?,
        proposal_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        content: row.get(4)?,
        required: row.get(5)?,
        word_limit: optional_usize(row.get(6)?),
        char_limit: optional_usize(row.get(7)?),
        used_generic_knowledge: row.get(8)?,
        order_index: row.get(9)?,
    })
}

/// Content of `section_id` as currently stored, if the section exists.
fn stored_content(tx: &Transaction<'_>, section_id: &str) -> Result<Option<String>> {
    tx.query_row(
        "SELECT content FROM sections WHERE section_id = ?1",
        [section_id],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to read content of section {section_id}"))
}

/// Drops the attribution, coverage and claims derived from a section's previous content.
fn clear_derived_rows(tx: &Transaction<'_>, section_id: &str) -> Result<()> {
    for table in ["verified_claims", "paragraph_attributions", "section_coverage"] {
        tx.execute(&format!("DELETE FROM {table} WHERE section_id = ?1"), [section_id])
            .with_context(|| format!("failed to clear {table} for section {section_id}"))?;
    }
    debug!(section_id, "section content changed; cleared derived rows");
    Ok(())
}

const SECTION_COLUMNS: &str = "section_id, proposal_id, name, description, content, required, \
     word_limit, char_limit, used_generic_knowledge, order_index";

struct RawParagraph {
    paragraph_id: String,
    section_id: String,
    proposal_id: String,
    index: i64,
    text: String,
    status: String,
    best_similarity: f64,
    sources_json: String,
    flags_json: String,
}

impl RawParagraph {
    fn into_paragraph(self) -> Result<AttributedParagraph> {
        let Some(status) = AttributionStatus::parse(&self.status) else {
            bail!(
                "unknown attribution status '{}' for paragraph {}",
                self.status,
                self.paragraph_id
            );
        };
        Ok(AttributedParagraph {
            sources: from_json(&self.sources_json, "paragraph sources")?,
            flags: from_json(&self.flags_json, "paragraph flags")?,
            paragraph_id: self.paragraph_id,
            section_id: self.section_id,
            proposal_id: self.proposal_id,
            index: to_usize(self.index),
            text: self.text,
            status,
            best_similarity: self.best_similarity,
        })
    }
}

struct RawClaim {
    claim_id: String,
    proposal_id: String,
    section_id: String,
    paragraph_id: String,
    claim_type: String,
    value: String,
    context: String,
    start: i64,
    end: i64,
    risk_level: String,
    status: String,
    evidence_json: String,
    verification_score: f64,
}

impl RawClaim {
    fn into_claim(self) -> Result<VerifiedClaim> {
        let (Some(claim_type), Some(risk_level), Some(status)) = (
            ClaimType::parse(&self.claim_type),
            RiskLevel::parse(&self.risk_level),
            ClaimStatus::parse(&self.status),
        ) else {
            bail!("claim {} has an unknown type, risk or status", self.claim_id);
        };
        Ok(VerifiedClaim {
            evidence: from_json(&self.evidence_json, "claim evidence")?,
            claim_id: self.claim_id,
            proposal_id: self.proposal_id,
            section_id: self.section_id,
            paragraph_id: self.paragraph_id,
            claim: ExtractedClaim {
                claim_type,
                value: self.value,
                context: self.context,
                position: TextSpan {
                    start: to_usize(self.start),
                    end: to_usize(self.end),
                },
                risk_level,
            },
            status,
            verification_score: self.verification_score,
        })
    }
}

struct RawFlag {
    flag_id: String,
    proposal_id: String,
    ambiguity_type: String,
    description: String,
    source_texts_json: String,
    suggested_resolutions_json: String,
    requires_user_input: bool,
    resolved: bool,
    resolution: Option<String>,
    resolved_by: Option<String>,
    resolved_at: Option<String>,
    origin: String,
}

impl RawFlag {
    fn into_flag(self) -> Result<AmbiguityFlag> {
        let (Some(ambiguity_type), Some(origin)) = (
            AmbiguityType::parse(&self.ambiguity_type),
            FlagOrigin::parse(&self.origin),
        ) else {
            bail!("ambiguity flag {} has an unknown type or origin", self.flag_id);
        };
        Ok(AmbiguityFlag {
            source_texts: from_json(&self.source_texts_json, "flag source texts")?,
            suggested_resolutions: from_json(
                &self.suggested_resolutions_json,
                "flag suggested resolutions",
            )?,
            flag_id: self.flag_id,
            proposal_id: self.proposal_id,
            ambiguity_type,
            description: self.description,
            requires_user_input: self.requires_user_input,
            resolved: self.resolved,
            resolution: self.resolution,
            resolved_by: self.resolved_by,
            resolved_at: self.resolved_at,
            origin,
        })
    }
}

const FLAG_COLUMNS: &str = "flag_id, proposal_id, ambiguity_type, description, source_texts_json, \
     suggested_resolutions_json, requires_user_input, resolved, resolution, resolved_by, \
     resolved_at, origin";

fn flag_from_row(row: &Row<'_>) -> rusqlite::Result<RawFlag> {
    Ok(RawFlag {
        flag_id: row.get(0)?,
        proposal_id: row.get(1)?,
        ambiguity_type: row.get(2)?,
        description: row.get(3)?,
        source_texts_json: row.get(4)?,
        suggested_resolutions_json: row.get(5)?,
        requires_user_input: row.get(6)?,
        resolved: row.get(7)?,
        resolution: row.get(8)?,
        resolved_by: row.get(9)?,
        resolved_at: row.get(10)?,
        origin: row.get(11)?,
    })
}

struct RawAudit {
    audit_id: String,
    proposal_id: String,
    user_id: String,
    format: String,
    created_at: String,
    decision: String,
    blocks_json: String,
    warnings_json: String,
    attestation_required: bool,
    snapshot_json: String,
    evaluation_failed: bool,
}

impl RawAudit {
    fn into_record(self) -> Result<ExportAuditRecord> {
        let Some(decision) = Decision::parse(&self.decision) else {
            bail!(
                "unknown decision '{}' on audit {}",
                self.decision,
                self.audit_id
            );
        };
        Ok(ExportAuditRecord {
            blocks: from_json(&self.blocks_json, "audit blocks")?,
            warnings: from_json(&self.warnings_json, "audit warnings")?,
            enforcement_snapshot: from_json(&self.snapshot_json, "audit snapshot")?,
            audit_id: self.audit_id,
            proposal_id: self.proposal_id,
            user_id: self.user_id,
            format: self.format,
            created_at: self.created_at,
            decision,
            attestation_required: self.attestation_required,
            evaluation_failed: self.evaluation_failed,
        })
    }
}

const AUDIT_COLUMNS: &str = "audit_id, proposal_id, user_id, format, created_at, decision, \
     blocks_json, warnings_json, attestation_required, enforcement_snapshot_json, evaluation_failed";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<RawAudit> {
    Ok(RawAudit {
        audit_id: row.get(0)?,
        proposal_id: row.get(1)?,
        user_id: row.get(2)?,
        format: row.get(3)?,
        created_at: row.get(4)?,
        decision: row.get(5)?,
        blocks_json: row.get(6)?,
        warnings_json: row.get(7)?,
        attestation_required: row.get(8)?,
        snapshot_json: row.get(9)?,
        evaluation_failed: row.get(10)?,
    })
}

impl ProposalStore for SqliteStore {
    fn load_proposal(&self, proposal_id: &str) -> Result<ProposalRecord> {
        let connection = self.lock()?;
        let proposal = connection
            .query_row(
                "SELECT proposal_id, organization_id, title, enforcement_failed
                 FROM proposals WHERE proposal_id = ?1",
                [proposal_id],
                |row| {
                    Ok(ProposalRecord {
                        proposal_id: row.get(0)?,
                        organization_id: row.get(1)?,
                        title: row.get(2)?,
                        enforcement_failed: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load proposal {proposal_id}"))?;

        proposal.with_context(|| format!("proposal not found: {proposal_id}"))
    }

    fn upsert_proposal(&self, proposal: &ProposalRecord) -> Result<()> {
        let connection = self.lock()?;
        connection
            .execute(
                "
                INSERT INTO proposals(proposal_id, organization_id, title, enforcement_failed, updated_at)
                VALUES(?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(proposal_id) DO UPDATE SET
                  organization_id=excluded.organization_id,
                  title=excluded.title,
                  enforcement_failed=excluded.enforcement_failed,
                  updated_at=excluded.updated_at
                ",
                params![
                    proposal.proposal_id,
                    proposal.organization_id,
                    proposal.title,
                    proposal.enforcement_failed,
                    now_utc_string()
                ],
            )
            .with_context(|| format!("failed to upsert proposal {}", proposal.proposal_id))?;
        Ok(())
    }

    fn set_enforcement_failed(&self, proposal_id: &str, failed: bool) -> Result<()> {
        let connection = self.lock()?;
        let updated = connection
            .execute(
                "UPDATE proposals SET enforcement_failed = ?2, updated_at = ?3 WHERE proposal_id = ?1",
                params![proposal_id, failed, now_utc_string()],
            )
            .with_context(|| format!("failed to flag proposal {proposal_id}"))?;
        if updated == 0 {
            bail!("proposal not found: {proposal_id}");
        }
        Ok(())
    }

    fn load_sections(&self, proposal_id: &str) -> Result<Vec<SectionRecord>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {SECTION_COLUMNS} FROM sections WHERE proposal_id = ?1
             ORDER BY order_index, section_id"
        ))?;
        let sections = statement
            .query_map([proposal_id], section_from_row)?
            .collect::<rusqlite::Result<Vec<SectionRecord>>>()
            .with_context(|| format!("failed to load sections for {proposal_id}"))?;
        Ok(sections)
    }

    fn load_section(&self, section_id: &str) -> Result<SectionRecord> {
        let connection = self.lock()?;
        let section = connection
            .query_row(
                &format!("SELECT {SECTION_COLUMNS} FROM sections WHERE section_id = ?1"),
                [section_id],
                section_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load section {section_id}"))?;
        section.with_context(|| format!("section not found: {section_id}"))
    }

    fn upsert_section(&self, section: &SectionRecord) -> Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        let previous = stored_content(&tx, &section.section_id)?;
        tx.execute(
            "
            INSERT INTO sections(
              section_id, proposal_id, name, description, content, required,
              word_limit, char_limit, used_generic_knowledge, order_index, updated_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(section_id) DO UPDATE SET
              proposal_id=excluded.proposal_id,
              name=excluded.name,
              description=excluded.description,
              content=excluded.content,
              required=excluded.required,
              word_limit=excluded.word_limit,
              char_limit=excluded.char_limit,
              used_generic_knowledge=excluded.used_generic_knowledge,
              order_index=excluded.order_index,
              updated_at=excluded.updated_at
            ",
            params![
                section.section_id,
                section.proposal_id,
                section.name,
                section.description,
                section.content,
                section.required,
                optional_i64(section.word_limit),
                optional_i64(section.char_limit),
                section.used_generic_knowledge,
                section.order_index,
                now_utc_string()
            ],
        )
        .with_context(|| format!("failed to upsert section {}", section.section_id))?;
        if previous.is_some_and(|content| content != section.content) {
            clear_derived_rows(&tx, &section.section_id)?;
        }
        tx.commit()
            .with_context(|| format!("failed to upsert section {}", section.section_id))?;
        Ok(())
    }

    fn update_section_content(
        &self,
        section_id: &str,
        content: &str,
        used_generic_knowledge: bool,
    ) -> Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        let Some(previous) = stored_content(&tx, section_id)? else {
            bail!("section not found: {section_id}");
        };
        tx.execute(
            "UPDATE sections SET content = ?2, used_generic_knowledge = ?3, updated_at = ?4
             WHERE section_id = ?1",
            params![section_id, content, used_generic_knowledge, now_utc_string()],
        )
        .with_context(|| format!("failed to update content of section {section_id}"))?;
        if previous != content {
            clear_derived_rows(&tx, section_id)?;
        }
        tx.commit()
            .with_context(|| format!("failed to update content of section {section_id}"))?;
        Ok(())
    }

    fn load_rfp_requirements(&self, proposal_id: &str) -> Result<Vec<RfpRequirement>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT section_name, required, word_limit, char_limit
             FROM rfp_requirements WHERE proposal_id = ?1 ORDER BY section_name",
        )?;
        let requirements = statement
            .query_map([proposal_id], |row| {
                Ok(RfpRequirement {
                    section_name: row.get(0)?,
                    required: row.get(1)?,
                    word_limit: optional_usize(row.get(2)?),
                    char_limit: optional_usize(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<RfpRequirement>>>()
            .with_context(|| format!("failed to load RFP requirements for {proposal_id}"))?;
        Ok(requirements)
    }

    fn replace_rfp_requirements(
        &self,
        proposal_id: &str,
        requirements: &[RfpRequirement],
    ) -> Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        tx.execute(
            "DELETE FROM rfp_requirements WHERE proposal_id = ?1",
            [proposal_id],
        )?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO rfp_requirements(proposal_id, section_name, required, word_limit, char_limit)
                VALUES(?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(proposal_id, section_name) DO UPDATE SET
                  required=excluded.required,
                  word_limit=excluded.word_limit,
                  char_limit=excluded.char_limit
                ",
            )?;
            for requirement in requirements {
                statement.execute(params![
                    proposal_id,
                    requirement.section_name,
                    requirement.required,
                    optional_i64(requirement.word_limit),
                    optional_i64(requirement.char_limit)
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to replace RFP requirements for {proposal_id}"))?;
        Ok(())
    }

    fn save_generation_metadata(&self, metadata: &GenerationMetadata) -> Result<()> {
        let connection = self.lock()?;
        connection
            .execute(
                "
                INSERT INTO generation_metadata(
                  proposal_id, section_id, retrieved_chunk_count, relevant_chunk_count,
                  used_generic_knowledge, similarity_min, similarity_max, similarity_avg,
                  claims_replaced, paragraphs_placeholdered, policy_override, refused, created_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
                params![
                    metadata.proposal_id,
                    metadata.section_id,
                    to_i64(metadata.retrieved_chunk_count),
                    to_i64(metadata.relevant_chunk_count),
                    metadata.used_generic_knowledge,
                    metadata.similarity_min,
                    metadata.similarity_max,
                    metadata.similarity_avg,
                    to_i64(metadata.claims_replaced),
                    to_i64(metadata.paragraphs_placeholdered),
                    metadata.policy_override,
                    metadata.refused,
                    metadata.created_at
                ],
            )
            .context("failed to persist generation metadata")?;
        Ok(())
    }

    fn load_generation_metadata(&self, proposal_id: &str) -> Result<Vec<GenerationMetadata>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "
            SELECT proposal_id, section_id, retrieved_chunk_count, relevant_chunk_count,
                   used_generic_knowledge, similarity_min, similarity_max, similarity_avg,
                   claims_replaced, paragraphs_placeholdered, policy_override, refused, created_at
            FROM generation_metadata
            WHERE proposal_id = ?1
            ORDER BY id
            ",
        )?;
        let rows = statement
            .query_map([proposal_id], |row| {
                Ok(GenerationMetadata {
                    proposal_id: row.get(0)?,
                    section_id: row.get(1)?,
                    retrieved_chunk_count: to_usize(row.get(2)?),
                    relevant_chunk_count: to_usize(row.get(3)?),
                    used_generic_knowledge: row.get(4)?,
                    similarity_min: row.get(5)?,
                    similarity_max: row.get(6)?,
                    similarity_avg: row.get(7)?,
                    claims_replaced: to_usize(row.get(8)?),
                    paragraphs_placeholdered: to_usize(row.get(9)?),
                    policy_override: row.get(10)?,
                    refused: row.get(11)?,
                    created_at: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<GenerationMetadata>>>()
            .with_context(|| format!("failed to load generation metadata for {proposal_id}"))?;
        Ok(rows)
    }

    fn replace_section_attribution(
        &self,
        section_id: &str,
        paragraphs: &[AttributedParagraph],
        coverage: &SectionCoverage,
    ) -> Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;

        let previous: Vec<(String, String)> = {
            let mut statement = tx.prepare(
                "SELECT paragraph_id, text FROM paragraph_attributions WHERE section_id = ?1",
            )?;
            statement
                .query_map([section_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()
                .with_context(|| format!("failed to read paragraphs of section {section_id}"))?
        };
        for (paragraph_id, text) in &previous {
            let unchanged = paragraphs
                .iter()
                .any(|paragraph| &paragraph.paragraph_id == paragraph_id && &paragraph.text == text);
            if !unchanged {
                tx.execute(
                    "DELETE FROM verified_claims WHERE paragraph_id = ?1",
                    [paragraph_id],
                )?;
            }
        }

        tx.execute(
            "DELETE FROM paragraph_attributions WHERE section_id = ?1",
            [section_id],
        )?;
        tx.execute(
            "DELETE FROM section_coverage WHERE section_id = ?1",
            [section_id],
        )?;

        {
            let mut statement = tx.prepare(
                "
                INSERT INTO paragraph_attributions(
                  paragraph_id, section_id, proposal_id, paragraph_index, text, status,
                  best_similarity, sources_json, flags_json
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
            )?;
            for paragraph in paragraphs {
                statement.execute(params![
                    paragraph.paragraph_id,
                    section_id,
                    paragraph.proposal_id,
                    to_i64(paragraph.index),
                    paragraph.text,
                    paragraph.status.as_str(),
                    paragraph.best_similarity,
                    to_json(&paragraph.sources, "paragraph sources")?,
                    to_json(&paragraph.flags, "paragraph flags")?
                ])?;
            }
        }

        tx.execute(
            "
            INSERT INTO section_coverage(
              section_id, proposal_id, section_name, coverage_score, total_paragraphs,
              grounded, partial, ungrounded, failed, source_documents_json, computed_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                section_id,
                coverage.proposal_id,
                coverage.section_name,
                i64::from(coverage.coverage_score),
                to_i64(coverage.total_paragraphs),
                to_i64(coverage.grounded),
                to_i64(coverage.partial),
                to_i64(coverage.ungrounded),
                to_i64(coverage.failed),
                to_json(&coverage.source_documents, "source contributions")?,
                coverage.computed_at
            ],
        )?;

        tx.commit()
            .with_context(|| format!("failed to replace attribution for section {section_id}"))?;
        debug!(
            section_id,
            paragraphs = paragraphs.len(),
            coverage = coverage.coverage_score,
            "replaced section attribution"
        );
        Ok(())
    }

    fn load_section_coverages(&self, proposal_id: &str) -> Result<Vec<SectionCoverage>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "
            SELECT c.section_id, c.proposal_id, c.section_name, c.coverage_score,
                   c.total_paragraphs, c.grounded, c.partial, c.ungrounded, c.failed,
                   c.source_documents_json, c.computed_at
            FROM section_coverage c
            LEFT JOIN sections s ON s.section_id = c.section_id
            WHERE c.proposal_id = ?1
            ORDER BY COALESCE(s.order_index, 0), c.section_id
            ",
        )?;
        let mut rows = statement.query([proposal_id])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_sources: String = row.get(9)?;
            out.push(SectionCoverage {
                section_id: row.get(0)?,
                proposal_id: row.get(1)?,
                section_name: row.get(2)?,
                coverage_score: u32::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                total_paragraphs: to_usize(row.get(4)?),
                grounded: to_usize(row.get(5)?),
                partial: to_usize(row.get(6)?),
                ungrounded: to_usize(row.get(7)?),
                failed: to_usize(row.get(8)?),
                source_documents: from_json(&raw_sources, "source contributions")?,
                computed_at: row.get(10)?,
            });
        }
        Ok(out)
    }

    fn load_attributed_paragraphs(&self, proposal_id: &str) -> Result<Vec<AttributedParagraph>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "
            SELECT p.paragraph_id, p.section_id, p.proposal_id, p.paragraph_index, p.text,
                   p.status, p.best_similarity, p.sources_json, p.flags_json
            FROM paragraph_attributions p
            LEFT JOIN sections s ON s.section_id = p.section_id
            WHERE p.proposal_id = ?1
            ORDER BY COALESCE(s.order_index, 0), p.section_id, p.paragraph_index
            ",
        )?;
        let raw = statement
            .query_map([proposal_id], |row| {
                Ok(RawParagraph {
                    paragraph_id: row.get(0)?,
                    section_id: row.get(1)?,
                    proposal_id: row.get(2)?,
                    index: row.get(3)?,
                    text: row.get(4)?,
                    status: row.get(5)?,
                    best_similarity: row.get(6)?,
                    sources_json: row.get(7)?,
                    flags_json: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<RawParagraph>>>()
            .with_context(|| format!("failed to load paragraphs for {proposal_id}"))?;

        raw.into_iter().map(RawParagraph::into_paragraph).collect()
    }

    fn replace_paragraph_claims(
        &self,
        paragraph_id: &str,
        claims: &[VerifiedClaim],
    ) -> Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        tx.execute(
            "DELETE FROM verified_claims WHERE paragraph_id = ?1",
            [paragraph_id],
        )?;
        {
            let mut statement = tx.prepare(
                "
                INSERT OR REPLACE INTO verified_claims(
                  claim_id, proposal_id, section_id, paragraph_id, claim_type, value, context,
                  start_offset, end_offset, risk_level, status, evidence_json, verification_score
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
            )?;
            for claim in claims {
                statement.execute(params![
                    claim.claim_id,
                    claim.proposal_id,
                    claim.section_id,
                    paragraph_id,
                    claim.claim.claim_type.as_str(),
                    claim.claim.value,
                    claim.claim.context,
                    to_i64(claim.claim.position.start),
                    to_i64(claim.claim.position.end),
                    claim.claim.risk_level.as_str(),
                    claim.status.as_str(),
                    to_json(&claim.evidence, "claim evidence")?,
                    claim.verification_score
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to replace claims for paragraph {paragraph_id}"))?;
        Ok(())
    }

    fn load_verified_claims(&self, proposal_id: &str) -> Result<Vec<VerifiedClaim>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "
            SELECT claim_id, proposal_id, section_id, paragraph_id, claim_type, value, context,
                   start_offset, end_offset, risk_level, status, evidence_json, verification_score
            FROM verified_claims
            WHERE proposal_id = ?1
            ORDER BY paragraph_id, start_offset, claim_type
            ",
        )?;
        let raw = statement
            .query_map([proposal_id], |row| {
                Ok(RawClaim {
                    claim_id: row.get(0)?,
                    proposal_id: row.get(1)?,
                    section_id: row.get(2)?,
                    paragraph_id: row.get(3)?,
                    claim_type: row.get(4)?,
                    value: row.get(5)?,
                    context: row.get(6)?,
                    start: row.get(7)?,
                    end: row.get(8)?,
                    risk_level: row.get(9)?,
                    status: row.get(10)?,
                    evidence_json: row.get(11)?,
                    verification_score: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<RawClaim>>>()
            .with_context(|| format!("failed to load verified claims for {proposal_id}"))?;

        raw.into_iter().map(RawClaim::into_claim).collect()
    }

    fn replace_ambiguity_flags(&self, proposal_id: &str, flags: &[AmbiguityFlag]) -> Result<()> {
        let mut connection = self.lock()?;
        let tx = connection.transaction()?;
        tx.execute(
            "DELETE FROM ambiguity_flags WHERE proposal_id = ?1",
            [proposal_id],
        )?;
        {
            let mut statement = tx.prepare(
                "
                INSERT OR REPLACE INTO ambiguity_flags(
                  flag_id, proposal_id, flag_index, ambiguity_type, description, source_texts_json,
                  suggested_resolutions_json, requires_user_input, resolved, resolution,
                  resolved_by, resolved_at, origin
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
            )?;
            for (index, flag) in flags.iter().enumerate() {
                statement.execute(params![
                    flag.flag_id,
                    proposal_id,
                    to_i64(index),
                    flag.ambiguity_type.as_str(),
                    flag.description,
                    to_json(&flag.source_texts, "flag source texts")?,
                    to_json(&flag.suggested_resolutions, "flag suggested resolutions")?,
                    flag.requires_user_input,
                    flag.resolved,
                    flag.resolution,
                    flag.resolved_by,
                    flag.resolved_at,
                    flag.origin.as_str()
                ])?;
            }
        }
        tx.commit()
            .with_context(|| format!("failed to replace ambiguity flags for {proposal_id}"))?;
        Ok(())
    }

    fn load_ambiguity_flags(&self, proposal_id: &str) -> Result<Vec<AmbiguityFlag>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {FLAG_COLUMNS} FROM ambiguity_flags WHERE proposal_id = ?1 ORDER BY flag_index"
        ))?;
        let raw = statement
            .query_map([proposal_id], flag_from_row)?
            .collect::<rusqlite::Result<Vec<RawFlag>>>()
            .with_context(|| format!("failed to load ambiguity flags for {proposal_id}"))?;

        raw.into_iter().map(RawFlag::into_flag).collect()
    }

    fn resolve_ambiguity_flag(
        &self,
        flag_id: &str,
        resolution: &str,
        resolved_by: &str,
        resolved_at: &str,
    ) -> Result<AmbiguityFlag> {
        let connection = self.lock()?;
        let updated = connection
            .execute(
                "UPDATE ambiguity_flags
                 SET resolved = 1, resolution = ?2, resolved_by = ?3, resolved_at = ?4
                 WHERE flag_id = ?1",
                params![flag_id, resolution, resolved_by, resolved_at],
            )
            .with_context(|| format!("failed to resolve ambiguity flag {flag_id}"))?;
        if updated == 0 {
            bail!("ambiguity flag not found: {flag_id}");
        }

        let raw = connection
            .query_row(
                &format!("SELECT {FLAG_COLUMNS} FROM ambiguity_flags WHERE flag_id = ?1"),
                [flag_id],
                flag_from_row,
            )
            .with_context(|| format!("failed to reload ambiguity flag {flag_id}"))?;
        raw.into_flag()
    }

    fn append_export_audit(&self, record: &ExportAuditRecord) -> Result<()> {
        let connection = self.lock()?;
        connection
            .execute(
                "
                INSERT INTO export_audits(
                  audit_id, proposal_id, user_id, format, created_at, decision, blocks_json,
                  warnings_json, attestation_required, enforcement_snapshot_json, evaluation_failed
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ",
                params![
                    record.audit_id,
                    record.proposal_id,
                    record.user_id,
                    record.format,
                    record.created_at,
                    record.decision.as_str(),
                    to_json(&record.blocks, "audit blocks")?,
                    to_json(&record.warnings, "audit warnings")?,
                    record.attestation_required,
                    to_json(&record.enforcement_snapshot, "audit snapshot")?,
                    record.evaluation_failed
                ],
            )
            .with_context(|| format!("failed to append export audit {}", record.audit_id))?;
        Ok(())
    }

    fn load_export_audit(&self, audit_id: &str) -> Result<Option<ExportAuditRecord>> {
        let connection = self.lock()?;
        let raw = connection
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM export_audits WHERE audit_id = ?1"),
                [audit_id],
                audit_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load export audit {audit_id}"))?;
        raw.map(RawAudit::into_record).transpose()
    }

    fn list_export_audits(&self, proposal_id: &str) -> Result<Vec<ExportAuditRecord>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM export_audits WHERE proposal_id = ?1
             ORDER BY created_at, rowid"
        ))?;
        let raw = statement
            .query_map([proposal_id], audit_from_row)?
            .collect::<rusqlite::Result<Vec<RawAudit>>>()
            .with_context(|| format!("failed to list export audits for {proposal_id}"))?;

        raw.into_iter().map(RawAudit::into_record).collect()
    }

    fn append_attestation(&self, attestation: &AttestationRecord) -> Result<()> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO export_attestations(audit_id, user_id, attestation_text, attested_at)
                 VALUES(?1, ?2, ?3, ?4)",
                params![
                    attestation.audit_id,
                    attestation.user_id,
                    attestation.attestation_text,
                    attestation.attested_at
                ],
            )
            .with_context(|| format!("failed to record attestation for {}", attestation.audit_id))?;
        Ok(())
    }

    fn load_attestations(&self, audit_id: &str) -> Result<Vec<AttestationRecord>> {
        let connection = self.lock()?;
        let mut statement = connection.prepare(
            "SELECT audit_id, user_id, attestation_text, attested_at
             FROM export_attestations WHERE audit_id = ?1 ORDER BY id",
        )?;
        let rows = statement
            .query_map([audit_id], |row| {
                Ok(AttestationRecord {
                    audit_id: row.get(0)?,
                    user_id: row.get(1)?,
                    attestation_text: row.get(2)?,
                    attested_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<AttestationRecord>>>()
            .with_context(|| format!("failed to load attestations for {audit_id}"))?;
        Ok(rows)
    }
}
