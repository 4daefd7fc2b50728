use anyhow::{Context, Result, bail};
use rusqlite::Connection;

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "1.2.0";

pub(super) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys")?;
    Ok(())
}

pub(super) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS proposals (
          proposal_id TEXT PRIMARY KEY,
          organization_id TEXT NOT NULL,
          title TEXT NOT NULL DEFAULT '',
          enforcement_failed INTEGER NOT NULL DEFAULT 0,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sections (
          section_id TEXT PRIMARY KEY,
          proposal_id TEXT NOT NULL,
          name TEXT NOT NULL,
          description TEXT NOT NULL DEFAULT '',
          content TEXT NOT NULL DEFAULT '',
          required INTEGER NOT NULL DEFAULT 0,
          word_limit INTEGER,
          char_limit INTEGER,
          used_generic_knowledge INTEGER NOT NULL DEFAULT 0,
          order_index INTEGER NOT NULL DEFAULT 0,
          updated_at TEXT NOT NULL,
          FOREIGN KEY(proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS rfp_requirements (
          proposal_id TEXT NOT NULL,
          section_name TEXT NOT NULL,
          required INTEGER NOT NULL DEFAULT 1,
          word_limit INTEGER,
          char_limit INTEGER,
          PRIMARY KEY (proposal_id, section_name),
          FOREIGN KEY(proposal_id) REFERENCES proposals(proposal_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS generation_metadata (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          proposal_id TEXT,
          section_id TEXT,
          retrieved_chunk_count INTEGER NOT NULL,
          relevant_chunk_count INTEGER NOT NULL,
          used_generic_knowledge INTEGER NOT NULL,
          similarity_min REAL NOT NULL,
          similarity_max REAL NOT NULL,
          similarity_avg REAL NOT NULL,
          claims_replaced INTEGER NOT NULL,
          paragraphs_placeholdered INTEGER NOT NULL,
          policy_override INTEGER NOT NULL,
          refused INTEGER NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS paragraph_attributions (
          paragraph_id TEXT PRIMARY KEY,
          section_id TEXT NOT NULL,
          proposal_id TEXT NOT NULL,
          paragraph_index INTEGER NOT NULL,
          text TEXT NOT NULL,
          status TEXT NOT NULL,
          best_similarity REAL NOT NULL,
          sources_json TEXT NOT NULL,
          flags_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS section_coverage (
          section_id TEXT PRIMARY KEY,
          proposal_id TEXT NOT NULL,
          section_name TEXT NOT NULL,
          coverage_score INTEGER NOT NULL,
          total_paragraphs INTEGER NOT NULL,
          grounded INTEGER NOT NULL,
          partial INTEGER NOT NULL,
          ungrounded INTEGER NOT NULL,
          failed INTEGER NOT NULL,
          source_documents_json TEXT NOT NULL,
          computed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verified_claims (
          claim_id TEXT PRIMARY KEY,
          proposal_id TEXT NOT NULL,
          section_id TEXT NOT NULL,
          paragraph_id TEXT NOT NULL,
          claim_type TEXT NOT NULL,
          value TEXT NOT NULL,
          context TEXT NOT NULL,
          start_offset INTEGER NOT NULL,
          end_offset INTEGER NOT NULL,
          risk_level TEXT NOT NULL,
          status TEXT NOT NULL,
          evidence_json TEXT NOT NULL,
          verification_score REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ambiguity_flags (
          flag_id TEXT PRIMARY KEY,
          proposal_id TEXT NOT NULL,
          flag_index INTEGER NOT NULL,
          ambiguity_type TEXT NOT NULL,
          description TEXT NOT NULL,
          source_texts_json TEXT NOT NULL,
          suggested_resolutions_json TEXT NOT NULL,
          requires_user_input INTEGER NOT NULL,
          resolved INTEGER NOT NULL DEFAULT 0,
          resolution TEXT,
          resolved_by TEXT,
          resolved_at TEXT,
          origin TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS export_audits (
          audit_id TEXT PRIMARY KEY,
          proposal_id TEXT NOT NULL,
          user_id TEXT NOT NULL,
          format TEXT NOT NULL,
          created_at TEXT NOT NULL,
          decision TEXT NOT NULL,
          blocks_json TEXT NOT NULL,
          warnings_json TEXT NOT NULL,
          attestation_required INTEGER NOT NULL,
          enforcement_snapshot_json TEXT NOT NULL,
          evaluation_failed INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS export_attestations (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          audit_id TEXT NOT NULL,
          user_id TEXT NOT NULL,
          attestation_text TEXT NOT NULL,
          attested_at TEXT NOT NULL,
          FOREIGN KEY(audit_id) REFERENCES export_audits(audit_id)
        );

        CREATE TABLE IF NOT EXISTS kb_documents (
          document_id TEXT PRIMARY KEY,
          organization_id TEXT NOT NULL,
          filename TEXT NOT NULL,
          document_type TEXT NOT NULL DEFAULT '',
          sha256 TEXT NOT NULL,
          ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kb_chunks (
          chunk_id TEXT PRIMARY KEY,
          document_id TEXT NOT NULL,
          organization_id TEXT NOT NULL,
          chunk_seq INTEGER NOT NULL,
          text TEXT NOT NULL,
          FOREIGN KEY(document_id) REFERENCES kb_documents(document_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS kb_chunk_embeddings (
          chunk_id TEXT NOT NULL,
          model_id TEXT NOT NULL,
          embedding BLOB NOT NULL,
          embedding_dim INTEGER NOT NULL,
          text_hash TEXT NOT NULL,
          generated_at TEXT NOT NULL,
          PRIMARY KEY (chunk_id, model_id),
          FOREIGN KEY (chunk_id) REFERENCES kb_chunks(chunk_id) ON DELETE CASCADE
        );
        ",
        )
        .context("failed to create enforcement tables")?;

    connection
        .execute(
            "
            CREATE VIRTUAL TABLE IF NOT EXISTS kb_chunks_fts
            USING fts5(chunk_id UNINDEXED, organization_id UNINDEXED, text)
            ",
            [],
        )
        .context("failed to initialize FTS5 table kb_chunks_fts")?;

    connection
        .execute_batch(
            "
        CREATE INDEX IF NOT EXISTS idx_sections_proposal ON sections(proposal_id, order_index);
        CREATE INDEX IF NOT EXISTS idx_generation_metadata_proposal ON generation_metadata(proposal_id);
        CREATE INDEX IF NOT EXISTS idx_attributions_section ON paragraph_attributions(section_id, paragraph_index);
        CREATE INDEX IF NOT EXISTS idx_attributions_proposal ON paragraph_attributions(proposal_id);
        CREATE INDEX IF NOT EXISTS idx_coverage_proposal ON section_coverage(proposal_id);
        CREATE INDEX IF NOT EXISTS idx_claims_paragraph ON verified_claims(paragraph_id);
        CREATE INDEX IF NOT EXISTS idx_claims_proposal ON verified_claims(proposal_id);
        CREATE INDEX IF NOT EXISTS idx_flags_proposal ON ambiguity_flags(proposal_id, flag_index);
        CREATE INDEX IF NOT EXISTS idx_audits_proposal ON export_audits(proposal_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_attestations_audit ON export_attestations(audit_id);
        CREATE INDEX IF NOT EXISTS idx_kb_chunks_org ON kb_chunks(organization_id);
        CREATE INDEX IF NOT EXISTS idx_kb_chunks_document ON kb_chunks(document_id, chunk_seq);
        ",
        )
        .context("failed to create enforcement indexes")?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

/// Rejects databases written by a newer, incompatible major schema.
pub(super) fn check_schema_version(connection: &Connection) -> Result<()> {
    let existing = connection
        .query_row(
            "SELECT value FROM metadata WHERE key = 'db_schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok();

    let Some(existing) = existing else {
        return Ok(());
    };
    let major = |version: &str| version.split('.').next().unwrap_or("").to_string();
    if major(&existing) != major(DB_SCHEMA_VERSION) {
        bail!(
            "database schema {existing} is incompatible with {DB_SCHEMA_VERSION}; use a fresh --db-path"
        );
    }
    Ok(())
}
