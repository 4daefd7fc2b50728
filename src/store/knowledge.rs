use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info};

use crate::collaborators::Retriever;
use crate::model::RetrievedChunk;
use crate::store::SqliteStore;
use crate::store::embedding::{EmbeddingModel, cosine_similarity, decode_blob, encode_blob};
use crate::store::sqlite::{to_i64, to_usize};
use crate::text::{content_tokens, count_words, split_paragraphs, word_set};
use crate::util::{now_utc_string, sha256_hex, short_digest};

pub const DEFAULT_CHUNK_WORDS: usize = 180;
const CANDIDATE_MULTIPLIER: usize = 4;
const TERM_WEIGHT: f64 = 0.6;
const SEMANTIC_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub document_id: String,
    pub organization_id: String,
    pub filename: String,
    pub chunk_count: usize,
    pub replaced_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseStats {
    pub documents: usize,
    pub chunks: usize,
    pub embeddings: usize,
}

impl SqliteStore {
    /// Chunks, indexes and embeds one document. Re-ingesting the same filename for an organization
    /// replaces its previous chunks.
    pub fn ingest_document(
        &self,
        organization_id: &str,
        filename: &str,
        document_type: &str,
        text: &str,
        model: &EmbeddingModel,
        chunk_words: usize,
    ) -> Result<IngestedDocument> {
        let document_id = format!("doc-{}", short_digest(&[organization_id, filename], 12));
        let chunks = chunk_text(text, chunk_words);
        let now = now_utc_string();

        let mut connection = self.lock()?;
        let tx = connection.transaction()?;

        let replaced_chunks: i64 = tx.query_row(
            "SELECT COUNT(*) FROM kb_chunks WHERE document_id = ?1",
            [&document_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM kb_chunks_fts WHERE chunk_id IN (SELECT chunk_id FROM kb_chunks WHERE document_id = ?1)",
            [&document_id],
        )?;
        tx.execute(
            "DELETE FROM kb_chunk_embeddings WHERE chunk_id IN (SELECT chunk_id FROM kb_chunks WHERE document_id = ?1)",
            [&document_id],
        )?;
        tx.execute("DELETE FROM kb_chunks WHERE document_id = ?1", [&document_id])?;

        tx.execute(
            "
            INSERT INTO kb_documents(document_id, organization_id, filename, document_type, sha256, ingested_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(document_id) DO UPDATE SET
              document_type=excluded.document_type,
              sha256=excluded.sha256,
              ingested_at=excluded.ingested_at
            ",
            params![
                document_id,
                organization_id,
                filename,
                document_type,
                sha256_hex(text),
                now
            ],
        )?;

        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO kb_chunks(chunk_id, document_id, organization_id, chunk_seq, text)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_fts = tx.prepare(
                "INSERT INTO kb_chunks_fts(chunk_id, organization_id, text) VALUES(?1, ?2, ?3)",
            )?;
            let mut insert_embedding = tx.prepare(
                "
                INSERT INTO kb_chunk_embeddings(chunk_id, model_id, embedding, embedding_dim, text_hash, generated_at)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;

            for (seq, chunk) in chunks.iter().enumerate() {
                let text_hash = sha256_hex(chunk);
                let chunk_id = format!(
                    "kb-{}",
                    short_digest(&[&document_id, &seq.to_string(), &text_hash], 16)
                );
                insert_chunk.execute(params![
                    chunk_id,
                    document_id,
                    organization_id,
                    to_i64(seq),
                    chunk
                ])?;
                insert_fts.execute(params![chunk_id, organization_id, chunk])?;

                let vector = model.embed(chunk);
                insert_embedding.execute(params![
                    chunk_id,
                    model.model_id,
                    encode_blob(&vector),
                    to_i64(vector.len()),
                    text_hash,
                    now
                ])?;
            }
        }

        tx.commit()
            .with_context(|| format!("failed to ingest knowledge-base document {filename}"))?;

        info!(
            organization_id,
            filename,
            document_id = %document_id,
            chunks = chunks.len(),
            "ingested knowledge-base document"
        );

        Ok(IngestedDocument {
            document_id,
            organization_id: organization_id.to_string(),
            filename: filename.to_string(),
            chunk_count: chunks.len(),
            replaced_chunks: to_usize(replaced_chunks),
        })
    }

    pub fn knowledge_base_stats(&self, organization_id: Option<&str>) -> Result<KnowledgeBaseStats> {
        let connection = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            let value: i64 = connection
                .query_row(sql, params![organization_id], |row| row.get(0))
                .context("failed to count knowledge-base rows")?;
            Ok(to_usize(value))
        };

        Ok(KnowledgeBaseStats {
            documents: count(
                "SELECT COUNT(*) FROM kb_documents WHERE ?1 IS NULL OR organization_id = ?1",
            )?,
            chunks: count("SELECT COUNT(*) FROM kb_chunks WHERE ?1 IS NULL OR organization_id = ?1")?,
            embeddings: count(
                "SELECT COUNT(*) FROM kb_chunk_embeddings e
                 JOIN kb_chunks c ON c.chunk_id = e.chunk_id
                 WHERE ?1 IS NULL OR c.organization_id = ?1",
            )?,
        })
    }
}

/// Packs blank-line paragraphs into chunks of at most `max_words`, splitting oversized
/// paragraphs on word boundaries.
pub fn chunk_text(text: &str, max_words: usize) -> Vec<String> {
    let max_words = max_words.max(1);
    let mut chunks = Vec::new();
    let mut current = Vec::<String>::new();
    let mut current_words = 0usize;

    let mut flush = |current: &mut Vec<String>, current_words: &mut usize| {
        if !current.is_empty() {
            chunks.push(current.join("\n\n"));
            current.clear();
            *current_words = 0;
        }
    };

    for paragraph in split_paragraphs(text) {
        let words = count_words(&paragraph);
        if words > max_words {
            flush(&mut current, &mut current_words);
            let tokens = paragraph.split_whitespace().collect::<Vec<&str>>();
            for piece in tokens.chunks(max_words) {
                current.push(piece.join(" "));
                flush(&mut current, &mut current_words);
            }
            continue;
        }
        if current_words + words > max_words {
            flush(&mut current, &mut current_words);
        }
        current.push(paragraph);
        current_words += words;
    }
    flush(&mut current, &mut current_words);

    chunks
}

/// OR-query of the quoted content tokens, so partial matches still surface candidates.
fn to_fts_query(query_text: &str) -> String {
    content_tokens(query_text)
        .into_iter()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .collect::<Vec<String>>()
        .join(" OR ")
}

/// Organization-scoped retrieval over the local knowledge base: FTS5 candidates re-scored by
/// query-term coverage and hash-embedding cosine into `[0, 1]`.
pub struct KnowledgeBaseRetriever<'a> {
    store: &'a SqliteStore,
    model: EmbeddingModel,
}

impl<'a> KnowledgeBaseRetriever<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self {
            store,
            model: EmbeddingModel::default(),
        }
    }
}

impl Retriever for KnowledgeBaseRetriever<'_> {
    fn retrieve(
        &self,
        query: &str,
        organization_id: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let fts_query = to_fts_query(query);
        if fts_query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let query_terms = content_tokens(query);
        let query_vector = self.model.embed(query);

        let connection = self.store.lock()?;
        let mut statement = connection.prepare(
            "
            SELECT c.chunk_id, c.document_id, c.text, d.filename, d.document_type,
                   e.embedding, e.embedding_dim
            FROM kb_chunks_fts
            JOIN kb_chunks c ON c.chunk_id = kb_chunks_fts.chunk_id
            JOIN kb_documents d ON d.document_id = c.document_id
            LEFT JOIN kb_chunk_embeddings e ON e.chunk_id = c.chunk_id AND e.model_id = ?3
            WHERE kb_chunks_fts MATCH ?1 AND c.organization_id = ?2
            ORDER BY bm25(kb_chunks_fts) ASC
            LIMIT ?4
            ",
        )?;
        let mut rows = statement
            .query(params![
                fts_query,
                organization_id,
                self.model.model_id,
                to_i64(top_k.saturating_mul(CANDIDATE_MULTIPLIER))
            ])
            .context("knowledge-base search failed")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let content: String = row.get(2)?;
            let blob: Option<Vec<u8>> = row.get(5)?;
            let dimensions: Option<i64> = row.get(6)?;

            let chunk_words = word_set(&content);
            let coverage = if query_terms.is_empty() {
                0.0
            } else {
                query_terms
                    .iter()
                    .filter(|term| chunk_words.contains(*term))
                    .count() as f64
                    / query_terms.len() as f64
            };
            let semantic = match (blob, dimensions) {
                (Some(blob), Some(dimensions)) => decode_blob(&blob, to_usize(dimensions))
                    .map(|vector| cosine_similarity(&query_vector, &vector).max(0.0))
                    .unwrap_or(0.0),
                _ => cosine_similarity(&query_vector, &self.model.embed(&content)).max(0.0),
            };

            out.push(RetrievedChunk {
                score: (TERM_WEIGHT * coverage + SEMANTIC_WEIGHT * semantic).clamp(0.0, 1.0),
                document_id: row.get(1)?,
                filename: row.get(3)?,
                document_type: row.get(4)?,
                content,
            });
        }

        out.sort_by(|left, right| right.score.total_cmp(&left.score));
        out.truncate(top_k);

        debug!(
            organization_id,
            candidates = out.len(),
            best = out.first().map(|chunk| chunk.score).unwrap_or(0.0),
            "knowledge-base retrieval"
        );
        Ok(out)
    }
}
