use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use grantgate::store::EmbeddingModel;

use crate::cli::IngestKbArgs;
use crate::commands::Session;

pub fn run(session: &Session, args: IngestKbArgs) -> Result<()> {
    let model = EmbeddingModel::default();
    let mut ingested = Vec::with_capacity(args.files.len());

    for path in &args.files {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let document = session.store.ingest_document(
            &args.organization_id,
            &filename,
            &args.document_type,
            &text,
            &model,
            args.chunk_words,
        )?;
        info!(
            organization_id = %args.organization_id,
            document_id = %document.document_id,
            chunks = document.chunk_count,
            replaced = document.replaced_chunks,
            "ingested knowledge-base document"
        );
        ingested.push(document);
    }

    session.emit(&ingested)
}
