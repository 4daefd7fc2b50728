use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use grantgate::config::ThresholdPreset;

#[derive(Parser, Debug)]
#[command(
    name = "grantgate",
    version,
    about = "Grounding, citation and export enforcement for generated grant proposals"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    #[arg(long, global = true, default_value = ".cache/grantgate/enforcement.sqlite")]
    pub db_path: PathBuf,

    /// JSON file whose threshold fields override the preset.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Threshold preset; falls back to GRANTGATE_THRESHOLD_PRESET, then `current`.
    #[arg(long, global = true, value_enum)]
    pub preset: Option<ThresholdPreset>,

    /// Also write the JSON result to this file.
    #[arg(long, global = true)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    ImportProposal(ImportProposalArgs),
    IngestKb(IngestKbArgs),
    Sanitize(SanitizeArgs),
    Enforce(EnforceArgs),
    MapCitations(MapCitationsArgs),
    Coverage(ProposalArgs),
    VerifyClaims(ProposalArgs),
    Ambiguity(AmbiguityArgs),
    ResolveAmbiguity(ResolveAmbiguityArgs),
    Compliance(ProposalArgs),
    ExportGate(ExportGateArgs),
    Attest(AttestArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProposalArgs {
    #[arg(long)]
    pub proposal_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ImportProposalArgs {
    /// JSON document with `proposal`, `sections` and optional `rfp_requirements`.
    #[arg(long)]
    pub input: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct IngestKbArgs {
    #[arg(long)]
    pub organization_id: String,

    /// Plain-text files; each becomes one knowledge-base document named after the file.
    #[arg(long = "file", required = true)]
    pub files: Vec<PathBuf>,

    #[arg(long, default_value = "document")]
    pub document_type: String,

    #[arg(long, default_value_t = grantgate::store::DEFAULT_CHUNK_WORDS)]
    pub chunk_words: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SanitizeArgs {
    #[arg(long, conflicts_with = "input")]
    pub text: Option<String>,

    #[arg(long)]
    pub input: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EnforceArgs {
    #[arg(long)]
    pub proposal_id: String,

    #[arg(long)]
    pub section_id: String,

    /// Draft produced by the language model for this section.
    #[arg(long)]
    pub draft: PathBuf,

    /// Retrieval query; defaults to the section name and description.
    #[arg(long, default_value = "")]
    pub query: String,

    #[arg(long, default_value = "")]
    pub instructions: String,
}

#[derive(Args, Debug, Clone)]
pub struct MapCitationsArgs {
    #[arg(long)]
    pub proposal_id: String,

    /// Map only this section; every section with content otherwise.
    #[arg(long)]
    pub section_id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AmbiguityArgs {
    #[arg(long)]
    pub proposal_id: String,

    /// RFP instructions as plain text.
    #[arg(long)]
    pub rfp: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveAmbiguityArgs {
    #[arg(long)]
    pub flag_id: String,

    #[arg(long)]
    pub resolution: String,

    #[arg(long)]
    pub resolved_by: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExportFormat {
    Docx,
    Pdf,
    Markdown,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docx => "docx",
            Self::Pdf => "pdf",
            Self::Markdown => "markdown",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExportGateArgs {
    #[arg(long)]
    pub proposal_id: String,

    #[arg(long)]
    pub user_id: String,

    #[arg(long, value_enum, default_value_t = ExportFormat::Docx)]
    pub format: ExportFormat,
}

#[derive(Args, Debug, Clone)]
pub struct AttestArgs {
    #[arg(long)]
    pub audit_id: String,

    #[arg(long)]
    pub user_id: String,

    #[arg(long)]
    pub text: String,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long)]
    pub proposal_id: Option<String>,

    #[arg(long)]
    pub organization_id: Option<String>,
}
