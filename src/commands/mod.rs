pub mod ambiguity;
pub mod citations;
pub mod compliance;
pub mod enforce;
pub mod export;
pub mod import;
pub mod ingest_kb;
pub mod sanitize;
pub mod status;
pub mod verify;

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use grantgate::config::{EnforcementConfig, resolve_threshold_preset};
use grantgate::store::SqliteStore;
use grantgate::util::{print_json, write_json_pretty};

use crate::cli::GlobalArgs;

/// Store, thresholds and output destination shared by every subcommand.
pub struct Session {
    pub store: SqliteStore,
    pub config: EnforcementConfig,
    pub db_path: PathBuf,
    output: Option<PathBuf>,
}

impl Session {
    pub fn open(args: &GlobalArgs) -> Result<Self> {
        let preset = args.preset.unwrap_or_else(resolve_threshold_preset);
        let config = EnforcementConfig::load(preset, args.config.as_deref())?;
        let store = SqliteStore::open(&args.db_path)?;
        info!(db_path = %args.db_path.display(), preset = preset.as_str(), "session opened");

        Ok(Self {
            store,
            config,
            db_path: args.db_path.clone(),
            output: args.output.clone(),
        })
    }

    /// Pretty JSON on stdout, and to `--output` when given.
    pub fn emit<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(path) = &self.output {
            write_json_pretty(path, value)?;
            info!(path = %path.display(), "wrote result");
        }
        print_json(value)
    }
}
