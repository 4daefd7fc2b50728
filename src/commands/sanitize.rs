use std::fs;

use anyhow::{Context, Result, bail};

use grantgate::enforcement::InstructionSanitizer;

use crate::cli::SanitizeArgs;
use crate::commands::Session;

pub fn run(session: &Session, args: SanitizeArgs) -> Result<()> {
    let text = match (args.text, args.input) {
        (Some(text), _) => text,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("pass --text or --input"),
    };

    let sanitizer = InstructionSanitizer::new()?;
    session.emit(&sanitizer.sanitize_custom_instructions(&text))
}
