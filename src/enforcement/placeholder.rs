use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Placeholder, PlaceholderType, TextSpan};
use crate::text::normalize_whitespace;
use crate::util::short_digest;

const PLACEHOLDER_ID_LEN: usize = 10;

/// Renders `[[PLACEHOLDER:TYPE:DESCRIPTION:ID]]`.
///
/// Brackets and line breaks are removed from the description and characters outside
/// `[A-Za-z0-9_-]` from the id, since either would break detection.
pub fn create_placeholder(placeholder_type: PlaceholderType, description: &str, id: &str) -> String {
    format!(
        "[[PLACEHOLDER:{}:{}:{}]]",
        placeholder_type.as_str(),
        clean_description(description),
        clean_id(id)
    )
}

/// Deterministic id, so identical enforcement runs render identical tokens.
pub fn placeholder_id(placeholder_type: PlaceholderType, description: &str, ordinal: usize) -> String {
    format!(
        "ph-{}",
        short_digest(
            &[
                placeholder_type.as_str(),
                &clean_description(description),
                &ordinal.to_string()
            ],
            PLACEHOLDER_ID_LEN
        )
    )
}

fn clean_description(description: &str) -> String {
    normalize_whitespace(&description.replace(['[', ']'], " "))
}

fn clean_id(id: &str) -> String {
    id.chars()
        .filter(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '-'))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderCounts {
    pub missing_data: usize,
    pub user_input_required: usize,
    pub verification_needed: usize,
}

impl PlaceholderCounts {
    pub fn blocking(&self) -> usize {
        self.missing_data + self.user_input_required
    }

    pub fn total(&self) -> usize {
        self.blocking() + self.verification_needed
    }

    pub fn add(&mut self, other: &PlaceholderCounts) {
        self.missing_data += other.missing_data;
        self.user_input_required += other.user_input_required;
        self.verification_needed += other.verification_needed;
    }
}

/// Finds enforced and legacy placeholder tokens in content.
pub struct PlaceholderScanner {
    enforced: Regex,
    legacy: Regex,
}

impl PlaceholderScanner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            enforced: Regex::new(
                r"\[\[PLACEHOLDER:(MISSING_DATA|USER_INPUT_REQUIRED|VERIFICATION_NEEDED):([^\]\n]*?):([A-Za-z0-9_-]+)\]\]",
            )
            .context("failed to compile enforced placeholder regex")?,
            legacy: Regex::new(r"\[PLACEHOLDER:\s*([^\]\n]*)\]")
                .context("failed to compile legacy placeholder regex")?,
        })
    }

    /// All unresolved placeholders, ordered by position.
    pub fn detect(&self, text: &str) -> Vec<Placeholder> {
        let mut found = Vec::new();

        for captures in self.enforced.captures_iter(text) {
            let (Some(whole), Some(kind), Some(description), Some(id)) =
                (captures.get(0), captures.get(1), captures.get(2), captures.get(3))
            else {
                continue;
            };
            let Some(placeholder_type) = PlaceholderType::parse(kind.as_str()) else {
                continue;
            };
            found.push(Placeholder {
                placeholder_type,
                description: description.as_str().to_string(),
                id: id.as_str().to_string(),
                suggested_sources: Vec::new(),
                position: TextSpan {
                    start: whole.start(),
                    end: whole.end(),
                },
                resolved: false,
                legacy: false,
            });
        }

        let enforced_spans = found
            .iter()
            .map(|placeholder| placeholder.position)
            .collect::<Vec<TextSpan>>();

        for captures in self.legacy.captures_iter(text) {
            let (Some(whole), Some(description)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let span = TextSpan {
                start: whole.start(),
                end: whole.end(),
            };
            let nested_in_double_bracket =
                span.start > 0 && text.as_bytes().get(span.start - 1) == Some(&b'[');
            if nested_in_double_bracket || enforced_spans.iter().any(|other| other.overlaps(&span)) {
                continue;
            }

            let description = description.as_str().trim().to_string();
            found.push(Placeholder {
                placeholder_type: PlaceholderType::MissingData,
                id: format!(
                    "legacy-{}",
                    short_digest(&[&description, &span.start.to_string()], PLACEHOLDER_ID_LEN)
                ),
                description,
                suggested_sources: Vec::new(),
                position: span,
                resolved: false,
                legacy: true,
            });
        }

        found.sort_by_key(|placeholder| placeholder.position.start);
        found
    }

    pub fn contains_placeholder(&self, text: &str) -> bool {
        !self.detect(text).is_empty()
    }

    pub fn counts(&self, text: &str) -> PlaceholderCounts {
        let mut counts = PlaceholderCounts::default();
        for placeholder in self.detect(text) {
            match placeholder.placeholder_type {
                PlaceholderType::MissingData => counts.missing_data += 1,
                PlaceholderType::UserInputRequired => counts.user_input_required += 1,
                PlaceholderType::VerificationNeeded => counts.verification_needed += 1,
            }
        }
        counts
    }

    /// Text with every placeholder token replaced by `replacement`.
    pub fn replace_all(&self, text: &str, replacement: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for placeholder in self.detect(text) {
            if placeholder.position.start < cursor {
                continue;
            }
            out.push_str(&text[cursor..placeholder.position.start]);
            out.push_str(replacement);
            cursor = placeholder.position.end;
        }
        out.push_str(&text[cursor..]);
        out
    }

    /// Spans of every token, for callers that must not edit inside them.
    pub fn spans(&self, text: &str) -> Vec<TextSpan> {
        self.detect(text)
            .into_iter()
            .map(|placeholder| placeholder.position)
            .collect()
    }
}
