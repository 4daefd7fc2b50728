use std::collections::HashSet;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::EvidenceThresholds;
use crate::model::{ClaimType, ExtractedClaim, RetrievedChunk};
use crate::text::{bounded_matches, content_tokens, normalize_whitespace, window_around, word_set};

/// Decides whether retrieved chunks back a claim, rejecting coincidental value collisions.
pub struct EvidenceMatcher {
    thresholds: EvidenceThresholds,
    numeric_token: Regex,
    honorific: Regex,
}

impl EvidenceMatcher {
    pub fn new(thresholds: EvidenceThresholds) -> Result<Self> {
        Ok(Self {
            thresholds,
            numeric_token: Regex::new(r"\d[\d,]*(?:\.\d+)?")
                .context("failed to compile numeric token regex")?,
            honorific: Regex::new(r"^(?:Dr|Mr|Mrs|Ms|Prof|Professor)\.?\s+")
                .context("failed to compile honorific regex")?,
        })
    }

    pub fn is_claim_supported(&self, claim: &ExtractedClaim, chunks: &[RetrievedChunk]) -> bool {
        self.find_support(claim, chunks).is_some()
    }

    /// First chunk satisfying the rule for the claim's type.
    pub fn find_support<'c>(
        &self,
        claim: &ExtractedClaim,
        chunks: &'c [RetrievedChunk],
    ) -> Option<&'c RetrievedChunk> {
        chunks.iter().find(|chunk| self.chunk_supports(claim, chunk))
    }

    fn chunk_supports(&self, claim: &ExtractedClaim, chunk: &RetrievedChunk) -> bool {
        match claim.claim_type {
            ClaimType::NamedPerson | ClaimType::StaffName => {
                let name = self.person_name(&claim.value);
                !name.is_empty() && normalize_whitespace(&chunk.content).contains(&name)
            }
            ClaimType::NamedOrg => {
                let name = normalize_whitespace(&claim.value).to_lowercase();
                !name.is_empty()
                    && normalize_whitespace(&chunk.content)
                        .to_lowercase()
                        .contains(&name)
            }
            _ => self.value_supported_in_context(claim, &chunk.content),
        }
    }

    /// Person value without its honorific, whitespace-normalized.
    pub fn person_name(&self, value: &str) -> String {
        normalize_whitespace(&self.honorific.replace(value.trim(), ""))
    }

    /// Bare number carried by a claim value. Outcome phrases carry it last ("by 25%").
    pub fn claim_number(&self, claim: &ExtractedClaim) -> Option<f64> {
        let mut numbers = self
            .numeric_token
            .find_iter(&claim.value)
            .filter_map(|matched| parse_number(matched.as_str()));
        if claim.claim_type == ClaimType::Outcome {
            numbers.last()
        } else {
            numbers.next()
        }
    }

    /// Every number in `content` with its byte span.
    pub fn numbers_in(&self, content: &str) -> Vec<(f64, usize, usize)> {
        self.numeric_token
            .find_iter(content)
            .filter_map(|matched| {
                parse_number(matched.as_str()).map(|value| (value, matched.start(), matched.end()))
            })
            .collect()
    }

    fn value_supported_in_context(&self, claim: &ExtractedClaim, content: &str) -> bool {
        let occurrences = self.value_occurrences(claim, content);
        if occurrences.is_empty() {
            return false;
        }

        let context = self.context_tokens(claim);
        if context.is_empty() {
            return true;
        }

        occurrences.iter().any(|(start, end)| {
            let window = window_around(content, *start, *end, self.thresholds.context_window_chars);
            let window_words = word_set(window);
            let hits = context
                .iter()
                .filter(|token| window_words.contains(*token))
                .count();
            hits as f64 / context.len() as f64 >= self.thresholds.min_context_overlap
        })
    }

    /// Byte spans in `content` where the claim's value, or its bare number, occurs as a whole token.
    fn value_occurrences(&self, claim: &ExtractedClaim, content: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();

        let needle = claim.value.trim().to_ascii_lowercase();
        if !needle.is_empty() {
            spans.extend(bounded_matches(&content.to_ascii_lowercase(), &needle));
        }

        if let Some(number) = self.claim_number(claim) {
            spans.extend(
                self.numbers_in(content)
                    .into_iter()
                    .filter(|(value, _, _)| numbers_equal(*value, number))
                    .map(|(_, start, end)| (start, end)),
            );
        }

        spans.sort_unstable();
        spans.dedup();
        spans
    }

    /// Non-stopword tokens of the sentence around the claim, minus the value's own tokens.
    fn context_tokens(&self, claim: &ExtractedClaim) -> Vec<String> {
        let value_tokens = word_set(&claim.value);
        let sentence = sentence_containing(&claim.context, &claim.value);
        let mut tokens = content_tokens(sentence);
        if tokens.iter().all(|token| value_tokens.contains(token)) {
            tokens = content_tokens(&claim.context);
        }

        let mut seen = HashSet::new();
        tokens
            .into_iter()
            .filter(|token| !value_tokens.contains(token))
            .filter(|token| !token.chars().all(|character| character.is_ascii_digit()))
            .filter(|token| seen.insert(token.clone()))
            .collect()
    }
}

pub fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").trim_end_matches('.').parse::<f64>().ok()
}

fn numbers_equal(left: f64, right: f64) -> bool {
    (left - right).abs() < 1e-9
}

/// Sentence of `context` that holds `value`, or the whole context when the value is absent.
fn sentence_containing<'a>(context: &'a str, value: &str) -> &'a str {
    let Some(position) = context.find(value) else {
        return context;
    };
    let is_boundary = |character: char| matches!(character, '.' | '!' | '?' | '\n');

    let start = context[..position]
        .rfind(is_boundary)
        .map(|index| index + 1)
        .unwrap_or(0);
    let value_end = position + value.len();
    let end = context[value_end..]
        .find(is_boundary)
        .map(|index| value_end + index)
        .unwrap_or(context.len());

    &context[start..end]
}
