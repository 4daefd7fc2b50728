use std::cmp::Reverse;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::collaborators::{ChatCompletion, parse_json_array};
use crate::model::{ClaimType, ExtractedClaim, TextSpan};
use crate::text::{floor_char_boundary, window_around};

const CONTEXT_RADIUS: usize = 100;
const LLM_TEXT_LIMIT: usize = 8_000;

const UNIT_WORDS: &str = "participants|students|people|individuals|families|households|organizations|partners|members|clients|patients|youth|children|adults|volunteers|staff|employees|schools|sites|communities|residents|veterans|seniors|beneficiaries|attendees|graduates|hours|sessions|workshops|events|programs|projects|counties|cities|meals|trainings|teachers|farmers|businesses|acres|jobs";

/// One claim family: the type it produces, its pattern, and the capture group holding the value
/// (the whole match when `None`).
struct ClaimRule {
    claim_type: ClaimType,
    pattern: Regex,
    value_group: Option<usize>,
}

fn claim_rule_table() -> Vec<(ClaimType, String, Option<usize>)> {
    vec![
        (
            ClaimType::Number,
            format!(
                r"(?i)\b(?:\d{{1,3}}(?:,\d{{3}})+|\d+(?:\.\d+)?)\s+(?:[a-z-]+\s+)?(?:{UNIT_WORDS})\b"
            ),
            None,
        ),
        (
            ClaimType::Percentage,
            r"(?i)\b\d+(?:\.\d+)?\s?(?:%|percent\b)".to_string(),
            None,
        ),
        (
            ClaimType::Currency,
            r"(?i)\$\s?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?(?:\s?(?:million|billion|thousand)\b|[mkb]\b)?|\b\d[\d,]*(?:\.\d+)?\s+(?:(?:million|billion|thousand)\s+)?(?:dollars|usd)\b"
                .to_string(),
            None,
        ),
        (
            ClaimType::Date,
            r"(?i)\b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+(?:\d{1,2},?\s+)?\d{4}\b|\b\d{1,2}/\d{1,2}/\d{2,4}\b"
                .to_string(),
            None,
        ),
        (
            ClaimType::Date,
            r"(?i)\b(?:in|since|by|during|from|until|through)\s+((?:19|20)\d{2})\b".to_string(),
            Some(1),
        ),
        (
            ClaimType::NamedOrg,
            r"\b(?:[Pp]artner(?:ed|ing|s)?|[Cc]ollaborat(?:ed|ing|es)|[Ww]ork(?:s|ed|ing)?|[Cc]ontracted)\s+with\s+(?:the\s+)?([A-Z][\w&'.-]*(?:\s+(?:(?:of|for|and|the)\s+)?[A-Z][\w&'.-]*){0,6})"
                .to_string(),
            Some(1),
        ),
        (
            ClaimType::NamedPerson,
            r"\b(?:Dr|Mr|Mrs|Ms|Prof|Professor)\.?\s+[A-Z][a-z]+(?:\s+[A-Z]\.)?(?:\s+[A-Z][a-z'-]+){0,2}"
                .to_string(),
            None,
        ),
        (
            ClaimType::StaffName,
            r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z'-]+){1,2}),\s+(?:our\s+|the\s+|who\s+serves\s+as\s+(?:our\s+)?)?(?:Executive\s+Director|(?:Program|Project)\s+(?:Director|Manager|Coordinator)|Director|Coordinator|Manager|CEO|President|Founder|Principal\s+Investigator)\b"
                .to_string(),
            Some(1),
        ),
        (
            ClaimType::Outcome,
            r"(?i)\b(?:increased|decreased|reduced|improved|raised|grew|boosted|lowered|cut|expanded)\b[^.\n]{0,80}?\bby\s+\d+(?:\.\d+)?\s?(?:%|percent\b)"
                .to_string(),
            None,
        ),
        (
            ClaimType::Location,
            r"\b(?:[Ii]n|[Aa]cross|[Tt]hroughout|[Ss]erving|[Ss]erves|[Ll]ocated\s+in)\s+((?:[A-Z][a-z]+\s){0,2}[A-Z][a-z]+,\s+(?:[A-Z]{2}\b|[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?))"
                .to_string(),
            Some(1),
        ),
    ]
}

/// Regex-driven extraction of typed factual assertions.
pub struct ClaimExtractor {
    rules: Vec<ClaimRule>,
}

impl ClaimExtractor {
    pub fn new() -> Result<Self> {
        let rules = claim_rule_table()
            .into_iter()
            .map(|(claim_type, pattern, value_group)| {
                Ok(ClaimRule {
                    claim_type,
                    pattern: Regex::new(&pattern).with_context(|| {
                        format!("failed to compile {} claim regex", claim_type.as_str())
                    })?,
                    value_group,
                })
            })
            .collect::<Result<Vec<ClaimRule>>>()?;

        Ok(Self { rules })
    }

    /// Claims in descending start order, so callers can splice replacements back to front.
    pub fn extract_claims(&self, text: &str) -> Vec<ExtractedClaim> {
        let mut claims = Vec::new();

        for rule in &self.rules {
            for captures in rule.pattern.captures_iter(text) {
                let matched = match rule.value_group {
                    Some(group) => captures.get(group),
                    None => captures.get(0),
                };
                let Some(matched) = matched else {
                    continue;
                };

                let Some(span) = trim_span(text, matched.start(), matched.end()) else {
                    continue;
                };
                claims.push(build_claim(text, rule.claim_type, span));
            }
        }

        sort_and_dedup(&mut claims);
        claims
    }

    /// Regex extraction plus the optional model pass.
    pub fn extract_with(
        &self,
        text: &str,
        enhancer: Option<&LlmClaimEnhancer<'_>>,
    ) -> Vec<ExtractedClaim> {
        let claims = self.extract_claims(text);
        match enhancer {
            Some(enhancer) => enhancer.enhance(text, claims),
            None => claims,
        }
    }
}

fn build_claim(text: &str, claim_type: ClaimType, span: TextSpan) -> ExtractedClaim {
    ExtractedClaim {
        claim_type,
        value: text[span.start..span.end].to_string(),
        context: window_around(text, span.start, span.end, CONTEXT_RADIUS).to_string(),
        position: span,
        risk_level: claim_type.risk_level(),
    }
}

/// Drops surrounding whitespace and trailing sentence punctuation from a match.
fn trim_span(text: &str, start: usize, end: usize) -> Option<TextSpan> {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice
        .trim()
        .trim_end_matches(|character: char| matches!(character, '.' | ',' | ';' | ':'));
    if trimmed.is_empty() {
        return None;
    }
    let start = start + leading;
    Some(TextSpan {
        start,
        end: start + trimmed.len(),
    })
}

fn sort_and_dedup(claims: &mut Vec<ExtractedClaim>) {
    claims.sort_by_key(|claim| {
        (
            Reverse(claim.position.start),
            Reverse(claim.position.end),
            claim.claim_type.as_str(),
        )
    });
    claims.dedup_by(|left, right| {
        left.claim_type == right.claim_type && left.position == right.position
    });
}

#[derive(Debug, Deserialize)]
struct LlmEntity {
    #[serde(rename = "type")]
    entity_type: String,
    value: String,
}

/// Model-assisted pass for organizations and outcomes the patterns miss.
pub struct LlmClaimEnhancer<'a> {
    llm: &'a dyn ChatCompletion,
}

impl<'a> LlmClaimEnhancer<'a> {
    pub fn new(llm: &'a dyn ChatCompletion) -> Self {
        Self { llm }
    }

    /// Returns `claims` extended with model-found entities; on any failure returns them unchanged.
    pub fn enhance(&self, text: &str, claims: Vec<ExtractedClaim>) -> Vec<ExtractedClaim> {
        match self.request_entities(text) {
            Ok(entities) => merge_entities(text, claims, entities),
            Err(err) => {
                warn!(error = %err, "claim enhancement failed; using pattern claims only");
                claims
            }
        }
    }

    fn request_entities(&self, text: &str) -> Result<Vec<LlmEntity>> {
        let excerpt = &text[..floor_char_boundary(text, LLM_TEXT_LIMIT)];
        let system_prompt = "You extract factual assertions from grant proposal text. \
            Return only a JSON array of objects with fields \"type\" and \"value\". \
            \"type\" is ORGANIZATION or OUTCOME. \"value\" must be copied verbatim from the text.";
        let user_prompt = format!("Text:\n{excerpt}");

        let response = self
            .llm
            .complete(system_prompt, &user_prompt)
            .context("claim enhancement request failed")?;
        parse_json_array(&response)
    }
}

fn merge_entities(
    text: &str,
    mut claims: Vec<ExtractedClaim>,
    entities: Vec<LlmEntity>,
) -> Vec<ExtractedClaim> {
    let mut added = 0usize;

    for entity in entities {
        let claim_type = match entity.entity_type.trim().to_ascii_uppercase().as_str() {
            "ORGANIZATION" | "NAMED_ORG" => ClaimType::NamedOrg,
            "OUTCOME" => ClaimType::Outcome,
            _ => continue,
        };
        let value = entity.value.trim();
        if value.is_empty() {
            continue;
        }

        for (start, matched) in text.match_indices(value) {
            let span = TextSpan {
                start,
                end: start + matched.len(),
            };
            let covered = claims
                .iter()
                .any(|claim| claim.claim_type == claim_type && claim.position.overlaps(&span));
            if covered {
                continue;
            }
            claims.push(build_claim(text, claim_type, span));
            added += 1;
        }
    }

    debug!(added, "merged model-extracted claims");
    sort_and_dedup(&mut claims);
    claims
}
