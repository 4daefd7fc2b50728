//! RFP ambiguity detection.
//!
//! A deterministic rule table runs first; an optional model pass adds issues the rules cannot see.
//! Flags carry deterministic ids, so re-analyzing unchanged text keeps earlier resolutions.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::{ChatCompletion, parse_json_array};
use crate::config::AmbiguityThresholds;
use crate::enforcement::evidence::parse_number;
use crate::model::{AmbiguityFlag, AmbiguityType, FlagOrigin};
use crate::store::ProposalStore;
use crate::text::{floor_char_boundary, normalize_whitespace, split_paragraphs};
use crate::util::{now_utc_string, short_digest};

const MAX_SOURCE_TEXTS: usize = 3;

const CONTRADICTORY_PAIRS: &[(&str, &str)] = &[
    ("brief", "comprehensive"),
    ("brief", "detailed"),
    ("concise", "detailed"),
    ("concise", "comprehensive"),
    ("short", "exhaustive"),
    ("summary", "exhaustive"),
    ("high-level", "in-depth"),
];

fn phrase_rule_table() -> Vec<(AmbiguityType, &'static str)> {
    vec![
        (
            AmbiguityType::Vague,
            r"\badequate(?:ly)?\s+(?:budget|funding|detail|staffing|resources|justification)\b",
        ),
        (
            AmbiguityType::Vague,
            r"\bas\s+(?:needed|appropriate|necessary|applicable|required)\b",
        ),
        (
            AmbiguityType::Vague,
            r"\bsufficient\s+(?:detail|information|evidence|documentation)\b",
        ),
        (
            AmbiguityType::Vague,
            r"\breasonable\s+(?:amount|number|budget|costs?|timeline)\b",
        ),
        (
            AmbiguityType::Vague,
            r"\b(?:where|when)\s+(?:possible|feasible|practical)\b",
        ),
        (AmbiguityType::Vague, r"\bif\s+applicable\b"),
        (
            AmbiguityType::Vague,
            r"\b(?:significant|substantial|meaningful)\s+(?:impact|improvement|results?)\b",
        ),
        (AmbiguityType::Implicit, r"\bindustry[\s-]standard\b"),
        (AmbiguityType::Implicit, r"\b(?:usual|standard|customary)\s+format\b"),
        (AmbiguityType::Implicit, r"\bbest\s+practices?\b"),
        (AmbiguityType::Implicit, r"\bas\s+(?:is\s+)?(?:typical|customary|usual)\b"),
        (AmbiguityType::Implicit, r"\bgenerally\s+accepted\b"),
    ]
}

struct PhraseRule {
    ambiguity_type: AmbiguityType,
    pattern: Regex,
}

struct PairRule {
    first: &'static str,
    second: &'static str,
    first_pattern: Regex,
    second_pattern: Regex,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmbiguitySummary {
    pub proposal_id: String,
    pub total_flags: usize,
    pub requires_user_input: usize,
    pub unresolved_blocking: usize,
    pub by_type: BTreeMap<String, usize>,
    pub flags: Vec<AmbiguityFlag>,
}

impl AmbiguitySummary {
    pub fn from_flags(proposal_id: &str, flags: Vec<AmbiguityFlag>) -> Self {
        let mut by_type = BTreeMap::new();
        for flag in &flags {
            *by_type
                .entry(flag.ambiguity_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        Self {
            proposal_id: proposal_id.to_string(),
            total_flags: flags.len(),
            requires_user_input: flags.iter().filter(|flag| flag.requires_user_input).count(),
            unresolved_blocking: flags
                .iter()
                .filter(|flag| flag.requires_user_input && !flag.resolved)
                .count(),
            by_type,
            flags,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LlmIssue {
    #[serde(rename = "type")]
    issue_type: String,
    description: String,
    #[serde(default)]
    source_text: Option<String>,
    #[serde(default)]
    suggested_resolution: Option<String>,
    #[serde(default)]
    requires_user_input: Option<bool>,
}

pub struct AmbiguityDetector<'a> {
    thresholds: AmbiguityThresholds,
    phrases: Vec<PhraseRule>,
    pairs: Vec<PairRule>,
    page_limit: Regex,
    word_limit: Regex,
    llm: Option<&'a dyn ChatCompletion>,
    store: &'a dyn ProposalStore,
}

impl<'a> AmbiguityDetector<'a> {
    pub fn new(thresholds: AmbiguityThresholds, store: &'a dyn ProposalStore) -> Result<Self> {
        let phrases = phrase_rule_table()
            .into_iter()
            .map(|(ambiguity_type, pattern)| {
                Ok(PhraseRule {
                    ambiguity_type,
                    pattern: Regex::new(&format!("(?i){pattern}")).with_context(|| {
                        format!("failed to compile {} ambiguity regex", ambiguity_type.as_str())
                    })?,
                })
            })
            .collect::<Result<Vec<PhraseRule>>>()?;

        let pairs = CONTRADICTORY_PAIRS
            .iter()
            .map(|&(first, second)| {
                Ok(PairRule {
                    first,
                    second,
                    first_pattern: term_pattern(first)?,
                    second_pattern: term_pattern(second)?,
                })
            })
            .collect::<Result<Vec<PairRule>>>()?;

        Ok(Self {
            thresholds,
            phrases,
            pairs,
            page_limit: Regex::new(r"(?i)\b(\d{1,3})[\s-]*(?:single[\s-]spaced\s+|double[\s-]spaced\s+)?pages?\b")
                .context("failed to compile page-limit regex")?,
            word_limit: Regex::new(r"(?i)\b(\d{1,3}(?:,\d{3})+|\d{2,6})[\s-]*words?\b")
                .context("failed to compile word-limit regex")?,
            llm: None,
            store,
        })
    }

    pub fn with_llm(mut self, llm: &'a dyn ChatCompletion) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Rule flags plus model flags not already covered, without touching the store.
    pub fn detect(&self, proposal_id: &str, rfp_text: &str) -> Vec<AmbiguityFlag> {
        let mut flags = self.detect_rules(proposal_id, rfp_text);
        if let Some(llm) = self.llm {
            match self.detect_with_llm(llm, proposal_id, rfp_text) {
                Ok(extra) => {
                    let mut seen = flags
                        .iter()
                        .map(|flag| description_key(&flag.description))
                        .collect::<HashSet<String>>();
                    flags.extend(
                        extra
                            .into_iter()
                            .filter(|flag| seen.insert(description_key(&flag.description))),
                    );
                }
                Err(err) => warn!(proposal_id, error = %err, "ambiguity model pass failed; using rule flags only"),
            }
        }
        flags
    }

    /// Deterministic pass only.
    pub fn detect_rules(&self, proposal_id: &str, rfp_text: &str) -> Vec<AmbiguityFlag> {
        let sentences = sentences(rfp_text);
        let mut flags = Vec::new();

        for pair in &self.pairs {
            let first = matching_sentences(&sentences, &pair.first_pattern);
            let second = matching_sentences(&sentences, &pair.second_pattern);
            if first.is_empty() || second.is_empty() {
                continue;
            }
            let mut seen = HashSet::new();
            let sources = first
                .into_iter()
                .chain(second)
                .filter(|sentence| seen.insert(sentence.clone()))
                .take(MAX_SOURCE_TEXTS)
                .collect::<Vec<String>>();
            flags.push(new_flag(
                proposal_id,
                AmbiguityType::Contradictory,
                format!(
                    "The RFP asks for both \"{}\" and \"{}\" content",
                    pair.first, pair.second
                ),
                sources,
                vec![
                    format!("Confirm with the funder whether a {} or a {} response is expected", pair.first, pair.second),
                    "Follow the instruction attached to the stricter length limit".to_string(),
                ],
                FlagOrigin::Rule,
            ));
        }

        // phrase (lowercased) -> (type, source sentences) in first-seen order
        let mut phrase_hits = Vec::<(String, AmbiguityType, Vec<String>)>::new();
        for rule in &self.phrases {
            for sentence in &sentences {
                for matched in rule.pattern.find_iter(sentence) {
                    let phrase = normalize_whitespace(matched.as_str()).to_lowercase();
                    match phrase_hits.iter_mut().find(|entry| entry.0 == phrase) {
                        Some((_, _, sources)) => {
                            if sources.len() < MAX_SOURCE_TEXTS && !sources.contains(sentence) {
                                sources.push(sentence.clone());
                            }
                        }
                        None => phrase_hits.push((phrase, rule.ambiguity_type, vec![sentence.clone()])),
                    }
                }
            }
        }
        for (phrase, ambiguity_type, sources) in phrase_hits {
            let (description, resolutions) = match ambiguity_type {
                AmbiguityType::Implicit => (
                    format!("\"{phrase}\" relies on an expectation the RFP does not state"),
                    vec![
                        "Ask the program officer which standard or format applies".to_string(),
                        "Use the funder's published template if one exists".to_string(),
                    ],
                ),
                _ => (
                    format!("\"{phrase}\" does not define a measurable expectation"),
                    vec![
                        "State the concrete amount or scope the proposal will commit to".to_string(),
                        "Ask the program officer for a definition".to_string(),
                    ],
                ),
            };
            flags.push(new_flag(
                proposal_id,
                ambiguity_type,
                description,
                sources,
                resolutions,
                FlagOrigin::Rule,
            ));
        }

        flags.extend(self.scope_flags(proposal_id, rfp_text));
        flags
    }

    /// Page and word limits whose ratio falls outside the plausible band. Limits in one paragraph
    /// pair with each other; a lone limit pairs with the next opposite limit stated after it.
    fn scope_flags(&self, proposal_id: &str, rfp_text: &str) -> Vec<AmbiguityFlag> {
        let mut flags = Vec::new();
        let mut pending: Option<StatedLimit> = None;

        for paragraph in split_paragraphs(rfp_text) {
            let pages = first_number(&self.page_limit, &paragraph);
            let words = first_number(&self.word_limit, &paragraph);
            let source = normalize_whitespace(&paragraph);

            match (pages, words) {
                (Some(pages), Some(words)) => {
                    pending = None;
                    flags.extend(self.scope_flag(proposal_id, pages, words, vec![source]));
                }
                (Some(pages), None) => match pending.take() {
                    Some(StatedLimit::Words(words, earlier)) => {
                        flags.extend(self.scope_flag(proposal_id, pages, words, vec![earlier, source]));
                    }
                    _ => pending = Some(StatedLimit::Pages(pages, source)),
                },
                (None, Some(words)) => match pending.take() {
                    Some(StatedLimit::Pages(pages, earlier)) => {
                        flags.extend(self.scope_flag(proposal_id, pages, words, vec![earlier, source]));
                    }
                    _ => pending = Some(StatedLimit::Words(words, source)),
                },
                (None, None) => {}
            }
        }
        flags
    }

    fn scope_flag(
        &self,
        proposal_id: &str,
        pages: f64,
        words: f64,
        sources: Vec<String>,
    ) -> Option<AmbiguityFlag> {
        if pages <= 0.0 {
            return None;
        }
        let per_page = (words / pages).round();
        let min = self.thresholds.min_words_per_page as f64;
        let max = self.thresholds.max_words_per_page as f64;
        if per_page >= min && per_page <= max {
            return None;
        }

        Some(new_flag(
            proposal_id,
            AmbiguityType::ScopeUnclear,
            format!(
                "A {pages}-page limit with a {words}-word limit implies {per_page} words per page, outside the {}-{} range",
                self.thresholds.min_words_per_page, self.thresholds.max_words_per_page
            ),
            sources,
            vec![
                "Confirm which limit governs the section".to_string(),
                "Write to the stricter of the two limits".to_string(),
            ],
            FlagOrigin::Rule,
        ))
    }

    fn detect_with_llm(
        &self,
        llm: &dyn ChatCompletion,
        proposal_id: &str,
        rfp_text: &str,
    ) -> Result<Vec<AmbiguityFlag>> {
        let excerpt = &rfp_text[..floor_char_boundary(rfp_text, self.thresholds.llm_excerpt_chars)];
        let system_prompt = "You review grant RFP instructions for ambiguity. Return only a JSON array of objects \
            with fields \"type\" (CONTRADICTORY, VAGUE, IMPLICIT or SCOPE_UNCLEAR), \"description\", \
            \"source_text\", \"suggested_resolution\" and \"requires_user_input\".";
        let response = llm
            .complete(system_prompt, &format!("RFP text:\n{excerpt}"))
            .context("ambiguity model request failed")?;
        let issues: Vec<LlmIssue> = parse_json_array(&response)?;

        Ok(issues
            .into_iter()
            .filter_map(|issue| {
                let ambiguity_type = AmbiguityType::parse(&issue.issue_type)?;
                let description = normalize_whitespace(&issue.description);
                if description.is_empty() {
                    return None;
                }
                let mut flag = new_flag(
                    proposal_id,
                    ambiguity_type,
                    description,
                    issue
                        .source_text
                        .map(|text| normalize_whitespace(&text))
                        .filter(|text| !text.is_empty())
                        .into_iter()
                        .collect(),
                    issue
                        .suggested_resolution
                        .map(|text| normalize_whitespace(&text))
                        .filter(|text| !text.is_empty())
                        .into_iter()
                        .collect(),
                    FlagOrigin::Llm,
                );
                if let Some(requires) = issue.requires_user_input {
                    flag.requires_user_input = flag.requires_user_input || requires;
                }
                Some(flag)
            })
            .collect())
    }

    /// Detects and replaces the proposal's flags. Resolutions carry over to flags that survive.
    pub fn analyze_and_persist(&self, proposal_id: &str, rfp_text: &str) -> Result<AmbiguitySummary> {
        self.store.load_proposal(proposal_id)?;

        let previous = self
            .store
            .load_ambiguity_flags(proposal_id)?
            .into_iter()
            .filter(|flag| flag.resolved)
            .map(|flag| (flag.flag_id.clone(), flag))
            .collect::<HashMap<String, AmbiguityFlag>>();

        let mut flags = self.detect(proposal_id, rfp_text);
        for flag in &mut flags {
            if let Some(resolved) = previous.get(&flag.flag_id) {
                flag.resolved = true;
                flag.resolution = resolved.resolution.clone();
                flag.resolved_by = resolved.resolved_by.clone();
                flag.resolved_at = resolved.resolved_at.clone();
            }
        }

        self.store.replace_ambiguity_flags(proposal_id, &flags)?;
        let summary = AmbiguitySummary::from_flags(proposal_id, flags);
        info!(
            proposal_id,
            flags = summary.total_flags,
            unresolved_blocking = summary.unresolved_blocking,
            "ambiguity analysis stored"
        );
        Ok(summary)
    }

    pub fn resolve_flag(&self, flag_id: &str, resolution: &str, resolved_by: &str) -> Result<AmbiguityFlag> {
        let resolution = resolution.trim();
        if resolution.is_empty() {
            bail!("a resolution is required to resolve ambiguity flag {flag_id}");
        }
        if resolved_by.trim().is_empty() {
            bail!("resolved_by is required to resolve ambiguity flag {flag_id}");
        }

        let flag = self.store.resolve_ambiguity_flag(
            flag_id,
            resolution,
            resolved_by.trim(),
            &now_utc_string(),
        )?;
        info!(flag_id, resolved_by, "ambiguity flag resolved");
        Ok(flag)
    }
}

fn term_pattern(term: &str) -> Result<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term)))
        .with_context(|| format!("failed to compile contradictory term regex for {term}"))
}

fn new_flag(
    proposal_id: &str,
    ambiguity_type: AmbiguityType,
    description: String,
    source_texts: Vec<String>,
    suggested_resolutions: Vec<String>,
    origin: FlagOrigin,
) -> AmbiguityFlag {
    AmbiguityFlag {
        flag_id: format!(
            "amb-{}",
            short_digest(
                &[proposal_id, ambiguity_type.as_str(), &description_key(&description)],
                12
            )
        ),
        proposal_id: proposal_id.to_string(),
        requires_user_input: matches!(
            ambiguity_type,
            AmbiguityType::Contradictory | AmbiguityType::ScopeUnclear
        ),
        ambiguity_type,
        description,
        source_texts,
        suggested_resolutions,
        resolved: false,
        resolution: None,
        resolved_by: None,
        resolved_at: None,
        origin,
    }
}

/// Lowercased alphanumeric words, for de-duplicating descriptions.
fn description_key(description: &str) -> String {
    description
        .split(|character: char| !character.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<String>>()
        .join(" ")
}

fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for paragraph in split_paragraphs(text) {
        let mut start = 0;
        for (index, character) in paragraph.char_indices() {
            if matches!(character, '.' | '!' | '?' | ';' | '\n') {
                push_sentence(&mut out, &paragraph[start..index + character.len_utf8()]);
                start = index + character.len_utf8();
            }
        }
        push_sentence(&mut out, &paragraph[start..]);
    }
    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let sentence = normalize_whitespace(raw);
    if !sentence.is_empty() {
        out.push(sentence);
    }
}

/// A limit seen without its counterpart, with the paragraph that stated it.
enum StatedLimit {
    Pages(f64, String),
    Words(f64, String),
}

fn first_number(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|matched| parse_number(matched.as_str()))
}

fn matching_sentences(sentences: &[String], pattern: &Regex) -> Vec<String> {
    sentences
        .iter()
        .filter(|sentence| pattern.is_match(sentence))
        .cloned()
        .collect()
}
