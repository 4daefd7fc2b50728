use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const POLICY_BLOCKED_MARKER: &str = "[POLICY_BLOCKED]";

/// Upper bound on replacement passes; real inputs settle in two or three.
const MAX_PASSES: usize = 64;

/// Separator tolerated between words of a blocked phrase. `~` in the tables below expands to it.
const WORD_SEPARATOR: &str = r"[\s\-_.,]+";

const ZERO_WIDTH: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}', '\u{180E}',
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassCategory {
    PlaceholderBypass,
    VerificationBypass,
    ConfidenceManipulation,
    KnowledgeBaseBypass,
    Fabrication,
    Estimation,
    CreativeLicense,
    RolePlay,
}

impl BypassCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlaceholderBypass => "placeholder_bypass",
            Self::VerificationBypass => "verification_bypass",
            Self::ConfidenceManipulation => "confidence_manipulation",
            Self::KnowledgeBaseBypass => "knowledge_base_bypass",
            Self::Fabrication => "fabrication",
            Self::Estimation => "estimation",
            Self::CreativeLicense => "creative_license",
            Self::RolePlay => "role_play",
        }
    }
}

fn bypass_rule_table() -> Vec<(BypassCategory, &'static str)> {
    use BypassCategory::*;

    vec![
        (
            PlaceholderBypass,
            r"(?:ignore|skip|remove|omit|disable|bypass|avoid|drop|strip)~(?:all~|any~)?(?:the~|of~the~)?(?:placeholders?|place~holders?)",
        ),
        (
            PlaceholderBypass,
            r"(?:don[’']?t|do~not|never|no~need~to)~(?:use|insert|add|include|leave|output|emit)~(?:any~)?(?:placeholders?|place~holders?)",
        ),
        (PlaceholderBypass, r"(?:without|no)~(?:any~)?(?:placeholders?|place~holders?)"),
        (
            VerificationBypass,
            r"(?:skip|ignore|disable|bypass|turn~off|switch~off)~(?:the~|all~|any~)?(?:verification|fact(?:~)?check(?:s|ing)?|grounding|citations?|validation|enforcement|source~checks?)",
        ),
        (
            VerificationBypass,
            r"(?:don[’']?t|do~not|never|no~need~to)~(?:verify|fact(?:~)?check|check~(?:the~)?sources|cite|validate)",
        ),
        (
            ConfidenceManipulation,
            r"(?:be|sound|write|appear)~(?:much~|more~|very~|extremely~|completely~|totally~|fully~)*(?:confident|authoritative|assertive|definitive)",
        ),
        (
            ConfidenceManipulation,
            r"(?:be|sound|appear)~(?:much~)?(?:more|very|extremely|completely|totally|absolutely)~certain",
        ),
        (
            ConfidenceManipulation,
            r"(?:don[’']?t|do~not|never|stop)~(?:hedg(?:e|ing)|qualify(?:ing)?|express~(?:any~)?uncertainty)",
        ),
        (
            ConfidenceManipulation,
            r"(?:state|present|treat)~(?:everything|all~claims|claims|it|them)~as~(?:facts?|certain|certainties|true)",
        ),
        (
            KnowledgeBaseBypass,
            r"(?:ignore|disregard|bypass|skip|don[’']?t~use|do~not~use)~(?:the~|my~|our~|all~)?(?:knowledge~base|kb|source~(?:documents?|materials?)|uploaded~(?:documents?|files?)|provided~(?:documents?|sources?|context|materials?))",
        ),
        (
            KnowledgeBaseBypass,
            r"use~(?:your~)?(?:own|general|outside|external|background|prior)~(?:knowledge|information|sources|data)",
        ),
        (
            Fabrication,
            r"make~up~(?:(?:some|any|the|a~few)~)?(?:numbers|data|statistics|stats|figures|facts|names|details|quotes|results)",
        ),
        (
            Fabrication,
            r"(?:invent|fake|manufacture)(?:d|s|ed|ing)?~(?:(?:some|any|the|realistic|plausible)~)?(?:numbers|data|statistics|stats|figures|facts|names|details|quotes|testimonials|results|outcomes)",
        ),
        (Fabrication, r"(?:fabricat|hallucinat)(?:e|ed|es|ing)"),
        (
            Fabrication,
            r"fill~in~(?:the~|any~|all~)?(?:gaps|blanks|missing~(?:data|information|details|numbers|figures))",
        ),
        (
            Estimation,
            r"(?:provide|give|use|include|add|insert|offer)~(?:some~|reasonable~|rough~|plausible~|realistic~|educated~|best~|approximate~)*(?:estimates?|guess(?:es|timates?)?|approximations?|ballpark~(?:figures?|numbers?))",
        ),
        (
            Estimation,
            r"(?:estimate|guess|approximate|extrapolate)~(?:the~|any~|all~)?(?:numbers|figures|data|values|statistics|amounts?|missing)",
        ),
        (
            Estimation,
            r"(?:reasonable|plausible|realistic|ballpark|approximate)~(?:numbers|figures|estimates|assumptions|values)",
        ),
        (
            CreativeLicense,
            r"(?:take|use|exercise|allow)~(?:some~|any~)?(?:creative~(?:license|licence|liberties|freedom)|artistic~(?:license|licence)|liberties)",
        ),
        (
            CreativeLicense,
            r"(?:be|get)~creative~with~(?:the~)?(?:facts|numbers|data|details|figures)",
        ),
        (CreativeLicense, r"\b(?:embellish|exaggerat)\w*"),
        (
            RolePlay,
            r"(?:pretend|imagine)~(?:that~|to~be~)?(?:you~are|you[’']?re|you~have)",
        ),
        (
            RolePlay,
            r"act~as~(?:if~|though~)?(?:you~are|you[’']?re|you~have)",
        ),
        (
            RolePlay,
            r"you~are~(?:now~)?(?:an?~)?(?:unrestricted|unfiltered|different|new|jailbroken)",
        ),
        (
            RolePlay,
            r"(?:ignore|disregard|forget)~(?:all~|any~|your~)?(?:previous|prior|above|earlier|system)~(?:instructions|rules|prompts?|directions)",
        ),
        (RolePlay, r"role(?:~)?play(?:ing)?"),
    ]
}

struct BypassRule {
    category: BypassCategory,
    pattern: Regex,
    /// Same phrase with separators and word boundaries dropped, run over letters only.
    collapsed: Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedPattern {
    pub category: BypassCategory,
    pub matched_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizationResult {
    pub sanitized: String,
    pub policy_override: bool,
    pub blocked_patterns: Vec<BlockedPattern>,
}

/// Neutralizes custom instructions that try to switch enforcement off.
pub struct InstructionSanitizer {
    rules: Vec<BypassRule>,
    letter_spaced: Regex,
}

impl InstructionSanitizer {
    pub fn new() -> Result<Self> {
        let rules = bypass_rule_table()
            .into_iter()
            .map(|(category, pattern)| {
                let context = || format!("failed to compile {} sanitizer regex", category.as_str());
                let expanded = format!(r"(?i)\b{}", pattern.replace('~', WORD_SEPARATOR));
                Ok(BypassRule {
                    category,
                    pattern: Regex::new(&expanded).with_context(context)?,
                    collapsed: Regex::new(&format!("(?i){}", collapsed_form(pattern)))
                        .with_context(context)?,
                })
            })
            .collect::<Result<Vec<BypassRule>>>()?;

        Ok(Self {
            rules,
            letter_spaced: Regex::new(r"\b(?:[A-Za-z][ .\-]){3,}[A-Za-z]\b")
                .context("failed to compile letter-spacing regex")?,
        })
    }

    pub fn sanitize_custom_instructions(&self, text: &str) -> SanitizationResult {
        let mut sanitized = self.normalize(text);
        let mut blocked_patterns = Vec::new();

        for _ in 0..MAX_PASSES {
            let mut changed = false;
            for rule in &self.rules {
                if !rule.pattern.is_match(&sanitized) {
                    continue;
                }
                blocked_patterns.extend(rule.pattern.find_iter(&sanitized).map(|matched| {
                    BlockedPattern {
                        category: rule.category,
                        matched_text: matched.as_str().to_string(),
                    }
                }));
                sanitized = rule
                    .pattern
                    .replace_all(&sanitized, POLICY_BLOCKED_MARKER)
                    .into_owned();
                changed = true;
            }
            for rule in &self.rules {
                changed |= neutralize_collapsed(rule, &mut sanitized, &mut blocked_patterns);
            }
            if !changed {
                break;
            }
        }

        let policy_override = !blocked_patterns.is_empty();
        if policy_override {
            warn!(
                blocked = blocked_patterns.len(),
                "custom instructions contained enforcement bypass attempts"
            );
        }

        SanitizationResult {
            sanitized,
            policy_override,
            blocked_patterns,
        }
    }

    /// Drops invisible characters and joins letter-spaced words ("i g n o r e" -> "ignore").
    fn normalize(&self, text: &str) -> String {
        let visible = text
            .chars()
            .filter(|character| !ZERO_WIDTH.contains(character))
            .collect::<String>();
        self.letter_spaced
            .replace_all(&visible, |captures: &regex::Captures<'_>| {
                captures[0]
                    .chars()
                    .filter(|character| character.is_ascii_alphabetic())
                    .collect::<String>()
            })
            .into_owned()
    }
}

/// Table pattern as matched against [`letters_only`] text.
fn collapsed_form(pattern: &str) -> String {
    pattern
        .replace("(?:~)?", "")
        .replace('~', "")
        .replace(r"\b", "")
        .replace(r"\w*", "")
}

/// Lowercased ASCII letters of `text` outside policy markers, with the byte offset of each.
fn letters_only(text: &str) -> (String, Vec<usize>) {
    let mut letters = String::with_capacity(text.len());
    let mut offsets = Vec::with_capacity(text.len());
    let mut skip_until = 0;

    for (index, character) in text.char_indices() {
        if index < skip_until {
            continue;
        }
        if text[index..].starts_with(POLICY_BLOCKED_MARKER) {
            skip_until = index + POLICY_BLOCKED_MARKER.len();
            continue;
        }
        if character.is_ascii_alphabetic() {
            letters.push(character.to_ascii_lowercase());
            offsets.push(index);
        }
    }
    (letters, offsets)
}

/// Replaces every span whose letters spell a blocked phrase, however it is spaced, split or
/// embedded. A span that straddles an earlier marker absorbs it.
fn neutralize_collapsed(
    rule: &BypassRule,
    text: &mut String,
    blocked_patterns: &mut Vec<BlockedPattern>,
) -> bool {
    let mut changed = false;
    loop {
        let (letters, offsets) = letters_only(text);
        let Some(matched) = rule.collapsed.find(&letters) else {
            break;
        };
        if matched.is_empty() {
            break;
        }
        let (Some(&start), Some(&last)) =
            (offsets.get(matched.start()), offsets.get(matched.end() - 1))
        else {
            break;
        };
        let end = last + 1;

        blocked_patterns.push(BlockedPattern {
            category: rule.category,
            matched_text: text[start..end].to_string(),
        });
        text.replace_range(start..end, POLICY_BLOCKED_MARKER);
        changed = true;
    }
    changed
}
