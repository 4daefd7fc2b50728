//! Tunable thresholds for every enforcement stage.
//!
//! Values are grouped by stage and resolved from a named preset, optionally overridden by a JSON
//! file. Every group carries `#[serde(default)]`, so a file only needs the fields it changes.

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::util::read_json_file;

pub const THRESHOLD_PRESET_ENV: &str = "GRANTGATE_THRESHOLD_PRESET";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdPreset {
    /// Looser relevance (0.40) and grounding (0.55) thresholds.
    #[default]
    Current,
    /// Earlier relevance (0.65) and grounding (0.70) thresholds.
    Legacy,
}

impl ThresholdPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Legacy => "legacy",
        }
    }
}

pub fn parse_threshold_preset(value: Option<&str>) -> ThresholdPreset {
    match value {
        Some(value) if value.trim().eq_ignore_ascii_case("legacy") => ThresholdPreset::Legacy,
        _ => ThresholdPreset::Current,
    }
}

pub fn resolve_threshold_preset() -> ThresholdPreset {
    parse_threshold_preset(std::env::var(THRESHOLD_PRESET_ENV).ok().as_deref())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalThresholds {
    pub min_relevance_score: f64,
    pub min_relevant_chunks: usize,
    pub top_k: usize,
}

impl Default for RetrievalThresholds {
    fn default() -> Self {
        Self {
            min_relevance_score: 0.40,
            min_relevant_chunks: 1,
            top_k: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingThresholds {
    pub grounded_threshold: f64,
    pub partial_threshold: f64,
    pub supporting_min_similarity: f64,
    pub max_supporting_chunks: usize,
    pub preview_chars: usize,
}

impl Default for GroundingThresholds {
    fn default() -> Self {
        Self {
            grounded_threshold: 0.55,
            partial_threshold: 0.30,
            supporting_min_similarity: 0.10,
            max_supporting_chunks: 3,
            preview_chars: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceThresholds {
    pub context_window_chars: usize,
    pub min_context_overlap: f64,
}

impl Default for EvidenceThresholds {
    fn default() -> Self {
        Self {
            context_window_chars: 100,
            min_context_overlap: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationThresholds {
    pub grounded_similarity: f64,
    pub partial_similarity: f64,
    pub jaccard_weight: f64,
    pub phrase_weight: f64,
    pub min_paragraph_words: usize,
    pub max_sources: usize,
    pub top_k: usize,
}

impl Default for CitationThresholds {
    fn default() -> Self {
        Self {
            grounded_similarity: 0.35,
            partial_similarity: 0.15,
            jaccard_weight: 0.7,
            phrase_weight: 0.3,
            min_paragraph_words: 3,
            max_sources: 3,
            top_k: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationThresholds {
    pub verified_confidence: f64,
    pub conflict_confidence: f64,
    pub evidence_floor: f64,
    pub numeric_tolerance: f64,
    pub max_evidence: usize,
    pub top_k: usize,
}

impl Default for VerificationThresholds {
    fn default() -> Self {
        Self {
            verified_confidence: 0.70,
            conflict_confidence: 0.50,
            evidence_floor: 0.25,
            numeric_tolerance: 0.10,
            max_evidence: 3,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbiguityThresholds {
    pub min_words_per_page: usize,
    pub max_words_per_page: usize,
    pub llm_excerpt_chars: usize,
}

impl Default for AmbiguityThresholds {
    fn default() -> Self {
        Self {
            min_words_per_page: 200,
            max_words_per_page: 600,
            llm_excerpt_chars: 6_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceThresholds {
    pub min_content_length: usize,
}

impl Default for ComplianceThresholds {
    fn default() -> Self {
        Self {
            min_content_length: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub coverage_block: u32,
    pub coverage_warn: u32,
    pub limit_block_percent: u32,
    pub max_verification_placeholders: usize,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            coverage_block: 30,
            coverage_warn: 60,
            limit_block_percent: 10,
            max_verification_placeholders: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub retrieval: RetrievalThresholds,
    pub grounding: GroundingThresholds,
    pub evidence: EvidenceThresholds,
    pub citation: CitationThresholds,
    pub verification: VerificationThresholds,
    pub ambiguity: AmbiguityThresholds,
    pub compliance: ComplianceThresholds,
    pub gate: GateThresholds,
}

impl EnforcementConfig {
    pub fn preset(preset: ThresholdPreset) -> Self {
        let mut config = Self::default();
        if preset == ThresholdPreset::Legacy {
            config.retrieval.min_relevance_score = 0.65;
            config.grounding.grounded_threshold = 0.70;
            config.grounding.partial_threshold = 0.40;
        }
        config
    }

    /// Preset first, then the JSON file's fields on top of it.
    pub fn load(preset: ThresholdPreset, path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!(preset = preset.as_str(), "using preset enforcement thresholds");
            return Ok(Self::preset(preset));
        };

        let overrides: serde_json::Value = read_json_file(path)?;
        let mut merged = serde_json::to_value(Self::preset(preset))
            .context("failed to serialize preset thresholds")?;
        merge_json(&mut merged, overrides);
        let config = serde_json::from_value(merged)
            .with_context(|| format!("invalid enforcement config: {}", path.display()))?;

        info!(
            preset = preset.as_str(),
            path = %path.display(),
            "loaded enforcement thresholds"
        );
        Ok(config)
    }
}

fn merge_json(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
