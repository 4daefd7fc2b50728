//! Lexical similarity strategies.
//!
//! Two scorers answer "is this paragraph grounded in this chunk?" with different tradeoffs and are
//! kept separate: [`FastJaccardScorer`] drives inline redaction at generation time,
//! [`PhraseOverlapScorer`] drives the persisted coverage numbers users see.

use std::collections::HashSet;

use crate::text::{significant_words, word_set};

pub trait TextSimilarityScorer {
    fn name(&self) -> &'static str;

    /// Similarity in `[0, 1]` between generated text and a source chunk.
    fn score(&self, paragraph: &str, chunk: &str) -> f64;
}

/// Word-set Jaccard over words longer than two characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastJaccardScorer;

impl TextSimilarityScorer for FastJaccardScorer {
    fn name(&self) -> &'static str {
        "fast_jaccard"
    }

    fn score(&self, paragraph: &str, chunk: &str) -> f64 {
        jaccard(&word_set(paragraph), &word_set(chunk))
    }
}

/// Weighted blend of word Jaccard and 3-word phrase overlap.
#[derive(Debug, Clone, Copy)]
pub struct PhraseOverlapScorer {
    pub jaccard_weight: f64,
    pub phrase_weight: f64,
}

impl Default for PhraseOverlapScorer {
    fn default() -> Self {
        Self {
            jaccard_weight: 0.7,
            phrase_weight: 0.3,
        }
    }
}

impl TextSimilarityScorer for PhraseOverlapScorer {
    fn name(&self) -> &'static str {
        "jaccard_phrase_overlap"
    }

    fn score(&self, paragraph: &str, chunk: &str) -> f64 {
        let word_score = jaccard(&word_set(paragraph), &word_set(chunk));
        let phrase_score = phrase_overlap(paragraph, chunk);
        (self.jaccard_weight * word_score + self.phrase_weight * phrase_score).clamp(0.0, 1.0)
    }
}

pub fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.len() + right.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Share of the paragraph's 3-word phrases that also occur in the chunk.
pub fn phrase_overlap(paragraph: &str, chunk: &str) -> f64 {
    let paragraph_phrases = trigrams(paragraph);
    if paragraph_phrases.is_empty() {
        return 0.0;
    }
    let chunk_phrases = trigrams(chunk);
    let shared = paragraph_phrases
        .iter()
        .filter(|phrase| chunk_phrases.contains(*phrase))
        .count();
    shared as f64 / paragraph_phrases.len() as f64
}

fn trigrams(text: &str) -> HashSet<String> {
    let words = significant_words(text);
    words
        .windows(3)
        .map(|window| window.join(" "))
        .collect()
}
