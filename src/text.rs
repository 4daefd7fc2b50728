//! Text helpers shared by the enforcement and audit passes.

use std::collections::HashSet;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "old", "see",
    "two", "way", "who", "did", "get", "him", "let", "say", "she", "too", "use", "that", "with",
    "this", "from", "they", "will", "would", "there", "their", "what", "about", "which", "when",
    "were", "been", "into", "than", "then", "them", "these", "those", "such", "also", "each",
    "more", "most", "other", "some", "over", "only", "very", "just", "where", "while", "being",
    "through", "during", "before", "after", "above", "below", "between", "both", "same", "should",
    "could", "does", "doing", "your", "yours", "ours", "upon", "within", "without", "because",
    "under", "again", "further", "here", "once", "own", "per", "via",
];

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Lowercased alphanumeric tokens longer than two characters.
pub fn significant_words(input: &str) -> Vec<String> {
    input
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

pub fn word_set(input: &str) -> HashSet<String> {
    significant_words(input).into_iter().collect()
}

/// Significant words with stopwords removed, order preserved, duplicates dropped.
pub fn content_tokens(input: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    significant_words(input)
        .into_iter()
        .filter(|token| !is_stopword(token))
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

pub fn count_words(input: &str) -> usize {
    input.split_whitespace().count()
}

/// Splits on blank-line boundaries; paragraphs come back trimmed and non-empty.
pub fn split_paragraphs(input: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = Vec::<&str>::new();

    for line in input.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n").trim().to_string());
                current.clear();
            }
            continue;
        }
        current.push(line);
    }

    if !current.is_empty() {
        paragraphs.push(current.join("\n").trim().to_string());
    }

    paragraphs.retain(|paragraph| !paragraph.is_empty());
    paragraphs
}

pub fn floor_char_boundary(input: &str, index: usize) -> usize {
    let mut index = index.min(input.len());
    while index > 0 && !input.is_char_boundary(index) {
        index -= 1;
    }
    index
}

pub fn ceil_char_boundary(input: &str, index: usize) -> usize {
    let mut index = index.min(input.len());
    while index < input.len() && !input.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Slice of `input` reaching `radius` bytes either side of `start..end`, clipped to char boundaries.
pub fn window_around(input: &str, start: usize, end: usize, radius: usize) -> &str {
    let from = floor_char_boundary(input, start.saturating_sub(radius));
    let to = ceil_char_boundary(input, end.saturating_add(radius));
    &input[from..to]
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

/// Byte spans of `needle` in `haystack` that do not run into a neighbouring word or figure.
/// "50 students" is not found in "150 students", nor "$500" in "$500,000".
pub fn bounded_matches(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    if needle.is_empty() {
        return Vec::new();
    }
    let check_start = needle.chars().next().is_some_and(char::is_alphanumeric);
    let check_end = needle.chars().next_back().is_some_and(char::is_alphanumeric);

    haystack
        .match_indices(needle)
        .map(|(start, matched)| (start, start + matched.len()))
        .filter(|(start, end)| {
            let mut before = haystack[..*start].chars().rev();
            let mut after = haystack[*end..].chars();
            !(check_start && joins_token(before.next(), before.next()))
                && !(check_end && joins_token(after.next(), after.next()))
        })
        .collect()
}

/// Whether `near` continues the adjacent token: a letter or digit, or a digit separator
/// (`,` `.`) with a digit beyond it.
fn joins_token(near: Option<char>, far: Option<char>) -> bool {
    match near {
        Some(character) if character.is_alphanumeric() => true,
        Some(',' | '.') => far.is_some_and(|character| character.is_ascii_digit()),
        _ => false,
    }
}

/// Reduces rich-text section content to the text a reviewer reads.
/// Block-level tags become paragraph breaks and `<br>` a line break.
pub struct HtmlStripper {
    tag: Regex,
    entity: Regex,
}

impl HtmlStripper {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tag: Regex::new(r"<\s*(/?)\s*([A-Za-z][A-Za-z0-9]*)[^<>]*>")
                .context("failed to compile HTML tag regex")?,
            entity: Regex::new(r"&(nbsp|lt|gt|quot|apos|amp|#39);")
                .context("failed to compile HTML entity regex")?,
        })
    }

    pub fn strip(&self, input: &str) -> String {
        if !input.contains('<') && !input.contains('&') {
            return input.to_string();
        }
        let text = self.tag.replace_all(input, |captures: &Captures<'_>| {
            match captures[2].to_ascii_lowercase().as_str() {
                "br" => "\n",
                "p" | "div" | "li" | "ul" | "ol" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
                | "blockquote" | "section" | "table" | "tr" => "\n\n",
                _ => "",
            }
        });
        self.entity
            .replace_all(&text, |captures: &Captures<'_>| match &captures[1] {
                "nbsp" => " ",
                "lt" => "<",
                "gt" => ">",
                "quot" => "\"",
                "apos" | "#39" => "'",
                _ => "&",
            })
            .into_owned()
    }
}

/// Case-insensitive, space/underscore-interchangeable form used to compare section names.
pub fn normalize_section_name(input: &str) -> String {
    normalize_whitespace(&input.to_lowercase().replace(['_', '-'], " "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_paragraphs_uses_blank_lines_only() {
        let text = "First line\ncontinues here.\n\n  \nSecond paragraph.\n\n\nThird.";
        let paragraphs = split_paragraphs(text);
        assert_eq!(
            paragraphs,
            vec![
                "First line\ncontinues here.".to_string(),
                "Second paragraph.".to_string(),
                "Third.".to_string()
            ]
        );
    }

    #[test]
    fn bounded_matches_reject_longer_figures() {
        assert!(bounded_matches("served 150 students", "50 students").is_empty());
        assert!(bounded_matches("a $500,000 budget", "$500").is_empty());
        assert!(bounded_matches("version 2.500 students", "500 students").is_empty());
        assert_eq!(bounded_matches("served 50 students.", "50 students"), vec![(7, 18)]);
        assert_eq!(bounded_matches("a $500, then more", "$500").len(), 1);
        assert_eq!(bounded_matches("budget: $500.", "$500").len(), 1);
    }

    #[test]
    fn strip_html_breaks_blocks_and_decodes_entities() {
        let html = "<p>Youth &amp; families</p><P class=\"x\">Second<br/>line</P>";
        let stripped = HtmlStripper::new().expect("stripper should build").strip(html);
        assert_eq!(split_paragraphs(&stripped), vec!["Youth & families", "Second\nline"]);
    }

    #[test]
    fn strip_html_decodes_each_entity_once_and_keeps_bare_angles() {
        let stripper = HtmlStripper::new().expect("stripper should build");
        assert_eq!(stripper.strip("&amp;lt;b&amp;gt; means bold"), "&lt;b&gt; means bold");
        assert_eq!(stripper.strip("ratio 3 < 5 &nbsp;ok"), "ratio 3 < 5  ok");
        assert_eq!(stripper.strip("<span>unclosed <em"), "unclosed <em");
        assert_eq!(stripper.strip("plain text"), "plain text");
    }

    #[test]
    fn window_around_respects_char_boundaries() {
        let text = "ééééé 500 ééééé";
        let start = text.find("500").expect("value present");
        let window = window_around(text, start, start + 3, 3);
        assert!(window.contains("500"));
    }

    #[test]
    fn content_tokens_drop_stopwords_and_short_words() {
        let tokens = content_tokens("The program served an estimated 500 youth in the county");
        assert_eq!(
            tokens,
            vec!["program", "served", "estimated", "500", "youth", "county"]
        );
    }

    #[test]
    fn normalize_section_name_treats_underscores_as_spaces() {
        assert_eq!(
            normalize_section_name("Project_Narrative"),
            normalize_section_name("project   narrative")
        );
    }
}
