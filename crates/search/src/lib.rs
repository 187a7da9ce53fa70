//! Corral search: label selectors for list/watch filtering and free-text matching
//! for list items.

#![forbid(unsafe_code)]

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;

pub mod selector;

pub use selector::{is_valid_key, matches_all, parse_selector, parse_selectors, LabelQuery, Term};

/// Fuzzy, case-insensitive match of `needle` within `haystack`. An empty needle matches.
pub fn text_matches(haystack: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() { return true; }
    SkimMatcherV2::default().ignore_case().fuzzy_match(haystack, needle).is_some()
}

/// Like [`text_matches`] but returns the score for ranking.
pub fn text_score(haystack: &str, needle: &str) -> Option<i64> {
    let needle = needle.trim();
    if needle.is_empty() { return Some(0); }
    SkimMatcherV2::default().ignore_case().fuzzy_match(haystack, needle)
}
