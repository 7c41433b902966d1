//! Text helpers shared by the threader and the context analyzer.

use std::collections::HashSet;
use std::sync::OnceLock;

const STOPWORDS: &[&str] = &[
    "about", "above", "after", "again", "all", "also", "and", "any", "are", "back", "because",
    "been", "before", "being", "below", "between", "both", "but", "can", "could", "did", "does",
    "doing", "done", "down", "each", "even", "few", "for", "from", "further", "get", "got",
    "had", "has", "have", "having", "her", "here", "hers", "him", "his", "how", "into", "its",
    "itself", "just", "know", "let", "like", "lets", "make", "may", "more", "most", "much",
    "must", "need", "not", "now", "off", "once", "one", "only", "other", "our", "ours", "out",
    "over", "own", "please", "same", "see", "she", "should", "some", "such", "sure", "than",
    "thank", "thanks", "that", "the", "their", "theirs", "them", "then", "there", "these",
    "they", "thing", "things", "this", "those", "through", "too", "under", "until", "use",
    "very", "want", "was", "way", "well", "were", "what", "when", "where", "which", "while",
    "who", "whom", "why", "will", "with", "would", "yes", "yet", "you", "your", "yours",
    "yourself", "okay", "going", "think", "look", "still", "really", "something",
];

const TECHNICAL_TERMS: &[&str] = &[
    "algorithm", "api", "array", "async", "await", "binary", "boolean", "branch", "buffer",
    "build", "bytes", "cache", "class", "cli", "commit", "compile", "compiler", "concurrency",
    "config", "database", "debug", "dependency", "deploy", "endpoint", "enum", "exception",
    "function", "generic", "hash", "heap", "http", "index", "integer", "interface", "iterator",
    "json", "kernel", "lambda", "latency", "library", "lifetime", "macro", "memory", "method",
    "migration", "module", "mutex", "parser", "pointer", "process", "protocol", "query",
    "recursion", "refactor", "regex", "runtime", "schema", "socket", "sql", "stack", "string",
    "struct", "syntax", "thread", "token", "trait", "tuple", "type", "variable", "vector",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

fn technical_terms() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| TECHNICAL_TERMS.iter().copied().collect())
}

pub fn is_stopword(word: &str) -> bool {
    stopwords().contains(word)
}

/// Lowercased alphabetic words of at least three characters, stopwords
/// removed, in order of appearance.
pub fn salient_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !is_stopword(w))
        .collect()
}

/// Whitespace-delimited words.
pub fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
}

/// Whether a raw word looks like code or names a technical concept.
pub fn is_technical(word: &str) -> bool {
    let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
    if trimmed.is_empty() {
        return false;
    }
    if word.contains("::") || word.contains("()") || word.contains("->") {
        return true;
    }
    if trimmed.contains('_') && trimmed.chars().any(|c| c.is_alphabetic()) {
        return true;
    }
    // camelCase: a lowercase letter directly followed by an uppercase one
    let chars: Vec<char> = trimmed.chars().collect();
    if chars
        .windows(2)
        .any(|w| w[0].is_lowercase() && w[1].is_uppercase())
    {
        return true;
    }
    if let Some((stem, ext)) = trimmed.rsplit_once('.') {
        if !stem.is_empty() && (1..=4).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_lowercase()) {
            return true;
        }
    }
    technical_terms().contains(trimmed.to_lowercase().as_str())
}

/// Share of words that are technical, in [0, 1].
pub fn technical_density(text: &str) -> f64 {
    let mut total = 0usize;
    let mut technical = 0usize;
    for word in words(text) {
        total += 1;
        if is_technical(word) {
            technical += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        technical as f64 / total as f64
    }
}

/// Mean number of words per sentence; sentences end at `.`, `!`, `?` or a newline.
pub fn average_sentence_length(text: &str) -> f64 {
    let counts: Vec<usize> = text
        .split(['.', '!', '?', '\n'])
        .map(|s| words(s).count())
        .filter(|&n| n > 0)
        .collect();
    if counts.is_empty() {
        0.0
    } else {
        counts.iter().sum::<usize>() as f64 / counts.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salient_terms_filters_stopwords_and_short_words() {
        let terms = salient_terms("Can you fix the parser? It is in a loop, the parser!");
        assert_eq!(terms, vec!["fix", "parser", "loop", "parser"]);
    }

    #[test]
    fn test_is_technical() {
        assert!(is_technical("parse_line"));
        assert!(is_technical("openIncremental"));
        assert!(is_technical("std::fs"));
        assert!(is_technical("main.rs"));
        assert!(is_technical("Database"));
        assert!(!is_technical("hello"));
        assert!(!is_technical("..."));
    }

    #[test]
    fn test_average_sentence_length() {
        assert_eq!(average_sentence_length(""), 0.0);
        assert_eq!(average_sentence_length("One two. Three four five six!"), 3.0);
    }

    #[test]
    fn test_technical_density() {
        assert_eq!(technical_density(""), 0.0);
        assert_eq!(technical_density("the mutex is held"), 0.25);
    }
}
