//! Text analysis: tokenization, stopwords and stemming
//!
//! Stemming is delegated to `rust-stemmers`. Stems that differ from the
//! surface form are indexed as separate `+stem` entries so that a query
//! term can match every inflection without losing exact-match precision.

use rust_stemmers::{Algorithm, Stemmer};

/// Marker prepended to indexed stem entries
pub const STEM_PREFIX: char = '+';

/// Default English stopword list
pub const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "is", "the", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in",
    "into", "it", "no", "not", "of", "on", "or", "such", "that", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with",
];

const SEPARATORS: &str = " \t\r\n,.<>{}[]\"':;!@#$%^&*()-+=~|/\\?";

/// Look up the stemming algorithm for a language name.
pub fn stemmer_for(language: &str) -> Option<Option<Algorithm>> {
    let algo = match language.to_ascii_lowercase().as_str() {
        "arabic" => Some(Algorithm::Arabic),
        "danish" => Some(Algorithm::Danish),
        "dutch" => Some(Algorithm::Dutch),
        "english" => Some(Algorithm::English),
        "finnish" => Some(Algorithm::Finnish),
        "french" => Some(Algorithm::French),
        "german" => Some(Algorithm::German),
        "greek" => Some(Algorithm::Greek),
        "hungarian" => Some(Algorithm::Hungarian),
        "italian" => Some(Algorithm::Italian),
        "norwegian" => Some(Algorithm::Norwegian),
        "portuguese" => Some(Algorithm::Portuguese),
        "romanian" => Some(Algorithm::Romanian),
        "russian" => Some(Algorithm::Russian),
        "spanish" => Some(Algorithm::Spanish),
        "swedish" => Some(Algorithm::Swedish),
        "tamil" => Some(Algorithm::Tamil),
        "turkish" => Some(Algorithm::Turkish),
        // Languages without a stemmer still tokenize
        "chinese" | "hindi" | "armenian" | "indonesian" | "irish" | "lithuanian" | "nepali"
        | "serbian" | "yiddish" => None,
        _ => return None,
    };
    Some(algo)
}

/// One token produced by the tokenizer
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Normalized (lowercased, unescaped) term
    pub term: String,
    /// Stem, when stemming is enabled and it differs from `term`
    pub stem: Option<String>,
    /// 1-based position among non-stopword tokens
    pub position: u32,
    /// Byte range of the token in the source text
    pub start: usize,
    pub end: usize,
}

/// Stopword list for an index
#[derive(Debug, Clone)]
pub struct StopWords {
    words: Vec<String>,
}

impl StopWords {
    pub fn new(custom: Option<&[String]>) -> Self {
        let words = match custom {
            Some(list) => list.iter().map(|w| w.to_lowercase()).collect(),
            None => DEFAULT_STOPWORDS.iter().map(|w| w.to_string()).collect(),
        };
        Self { words }
    }

    pub fn none() -> Self {
        Self { words: Vec::new() }
    }

    pub fn contains(&self, term: &str) -> bool {
        self.words.iter().any(|w| w == term)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

/// Stem a single normalized term with the given language.
pub fn stem(term: &str, language: &str) -> Option<String> {
    let algo = stemmer_for(language).flatten()?;
    let stemmed = Stemmer::create(algo).stem(term).into_owned();
    (stemmed != term && !stemmed.is_empty()).then_some(stemmed)
}

/// Normalize a query or document term: lowercase and drop escapes.
pub fn normalize(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    let mut escaped = false;
    for c in term.chars() {
        if c == '\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// Split text into tokens.
///
/// Separators are whitespace and punctuation; a backslash makes the next
/// character part of the current token. Stopwords are dropped and do not
/// consume positions. `start_position` continues numbering across fields.
pub fn tokenize(
    text: &str,
    stopwords: &StopWords,
    language: Option<&str>,
    start_position: u32,
) -> Vec<Token> {
    let stemmer = language
        .and_then(|l| stemmer_for(l).flatten())
        .map(Stemmer::create);

    let mut tokens = Vec::new();
    let mut position = start_position;
    let mut current = String::new();
    let mut token_start = 0usize;
    let mut escaped = false;

    let mut flush = |current: &mut String, start: usize, end: usize, position: &mut u32| {
        if current.is_empty() {
            return;
        }
        let term = std::mem::take(current);
        if stopwords.contains(&term) {
            return;
        }
        *position += 1;
        let stem = stemmer.as_ref().and_then(|s| {
            let stemmed = s.stem(&term).into_owned();
            (stemmed != term && !stemmed.is_empty()).then_some(stemmed)
        });
        tokens.push(Token {
            term,
            stem,
            position: *position,
            start,
            end,
        });
    };

    for (idx, c) in text.char_indices() {
        if escaped {
            if current.is_empty() {
                token_start = idx.saturating_sub(1);
            }
            current.extend(c.to_lowercase());
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if SEPARATORS.contains(c) {
            flush(&mut current, token_start, idx, &mut position);
            continue;
        }
        if current.is_empty() {
            token_start = idx;
        }
        current.extend(c.to_lowercase());
    }
    flush(&mut current, token_start, text.len(), &mut position);
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_stopwords_without_consuming_positions() {
        let tokens = tokenize("The quick, brown fox", &StopWords::new(None), None, 0);
        let terms: Vec<_> = tokens.iter().map(|t| t.term.as_str()).collect();
        assert_eq!(terms, vec!["quick", "brown", "fox"]);
        assert_eq!(tokens[0].position, 1);
        assert_eq!(tokens[2].position, 3);
        assert_eq!(&"The quick, brown fox"[tokens[0].start..tokens[0].end], "quick");
    }

    #[test]
    fn test_escaped_separator_stays_in_token() {
        let tokens = tokenize("hello\\-world x", &StopWords::none(), None, 0);
        assert_eq!(tokens[0].term, "hello-world");
        assert_eq!(tokens[1].term, "x");
    }

    #[test]
    fn test_stemming() {
        let tokens = tokenize("running dogs", &StopWords::none(), Some("english"), 0);
        assert_eq!(tokens[0].stem.as_deref(), Some("run"));
        assert_eq!(tokens[1].stem.as_deref(), Some("dog"));
        assert_eq!(stem("hello", "english"), None);
    }

    #[test]
    fn test_positions_continue_across_fields() {
        let tokens = tokenize("a b", &StopWords::none(), None, 10);
        assert_eq!(tokens[0].position, 11);
    }

    #[test]
    fn test_unknown_language() {
        assert!(stemmer_for("klingon").is_none());
        assert!(matches!(stemmer_for("chinese"), Some(None)));
    }
}
