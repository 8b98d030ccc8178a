//! Text normalization and lexical keys.
//!
//! Normalized text is the unit every index works on: the bloom filter is
//! keyed by its tokens, the text-match stage by its word trigrams.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

// Punctuation and symbols; letters, digits and whitespace survive.
static STRIP: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[\p{P}\p{S}]+").ok());

/// Normalizes mention or entity text: lowercase, strip punctuation, collapse
/// whitespace, trim.
///
/// # Examples
///
/// ```
/// use kyro_resolve::normalize::normalize;
///
/// assert_eq!(normalize("  C. Ronaldo "), "c ronaldo");
/// assert_eq!(normalize("Cristiano\tRONALDO!"), "cristiano ronaldo");
/// ```
#[must_use]
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = match STRIP.as_ref() {
        Some(re) => re.replace_all(&lowered, "").into_owned(),
        None => lowered
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect(),
    };
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace tokens of already-normalized text.
pub fn tokens(normalized: &str) -> impl Iterator<Item = &str> {
    normalized.split(' ').filter(|t| !t.is_empty())
}

/// Word trigrams of already-normalized text.
///
/// Each word is padded with two leading blanks and one trailing blank before
/// slicing, so short words and word starts still produce keys.
#[must_use]
pub fn trigrams(normalized: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for word in tokens(normalized) {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        for window in padded.windows(3) {
            out.insert(window.iter().collect());
        }
    }
    out
}

/// Jaccard similarity of two trigram sets, in `[0, 1]`.
#[must_use]
pub fn trigram_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    #[allow(clippy::cast_precision_loss)]
    let sim = shared as f32 / union as f32;
    sim
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize("Hello,   World!"), "hello world");
        assert_eq!(normalize("ACME Corp."), "acme corp");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_normalize_strips_symbols_and_unicode_punctuation() {
        assert_eq!(normalize("Müller & Söhne — GmbH"), "müller söhne gmbh");
        assert_eq!(normalize("«Deal #42»"), "deal 42");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(" The  Walt-Disney Co. ");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_tokens() {
        let t: Vec<&str> = tokens("c ronaldo").collect();
        assert_eq!(t, vec!["c", "ronaldo"]);
        assert_eq!(tokens("").count(), 0);
    }

    #[test]
    fn test_trigrams_pad_words() {
        let t = trigrams("ab");
        assert!(t.contains("  a"));
        assert!(t.contains(" ab"));
        assert!(t.contains("ab "));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn test_trigram_similarity() {
        let a = trigrams("cristiano ronaldo");
        let b = trigrams("c ronaldo");
        let sim = trigram_similarity(&a, &b);
        assert!(sim > 0.4 && sim < 0.6, "sim={sim}");
        assert!((trigram_similarity(&a, &a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(trigram_similarity(&a, &trigrams("zzz")), 0.0);
        assert_eq!(trigram_similarity(&a, &BTreeSet::new()), 0.0);
    }
}
