//! Casing conversion and the shared SHA-1 content-addressing helpers used
//! by topic names (§3) and read-model namespaces (§3, §6).

use sha1::{Digest, Sha1};

/// Casing conventions a [`crate::readmodel::ReadModelClientFactory`] may
/// request its namespace be rendered in (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasingPolicy {
    Camel,
    Snake,
    ScreamingSnake,
    Pascal,
    Title,
    Sentence,
    Kebab,
}

impl CasingPolicy {
    /// Splits `input` into lowercase words on `[-_\s]+` and on
    /// lowercase/digit -> uppercase and uppercase -> capitalized-word
    /// boundaries, then reassembles per this casing.
    pub fn apply(self, input: &str) -> String {
        let words = split_words(input);
        match self {
            CasingPolicy::Camel => join_camel(&words, false),
            CasingPolicy::Pascal => join_camel(&words, true),
            CasingPolicy::Snake => words.join("_"),
            CasingPolicy::ScreamingSnake => words
                .iter()
                .map(|w| w.to_uppercase())
                .collect::<Vec<_>>()
                .join("_"),
            CasingPolicy::Kebab => words.join("-"),
            CasingPolicy::Title => words
                .iter()
                .map(|w| capitalize(w))
                .collect::<Vec<_>>()
                .join(" "),
            CasingPolicy::Sentence => {
                let mut joined = words.join(" ");
                if let Some(first) = joined.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                joined
            }
        }
    }
}

fn join_camel(words: &[String], capitalize_first: bool) -> String {
    let mut out = String::new();
    for (i, word) in words.iter().enumerate() {
        if i == 0 && !capitalize_first {
            out.push_str(word);
        } else {
            out.push_str(&capitalize(word));
        }
    }
    out
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Splits on explicit separators and on case/digit boundaries, lowercasing
/// each resulting word.
fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = input.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == '_' || c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if i > 0 {
            let prev = chars[i - 1];
            let prev_lower_or_digit = prev.is_lowercase() || prev.is_ascii_digit();
            let boundary_lower_to_upper = prev_lower_or_digit && c.is_uppercase();
            // Uppercase run followed by a new capitalized word, e.g. "HTTPServer" -> "HTTP", "Server".
            let boundary_acronym_to_word = prev.is_uppercase()
                && c.is_uppercase()
                && chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if boundary_lower_to_upper || boundary_acronym_to_word {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
        }

        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words.into_iter().map(|w| w.to_lowercase()).collect()
}

/// Lowercase 40-character hex SHA-1 digest of `input`, the stable topic
/// name / namespace suffix format (§6).
pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Joins non-empty naming tokens with `-`, per the topic name format (§3).
pub fn join_nonempty(tokens: &[&str], sep: &str) -> String {
    tokens
        .iter()
        .filter(|t| !t.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(sep)
}
