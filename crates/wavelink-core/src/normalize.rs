//! Name normalization for identity matching.
//!
//! - Unicode NFKD decomposition with combining marks dropped (diacritics)
//! - Lowercase folding
//! - Every non-alphanumeric run collapsed to a single token boundary

use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::{Error, Result};

/// A canonicalized name: an ordered list of lowercase ASCII-folded tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedName {
  tokens: Vec<String>,
}

impl NormalizedName {
  pub fn tokens(&self) -> &[String] { &self.tokens }

  /// Tokens joined by a single space, in original order.
  pub fn canonical(&self) -> String { self.tokens.join(" ") }

  /// Tokens in lexical order; used for order-insensitive comparison so
  /// "Warchol Adam" agrees with "Adam Warchol".
  pub fn sorted_tokens(&self) -> Vec<&str> {
    let mut sorted: Vec<&str> = self.tokens.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted
  }

  /// Exact token-multiset equality.
  pub fn same_tokens(&self, other: &Self) -> bool {
    self.sorted_tokens() == other.sorted_tokens()
  }
}

/// Fold `raw` to lowercase, diacritic-free, space-separated tokens. Never
/// fails; returns an empty string when nothing alphanumeric remains.
pub fn fold(raw: &str) -> String {
  let stripped: String = raw
    .nfkd()
    .filter(|c| !is_combining_mark(*c))
    .flat_map(char::to_lowercase)
    .map(|c| if c.is_alphanumeric() { c } else { ' ' })
    .collect();

  stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonicalize a free-text identity string.
///
/// Fails with [`Error::Validation`] when the input holds no alphanumeric
/// characters, so malformed records never reach the matcher.
pub fn normalize_name(raw: &str) -> Result<NormalizedName> {
  let folded = fold(raw);
  if folded.is_empty() {
    return Err(Error::Validation(format!("name {raw:?} is empty after normalization")));
  }
  Ok(NormalizedName {
    tokens: folded.split(' ').map(str::to_owned).collect(),
  })
}
