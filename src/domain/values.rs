//! Validated identifiers that reach cache keys and durable rows.
//!
//! Normalisation happens once here so two spellings of the same tag, platform
//! or query always land on the same key.

use std::fmt;

use super::error::DomainError;

const MAX_TAG_NAME_CHARS: usize = 64;
const MAX_PLATFORM_CHARS: usize = 32;
const MAX_QUERY_CHARS: usize = 200;

/// Normalised hashtag name: trimmed, leading `#` removed, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagName(String);

impl TagName {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim().trim_start_matches('#').trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("tag name must not be empty"));
        }
        if trimmed.chars().count() > MAX_TAG_NAME_CHARS {
            return Err(DomainError::validation(format!(
                "tag name exceeds {MAX_TAG_NAME_CHARS} characters"
            )));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(DomainError::validation("tag name must not contain whitespace"));
        }
        Ok(Self(trimmed.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Share target such as `twitter` or `email`, lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform(String);

impl Platform {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("platform must not be empty"));
        }
        if trimmed.chars().count() > MAX_PLATFORM_CHARS {
            return Err(DomainError::validation(format!(
                "platform exceeds {MAX_PLATFORM_CHARS} characters"
            )));
        }
        if !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(DomainError::validation(
                "platform may only contain ascii letters, digits, `-` and `_`",
            ));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Search query as stored in suggestions and history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchQuery(String);

impl SearchQuery {
    /// Returns `None` for blank input; long queries are cut at a char boundary.
    pub fn parse(raw: &str) -> Option<Self> {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return None;
        }
        let normalised: String = collapsed
            .to_lowercase()
            .chars()
            .take(MAX_QUERY_CHARS)
            .collect();
        Some(Self(normalised.trim_end().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercased prefix used for client-side filtering; empty matches everything.
pub fn normalise_prefix(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_are_normalised() {
        let tag = TagName::parse("  #Rust ").expect("valid tag");
        assert_eq!(tag.as_str(), "rust");
        assert_eq!(TagName::parse("RUST").expect("valid"), tag);
    }

    #[test]
    fn empty_or_spaced_tags_are_rejected() {
        assert!(TagName::parse("   ").is_err());
        assert!(TagName::parse("#").is_err());
        assert!(TagName::parse("two words").is_err());
        assert!(TagName::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn platform_rejects_separators() {
        assert_eq!(Platform::parse(" Twitter ").expect("valid").as_str(), "twitter");
        assert!(Platform::parse("a:b").is_err());
        assert!(Platform::parse("").is_err());
    }

    #[test]
    fn queries_collapse_whitespace() {
        let query = SearchQuery::parse("  Rust   Async\tIO ").expect("query");
        assert_eq!(query.as_str(), "rust async io");
        assert!(SearchQuery::parse(" \n ").is_none());
    }

    #[test]
    fn prefix_ignores_hash_and_case() {
        assert_eq!(normalise_prefix(" #Ru"), "ru");
        assert_eq!(normalise_prefix(""), "");
    }
}
