//! Action URI parsing for push messages.
//!
//! Push messages carry semantic commands in one of two forms:
//!
//! | Form | Example |
//! |------|---------|
//! | Full | `keypath://layer/nav/activate?mode=hold` |
//! | Shorthand | `launch:obsidian`, `layer:nav:activate?mode=hold` |
//!
//! Both normalize to the same [`ActionUri`].
//!
//! # Example
//!
//! ```ignore
//! use kanata_link::protocol::ActionUri;
//!
//! let uri = ActionUri::parse("launch:obsidian").unwrap();
//! assert_eq!(uri.action, "launch");
//! assert_eq!(uri.path, vec!["obsidian"]);
//! assert_eq!(uri.display_target().as_deref(), Some("Obsidian"));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;

use rustc_hash::FxHashMap;
use url::Url;
use url::form_urlencoded;

// ============================================================================
// ActionUri
// ============================================================================

/// Which syntax the URI was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriForm {
    /// `scheme://action/...`
    Full {
        /// URI scheme.
        scheme: String,
    },
    /// `action:seg:seg`
    Shorthand,
}

/// A structured command parsed from a push payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionUri {
    /// Command verb (`launch`, `layer`, ...).
    pub action: String,
    /// Decoded path segments after the action.
    pub path: Vec<String>,
    /// Decoded query parameters.
    pub query: FxHashMap<String, String>,
    /// Source syntax.
    pub form: UriForm,
}

impl ActionUri {
    /// Parses either form.
    ///
    /// Returns `None` for free text that is neither.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.contains("://") {
            Self::parse_full(input)
        } else if input.contains(':') {
            Self::parse_shorthand(input)
        } else {
            None
        }
    }

    fn parse_full(input: &str) -> Option<Self> {
        let url = Url::parse(input).ok()?;
        let action = url.host_str().filter(|host| !host.is_empty())?;

        let path: Vec<String> = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .map(decode)
                    .collect()
            })
            .unwrap_or_default();

        let query: FxHashMap<String, String> = url.query_pairs().into_owned().collect();

        Some(Self {
            action: decode(action),
            path,
            query,
            form: UriForm::Full {
                scheme: url.scheme().to_string(),
            },
        })
    }

    fn parse_shorthand(input: &str) -> Option<Self> {
        let (body, query) = match input.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (input, None),
        };

        let mut parts = body.split(':');
        let action = parts.next()?;
        if action.is_empty() || action.chars().any(char::is_whitespace) {
            return None;
        }

        let path: Vec<String> = parts
            .filter(|segment| !segment.is_empty())
            .map(decode)
            .collect();

        let query: FxHashMap<String, String> = query
            .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Some(Self {
            action: action.to_string(),
            path,
            query,
            form: UriForm::Shorthand,
        })
    }

    /// Returns the first path segment.
    #[inline]
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    /// Returns the first path segment title-cased for display.
    ///
    /// `"obsidian"` becomes `"Obsidian"`, `"visual studio code"` becomes
    /// `"Visual Studio Code"`.
    #[must_use]
    pub fn display_target(&self) -> Option<String> {
        self.target().map(title_case)
    }

    /// Returns a query parameter.
    #[inline]
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Percent-decodes a segment, keeping the raw text if it is not valid UTF-8.
fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .unwrap_or(Cow::Borrowed(segment))
        .into_owned()
}

/// Capitalizes the first letter of every word.
///
/// Word boundaries are whitespace and `-`; separators are preserved.
#[must_use]
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut at_word_start = true;

    for ch in input.chars() {
        if ch.is_whitespace() || ch == '-' {
            at_word_start = true;
            out.push(ch);
        } else if at_word_start {
            out.extend(ch.to_uppercase());
            at_word_start = false;
        } else {
            out.push(ch);
        }
    }

    out
}

// ============================================================================
// Tests
// ============================================================================
