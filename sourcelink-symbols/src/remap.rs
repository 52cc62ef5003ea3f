//! Source-link tables: rewriting build-time document paths into retrievable URLs.
//!
//! A source-link table is a JSON document of the form
//!
//! ```json
//! {
//!   "documents": {
//!     "/_/*": "https://raw.example.org/project/0123abcd/*",
//!     "C:\\build\\generated.cs": "https://example.org/generated.cs"
//!   }
//! }
//! ```
//!
//! Rules are tried in the order they appear in the document and the first match wins. A rule
//! whose pattern and template each contain exactly one `*` is a wildcard rule; anything else is
//! compared literally. Both kinds of comparison ignore case.

use serde::Deserialize;
use tracing::trace;

/// Errors parsing a source-link table.
#[derive(Debug, thiserror::Error)]
pub enum RemapError {
    #[error("invalid source link json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document pattern {0:?} does not map to a string")]
    NonStringTemplate(String),
}

/// One entry of a source-link table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemapRule {
    pub pattern: String,
    pub template: String,
}

impl RemapRule {
    pub fn new(pattern: &str, template: &str) -> RemapRule {
        RemapRule {
            pattern: pattern.to_owned(),
            template: template.to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
enum Matcher {
    Literal {
        path: String,
        url: String,
    },
    Wildcard {
        prefix: String,
        suffix: String,
        url_prefix: String,
        url_suffix: String,
    },
}

impl Matcher {
    fn compile(rule: &RemapRule) -> Matcher {
        match (
            split_wildcard(&rule.pattern),
            split_wildcard(&rule.template),
        ) {
            (Some((prefix, suffix)), Some((url_prefix, url_suffix))) => Matcher::Wildcard {
                prefix: prefix.to_owned(),
                suffix: suffix.to_owned(),
                url_prefix: url_prefix.to_owned(),
                url_suffix: url_suffix.to_owned(),
            },
            _ => Matcher::Literal {
                path: rule.pattern.clone(),
                url: rule.template.clone(),
            },
        }
    }

    fn apply(&self, path: &str) -> Option<String> {
        match self {
            Matcher::Literal { path: literal, url } => {
                eq_ignore_case(literal, path).then(|| url.clone())
            }
            Matcher::Wildcard {
                prefix,
                suffix,
                url_prefix,
                url_suffix,
            } => {
                let rest = strip_prefix_ignore_case(path, prefix)?;
                let capture = strip_suffix_ignore_case(rest, suffix)?;
                if capture.is_empty() {
                    return None;
                }
                Some(format!(
                    "{url_prefix}{}{url_suffix}",
                    capture.replace('\\', "/")
                ))
            }
        }
    }
}

/// Split `s` around its only `*`, or `None` if it has zero or several.
fn split_wildcard(s: &str) -> Option<(&str, &str)> {
    let (prefix, suffix) = s.split_once('*')?;
    if suffix.contains('*') {
        None
    } else {
        Some((prefix, suffix))
    }
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.chars().count() == b.chars().count()
        && a.chars().zip(b.chars()).all(|(a, b)| chars_eq_ignore_case(a, b))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let mut chars = s.char_indices();
    for expected in prefix.chars() {
        let (_, c) = chars.next()?;
        if !chars_eq_ignore_case(c, expected) {
            return None;
        }
    }
    Some(chars.as_str())
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let mut end = s.len();
    let mut chars = s.char_indices().rev();
    for expected in suffix.chars().rev() {
        let (idx, c) = chars.next()?;
        if !chars_eq_ignore_case(c, expected) {
            return None;
        }
        end = idx;
    }
    Some(&s[..end])
}

#[derive(Deserialize)]
struct SourceLinkJson {
    #[serde(default)]
    documents: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A compiled source-link table.
///
/// The default table has no rules and returns every path unchanged.
#[derive(Clone, Debug, Default)]
pub struct SourceRemap {
    rules: Vec<RemapRule>,
    matchers: Vec<Matcher>,
}

impl SourceRemap {
    /// Compile `rules`, keeping their order.
    pub fn build(rules: Vec<RemapRule>) -> SourceRemap {
        let matchers = rules.iter().map(Matcher::compile).collect();
        SourceRemap { rules, matchers }
    }

    /// Parse the JSON value of a source-link custom debug information blob.
    ///
    /// An empty blob is an empty table.
    pub fn from_json(bytes: &[u8]) -> Result<SourceRemap, RemapError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(SourceRemap::default());
        }
        let json: SourceLinkJson = serde_json::from_slice(bytes)?;
        let rules = json
            .documents
            .unwrap_or_default()
            .into_iter()
            .map(|(pattern, template)| match template {
                serde_json::Value::String(template) => Ok(RemapRule { pattern, template }),
                _ => Err(RemapError::NonStringTemplate(pattern)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SourceRemap::build(rules))
    }

    /// The URL `path` maps to, or `path` itself when no rule matches.
    pub fn resolve(&self, path: &str) -> String {
        for matcher in &self.matchers {
            if let Some(url) = matcher.apply(path) {
                trace!("source link: {path} -> {url}");
                return url;
            }
        }
        path.to_owned()
    }

    pub fn rules(&self) -> &[RemapRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
