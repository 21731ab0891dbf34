//! Asset selection expressions
//!
//! A selection is a comma-separated list of terms. Each term is one of:
//!
//! - `*` or a glob such as `raw_*` / `flight?` matched against asset names
//! - an exact asset name
//! - `group:<name>` or `tag:<name>`
//!
//! Prefixing a term with `+` adds all of its ancestors, suffixing it with `+`
//! adds all of its descendants: `+daily_metrics` selects the metrics asset and
//! everything it reads, `raw_flights+` selects raw flights and everything
//! downstream of it.

use crate::graph::{AssetGraph, GraphError};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

/// Errors produced when parsing or resolving a selection
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("Selection is empty")]
    Empty,

    #[error("Invalid selection pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Selection term '{0}' matched no assets")]
    NoMatch(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone)]
enum Matcher {
    All,
    Name(String),
    Glob(Regex),
    Group(String),
    Tag(String),
}

#[derive(Debug, Clone)]
struct SelectionTerm {
    raw: String,
    matcher: Matcher,
    with_ancestors: bool,
    with_descendants: bool,
}

/// Parsed asset selection
#[derive(Debug, Clone)]
pub struct AssetSelection {
    terms: Vec<SelectionTerm>,
}

impl AssetSelection {
    /// Select every asset
    pub fn all() -> Self {
        Self {
            terms: vec![SelectionTerm {
                raw: "*".to_string(),
                matcher: Matcher::All,
                with_ancestors: false,
                with_descendants: false,
            }],
        }
    }

    /// Parse a selection expression
    pub fn parse(expr: &str) -> Result<Self, SelectionError> {
        let terms = expr
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(parse_term)
            .collect::<Result<Vec<_>, _>>()?;

        if terms.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(Self { terms })
    }

    /// Resolve the selection against a graph.
    ///
    /// Every term must match at least one asset so that typos fail loudly.
    pub fn resolve(&self, graph: &AssetGraph) -> Result<BTreeSet<String>, SelectionError> {
        let mut selected = BTreeSet::new();

        for term in &self.terms {
            let matched: Vec<String> = graph
                .assets()
                .into_iter()
                .filter(|asset| match &term.matcher {
                    Matcher::All => true,
                    Matcher::Name(name) => &asset.name == name,
                    Matcher::Glob(re) => re.is_match(&asset.name),
                    Matcher::Group(group) => asset.in_group(group),
                    Matcher::Tag(tag) => asset.has_tag(tag),
                })
                .map(|asset| asset.name.clone())
                .collect();

            if matched.is_empty() {
                return Err(SelectionError::NoMatch(term.raw.clone()));
            }

            if term.with_ancestors {
                selected.extend(graph.ancestors(matched.as_slice())?);
            }
            if term.with_descendants {
                selected.extend(graph.descendants(matched.as_slice())?);
            }
            selected.extend(matched);
        }

        Ok(selected)
    }
}

impl fmt::Display for AssetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw: Vec<&str> = self.terms.iter().map(|t| t.raw.as_str()).collect();
        f.write_str(&raw.join(","))
    }
}

fn parse_term(raw: &str) -> Result<SelectionTerm, SelectionError> {
    let mut body = raw;
    let with_ancestors = body.starts_with('+');
    if with_ancestors {
        body = &body[1..];
    }
    let with_descendants = body.ends_with('+');
    if with_descendants {
        body = &body[..body.len() - 1];
    }

    let body = body.trim();
    if body.is_empty() {
        return Err(SelectionError::InvalidPattern {
            pattern: raw.to_string(),
            reason: "missing asset pattern".to_string(),
        });
    }

    let matcher = if body == "*" {
        Matcher::All
    } else if let Some(group) = body.strip_prefix("group:") {
        Matcher::Group(non_empty(raw, group)?)
    } else if let Some(tag) = body.strip_prefix("tag:") {
        Matcher::Tag(non_empty(raw, tag)?)
    } else if body.contains(['*', '?']) {
        Matcher::Glob(glob_to_regex(raw, body)?)
    } else if body
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        Matcher::Name(body.to_string())
    } else {
        return Err(SelectionError::InvalidPattern {
            pattern: raw.to_string(),
            reason: "asset names may only contain letters, digits, '_', '-' and '.'".to_string(),
        });
    };

    Ok(SelectionTerm {
        raw: raw.to_string(),
        matcher,
        with_ancestors,
        with_descendants,
    })
}

fn non_empty(raw: &str, value: &str) -> Result<String, SelectionError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SelectionError::InvalidPattern {
            pattern: raw.to_string(),
            reason: "missing name after prefix".to_string(),
        });
    }
    Ok(value.to_string())
}

fn glob_to_regex(raw: &str, glob: &str) -> Result<Regex, SelectionError> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| SelectionError::InvalidPattern {
        pattern: raw.to_string(),
        reason: e.to_string(),
    })
}
