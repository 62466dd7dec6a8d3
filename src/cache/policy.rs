//! TTL policy per resource path.
//!
//! Rules are checked in the order they were added and the first match wins,
//! so more specific rules must be added before broader ones.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

/// Default TTL for paths no rule matches.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A single product, `/products/<id>` with no further segments
static PRODUCT_DETAIL_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^/products/[^/]+$").expect("Invalid product detail regex"));

/// Predicate over a resource path.
#[derive(Debug, Clone)]
pub enum PathMatcher {
  /// Path equals the given string
  Exact(String),
  /// Path equals the prefix or continues it with a `/` segment
  Prefix(String),
  /// Path matches the regular expression
  Pattern(Regex),
}

impl PathMatcher {
  pub fn matches(&self, path: &str) -> bool {
    match self {
      PathMatcher::Exact(p) => path == p,
      PathMatcher::Prefix(prefix) => {
        let prefix = prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
          Some(rest) => rest.is_empty() || rest.starts_with('/'),
          None => false,
        }
      }
      PathMatcher::Pattern(re) => re.is_match(path),
    }
  }
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
  pub matcher: PathMatcher,
  pub ttl: Duration,
}

/// Ordered mapping from resource paths to TTLs.
#[derive(Debug, Clone)]
pub struct PolicyTable {
  rules: Vec<PolicyRule>,
  default_ttl: Duration,
}

impl Default for PolicyTable {
  fn default() -> Self {
    Self::storefront()
  }
}

impl PolicyTable {
  /// Empty table that gives every path `default_ttl`.
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      rules: Vec::new(),
      default_ttl,
    }
  }

  /// Built-in table for the storefront API.
  ///
  /// - Taxonomies (categories, brands, vehicle fitment): 1 hour
  /// - Single product pages: 10 minutes
  /// - Search results: 30 seconds
  /// - Product listings: 1 minute
  pub fn storefront() -> Self {
    Self::new(DEFAULT_TTL)
      .rule(PathMatcher::Prefix("/categories".into()), Duration::from_secs(3600))
      .rule(PathMatcher::Prefix("/brands".into()), Duration::from_secs(3600))
      .rule(PathMatcher::Prefix("/vehicles".into()), Duration::from_secs(3600))
      .rule(PathMatcher::Pattern(PRODUCT_DETAIL_PATTERN.clone()), Duration::from_secs(600))
      .rule(PathMatcher::Prefix("/search".into()), Duration::from_secs(30))
      .rule(PathMatcher::Prefix("/products".into()), Duration::from_secs(60))
  }

  /// Append a rule. It only applies to paths no earlier rule matched.
  pub fn rule(mut self, matcher: PathMatcher, ttl: Duration) -> Self {
    self.rules.push(PolicyRule { matcher, ttl });
    self
  }

  /// Replace the TTL for unmatched paths.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn rules(&self) -> &[PolicyRule] {
    &self.rules
  }

  /// TTL for a resource path.
  pub fn ttl_for(&self, path: &str) -> Duration {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(path))
      .map(|rule| rule.ttl)
      .unwrap_or(self.default_ttl)
  }
}
