//! Header rewrite engine.
//!
//! A [`HeaderPolicy`] is compiled once from [`HeaderRules`] and applied to
//! every outgoing request in a fixed order: drop, add-if-absent, force.

use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, warn};

/// Characters that mark a drop rule as a regular expression.
const PATTERN_CHARS: &[char] = &[
    '.', '*', '+', '?', '[', ']', '{', '}', '(', ')', '^', '$', '|', '\\',
];

/// Header rules as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeaderRules {
    pub drop_all: bool,
    pub drop_headers: Vec<String>,
    pub add_headers: BTreeMap<String, String>,
    pub force_headers: BTreeMap<String, String>,
}

/// A drop rule, classified once at load time.
#[derive(Debug, Clone)]
pub enum DropRule {
    /// Lower-cased header name, compared case-insensitively.
    Exact(String),
    /// Anchored at the start of the header name, case-insensitive.
    Pattern(Regex),
}

impl DropRule {
    /// Classify `rule`. Returns `None` (and logs) for a pattern that does not
    /// compile.
    pub fn classify(rule: &str) -> Option<Self> {
        if !rule.contains(PATTERN_CHARS) {
            return Some(DropRule::Exact(rule.to_ascii_lowercase()));
        }
        match RegexBuilder::new(&format!("^(?:{rule})"))
            .case_insensitive(true)
            .build()
        {
            Ok(re) => Some(DropRule::Pattern(re)),
            Err(e) => {
                warn!(rule, "ignoring invalid header drop pattern: {e}");
                None
            }
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            DropRule::Exact(exact) => name.eq_ignore_ascii_case(exact),
            DropRule::Pattern(re) => re.is_match(name),
        }
    }
}

/// Compiled header policy. Immutable and shared by all requests.
#[derive(Debug, Clone, Default)]
pub struct HeaderPolicy {
    drop_all: bool,
    drop_rules: Vec<DropRule>,
    add: Vec<(HeaderName, HeaderValue)>,
    force: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderPolicy {
    pub fn new(rules: &HeaderRules) -> Self {
        Self {
            drop_all: rules.drop_all,
            drop_rules: rules
                .drop_headers
                .iter()
                .filter_map(|r| DropRule::classify(r))
                .collect(),
            add: parse_pairs(&rules.add_headers, "add_headers"),
            force: parse_pairs(&rules.force_headers, "force_headers"),
        }
    }

    pub fn drop_rules(&self) -> &[DropRule] {
        &self.drop_rules
    }

    /// Apply the policy to `incoming`, returning a new header map.
    pub fn process(&self, incoming: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        if !self.drop_all {
            for (name, value) in incoming {
                if self.should_drop(name.as_str()) {
                    debug!(header = %name, "dropping header");
                    continue;
                }
                out.append(name.clone(), value.clone());
            }
        }

        for (name, value) in &self.add {
            if !out.contains_key(name) {
                out.insert(name.clone(), value.clone());
            }
        }

        for (name, value) in &self.force {
            out.insert(name.clone(), value.clone());
        }

        out
    }

    fn should_drop(&self, name: &str) -> bool {
        self.drop_rules.iter().any(|rule| rule.matches(name))
    }
}

fn parse_pairs(pairs: &BTreeMap<String, String>, section: &str) -> Vec<(HeaderName, HeaderValue)> {
    pairs
        .iter()
        .filter_map(|(k, v)| {
            let name = HeaderName::from_bytes(k.as_bytes());
            let value = HeaderValue::from_str(v);
            match (name, value) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    warn!(section, header = %k, "ignoring header that is not valid HTTP");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn rules(drop: &[&str]) -> HeaderRules {
        HeaderRules {
            drop_headers: drop.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn classification() {
        assert!(matches!(DropRule::classify("X-Api-Key"), Some(DropRule::Exact(s)) if s == "x-api-key"));
        assert!(matches!(DropRule::classify("x-stainless-.*"), Some(DropRule::Pattern(_))));
        assert!(DropRule::classify("x-(").is_none());
    }

    #[test]
    fn exact_drop_is_case_insensitive() {
        let policy = HeaderPolicy::new(&rules(&["User-Agent"]));
        let out = policy.process(&headers(&[("user-agent", "curl"), ("accept", "*/*")]));
        assert!(!out.contains_key("user-agent"));
        assert!(out.contains_key("accept"));
    }

    #[test]
    fn exact_drop_does_not_prefix_match() {
        let policy = HeaderPolicy::new(&rules(&["x-trace"]));
        let out = policy.process(&headers(&[("x-trace-id", "1")]));
        assert!(out.contains_key("x-trace-id"));
    }

    #[test]
    fn pattern_drop_is_anchored_at_start() {
        let policy = HeaderPolicy::new(&rules(&["x-stainless-.*"]));
        let out = policy.process(&headers(&[
            ("x-stainless-os", "linux"),
            ("X-Stainless-Lang", "js"),
            ("my-x-stainless-thing", "keep"),
        ]));
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("my-x-stainless-thing"));
    }

    #[test]
    fn invalid_pattern_is_skipped_not_fatal() {
        let policy = HeaderPolicy::new(&rules(&["x-(", "accept"]));
        assert_eq!(policy.drop_rules().len(), 1);
        let out = policy.process(&headers(&[("accept", "*/*"), ("x-other", "v")]));
        assert!(!out.contains_key("accept"));
        assert!(out.contains_key("x-other"));
    }

    #[test]
    fn add_only_when_absent() {
        let mut r = HeaderRules::default();
        r.add_headers.insert("x-team".into(), "default".into());
        r.add_headers.insert("x-new".into(), "added".into());
        let out = HeaderPolicy::new(&r).process(&headers(&[("x-team", "mine")]));
        assert_eq!(out["x-team"], "mine");
        assert_eq!(out["x-new"], "added");
    }

    #[test]
    fn force_always_wins() {
        let mut r = HeaderRules::default();
        r.add_headers.insert("x-env".into(), "from-add".into());
        r.force_headers.insert("x-env".into(), "forced".into());
        r.force_headers.insert("user-agent".into(), "modelgate".into());
        let out = HeaderPolicy::new(&r).process(&headers(&[("user-agent", "curl")]));
        assert_eq!(out["x-env"], "forced");
        assert_eq!(out["user-agent"], "modelgate");
    }

    #[test]
    fn drop_all_keeps_only_configured_headers() {
        let mut r = HeaderRules {
            drop_all: true,
            ..Default::default()
        };
        r.add_headers.insert("x-a".into(), "1".into());
        r.add_headers.insert("x-b".into(), "2".into());
        r.force_headers.insert("x-b".into(), "forced".into());
        let out = HeaderPolicy::new(&r).process(&headers(&[
            ("authorization", "Bearer secret"),
            ("x-a", "client"),
        ]));
        assert_eq!(out.len(), 2);
        assert_eq!(out["x-a"], "1");
        assert_eq!(out["x-b"], "forced");
    }

    #[test]
    fn processing_is_idempotent() {
        let mut r = rules(&["x-drop", "x-pat-.*"]);
        r.add_headers.insert("x-drop".into(), "re-added".into());
        r.add_headers.insert("x-add".into(), "a".into());
        r.force_headers.insert("x-force".into(), "f".into());
        r.force_headers.insert("x-pat-1".into(), "forced".into());
        let policy = HeaderPolicy::new(&r);

        let incoming = headers(&[
            ("x-drop", "1"),
            ("x-pat-2", "2"),
            ("x-force", "client"),
            ("accept", "*/*"),
        ]);
        let once = policy.process(&incoming);
        let twice = policy.process(&once);
        assert_eq!(once, twice);
        assert_eq!(once["x-drop"], "re-added");
        assert!(!once.contains_key("x-pat-2"));
    }

    #[test]
    fn invalid_configured_header_is_skipped() {
        let mut r = HeaderRules::default();
        r.force_headers.insert("bad header".into(), "v".into());
        r.force_headers.insert("x-ok".into(), "v".into());
        let out = HeaderPolicy::new(&r).process(&HeaderMap::new());
        assert_eq!(out.len(), 1);
    }
}
