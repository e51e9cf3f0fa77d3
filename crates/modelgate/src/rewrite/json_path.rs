//! A small JSONPath evaluator that reports match *locations*.
//!
//! Supported syntax: `$`, `.name`, `['name']`, `["name"]`, `[n]`, `.*`,
//! `[*]`, `..name`, and `..*`. Locations are returned as explicit key/index
//! chains so callers can delete the matched values afterwards.

use serde_json::{Map, Value};

use crate::error::TransformError;

/// One step in a concrete location inside a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathElement {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for PathElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathElement::Key(k) => write!(f, ".{k}"),
            PathElement::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A concrete location: the chain of keys/indices from the root.
pub type Location = Vec<PathElement>;

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    Name(String),
    Index(usize),
    Wildcard,
    DescendantName(String),
    DescendantWildcard,
}

/// A compiled JSONPath query.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    source: String,
    selectors: Vec<Selector>,
}

impl JsonPath {
    /// Parse a query. The leading `$` is required.
    pub fn parse(path: &str) -> Result<Self, TransformError> {
        let invalid = |reason: &str| TransformError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let mut chars = path.trim().chars().peekable();
        if chars.next() != Some('$') {
            return Err(invalid("must start with '$'"));
        }

        let mut selectors = Vec::new();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let descendant = chars.next_if_eq(&'.').is_some();
                    if chars.next_if_eq(&'*').is_some() {
                        selectors.push(if descendant {
                            Selector::DescendantWildcard
                        } else {
                            Selector::Wildcard
                        });
                        continue;
                    }
                    let mut name = String::new();
                    while let Some(n) = chars.next_if(|n| *n != '.' && *n != '[') {
                        name.push(n);
                    }
                    if name.is_empty() {
                        return Err(invalid("empty member name"));
                    }
                    selectors.push(if descendant {
                        Selector::DescendantName(name)
                    } else {
                        Selector::Name(name)
                    });
                }
                '[' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    let mut quote: Option<char> = None;
                    for n in chars.by_ref() {
                        match (quote, n) {
                            (None, ']') => {
                                closed = true;
                                break;
                            }
                            (None, '\'' | '"') => quote = Some(n),
                            (Some(q), n) if n == q => quote = None,
                            _ => inner.push(n),
                        }
                    }
                    if !closed {
                        return Err(invalid("unterminated '['"));
                    }
                    let trimmed = inner.trim();
                    if trimmed == "*" {
                        selectors.push(Selector::Wildcard);
                    } else if let Ok(index) = trimmed.parse::<usize>() {
                        selectors.push(Selector::Index(index));
                    } else if trimmed.is_empty() {
                        return Err(invalid("empty bracket selector"));
                    } else {
                        selectors.push(Selector::Name(inner));
                    }
                }
                other => return Err(invalid(&format!("unexpected character '{other}'"))),
            }
        }

        Ok(Self {
            source: path.to_string(),
            selectors,
        })
    }

    /// The query text this path was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Every location in `root` matched by this query, in document order.
    pub fn find(&self, root: &Value) -> Vec<Location> {
        let mut current: Vec<(Location, &Value)> = vec![(Vec::new(), root)];
        for selector in &self.selectors {
            let mut next = Vec::new();
            for (location, value) in current {
                select(selector, location, value, &mut next);
            }
            current = next;
        }
        current.into_iter().map(|(location, _)| location).collect()
    }
}

fn select<'a>(
    selector: &Selector,
    location: Location,
    value: &'a Value,
    out: &mut Vec<(Location, &'a Value)>,
) {
    match selector {
        Selector::Name(name) => {
            if let Some(child) = value.as_object().and_then(|o| o.get(name)) {
                out.push((extend(&location, PathElement::Key(name.clone())), child));
            }
        }
        Selector::Index(index) => {
            if let Some(child) = value.as_array().and_then(|a| a.get(*index)) {
                out.push((extend(&location, PathElement::Index(*index)), child));
            }
        }
        Selector::Wildcard => out.extend(children(&location, value)),
        Selector::DescendantName(name) => {
            for (loc, node) in self_and_descendants(location, value) {
                if let Some(child) = node.as_object().and_then(|o| o.get(name)) {
                    out.push((extend(&loc, PathElement::Key(name.clone())), child));
                }
            }
        }
        Selector::DescendantWildcard => {
            let mut nodes = self_and_descendants(location, value);
            // The starting node itself is not a descendant.
            nodes.remove(0);
            out.extend(nodes);
        }
    }
}

fn extend(location: &Location, element: PathElement) -> Location {
    let mut next = location.clone();
    next.push(element);
    next
}

fn children<'a>(location: &Location, value: &'a Value) -> Vec<(Location, &'a Value)> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (extend(location, PathElement::Key(k.clone())), v))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (extend(location, PathElement::Index(i)), v))
            .collect(),
        _ => Vec::new(),
    }
}

fn self_and_descendants(location: Location, value: &Value) -> Vec<(Location, &Value)> {
    let mut out = vec![(location, value)];
    let mut i = 0;
    while i < out.len() {
        let (loc, node) = (out[i].0.clone(), out[i].1);
        let kids = children(&loc, node);
        out.extend(kids);
        i += 1;
    }
    out
}

/// Remove the value at `location`. Returns `false` if it no longer exists.
///
/// The root itself cannot be removed.
pub fn remove_at(root: &mut Value, location: &[PathElement]) -> bool {
    let Some((last, parents)) = location.split_last() else {
        return false;
    };
    let mut parent = root;
    for element in parents {
        let next = match (element, parent) {
            (PathElement::Key(k), Value::Object(map)) => map.get_mut(k),
            (PathElement::Index(i), Value::Array(items)) => items.get_mut(*i),
            _ => None,
        };
        match next {
            Some(v) => parent = v,
            None => return false,
        }
    }
    match (last, parent) {
        (PathElement::Key(k), Value::Object(map)) => map.remove(k).is_some(),
        (PathElement::Index(i), Value::Array(items)) if *i < items.len() => {
            items.remove(*i);
            true
        }
        _ => false,
    }
}

/// Parse the restricted dotted form used for insertion: `$.a.b.c` or `a.b.c`.
pub fn dotted_keys(path: &str) -> Result<Vec<String>, TransformError> {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    let keys: Vec<String> = body.split('.').map(str::to_string).collect();
    if keys.iter().any(String::is_empty) {
        return Err(TransformError::InvalidPath {
            path: path.to_string(),
            reason: "empty segment".to_string(),
        });
    }
    Ok(keys)
}

/// Set `value` at the dotted `keys` under `root`, creating empty objects for
/// missing intermediate segments and overwriting whatever is at the leaf.
pub fn set_at(root: &mut Value, keys: &[String], value: Value) -> Result<(), TransformError> {
    let Some((leaf, parents)) = keys.split_last() else {
        return Err(TransformError::InvalidPath {
            path: String::new(),
            reason: "no segments".to_string(),
        });
    };
    let mut current = root;
    for key in parents {
        let Value::Object(map) = current else {
            return Err(TransformError::BlockedPath {
                segment: key.clone(),
            });
        };
        current = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match current {
        Value::Object(map) => {
            map.insert(leaf.clone(), value);
            Ok(())
        }
        _ => Err(TransformError::BlockedPath {
            segment: leaf.clone(),
        }),
    }
}
