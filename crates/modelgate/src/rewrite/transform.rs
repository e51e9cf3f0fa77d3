//! Ordered, fail-isolated rewrite stages over a JSON request body.
//!
//! Each enabled [`TransformRule`] is compiled once into a stage. Stages run in
//! configured order, each against the previous stage's output. A stage that
//! fails leaves the body as it was before that stage and the next stage
//! carries on; a broken rule never aborts the request.

use std::borrow::Cow;
use std::io;

use regex::{Regex, RegexBuilder};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::ser::{Formatter, Serializer};
use tracing::{debug, warn};

use super::json_path::{self, JsonPath, Location};
use crate::error::TransformError;

/// Kind of rewrite a rule performs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum RuleKind {
    /// Text substitution over the serialized body.
    RegexReplace,
    /// Delete every location matched by a JSONPath query.
    JsonPathDrop,
    /// Set a literal value at a dotted path.
    JsonPathAdd,
    /// Unrecognised kind; compiled to a no-op.
    Unknown(String),
}

impl From<String> for RuleKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "regex_replace" => RuleKind::RegexReplace,
            "jsonpath_drop" => RuleKind::JsonPathDrop,
            "jsonpath_add" => RuleKind::JsonPathAdd,
            _ => RuleKind::Unknown(s),
        }
    }
}

/// One configured body rewrite, as it appears in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformRule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    // regex_replace
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub replacement: Option<String>,
    /// `|`-separated: `IGNORECASE`, `MULTILINE`, `DOTALL`.
    #[serde(default)]
    pub flags: Option<String>,

    // jsonpath_drop / jsonpath_add
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

impl TransformRule {
    fn blank(name: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            pattern: None,
            replacement: None,
            flags: None,
            path: None,
            value: None,
        }
    }

    pub fn regex_replace(
        name: impl Into<String>,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            pattern: Some(pattern.into()),
            replacement: Some(replacement.into()),
            ..Self::blank(name, RuleKind::RegexReplace)
        }
    }

    pub fn jsonpath_drop(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::blank(name, RuleKind::JsonPathDrop)
        }
    }

    pub fn jsonpath_add(name: impl Into<String>, path: impl Into<String>, value: Value) -> Self {
        Self {
            path: Some(path.into()),
            value: Some(value),
            ..Self::blank(name, RuleKind::JsonPathAdd)
        }
    }

    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = Some(flags.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

enum Stage {
    RegexReplace { regex: Regex, replacement: String },
    JsonPathDrop { path: JsonPath },
    JsonPathAdd { keys: Vec<String>, value: Value },
    /// A rule that could not be compiled. Runs as a no-op.
    Inert,
}

struct CompiledRule {
    name: String,
    stage: Stage,
}

/// The compiled, ordered rewrite pipeline shared by all requests.
pub struct TransformPipeline {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("rules", &self.rule_names())
            .finish()
    }
}

impl TransformPipeline {
    /// Compile `rules`, keeping configured order. Disabled rules are skipped;
    /// rules that fail to compile are kept as no-ops and logged.
    pub fn new(rules: &[TransformRule]) -> Self {
        let rules = rules
            .iter()
            .filter(|r| r.enabled)
            .map(|rule| CompiledRule {
                name: rule.name.clone(),
                stage: compile(rule).unwrap_or_else(|reason| {
                    warn!(rule = %rule.name, "transformation disabled: {reason}");
                    Stage::Inert
                }),
            })
            .collect();
        Self { rules }
    }

    /// A pipeline that leaves bodies untouched.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Names of the enabled rules in execution order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Run every stage in order over a copy of `body`.
    pub fn apply(&self, body: &Value) -> Value {
        let mut current = body.clone();
        for rule in &self.rules {
            match rule.stage.run(&current) {
                Ok(None) => {}
                Ok(Some(next)) => current = next,
                Err(e) => {
                    warn!(rule = %rule.name, "transformation failed, keeping previous body: {e}");
                }
            }
        }
        current
    }
}

fn compile(rule: &TransformRule) -> Result<Stage, String> {
    match &rule.kind {
        RuleKind::RegexReplace => {
            let pattern = rule.pattern.as_deref().ok_or("regex_replace needs a pattern")?;
            let regex = build_regex(pattern, rule.flags.as_deref()).map_err(|e| e.to_string())?;
            let replacement =
                expansion_template(rule.replacement.as_deref().unwrap_or_default(), &regex)?;
            Ok(Stage::RegexReplace { regex, replacement })
        }
        RuleKind::JsonPathDrop => {
            let path = rule.path.as_deref().ok_or("jsonpath_drop needs a path")?;
            let path = JsonPath::parse(path).map_err(|e| e.to_string())?;
            Ok(Stage::JsonPathDrop { path })
        }
        RuleKind::JsonPathAdd => {
            let path = rule.path.as_deref().ok_or("jsonpath_add needs a path")?;
            let value = rule.value.clone().ok_or("jsonpath_add needs a value")?;
            let keys = json_path::dotted_keys(path).map_err(|e| e.to_string())?;
            Ok(Stage::JsonPathAdd { keys, value })
        }
        RuleKind::Unknown(kind) => Err(format!("unknown transformation type '{kind}'")),
    }
}

fn build_regex(pattern: &str, flags: Option<&str>) -> Result<Regex, TransformError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.unwrap_or_default().split('|').map(str::trim) {
        match flag.to_ascii_uppercase().as_str() {
            "" => {}
            "IGNORECASE" => {
                builder.case_insensitive(true);
            }
            "MULTILINE" => {
                builder.multi_line(true);
            }
            "DOTALL" => {
                builder.dot_matches_new_line(true);
            }
            other => warn!("ignoring unknown regex flag '{other}'"),
        }
    }
    Ok(builder.build()?)
}

/// Translate a backslash replacement template (`\1`, `\g<name>`, `\n`) into
/// `regex` expansion syntax. `$` is always literal.
fn expansion_template(raw: &str, regex: &Regex) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            push_literal(&mut out, c);
            continue;
        }
        let Some(escaped) = chars.next() else {
            return Err("replacement ends with a lone backslash".to_string());
        };
        match escaped {
            '0' => {
                let mut code = 0u8;
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d as u8;
                            chars.next();
                        }
                        None => break,
                    }
                }
                push_literal(&mut out, char::from(code));
            }
            '1'..='9' => {
                let mut group = escaped.to_digit(10).unwrap_or_default() as usize;
                if let Some(d) = chars.peek().and_then(|d| d.to_digit(10)) {
                    group = group * 10 + d as usize;
                    chars.next();
                }
                push_group(&mut out, &group.to_string(), regex)?;
            }
            'g' => {
                if chars.next() != Some('<') {
                    return Err("missing '<' after \\g".to_string());
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('>') => break,
                        Some(c) => name.push(c),
                        None => return Err("missing '>' in group reference".to_string()),
                    }
                }
                push_group(&mut out, &name, regex)?;
            }
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            c if c.is_ascii_alphabetic() => return Err(format!("bad escape \\{c} in replacement")),
            other => {
                out.push('\\');
                push_literal(&mut out, other);
            }
        }
    }
    Ok(out)
}

fn push_literal(out: &mut String, c: char) {
    if c == '$' {
        out.push_str("$$");
    } else {
        out.push(c);
    }
}

fn push_group(out: &mut String, group: &str, regex: &Regex) -> Result<(), String> {
    let known = match group.parse::<usize>() {
        Ok(index) => index < regex.captures_len(),
        Err(_) => regex.capture_names().flatten().any(|name| name == group),
    };
    if !known {
        return Err(format!("invalid group reference '{group}'"));
    }
    out.push_str("${");
    out.push_str(group);
    out.push('}');
    Ok(())
}

/// JSON layout matched by `regex_replace` patterns: `", "` and `": "`
/// separators, non-ASCII characters written as `\uXXXX`.
struct SpacedAscii;

impl Formatter for SpacedAscii {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let bytes = fragment.as_bytes();
        let mut start = 0;
        for (i, c) in fragment.char_indices() {
            if c.is_ascii() {
                continue;
            }
            writer.write_all(&bytes[start..i])?;
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = i + c.len_utf8();
        }
        writer.write_all(&bytes[start..])
    }
}

fn to_spaced_json(body: &Value) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    body.serialize(&mut Serializer::with_formatter(&mut out, SpacedAscii))?;
    String::from_utf8(out).map_err(serde_json::Error::custom)
}

impl Stage {
    /// `Ok(None)` means the body is unchanged.
    fn run(&self, body: &Value) -> Result<Option<Value>, TransformError> {
        match self {
            Stage::RegexReplace { regex, replacement } => {
                let text = to_spaced_json(body).map_err(TransformError::InvalidJson)?;
                let replaced = regex.replace_all(&text, replacement.as_str());
                if let Cow::Borrowed(_) = replaced {
                    return Ok(None);
                }
                let next: Value =
                    serde_json::from_str(&replaced).map_err(TransformError::InvalidJson)?;
                if !next.is_object() {
                    return Err(TransformError::NotAnObject);
                }
                Ok(Some(next))
            }
            Stage::JsonPathDrop { path } => {
                let mut matches: Vec<Location> = path.find(body);
                if matches.is_empty() {
                    debug!(path = path.as_str(), "no matches for jsonpath_drop");
                    return Ok(None);
                }
                // Deepest first, and later siblings before earlier ones, so a
                // removal never shifts the location of one still pending.
                matches.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));
                let mut next = body.clone();
                let removed = matches
                    .iter()
                    .filter(|loc| json_path::remove_at(&mut next, loc))
                    .count();
                debug!(path = path.as_str(), removed, "jsonpath_drop applied");
                Ok(Some(next))
            }
            Stage::JsonPathAdd { keys, value } => {
                let mut next = body.clone();
                json_path::set_at(&mut next, keys, value.clone())?;
                debug!(path = %keys.join("."), "jsonpath_add applied");
                Ok(Some(next))
            }
            Stage::Inert => Ok(None),
        }
    }
}
