//! Appender patterns: which monitors below a configured monitor an
//! appender applies to.
//!
//! Two grammars are accepted.
//!
//! Legacy tokens:
//!
//! | token  | applies to                              |
//! |--------|-----------------------------------------|
//! | `.`    | the monitor itself                      |
//! | `./`   | the monitor itself                      |
//! | `/*`   | direct children only                    |
//! | `/**`  | all descendants, not the monitor        |
//! | `./*`  | direct children only                    |
//! | `./**` | the monitor and all descendants         |
//!
//! Enhanced patterns start with `/` (descendants only) or `./` (the monitor
//! plus matching descendants) followed by dot separated segments relative to
//! the monitor. Inside a segment `#` matches one word character and `*`
//! matches one or more word characters; every other character is literal.
//! A final segment of `**` matches one or more whole segments.
//!
//! ```rust
//! use perfmon_sdk::pattern::CompiledPattern;
//!
//! let pattern = CompiledPattern::compile("WebRequest", "/api.v#.**").unwrap();
//! assert!(pattern.matches("WebRequest.api.v2.users.list"));
//! assert!(!pattern.matches("WebRequest.api.v10.users"));
//! assert!(!pattern.matches("WebRequest"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{PerfMonError, Result};
use crate::monitor::ROOT_NAME;

pub const PARENT_ONLY: &str = "./";
pub const CHILDREN_ONLY: &str = "/*";
pub const ALL_DESCENDANTS: &str = "/**";
/// Older spelling of [`CHILDREN_ONLY`].
pub const DOT_CHILDREN_ONLY: &str = "./*";
pub const PARENT_AND_ALL_DESCENDANTS: &str = "./**";

const ANY_SEGMENT: &str = r"[^.]+";
const ANY_DEPTH: &str = r"[^.]+(?:\.[^.]+)*";

/// One segment of an enhanced pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text mixed with `#` and `*` wildcards; matches one segment.
    Token(String),
    /// `**`: one or more whole segments.
    AnyDepth,
}

/// Parsed form of a pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternKind {
    ParentOnly,
    ChildrenOnly,
    AllDescendants,
    ParentAndAllDescendants,
    Enhanced {
        include_current: bool,
        segments: Vec<Segment>,
    },
}

impl PatternKind {
    /// Parse a pattern string.
    ///
    /// A string is read with the enhanced grammar only when it is not one of
    /// the legacy tokens and starts with `/` or `./` immediately followed by
    /// a non-whitespace character.
    pub fn parse(pattern: &str) -> Result<PatternKind> {
        let p = pattern.trim();
        match p {
            "." | PARENT_ONLY => return Ok(PatternKind::ParentOnly),
            CHILDREN_ONLY | DOT_CHILDREN_ONLY => return Ok(PatternKind::ChildrenOnly),
            ALL_DESCENDANTS => return Ok(PatternKind::AllDescendants),
            PARENT_AND_ALL_DESCENDANTS => return Ok(PatternKind::ParentAndAllDescendants),
            _ => {}
        }

        let (include_current, body) = if let Some(body) = p.strip_prefix("./") {
            (true, body)
        } else if let Some(body) = p.strip_prefix('/') {
            (false, body)
        } else {
            return Err(PerfMonError::invalid_pattern(
                pattern,
                "expected a legacy token or a pattern starting with '/' or './'",
            ));
        };

        match body.chars().next() {
            None => {
                return Err(PerfMonError::invalid_pattern(
                    pattern,
                    "missing segment after prefix",
                ))
            }
            Some(c) if c.is_whitespace() => {
                return Err(PerfMonError::invalid_pattern(
                    pattern,
                    "whitespace after prefix",
                ))
            }
            Some(_) => {}
        }
        if body.chars().any(char::is_whitespace) {
            return Err(PerfMonError::invalid_pattern(pattern, "embedded whitespace"));
        }

        let raw: Vec<&str> = body.split('.').collect();
        let last = raw.len() - 1;
        let mut segments = Vec::with_capacity(raw.len());
        for (i, seg) in raw.into_iter().enumerate() {
            if seg.is_empty() {
                return Err(PerfMonError::invalid_pattern(pattern, "empty segment"));
            }
            if seg == "**" {
                if i != last {
                    return Err(PerfMonError::invalid_pattern(
                        pattern,
                        "'**' must be the final segment",
                    ));
                }
                segments.push(Segment::AnyDepth);
            } else if seg.contains("**") {
                return Err(PerfMonError::invalid_pattern(
                    pattern,
                    "'**' must be a whole segment",
                ));
            } else {
                segments.push(Segment::Token(seg.to_string()));
            }
        }

        Ok(PatternKind::Enhanced {
            include_current,
            segments,
        })
    }

    pub fn applies_to_current(&self) -> bool {
        match self {
            PatternKind::ParentOnly | PatternKind::ParentAndAllDescendants => true,
            PatternKind::ChildrenOnly | PatternKind::AllDescendants => false,
            PatternKind::Enhanced {
                include_current, ..
            } => *include_current,
        }
    }

    pub fn applies_to_descendants(&self) -> bool {
        !matches!(self, PatternKind::ParentOnly)
    }

    /// Regex fragment matching the path below the anchor, if any.
    fn descendant_regex(&self) -> Option<String> {
        match self {
            PatternKind::ParentOnly => None,
            PatternKind::ChildrenOnly => Some(ANY_SEGMENT.to_string()),
            PatternKind::AllDescendants | PatternKind::ParentAndAllDescendants => {
                Some(ANY_DEPTH.to_string())
            }
            PatternKind::Enhanced { segments, .. } => Some(
                segments
                    .iter()
                    .map(|s| match s {
                        Segment::Token(t) => token_regex(t),
                        Segment::AnyDepth => ANY_DEPTH.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(r"\."),
            ),
        }
    }
}

/// Translate one enhanced segment into a regex fragment.
fn token_regex(token: &str) -> String {
    let mut out = String::with_capacity(token.len() * 2);
    let mut buf = [0u8; 4];
    for c in token.chars() {
        match c {
            '#' => out.push_str(r"\w"),
            '*' => out.push_str(r"\w+"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out
}

fn anchored(fragment: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{fragment})$"))
        .map_err(|e| PerfMonError::invalid_pattern(fragment, e.to_string()))
}

fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| match s {
            Segment::Token(t) => t.as_str(),
            Segment::AnyDepth => "**",
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// A pattern compiled against the monitor it is bound to.
#[derive(Debug)]
pub struct CompiledPattern {
    anchor: String,
    source: String,
    kind: PatternKind,
    descendants: Option<Regex>,
    /// First enhanced segment, used when rewriting for a child.
    first_segment: Option<Regex>,
}

impl CompiledPattern {
    /// Compile `pattern` for the monitor named `anchor`.
    pub fn compile(anchor: &str, pattern: &str) -> Result<Self> {
        let kind = PatternKind::parse(pattern)?;

        let prefix = if anchor == ROOT_NAME {
            String::new()
        } else {
            format!(r"{}\.", regex::escape(anchor))
        };
        let descendants = match kind.descendant_regex() {
            Some(fragment) => Some(
                Regex::new(&format!("^{prefix}(?:{fragment})$"))
                    .map_err(|e| PerfMonError::invalid_pattern(pattern, e.to_string()))?,
            ),
            None => None,
        };
        let first_segment = match &kind {
            PatternKind::Enhanced { segments, .. } => match segments.first() {
                Some(Segment::Token(t)) => Some(anchored(&token_regex(t))?),
                _ => None,
            },
            _ => None,
        };

        Ok(Self {
            anchor: anchor.to_string(),
            source: pattern.trim().to_string(),
            kind,
            descendants,
            first_segment,
        })
    }

    /// Name of the monitor the pattern is bound to.
    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    /// The pattern string as configured.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> &PatternKind {
        &self.kind
    }

    pub fn applies_to_current(&self) -> bool {
        self.kind.applies_to_current()
    }

    pub fn applies_to_descendants(&self) -> bool {
        self.kind.applies_to_descendants()
    }

    /// Whether the monitor named `candidate` is selected by this pattern.
    pub fn matches(&self, candidate: &str) -> bool {
        if candidate == self.anchor {
            return self.applies_to_current();
        }
        self.descendants
            .as_ref()
            .is_some_and(|re| re.is_match(candidate))
    }

    /// Pattern a direct child named `child` (simple name) inherits, or
    /// `None` when nothing applies at or below the child.
    pub fn child_pattern(&self, child: &str) -> Option<String> {
        match &self.kind {
            PatternKind::Enhanced { segments, .. } => {
                let first_matches = self
                    .first_segment
                    .as_ref()
                    .map(|re| re.is_match(child));
                rewrite_enhanced(segments, first_matches)
            }
            legacy => rewrite_legacy(legacy),
        }
    }
}

fn rewrite_legacy(kind: &PatternKind) -> Option<String> {
    match kind {
        PatternKind::ParentOnly => None,
        PatternKind::ChildrenOnly => Some(PARENT_ONLY.to_string()),
        PatternKind::AllDescendants | PatternKind::ParentAndAllDescendants => {
            Some(PARENT_AND_ALL_DESCENDANTS.to_string())
        }
        PatternKind::Enhanced { .. } => None,
    }
}

/// `first_matches` is `None` when the first segment is `**`.
fn rewrite_enhanced(segments: &[Segment], first_matches: Option<bool>) -> Option<String> {
    match first_matches {
        None => Some(PARENT_AND_ALL_DESCENDANTS.to_string()),
        Some(false) => None,
        Some(true) => {
            let rest = &segments[1..];
            match rest {
                [] => Some(PARENT_ONLY.to_string()),
                [Segment::AnyDepth] => Some(ALL_DESCENDANTS.to_string()),
                _ => Some(format!("/{}", join_segments(rest))),
            }
        }
    }
}

/// Rewrite the pattern bound at `parent_name` into the pattern its direct
/// child `child_name` inherits.
///
/// Returns `Ok(None)` when the pattern selects nothing at or below the child.
pub fn rewrite_for_child(
    parent_pattern: &str,
    parent_name: &str,
    child_name: &str,
) -> Result<Option<String>> {
    let simple = if parent_name == ROOT_NAME {
        child_name
    } else {
        child_name
            .strip_prefix(parent_name)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| PerfMonError::InvalidMonitorName(child_name.to_string()))?
    };
    if simple.is_empty() || simple.contains('.') {
        return Err(PerfMonError::InvalidMonitorName(child_name.to_string()));
    }
    Ok(CompiledPattern::compile(parent_name, parent_pattern)?.child_pattern(simple))
}

/// Compiled patterns keyed by `(monitor name, pattern string)`.
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: RwLock<HashMap<String, HashMap<String, Arc<CompiledPattern>>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a compiled pattern, compiling it on first use.
    pub fn get_or_compile(&self, anchor: &str, pattern: &str) -> Result<Arc<CompiledPattern>> {
        // Fast path
        {
            let entries = self.entries.read();
            if let Some(compiled) = entries.get(anchor).and_then(|m| m.get(pattern)) {
                return Ok(compiled.clone());
            }
        }

        // Slow path: compile outside the lock, then insert unless another
        // thread won the race
        let compiled = Arc::new(CompiledPattern::compile(anchor, pattern)?);
        let mut entries = self.entries.write();
        Ok(entries
            .entry(anchor.to_string())
            .or_default()
            .entry(pattern.to_string())
            .or_insert(compiled)
            .clone())
    }

    /// Number of cached patterns.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(anchor: &str, pattern: &str) -> CompiledPattern {
        CompiledPattern::compile(anchor, pattern).unwrap()
    }

    #[test]
    fn parent_only_tokens() {
        for token in [".", "./"] {
            let p = compile("a", token);
            assert!(p.matches("a"));
            assert!(!p.matches("a.b"));
            assert!(!p.applies_to_descendants());
        }
    }

    #[test]
    fn children_only() {
        let p = compile("a", "/*");
        assert!(!p.matches("a"));
        assert!(p.matches("a.b"));
        assert!(!p.matches("a.b.c"));
        assert!(!p.matches("ab"));
    }

    #[test]
    fn all_descendants() {
        let p = compile("a", "/**");
        assert!(!p.matches("a"));
        assert!(p.matches("a.b"));
        assert!(p.matches("a.b.c.d"));
        assert!(!p.matches("b.a"));
    }

    #[test]
    fn dotted_children_only() {
        let p = compile("a", "./*");
        assert_eq!(p.kind(), &PatternKind::ChildrenOnly);
        assert!(!p.matches("a"));
        assert!(p.matches("a.b"));
        assert!(!p.matches("a.b.c"));
    }

    #[test]
    fn parent_and_all_descendants() {
        let p = compile("a", "./**");
        assert!(p.matches("a"));
        assert!(p.matches("a.b"));
        assert!(p.matches("a.b.c"));
        assert!(!p.matches("x"));
    }

    #[test]
    fn anchor_is_matched_literally() {
        let p = compile("a.b", "/*");
        assert!(p.matches("a.b.c"));
        assert!(!p.matches("aXb.c"));
    }

    #[test]
    fn root_anchor_has_no_prefix() {
        let p = compile(ROOT_NAME, "/*");
        assert!(p.matches("WebRequest"));
        assert!(!p.matches("WebRequest.login"));
        assert!(!p.matches(ROOT_NAME));
    }

    #[test]
    fn enhanced_wildcards() {
        let p = compile("svc", "/v#.get*");
        assert!(p.matches("svc.v1.getUser"));
        assert!(!p.matches("svc.v12.getUser"));
        assert!(!p.matches("svc.v1.get"));
        assert!(!p.matches("svc.v1"));
        assert!(!p.matches("svc"));
    }

    #[test]
    fn enhanced_literal_characters_are_quoted() {
        let p = compile("svc", "/a+b");
        assert!(p.matches("svc.a+b"));
        assert!(!p.matches("svc.aab"));
    }

    #[test]
    fn enhanced_include_current() {
        let p = compile("svc", "./api");
        assert!(p.applies_to_current());
        assert!(p.matches("svc"));
        assert!(p.matches("svc.api"));
        assert!(!p.matches("svc.web"));
    }

    #[test]
    fn enhanced_trailing_any_depth() {
        let p = compile("svc", "/api.**");
        assert!(!p.matches("svc.api"));
        assert!(p.matches("svc.api.users"));
        assert!(p.matches("svc.api.users.list"));
    }

    #[test]
    fn invalid_enhanced_patterns() {
        for bad in ["/", "/ a", "/a b", "/.a", "/a.", "/a..b", "a", "/**.a", "/a**", "*"] {
            let err = CompiledPattern::compile("svc", bad).unwrap_err();
            assert!(
                matches!(err, PerfMonError::InvalidPattern { .. }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn legacy_rewrite_table() {
        let cases = [
            ("./", None),
            ("/*", Some("./")),
            ("/**", Some("./**")),
            ("./*", Some("./")),
            ("./**", Some("./**")),
        ];
        for (parent, child) in cases {
            assert_eq!(
                rewrite_for_child(parent, "a", "a.b").unwrap().as_deref(),
                child,
                "rewriting {parent}"
            );
        }
    }

    #[test]
    fn enhanced_rewrite_strips_first_segment() {
        assert_eq!(
            rewrite_for_child("/api.v#.list", "svc", "svc.api").unwrap(),
            Some("/v#.list".to_string())
        );
        assert_eq!(rewrite_for_child("/api.v#", "svc", "svc.web").unwrap(), None);
        assert_eq!(
            rewrite_for_child("/api", "svc", "svc.api").unwrap(),
            Some("./".to_string())
        );
        assert_eq!(
            rewrite_for_child("./a*.**", "svc", "svc.abc").unwrap(),
            Some("/**".to_string())
        );
        assert_eq!(
            rewrite_for_child("/**", "svc", "svc.x").unwrap(),
            Some("./**".to_string())
        );
    }

    #[test]
    fn rewrite_chain_agrees_with_matches() {
        let root = compile("svc", "/api.v#.**");
        let names = ["svc.api", "svc.api.v1", "svc.api.v1.users", "svc.api.v1.users.x"];

        let mut pattern = Some("/api.v#.**".to_string());
        let mut parent = "svc".to_string();
        for name in names {
            let child = rewrite_for_child(pattern.as_deref().unwrap(), &parent, name).unwrap();
            let child_applies = child
                .as_deref()
                .map(|p| compile(name, p).applies_to_current())
                .unwrap_or(false);
            assert_eq!(child_applies, root.matches(name), "mismatch at {name}");
            pattern = child;
            parent = name.to_string();
        }
    }

    #[test]
    fn rewrite_rejects_non_children() {
        assert!(rewrite_for_child("/*", "a", "b.c").is_err());
        assert!(rewrite_for_child("/*", "a", "a.b.c").is_err());
    }

    #[test]
    fn cache_returns_same_compiled_pattern() {
        let cache = PatternCache::new();
        let p1 = cache.get_or_compile("a", "/**").unwrap();
        let p2 = cache.get_or_compile("a", "/**").unwrap();
        let other = cache.get_or_compile("b", "/**").unwrap();

        assert!(Arc::ptr_eq(&p1, &p2));
        assert!(!Arc::ptr_eq(&p1, &other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_does_not_store_failures() {
        let cache = PatternCache::new();
        assert!(cache.get_or_compile("a", "/a b").is_err());
        assert!(cache.is_empty());
    }
}
