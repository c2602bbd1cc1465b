//! ThreadTraceData - a captured tree of nested timer spans.

use alloc::string::String;
use alloc::vec::Vec;

/// One span of a thread trace.
///
/// Children are kept in the order they were started, which is also their
/// temporal nesting order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct ThreadTraceData {
    /// Monitor (category) name the span was started with.
    #[cfg_attr(feature = "minicbor", n(0))]
    pub name: String,

    /// Start time (ms since Unix epoch).
    #[cfg_attr(feature = "minicbor", n(1))]
    pub start_ms: u64,

    /// End time (ms since Unix epoch); `None` while the span is open.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(2))]
    pub end_ms: Option<u64>,

    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Vec::is_empty"))]
    #[cfg_attr(feature = "minicbor", n(3))]
    pub children: Vec<ThreadTraceData>,
}

impl ThreadTraceData {
    /// Create an open span.
    pub fn open(name: impl Into<String>, start_ms: u64) -> Self {
        Self {
            name: name.into(),
            start_ms,
            end_ms: None,
            children: Vec::new(),
        }
    }

    pub fn close(&mut self, end_ms: u64) {
        self.end_ms = Some(end_ms);
    }

    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    /// Span duration in milliseconds, `None` while open.
    pub fn duration_ms(&self) -> Option<u64> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }

    /// Number of spans in this subtree, including this one.
    pub fn span_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.span_count()).sum::<usize>()
    }

    /// Depth of the subtree; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(|c| c.depth()).max().unwrap_or(0)
    }

    /// Find the first span with the given name, depth first.
    pub fn find(&self, name: &str) -> Option<&ThreadTraceData> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Names of the direct children, in order.
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }
}
