//! Key paths: stable addresses for slots in a document tree.
//!
//! A [`KeyPath`] is the ordered list of steps from the document root to a
//! slot. Map-typed steps carry the map key; array-typed steps carry the
//! element's stable id, never its position. Positions shift under concurrent
//! inserts and deletes, ids do not, so a path recorded at mutation time keeps
//! addressing the same logical slot after reordering.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ElementId;

/// How a step's key is interpreted in its parent container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// The key is a name looked up in a map-like parent (the document's
    /// root name table counts as map-like).
    Map,
    /// The key is a stable element id looked up in an array parent.
    Array,
}

/// The key of one path step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    /// Stable element id of an array element.
    Id(ElementId),
    /// Map key or top-level root name.
    Name(String),
}

/// One step of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub kind: StepKind,
    pub key: PathKey,
}

impl PathStep {
    /// A map-typed step with the given key.
    pub fn map(key: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Map,
            key: PathKey::Name(key.into()),
        }
    }

    /// An array-typed step with the given element id.
    pub fn array(id: ElementId) -> Self {
        Self {
            kind: StepKind::Array,
            key: PathKey::Id(id),
        }
    }
}

/// Ordered steps from the document root to a slot.
///
/// The wire form is length-prefixed UTF-8 JSON: an array of
/// `{"kind": "map"|"array", "key": <name or id>}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<PathStep>);

impl KeyPath {
    /// An empty path.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a path from steps.
    pub fn from_steps(steps: Vec<PathStep>) -> Self {
        Self(steps)
    }

    /// A single-step path addressing a top-level root.
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![PathStep::map(name)])
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a step.
    pub fn push(&mut self, step: PathStep) {
        self.0.push(step);
    }

    /// A copy of this path with one more step.
    pub fn child(&self, step: PathStep) -> Self {
        let mut steps = self.0.clone();
        steps.push(step);
        Self(steps)
    }

    /// All but the last step.
    pub fn parent(&self) -> Self {
        let mut steps = self.0.clone();
        steps.pop();
        Self(steps)
    }

    /// The final step, naming the addressed slot.
    pub fn last(&self) -> Option<&PathStep> {
        self.0.last()
    }

    /// True when `self` is a proper prefix of `other`.
    ///
    /// A path is not a strict prefix of itself.
    pub fn is_strict_prefix_of(&self, other: &KeyPath) -> bool {
        self.0.len() < other.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(root)");
        }
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match &step.key {
                PathKey::Name(name) => write!(f, "{name}")?,
                PathKey::Id(id) => write!(f, "#{id}")?,
            }
        }
        Ok(())
    }
}
