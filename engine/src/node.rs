//! Arena-backed state tree.
//!
//! Every container a document holds lives in an arena, addressed by a stable
//! [`NodeId`]. Shared-type handles are arena indices, so two handles over the
//! same container are the same identity by construction. Arena slots are
//! never recycled: the id of a removed node stays dead forever and can never
//! alias an unrelated node.
//!
//! Nodes carry their parent link, so the current key path of any live node is
//! computable by climbing to the root.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::path::{KeyPath, PathStep};
use crate::value::Value;
use crate::ElementId;

/// Opaque arena index of a container node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// Container kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Map,
    Array,
}

impl NodeKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            NodeKind::Map => "map",
            NodeKind::Array => "array",
        }
    }
}

/// Where a node hangs in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParentLink {
    /// Top-level entry of the document's root name table.
    Root(String),
    /// Entry of a map node.
    MapEntry { parent: NodeId, key: String },
    /// Element of an array node, addressed by stable id.
    ArrayElem { parent: NodeId, id: ElementId },
}

/// A slot inside a container: either a scalar/numeric-array leaf or a nested
/// container node. User-supplied maps and lists always materialize as nodes,
/// so a leaf is never itself a container.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Child {
    Leaf(Value),
    Node(NodeId),
}

/// One container node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    pub(crate) parent: ParentLink,
    pub(crate) body: NodeBody,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeBody {
    Map(IndexMap<String, Child>),
    Array(Vec<(ElementId, Child)>),
}

impl Node {
    pub(crate) fn empty(kind: NodeKind, parent: ParentLink) -> Self {
        let body = match kind {
            NodeKind::Map => NodeBody::Map(IndexMap::new()),
            NodeKind::Array => NodeBody::Array(Vec::new()),
        };
        Self { parent, body }
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::Map(_) => NodeKind::Map,
            NodeBody::Array(_) => NodeKind::Array,
        }
    }
}

/// The arena owning every container node of one document.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Option<Node>>,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(node));
        id
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub(crate) fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.get(id).map(Node::kind)
    }

    pub(crate) fn map_entries(&self, id: NodeId) -> Option<&IndexMap<String, Child>> {
        match &self.get(id)?.body {
            NodeBody::Map(entries) => Some(entries),
            NodeBody::Array(_) => None,
        }
    }

    pub(crate) fn map_entries_mut(&mut self, id: NodeId) -> Option<&mut IndexMap<String, Child>> {
        match &mut self.get_mut(id)?.body {
            NodeBody::Map(entries) => Some(entries),
            NodeBody::Array(_) => None,
        }
    }

    pub(crate) fn array_elems(&self, id: NodeId) -> Option<&Vec<(ElementId, Child)>> {
        match &self.get(id)?.body {
            NodeBody::Array(elems) => Some(elems),
            NodeBody::Map(_) => None,
        }
    }

    pub(crate) fn array_elems_mut(&mut self, id: NodeId) -> Option<&mut Vec<(ElementId, Child)>> {
        match &mut self.get_mut(id)?.body {
            NodeBody::Array(elems) => Some(elems),
            NodeBody::Map(_) => None,
        }
    }

    pub(crate) fn set_parent(&mut self, id: NodeId, parent: ParentLink) {
        if let Some(node) = self.get_mut(id) {
            node.parent = parent;
        }
    }

    /// Empty a node's body and hand back its children, for id-preserving
    /// remapping during a state reset.
    pub(crate) fn take_body(&mut self, id: NodeId) -> Option<NodeBody> {
        let node = self.get_mut(id)?;
        let empty = match node.body {
            NodeBody::Map(_) => NodeBody::Map(IndexMap::new()),
            NodeBody::Array(_) => NodeBody::Array(Vec::new()),
        };
        Some(std::mem::replace(&mut node.body, empty))
    }

    pub(crate) fn set_body(&mut self, id: NodeId, body: NodeBody) {
        if let Some(node) = self.get_mut(id) {
            node.body = body;
        }
    }

    /// Remove a node and every container beneath it. Slots are cleared, not
    /// recycled, so outstanding handles over them go permanently stale.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) {
        let Some(node) = self.slots.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        match node.body {
            NodeBody::Map(entries) => {
                for (_, child) in entries {
                    if let Child::Node(child_id) = child {
                        self.remove_subtree(child_id);
                    }
                }
            }
            NodeBody::Array(elems) => {
                for (_, child) in elems {
                    if let Child::Node(child_id) = child {
                        self.remove_subtree(child_id);
                    }
                }
            }
        }
    }

    /// Current key path of a live node, computed by climbing parent links.
    pub(crate) fn key_path_of(&self, id: NodeId) -> Result<KeyPath> {
        let mut steps = Vec::new();
        let mut current = id;
        loop {
            let node = self.get(current).ok_or(Error::StaleHandle)?;
            match &node.parent {
                ParentLink::Root(name) => {
                    steps.push(PathStep::map(name.clone()));
                    break;
                }
                ParentLink::MapEntry { parent, key } => {
                    steps.push(PathStep::map(key.clone()));
                    current = *parent;
                }
                ParentLink::ArrayElem { parent, id } => {
                    steps.push(PathStep::array(*id));
                    current = *parent;
                }
            }
        }
        steps.reverse();
        Ok(KeyPath::from_steps(steps))
    }

    /// Plain value of a child, stripping element ids and unwrapping nested
    /// containers.
    pub(crate) fn child_value(&self, child: &Child) -> Value {
        match child {
            Child::Leaf(value) => value.clone(),
            Child::Node(id) => self.node_value(*id),
        }
    }

    pub(crate) fn node_value(&self, id: NodeId) -> Value {
        match self.get(id).map(|n| &n.body) {
            Some(NodeBody::Map(entries)) => Value::Map(
                entries
                    .iter()
                    .map(|(k, child)| (k.clone(), self.child_value(child)))
                    .collect(),
            ),
            Some(NodeBody::Array(elems)) => Value::List(
                elems
                    .iter()
                    .map(|(_, child)| self.child_value(child))
                    .collect(),
            ),
            None => Value::Null,
        }
    }

    /// State-form value of a child: array elements are encoded as
    /// `[id, value]` pairs so element ids survive the wire and agree on
    /// every replica.
    pub(crate) fn child_state_value(&self, child: &Child) -> Value {
        match child {
            Child::Leaf(value) => value.clone(),
            Child::Node(id) => self.node_state_value(*id),
        }
    }

    pub(crate) fn node_state_value(&self, id: NodeId) -> Value {
        match self.get(id).map(|n| &n.body) {
            Some(NodeBody::Map(entries)) => Value::Map(
                entries
                    .iter()
                    .map(|(k, child)| (k.clone(), self.child_state_value(child)))
                    .collect(),
            ),
            Some(NodeBody::Array(elems)) => Value::List(
                elems
                    .iter()
                    .map(|(elem_id, child)| {
                        Value::List(vec![
                            Value::from(*elem_id),
                            self.child_state_value(child),
                        ])
                    })
                    .collect(),
            ),
            None => Value::Null,
        }
    }
}

/// Split a state-form array element into its id and value.
pub(crate) fn split_state_pair(pair: Value) -> Result<(ElementId, Value)> {
    let Value::List(mut items) = pair else {
        return Err(Error::MalformedState(
            "array element is not an [id, value] pair".into(),
        ));
    };
    if items.len() != 2 {
        return Err(Error::MalformedState(format!(
            "array element pair has {} items, expected 2",
            items.len()
        )));
    }
    let value = items.pop().unwrap_or(Value::Null);
    let id = items
        .pop()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::MalformedState("array element id is not an unsigned integer".into()))?;
    Ok((id, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree() -> (Arena, NodeId, NodeId) {
        let mut arena = Arena::new();
        let root = arena.insert(Node::empty(NodeKind::Map, ParentLink::Root("world".into())));
        let items = arena.insert(Node::empty(
            NodeKind::Array,
            ParentLink::MapEntry {
                parent: root,
                key: "items".into(),
            },
        ));
        arena
            .map_entries_mut(root)
            .unwrap()
            .insert("items".into(), Child::Node(items));
        arena
            .array_elems_mut(items)
            .unwrap()
            .push((7, Child::Leaf(Value::Int(1))));
        (arena, root, items)
    }

    #[test]
    fn key_path_climbs_parent_links() {
        let (arena, root, items) = small_tree();
        assert_eq!(arena.key_path_of(root).unwrap(), KeyPath::root("world"));
        let mut expected = KeyPath::root("world");
        expected.push(PathStep::map("items"));
        assert_eq!(arena.key_path_of(items).unwrap(), expected);
    }

    #[test]
    fn remove_subtree_stales_descendants() {
        let (mut arena, root, items) = small_tree();
        arena.remove_subtree(root);
        assert!(arena.get(root).is_none());
        assert!(arena.get(items).is_none());
        assert_eq!(arena.key_path_of(items), Err(Error::StaleHandle));
    }

    #[test]
    fn slots_are_never_recycled() {
        let (mut arena, root, items) = small_tree();
        arena.remove_subtree(items);
        let fresh = arena.insert(Node::empty(NodeKind::Map, ParentLink::Root("other".into())));
        assert_ne!(fresh, items);
        assert_ne!(fresh, root);
        assert!(arena.get(items).is_none());
    }

    #[test]
    fn plain_and_state_values() {
        let (arena, root, _) = small_tree();
        let plain = arena.node_value(root);
        let Value::Map(entries) = &plain else { panic!("expected map") };
        assert_eq!(entries["items"], Value::List(vec![Value::Int(1)]));

        let state = arena.node_state_value(root);
        let Value::Map(entries) = &state else { panic!("expected map") };
        assert_eq!(
            entries["items"],
            Value::List(vec![Value::List(vec![Value::Int(7), Value::Int(1)])])
        );
    }

    #[test]
    fn state_pair_validation() {
        let (id, value) = split_state_pair(Value::List(vec![Value::Int(7), Value::Bool(true)])).unwrap();
        assert_eq!(id, 7);
        assert_eq!(value, Value::Bool(true));

        assert!(split_state_pair(Value::Int(7)).is_err());
        assert!(split_state_pair(Value::List(vec![Value::Int(7)])).is_err());
        assert!(
            split_state_pair(Value::List(vec![Value::Str("x".into()), Value::Null])).is_err()
        );
    }
}
