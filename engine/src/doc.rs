//! Document: one replica of the shared tree.
//!
//! A [`Doc`] owns everything mutable: the node arena, the root name table,
//! the clock, the history, observer registries, and the in-flight
//! transaction. [`MapRef`] and [`ArrayRef`] are `Copy` handles over arena
//! nodes; every operation takes the document explicitly, so there is exactly
//! one owner of the state and handle identity equals node identity.
//!
//! Mutations issued inside [`Doc::transact`] batch into one update message;
//! mutations issued outside commit as ad hoc single-event transactions.
//! Observers fire synchronously, once per applied event, on the mutated
//! container only.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::event::{ArrayChange, Change, ChangeAction, EntryChange, Event, MapChange};
use crate::history::{History, HistoryEntry};
use crate::node::{split_state_pair, Arena, Child, Node, NodeBody, NodeId, NodeKind, ParentLink};
use crate::path::{KeyPath, PathKey, PathStep, StepKind};
use crate::transaction::TransactionCache;
use crate::value::Value;
use crate::{Clock, ElementId, Priority};

type MapObserver = Rc<dyn Fn(&MapChange)>;
type ArrayObserver = Rc<dyn Fn(&ArrayChange)>;
type UpdateObserver = Rc<dyn Fn(&[u8], Option<&str>)>;

/// Token returned by `observe` calls, used to unobserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

/// Result of reading a slot: plain leaf values come out by value, nested
/// containers come out as live handles so their identity is preserved.
#[derive(Debug, Clone)]
pub enum Out {
    Value(Value),
    Map(MapRef),
    Array(ArrayRef),
}

impl Out {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Out::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn map(self) -> Option<MapRef> {
        match self {
            Out::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn array(self) -> Option<ArrayRef> {
        match self {
            Out::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Plain value of this read, materializing containers.
    pub fn to_value(&self, doc: &Doc) -> Value {
        match self {
            Out::Value(value) => value.clone(),
            Out::Map(map) => map.to_value(doc),
            Out::Array(array) => array.to_value(doc),
        }
    }
}

/// One replica of the shared document tree.
pub struct Doc {
    arena: Arena,
    roots: IndexMap<String, NodeId>,
    clock: Clock,
    resolve_priority: Priority,
    history: History,
    txn: Option<TransactionCache>,
    txn_depth: usize,
    map_observers: HashMap<NodeId, Vec<(Subscription, MapObserver)>>,
    array_observers: HashMap<NodeId, Vec<(Subscription, ArrayObserver)>>,
    update_subscribers: Vec<(Subscription, UpdateObserver)>,
    next_subscription: u64,
    id_source: Box<dyn FnMut() -> ElementId>,
    mirror: bool,
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doc")
            .field("clock", &self.clock)
            .field("resolve_priority", &self.resolve_priority)
            .field("roots", &self.roots.keys().collect::<Vec<_>>())
            .field("history_len", &self.history.len())
            .field("mirror", &self.mirror)
            .finish()
    }
}

impl Doc {
    /// A fresh, empty replica with a random resolve priority and a random
    /// element-id source.
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            roots: IndexMap::new(),
            clock: 0,
            resolve_priority: rand::random(),
            history: History::default(),
            txn: None,
            txn_depth: 0,
            map_observers: HashMap::new(),
            array_observers: HashMap::new(),
            update_subscribers: Vec::new(),
            next_subscription: 0,
            id_source: Box::new(rand::random::<u64>),
            mirror: false,
        }
    }

    /// Count of transactions applied so far.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn resolve_priority(&self) -> Priority {
        self.resolve_priority
    }

    /// Override the random tie-break priority. Priorities are expected to be
    /// unique across a replica set; ties resolve against the incomer.
    pub fn set_resolve_priority(&mut self, priority: Priority) {
        self.resolve_priority = priority;
    }

    /// In mirror mode the document re-emits an equivalent update to its own
    /// subscribers after applying an incoming one, for relay topologies.
    pub fn set_mirror(&mut self, mirror: bool) {
        self.mirror = mirror;
    }

    pub(crate) fn mirror(&self) -> bool {
        self.mirror
    }

    /// Replace the element-id source. Ids must be unique within the replica
    /// set; tests inject counters for determinism.
    pub fn set_id_source(&mut self, source: impl FnMut() -> ElementId + 'static) {
        self.id_source = Box::new(source);
    }

    /// Bound the retained history. Rebasing a transaction older than the
    /// retained window fails; such a replica needs a snapshot.
    pub fn set_history_limit(&mut self, limit: usize) {
        self.history.set_limit(limit);
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// The map rooted at `name`, created empty if absent. Idempotent:
    /// repeated calls return a handle with the same identity.
    pub fn get_map(&mut self, name: &str) -> Result<MapRef> {
        Ok(MapRef {
            node: self.get_root(name, NodeKind::Map)?,
        })
    }

    /// The array rooted at `name`, created empty if absent.
    pub fn get_array(&mut self, name: &str) -> Result<ArrayRef> {
        Ok(ArrayRef {
            node: self.get_root(name, NodeKind::Array)?,
        })
    }

    fn get_root(&mut self, name: &str, kind: NodeKind) -> Result<NodeId> {
        if let Some(&id) = self.roots.get(name) {
            let found = self.arena.kind(id).ok_or(Error::StaleHandle)?;
            if found != kind {
                return Err(Error::KindMismatch {
                    name: name.to_owned(),
                    expected: kind.name(),
                    found: found.name(),
                });
            }
            return Ok(id);
        }
        let id = self
            .arena
            .insert(Node::empty(kind, ParentLink::Root(name.to_owned())));
        self.roots.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Run `f` inside a transaction: every mutation it issues batches into
    /// one update message, committed when the outermost call exits.
    pub fn transact<T>(&mut self, f: impl FnOnce(&mut Doc) -> Result<T>) -> Result<T> {
        self.transact_with(None, f)
    }

    /// [`Doc::transact`] with an origin tag. The origin is handed to update
    /// subscribers so embedders can filter echoes; it never crosses the
    /// wire. Nested calls collapse into the outermost transaction and the
    /// inner origin is ignored.
    ///
    /// The outermost exit always commits whatever events were produced,
    /// including when `f` returns an error.
    pub fn transact_with<T>(
        &mut self,
        origin: Option<&str>,
        f: impl FnOnce(&mut Doc) -> Result<T>,
    ) -> Result<T> {
        if self.txn_depth == 0 && self.txn.is_none() {
            self.txn = Some(TransactionCache::new(origin.map(str::to_owned), self.clock));
        }
        self.txn_depth += 1;
        let result = f(self);
        self.txn_depth -= 1;
        if self.txn_depth == 0 {
            if let Some(cache) = self.txn.take() {
                let committed = self.commit_cache(cache);
                return match result {
                    Ok(value) => committed.map(|_| value),
                    Err(e) => Err(e),
                };
            }
        }
        result
    }

    /// Subscribe to committed update buffers. Every locally committed
    /// transaction (and, in mirror mode, every relayed update) is delivered
    /// with its origin.
    pub fn observe_update(&mut self, f: impl Fn(&[u8], Option<&str>) + 'static) -> Subscription {
        let sub = self.next_subscription();
        self.update_subscribers.push((sub, Rc::new(f)));
        sub
    }

    pub fn unobserve_update(&mut self, sub: Subscription) {
        self.update_subscribers.retain(|(s, _)| *s != sub);
    }

    /// Plain snapshot of every root.
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.roots
                .iter()
                .map(|(name, &id)| (name.clone(), self.arena.node_value(id)))
                .collect(),
        )
    }

    /// State-form snapshot of every root: array elements carry their stable
    /// ids, so a receiver materializes the same ids the sender holds.
    pub(crate) fn state_value(&self) -> Value {
        Value::Map(
            self.roots
                .iter()
                .map(|(name, &id)| (name.clone(), self.arena.node_state_value(id)))
                .collect(),
        )
    }

    fn next_subscription(&mut self) -> Subscription {
        let sub = Subscription(self.next_subscription);
        self.next_subscription += 1;
        sub
    }

    // ------------------------------------------------------------------
    // Event construction and commit
    // ------------------------------------------------------------------

    /// Convert a plain value into state form, assigning a fresh stable id to
    /// every list element.
    fn to_state_form(&mut self, value: Value) -> Value {
        match value {
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| {
                        let v = self.to_state_form(v);
                        (k, v)
                    })
                    .collect(),
            ),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| {
                        let id = (self.id_source)();
                        Value::List(vec![Value::from(id), self.to_state_form(item)])
                    })
                    .collect(),
            ),
            leaf => leaf,
        }
    }

    /// Apply an event, fire its notification, and record it: into the open
    /// transaction if one is active, otherwise as an ad hoc single-event
    /// transaction committed immediately.
    fn commit_event(&mut self, event: Event) -> Result<()> {
        let change = self.apply_event(&event)?;
        self.notify(change);
        match self.txn.as_mut() {
            Some(cache) => {
                cache.push_event(event);
                Ok(())
            }
            None => {
                let mut cache = TransactionCache::new(None, self.clock);
                cache.push_event(event);
                self.commit_cache(cache)
            }
        }
    }

    /// Commit: serialize, append to history stamped with this document's
    /// priority, advance the clock, dispatch the bytes. An empty transaction
    /// commits nothing.
    fn commit_cache(&mut self, cache: TransactionCache) -> Result<()> {
        if cache.is_empty() {
            return Ok(());
        }
        let priority = self.resolve_priority;
        let bytes = cache.encode(priority)?;
        let TransactionCache { origin, events, .. } = cache;
        for event in events {
            self.history.push(HistoryEntry {
                clock: self.clock,
                priority,
                event,
            });
        }
        self.clock += 1;
        self.dispatch_update(&bytes, origin.as_deref());
        Ok(())
    }

    pub(crate) fn dispatch_update(&self, bytes: &[u8], origin: Option<&str>) {
        let subscribers: Vec<UpdateObserver> = self
            .update_subscribers
            .iter()
            .map(|(_, f)| Rc::clone(f))
            .collect();
        for f in subscribers {
            f(bytes, origin);
        }
    }

    fn notify(&self, change: Option<(NodeId, Change)>) {
        let Some((node, change)) = change else {
            return;
        };
        match change {
            Change::Map(change) => {
                let observers: Vec<MapObserver> = self
                    .map_observers
                    .get(&node)
                    .map(|list| list.iter().map(|(_, f)| Rc::clone(f)).collect())
                    .unwrap_or_default();
                for f in observers {
                    f(&change);
                }
            }
            Change::Array(change) => {
                let observers: Vec<ArrayObserver> = self
                    .array_observers
                    .get(&node)
                    .map(|list| list.iter().map(|(_, f)| Rc::clone(f)).collect())
                    .unwrap_or_default();
                for f in observers {
                    f(&change);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Event application
    // ------------------------------------------------------------------

    /// Resolve the container a path addresses, materializing a missing
    /// top-level root (of the kind the path implies) and failing anywhere
    /// deeper.
    fn resolve_container(&mut self, path: &KeyPath, expected: NodeKind) -> Result<NodeId> {
        let Some((first, rest)) = path.steps().split_first() else {
            return Err(Error::UnresolvedPath(path.to_string()));
        };
        let (StepKind::Map, PathKey::Name(name)) = (&first.kind, &first.key) else {
            return Err(Error::UnresolvedPath(path.to_string()));
        };
        let mut current = match self.roots.get(name) {
            Some(&id) => id,
            None => {
                let kind = rest.first().map_or(expected, |step| match step.kind {
                    StepKind::Map => NodeKind::Map,
                    StepKind::Array => NodeKind::Array,
                });
                let id = self
                    .arena
                    .insert(Node::empty(kind, ParentLink::Root(name.clone())));
                self.roots.insert(name.clone(), id);
                id
            }
        };
        for step in rest {
            let child = match (&step.kind, &step.key) {
                (StepKind::Map, PathKey::Name(key)) => self
                    .arena
                    .map_entries(current)
                    .and_then(|entries| entries.get(key))
                    .cloned(),
                (StepKind::Array, PathKey::Id(id)) => self
                    .arena
                    .array_elems(current)
                    .and_then(|elems| elems.iter().find(|(eid, _)| eid == id))
                    .map(|(_, child)| child.clone()),
                _ => None,
            };
            match child {
                Some(Child::Node(id)) => current = id,
                _ => return Err(Error::UnresolvedPath(path.to_string())),
            }
        }
        if self.arena.kind(current) != Some(expected) {
            return Err(Error::UnresolvedPath(path.to_string()));
        }
        Ok(current)
    }

    /// Materialize a state-form value into nodes, keeping the sender's
    /// element ids.
    fn materialize(&mut self, state: Value, link: ParentLink) -> Result<Child> {
        match state {
            Value::Map(entries) => {
                let id = self.arena.insert(Node::empty(NodeKind::Map, link));
                for (key, child_state) in entries {
                    let child_link = ParentLink::MapEntry {
                        parent: id,
                        key: key.clone(),
                    };
                    let child = self.materialize(child_state, child_link)?;
                    if let Some(map) = self.arena.map_entries_mut(id) {
                        map.insert(key, child);
                    }
                }
                Ok(Child::Node(id))
            }
            Value::List(items) => {
                let id = self.arena.insert(Node::empty(NodeKind::Array, link));
                for item in items {
                    let (elem_id, child_state) = split_state_pair(item)?;
                    let child_link = ParentLink::ArrayElem {
                        parent: id,
                        id: elem_id,
                    };
                    let child = self.materialize(child_state, child_link)?;
                    if let Some(elems) = self.arena.array_elems_mut(id) {
                        elems.push((elem_id, child));
                    }
                }
                Ok(Child::Node(id))
            }
            leaf => Ok(Child::Leaf(leaf)),
        }
    }

    /// Apply one event to the tree. Returns the mutated container and its
    /// change descriptor, or `None` when the event was a no-op (null events,
    /// idempotent deletes).
    pub(crate) fn apply_event(&mut self, event: &Event) -> Result<Option<(NodeId, Change)>> {
        match event {
            Event::Null => Ok(None),
            Event::MapSet { path, key, value } => {
                let container = self.resolve_container(path, NodeKind::Map)?;
                let link = ParentLink::MapEntry {
                    parent: container,
                    key: key.clone(),
                };
                let child = self.materialize(value.clone(), link)?;
                let plain = self.arena.child_value(&child);
                let old = self
                    .arena
                    .map_entries_mut(container)
                    .ok_or_else(|| Error::UnresolvedPath(path.to_string()))?
                    .insert(key.clone(), child);
                let mut change = MapChange::default();
                let action = if old.is_some() {
                    ChangeAction::Update
                } else {
                    change.added.insert(key.clone());
                    ChangeAction::Add
                };
                change.entries.insert(
                    key.clone(),
                    EntryChange {
                        action,
                        value: Some(plain),
                    },
                );
                if let Some(Child::Node(old_id)) = old {
                    self.arena.remove_subtree(old_id);
                }
                Ok(Some((container, Change::Map(change))))
            }
            Event::MapDelete { path, key } => {
                let container = self.resolve_container(path, NodeKind::Map)?;
                let old = self
                    .arena
                    .map_entries_mut(container)
                    .ok_or_else(|| Error::UnresolvedPath(path.to_string()))?
                    .shift_remove(key);
                let Some(old) = old else {
                    // The key was already gone: a delete that won its rebase
                    // against another delete. No-op, no notification.
                    return Ok(None);
                };
                if let Child::Node(old_id) = old {
                    self.arena.remove_subtree(old_id);
                }
                let mut change = MapChange::default();
                change.deleted.insert(key.clone());
                change.entries.insert(
                    key.clone(),
                    EntryChange {
                        action: ChangeAction::Delete,
                        value: None,
                    },
                );
                Ok(Some((container, Change::Map(change))))
            }
            Event::ArrayPush { path, value } => {
                let elem_id = array_step_id(path)?;
                let container = self.resolve_container(&path.parent(), NodeKind::Array)?;
                let link = ParentLink::ArrayElem {
                    parent: container,
                    id: elem_id,
                };
                let child = self.materialize(value.clone(), link)?;
                let plain = self.arena.child_value(&child);
                self.arena
                    .array_elems_mut(container)
                    .ok_or_else(|| Error::UnresolvedPath(path.to_string()))?
                    .push((elem_id, child));
                let mut change = ArrayChange::default();
                change.added.insert(elem_id);
                change.entries.insert(
                    elem_id,
                    EntryChange {
                        action: ChangeAction::Add,
                        value: Some(plain),
                    },
                );
                Ok(Some((container, Change::Array(change))))
            }
            Event::ArrayDelete { path } => {
                let elem_id = array_step_id(path)?;
                let container = self.resolve_container(&path.parent(), NodeKind::Array)?;
                let elems = self
                    .arena
                    .array_elems_mut(container)
                    .ok_or_else(|| Error::UnresolvedPath(path.to_string()))?;
                let Some(index) = elems.iter().position(|(eid, _)| *eid == elem_id) else {
                    // Already deleted; deletes are idempotent.
                    return Ok(None);
                };
                let (_, old) = elems.remove(index);
                if let Child::Node(old_id) = old {
                    self.arena.remove_subtree(old_id);
                }
                let mut change = ArrayChange::default();
                change.deleted.insert(elem_id);
                change.entries.insert(
                    elem_id,
                    EntryChange {
                        action: ChangeAction::Delete,
                        value: None,
                    },
                );
                Ok(Some((container, Change::Array(change))))
            }
        }
    }

    // ------------------------------------------------------------------
    // Remote application
    // ------------------------------------------------------------------

    /// Apply an incoming transaction, rebasing it first when its start clock
    /// lags the local clock. Returns the effective start clock and the
    /// (possibly nulled) events actually applied, for mirror re-emission.
    pub(crate) fn apply_transaction(
        &mut self,
        start_clock: Clock,
        priority: Priority,
        mut events: Vec<Event>,
    ) -> Result<(Clock, Vec<Event>)> {
        if start_clock > self.clock {
            return Err(Error::SkippedHistory {
                start_clock,
                clock: self.clock,
            });
        }
        if start_clock < self.clock {
            let segment = self.history.segment(start_clock)?;
            crate::history::rebase(&mut events, priority, &segment);
        }
        let effective_start = self.clock;
        for event in &events {
            let change = self.apply_event(event)?;
            self.notify(change);
        }
        for event in events.iter().cloned() {
            self.history.push(HistoryEntry {
                clock: self.clock,
                priority,
                event,
            });
        }
        self.clock += 1;
        Ok((effective_start, events))
    }

    /// Replace the whole state from a snapshot, preserving handle identity.
    ///
    /// Fires synthetic delete notifications for every populated container of
    /// the old tree, remaps existing nodes onto the corresponding nodes of
    /// the new tree (maps match by key, arrays by stable element id) so
    /// outstanding handles and their observers survive the resync, fires
    /// synthetic add notifications for the new tree, then installs the new
    /// clock and a cleared history.
    pub fn set_clock_state(&mut self, clock: Clock, state: Value) -> Result<()> {
        let Value::Map(roots_state) = state else {
            return Err(Error::MalformedState("snapshot root is not a map".into()));
        };

        for change in self.collect_population_changes(ChangeAction::Delete) {
            self.notify(Some(change));
        }

        let mut old_roots = std::mem::take(&mut self.roots);
        let mut new_roots = IndexMap::with_capacity(roots_state.len());
        for (name, child_state) in roots_state {
            let old = old_roots.shift_remove(&name).map(Child::Node);
            let link = ParentLink::Root(name.clone());
            match self.remap_child(old, child_state, link)? {
                Child::Node(id) => {
                    new_roots.insert(name, id);
                }
                Child::Leaf(_) => {
                    return Err(Error::MalformedState(format!(
                        "root '{name}' is not a container"
                    )));
                }
            }
        }
        for (_, leftover) in old_roots {
            self.arena.remove_subtree(leftover);
        }
        self.roots = new_roots;

        for change in self.collect_population_changes(ChangeAction::Add) {
            self.notify(Some(change));
        }

        self.clock = clock;
        self.history.clear_to(clock);
        Ok(())
    }

    /// Rebuild one slot from state form, reusing the old node's id whenever
    /// the old and new containers correspond.
    fn remap_child(&mut self, old: Option<Child>, state: Value, link: ParentLink) -> Result<Child> {
        match state {
            Value::Map(entries) => {
                let id = self.reuse_or_insert(old, NodeKind::Map, link);
                let mut old_entries = match self.arena.take_body(id) {
                    Some(NodeBody::Map(entries)) => entries,
                    _ => IndexMap::new(),
                };
                let mut new_entries = IndexMap::with_capacity(entries.len());
                for (key, child_state) in entries {
                    let old_child = old_entries.shift_remove(&key);
                    let child_link = ParentLink::MapEntry {
                        parent: id,
                        key: key.clone(),
                    };
                    let child = self.remap_child(old_child, child_state, child_link)?;
                    new_entries.insert(key, child);
                }
                for (_, leftover) in old_entries {
                    self.drop_child(leftover);
                }
                self.arena.set_body(id, NodeBody::Map(new_entries));
                Ok(Child::Node(id))
            }
            Value::List(items) => {
                let id = self.reuse_or_insert(old, NodeKind::Array, link);
                let mut old_by_id: IndexMap<ElementId, Child> = match self.arena.take_body(id) {
                    Some(NodeBody::Array(elems)) => elems.into_iter().collect(),
                    _ => IndexMap::new(),
                };
                let mut new_elems = Vec::with_capacity(items.len());
                for item in items {
                    let (elem_id, child_state) = split_state_pair(item)?;
                    let old_child = old_by_id.shift_remove(&elem_id);
                    let child_link = ParentLink::ArrayElem {
                        parent: id,
                        id: elem_id,
                    };
                    let child = self.remap_child(old_child, child_state, child_link)?;
                    new_elems.push((elem_id, child));
                }
                for (_, leftover) in old_by_id {
                    self.drop_child(leftover);
                }
                self.arena.set_body(id, NodeBody::Array(new_elems));
                Ok(Child::Node(id))
            }
            leaf => {
                if let Some(old) = old {
                    self.drop_child(old);
                }
                Ok(Child::Leaf(leaf))
            }
        }
    }

    /// Keep the old node's id when it was a container of the right kind;
    /// otherwise drop it and allocate a fresh node.
    fn reuse_or_insert(&mut self, old: Option<Child>, kind: NodeKind, link: ParentLink) -> NodeId {
        match old {
            Some(Child::Node(id)) if self.arena.kind(id) == Some(kind) => {
                self.arena.set_parent(id, link);
                id
            }
            other => {
                if let Some(old) = other {
                    self.drop_child(old);
                }
                self.arena.insert(Node::empty(kind, link))
            }
        }
    }

    fn drop_child(&mut self, child: Child) {
        if let Child::Node(id) = child {
            self.arena.remove_subtree(id);
        }
    }

    /// Synthetic change descriptors covering every populated container,
    /// pre-order. `Delete` describes the tree as all-removed, `Add` as
    /// all-inserted.
    fn collect_population_changes(&self, action: ChangeAction) -> Vec<(NodeId, Change)> {
        let mut out = Vec::new();
        for &root in self.roots.values() {
            self.collect_node_population(root, action, &mut out);
        }
        out
    }

    fn collect_node_population(
        &self,
        id: NodeId,
        action: ChangeAction,
        out: &mut Vec<(NodeId, Change)>,
    ) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        match &node.body {
            NodeBody::Map(entries) => {
                if !entries.is_empty() {
                    let mut change = MapChange::default();
                    for (key, child) in entries {
                        let entry = self.population_entry(action, child);
                        match action {
                            ChangeAction::Delete => {
                                change.deleted.insert(key.clone());
                            }
                            _ => {
                                change.added.insert(key.clone());
                            }
                        }
                        change.entries.insert(key.clone(), entry);
                    }
                    out.push((id, Change::Map(change)));
                }
                for child in entries.values() {
                    if let Child::Node(child_id) = child {
                        self.collect_node_population(*child_id, action, out);
                    }
                }
            }
            NodeBody::Array(elems) => {
                if !elems.is_empty() {
                    let mut change = ArrayChange::default();
                    for (elem_id, child) in elems {
                        let entry = self.population_entry(action, child);
                        match action {
                            ChangeAction::Delete => {
                                change.deleted.insert(*elem_id);
                            }
                            _ => {
                                change.added.insert(*elem_id);
                            }
                        }
                        change.entries.insert(*elem_id, entry);
                    }
                    out.push((id, Change::Array(change)));
                }
                for (_, child) in elems {
                    if let Child::Node(child_id) = child {
                        self.collect_node_population(*child_id, action, out);
                    }
                }
            }
        }
    }

    fn population_entry(&self, action: ChangeAction, child: &Child) -> EntryChange {
        let value = match action {
            ChangeAction::Delete => None,
            _ => Some(self.arena.child_value(child)),
        };
        EntryChange { action, value }
    }

    fn child_out(&self, child: &Child) -> Out {
        match child {
            Child::Leaf(value) => Out::Value(value.clone()),
            Child::Node(id) => match self.arena.kind(*id) {
                Some(NodeKind::Map) => Out::Map(MapRef { node: *id }),
                Some(NodeKind::Array) => Out::Array(ArrayRef { node: *id }),
                None => Out::Value(Value::Null),
            },
        }
    }
}

/// Final step of an array event path: must carry a stable element id.
fn array_step_id(path: &KeyPath) -> Result<ElementId> {
    match path.last() {
        Some(PathStep {
            kind: StepKind::Array,
            key: PathKey::Id(id),
        }) => Ok(*id),
        _ => Err(Error::UnresolvedPath(path.to_string())),
    }
}

/// `Copy` handle over a shared map node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRef {
    node: NodeId,
}

impl MapRef {
    /// Read a slot. Leaves come out by value, nested containers as live
    /// handles. `None` for absent keys and stale handles.
    pub fn get(&self, doc: &Doc, key: &str) -> Option<Out> {
        let child = doc.arena.map_entries(self.node)?.get(key)?;
        Some(doc.child_out(child))
    }

    /// Set a slot. Container values materialize as fresh nodes with fresh
    /// element ids; replacing an existing container stales its handles.
    pub fn set(&self, doc: &mut Doc, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let path = doc.arena.key_path_of(self.node)?;
        let state = doc.to_state_form(value.into());
        doc.commit_event(Event::MapSet {
            path,
            key: key.into(),
            value: state,
        })
    }

    /// Delete a slot. An absent key is not an event: returns `false` and
    /// nothing is recorded or dispatched.
    pub fn delete(&self, doc: &mut Doc, key: &str) -> Result<bool> {
        let path = doc.arena.key_path_of(self.node)?;
        let present = doc
            .arena
            .map_entries(self.node)
            .is_some_and(|entries| entries.contains_key(key));
        if !present {
            return Ok(false);
        }
        doc.commit_event(Event::MapDelete {
            path,
            key: key.to_owned(),
        })?;
        Ok(true)
    }

    pub fn contains_key(&self, doc: &Doc, key: &str) -> bool {
        doc.arena
            .map_entries(self.node)
            .is_some_and(|entries| entries.contains_key(key))
    }

    pub fn len(&self, doc: &Doc) -> usize {
        doc.arena.map_entries(self.node).map_or(0, IndexMap::len)
    }

    pub fn is_empty(&self, doc: &Doc) -> bool {
        self.len(doc) == 0
    }

    /// Keys in insertion order.
    pub fn keys<'doc>(&self, doc: &'doc Doc) -> impl Iterator<Item = &'doc str> {
        doc.arena
            .map_entries(self.node)
            .into_iter()
            .flatten()
            .map(|(key, _)| key.as_str())
    }

    pub fn values<'doc>(&self, doc: &'doc Doc) -> impl Iterator<Item = Out> + 'doc {
        doc.arena
            .map_entries(self.node)
            .into_iter()
            .flatten()
            .map(move |(_, child)| doc.child_out(child))
    }

    pub fn entries<'doc>(&self, doc: &'doc Doc) -> impl Iterator<Item = (&'doc str, Out)> + 'doc {
        doc.arena
            .map_entries(self.node)
            .into_iter()
            .flatten()
            .map(move |(key, child)| (key.as_str(), doc.child_out(child)))
    }

    /// Plain recursive snapshot of this map.
    pub fn to_value(&self, doc: &Doc) -> Value {
        doc.arena.node_value(self.node)
    }

    /// Subscribe to this map's change descriptors. Fires synchronously,
    /// once per applied event, in registration order.
    pub fn observe(&self, doc: &mut Doc, f: impl Fn(&MapChange) + 'static) -> Subscription {
        let sub = doc.next_subscription();
        doc.map_observers
            .entry(self.node)
            .or_default()
            .push((sub, Rc::new(f)));
        sub
    }

    pub fn unobserve(&self, doc: &mut Doc, sub: Subscription) {
        if let Some(list) = doc.map_observers.get_mut(&self.node) {
            list.retain(|(s, _)| *s != sub);
        }
    }
}

/// `Copy` handle over a shared array node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRef {
    node: NodeId,
}

impl ArrayRef {
    /// Append one element. Only single-element pushes are supported;
    /// anything else raises, nothing is truncated. Returns the stable id
    /// assigned to the new element.
    pub fn push(&self, doc: &mut Doc, values: Vec<Value>) -> Result<ElementId> {
        if values.len() != 1 {
            return Err(Error::SingleElementOnly(values.len()));
        }
        let mut path = doc.arena.key_path_of(self.node)?;
        let value = values.into_iter().next().unwrap_or(Value::Null);
        let elem_id = (doc.id_source)();
        path.push(PathStep::array(elem_id));
        let state = doc.to_state_form(value);
        doc.commit_event(Event::ArrayPush { path, value: state })?;
        Ok(elem_id)
    }

    /// Delete the element currently at `index`. The recorded event is keyed
    /// by the element's stable id, not the index, so a concurrent replica
    /// recognizes the same logical element even after positions shift.
    pub fn delete(&self, doc: &mut Doc, index: usize) -> Result<()> {
        let mut path = doc.arena.key_path_of(self.node)?;
        let elems = doc
            .arena
            .array_elems(self.node)
            .ok_or(Error::StaleHandle)?;
        let len = elems.len();
        let Some((elem_id, _)) = elems.get(index) else {
            return Err(Error::IndexOutOfBounds { index, len });
        };
        path.push(PathStep::array(*elem_id));
        doc.commit_event(Event::ArrayDelete { path })
    }

    pub fn get(&self, doc: &Doc, index: usize) -> Option<Out> {
        let (_, child) = doc.arena.array_elems(self.node)?.get(index)?;
        Some(doc.child_out(child))
    }

    /// Stable id of the element currently at `index`.
    pub fn id_at(&self, doc: &Doc, index: usize) -> Option<ElementId> {
        doc.arena
            .array_elems(self.node)?
            .get(index)
            .map(|(id, _)| *id)
    }

    pub fn len(&self, doc: &Doc) -> usize {
        doc.arena.array_elems(self.node).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, doc: &Doc) -> bool {
        self.len(doc) == 0
    }

    pub fn iter<'doc>(&self, doc: &'doc Doc) -> impl Iterator<Item = Out> + 'doc {
        doc.arena
            .array_elems(self.node)
            .into_iter()
            .flatten()
            .map(move |(_, child)| doc.child_out(child))
    }

    /// Plain recursive snapshot of this array.
    pub fn to_value(&self, doc: &Doc) -> Value {
        doc.arena.node_value(self.node)
    }

    pub fn observe(&self, doc: &mut Doc, f: impl Fn(&ArrayChange) + 'static) -> Subscription {
        let sub = doc.next_subscription();
        doc.array_observers
            .entry(self.node)
            .or_default()
            .push((sub, Rc::new(f)));
        sub
    }

    pub fn unobserve(&self, doc: &mut Doc, sub: Subscription) {
        if let Some(list) = doc.array_observers.get_mut(&self.node) {
            list.retain(|(s, _)| *s != sub);
        }
    }
}
