//! Reference resolver and edge index.
//!
//! Every reference-typed field of a stored document contributes one
//! directed, labelled edge. The index keeps bidirectional adjacency plus a
//! copy of each node's non-reference properties, so a query snapshot is a
//! plain structural clone that needs no further file access.
//!
//! Entity names and edge labels are interned to `u32` ids; adjacency sets
//! are ordered, and listings resolve labels back to names and re-sort by
//! (label name, peer) so traversal order is stable regardless of intern
//! order.

use crate::stats::GraphStatistics;
use crate::{Error, Result, index_file};
use rserv_api::{DocId, Edge, EntityId, GraphView, LabelId, NodeKey};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphMode {
    Memory,
    Indexed,
}

/// One document's contribution to the graph, as produced by a store scan.
#[derive(Debug, Clone)]
pub struct DocRecord {
    pub entity: String,
    pub id: DocId,
    /// Non-reference fields only.
    pub props: Map<String, Value>,
    /// `(field, target_entity, target_id)` triples.
    pub refs: Vec<(String, String, DocId)>,
}

#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub(crate) entities: Vec<String>,
    pub(crate) entity_ids: BTreeMap<String, EntityId>,
    pub(crate) labels: Vec<String>,
    pub(crate) label_ids: BTreeMap<String, LabelId>,
    pub(crate) out: BTreeMap<NodeKey, BTreeSet<(LabelId, NodeKey)>>,
    pub(crate) inbound: BTreeMap<NodeKey, BTreeSet<(LabelId, NodeKey)>>,
    pub(crate) props: BTreeMap<NodeKey, Map<String, Value>>,
    pub(crate) nodes_by_type: BTreeMap<EntityId, BTreeSet<DocId>>,
    pub(crate) prop_index: BTreeMap<(EntityId, String, String), BTreeSet<DocId>>,
    pub(crate) edge_total: usize,
    pub(crate) indexed: bool,
}

/// Field name → edge label: `foo_bar` becomes `FOO_BAR`.
pub fn edge_label(field: &str) -> String {
    field.to_uppercase()
}

/// Entity `users` matches node type `User`, `Users`, or `user`.
pub fn entity_matches_type(entity: &str, ty: &str) -> bool {
    let e = entity.to_lowercase();
    let t = ty.to_lowercase();
    e == t || e.strip_suffix('s') == Some(t.as_str()) || t.strip_suffix('s') == Some(e.as_str())
}

/// Entity name → node type name: lower-case singular, title-cased.
pub fn type_name(entity: &str) -> String {
    let lower = entity.to_lowercase();
    let singular = lower
        .strip_suffix('s')
        .filter(|s| !s.is_empty())
        .unwrap_or(lower.as_str());
    let mut chars = singular.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl GraphState {
    pub(crate) fn intern_entity(&mut self, name: &str) -> EntityId {
        if let Some(id) = self.entity_ids.get(name) {
            return *id;
        }
        let id = self.entities.len() as EntityId;
        self.entities.push(name.to_string());
        self.entity_ids.insert(name.to_string(), id);
        id
    }

    pub(crate) fn intern_label(&mut self, name: &str) -> LabelId {
        if let Some(id) = self.label_ids.get(name) {
            return *id;
        }
        let id = self.labels.len() as LabelId;
        self.labels.push(name.to_string());
        self.label_ids.insert(name.to_string(), id);
        id
    }

    pub(crate) fn entity_name(&self, id: EntityId) -> Option<&str> {
        self.entities.get(id as usize).map(String::as_str)
    }

    pub(crate) fn label_name(&self, id: LabelId) -> Option<&str> {
        self.labels.get(id as usize).map(String::as_str)
    }

    fn index_props(&mut self, node: NodeKey, props: &Map<String, Value>, insert: bool) {
        if !self.indexed {
            return;
        }
        for (field, value) in props {
            let Some(key) = scalar_key(value) else {
                continue;
            };
            let slot = self
                .prop_index
                .entry((node.entity, field.clone(), key))
                .or_default();
            if insert {
                slot.insert(node.id);
            } else {
                slot.remove(&node.id);
            }
        }
    }

    fn drop_outbound(&mut self, node: NodeKey) {
        if let Some(edges) = self.out.remove(&node) {
            self.edge_total -= edges.len();
            for (label, dst) in edges {
                if let Some(set) = self.inbound.get_mut(&dst) {
                    set.remove(&(label, node));
                    if set.is_empty() {
                        self.inbound.remove(&dst);
                    }
                }
            }
        }
    }

    /// Installs (or replaces) a document's node properties and outbound
    /// edges. Inbound edges pointing at it are untouched.
    pub(crate) fn upsert_document(
        &mut self,
        entity: &str,
        id: DocId,
        props: Map<String, Value>,
        refs: &[(String, String, DocId)],
    ) {
        let eid = self.intern_entity(entity);
        let node = NodeKey::new(eid, id);

        if let Some(old) = self.props.remove(&node) {
            self.index_props(node, &old, false);
        }
        self.drop_outbound(node);

        self.index_props(node, &props, true);
        self.props.insert(node, props);
        self.nodes_by_type.entry(eid).or_default().insert(id);

        let mut edges = BTreeSet::new();
        for (field, target_entity, target_id) in refs {
            let label = self.intern_label(&edge_label(field));
            let target = NodeKey::new(self.intern_entity(target_entity), *target_id);
            if edges.insert((label, target)) {
                self.inbound.entry(target).or_default().insert((label, node));
            }
        }
        self.edge_total += edges.len();
        if !edges.is_empty() {
            self.out.insert(node, edges);
        }
    }

    /// Removes a document: its node, outbound edges, and any inbound edges
    /// still pointing at it.
    pub(crate) fn remove_document(&mut self, entity: &str, id: DocId) {
        let Some(eid) = self.entity_ids.get(entity).copied() else {
            return;
        };
        let node = NodeKey::new(eid, id);
        if let Some(old) = self.props.remove(&node) {
            self.index_props(node, &old, false);
        }
        self.drop_outbound(node);
        if let Some(sources) = self.inbound.remove(&node) {
            for (label, src) in sources {
                if let Some(set) = self.out.get_mut(&src) {
                    if set.remove(&(label, node)) {
                        self.edge_total -= 1;
                    }
                    if set.is_empty() {
                        self.out.remove(&src);
                    }
                }
            }
        }
        if let Some(ids) = self.nodes_by_type.get_mut(&eid) {
            ids.remove(&id);
        }
    }

    fn resolve_edges(&self, set: Option<&BTreeSet<(LabelId, NodeKey)>>) -> Vec<Edge> {
        let mut edges: Vec<Edge> = set
            .into_iter()
            .flatten()
            .map(|(label, peer)| Edge {
                label: self.label_name(*label).unwrap_or_default().to_string(),
                peer: *peer,
            })
            .collect();
        edges.sort();
        edges
    }
}

fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

impl GraphView for GraphState {
    fn nodes(&self) -> Vec<NodeKey> {
        self.props.keys().copied().collect()
    }

    fn nodes_of_type(&self, ty: &str) -> Vec<NodeKey> {
        let mut out = Vec::new();
        for (name, eid) in &self.entity_ids {
            if entity_matches_type(name, ty) {
                if let Some(ids) = self.nodes_by_type.get(eid) {
                    out.extend(ids.iter().map(|id| NodeKey::new(*eid, *id)));
                }
            }
        }
        out.sort();
        out
    }

    fn contains(&self, node: NodeKey) -> bool {
        self.props.contains_key(&node)
    }

    fn outbound(&self, node: NodeKey) -> Vec<Edge> {
        self.resolve_edges(self.out.get(&node))
    }

    fn inbound(&self, node: NodeKey) -> Vec<Edge> {
        self.resolve_edges(self.inbound.get(&node))
    }

    fn node_type(&self, node: NodeKey) -> Option<String> {
        self.entity_name(node.entity).map(type_name)
    }

    fn node_property(&self, node: NodeKey, key: &str) -> Option<Value> {
        self.props.get(&node)?.get(key).cloned()
    }

    fn node_properties(&self, node: NodeKey) -> Option<Map<String, Value>> {
        self.props.get(&node).cloned()
    }

    fn resolve_id(&self, id: DocId) -> Option<NodeKey> {
        for eid in 0..self.entities.len() as EntityId {
            let node = NodeKey::new(eid, id);
            if self.props.contains_key(&node) {
                return Some(node);
            }
        }
        None
    }

    fn seed_by_property(&self, ty: &str, field: &str, value: &Value) -> Option<Vec<NodeKey>> {
        if !self.indexed {
            return None;
        }
        let key = scalar_key(value)?;
        let mut out = Vec::new();
        for (name, eid) in &self.entity_ids {
            if !entity_matches_type(name, ty) {
                continue;
            }
            if let Some(ids) = self.prop_index.get(&(*eid, field.to_string(), key.clone())) {
                out.extend(ids.iter().map(|id| NodeKey::new(*eid, *id)));
            }
        }
        out.sort();
        Some(out)
    }

    fn node_count(&self) -> usize {
        self.props.len()
    }

    fn edge_count(&self) -> usize {
        self.edge_total
    }
}

/// A consistent copy of the index taken at a point in time. Queries run
/// against snapshots; concurrent writes are invisible to them.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    state: GraphState,
}

impl GraphView for GraphSnapshot {
    fn nodes(&self) -> Vec<NodeKey> {
        self.state.nodes()
    }
    fn nodes_of_type(&self, ty: &str) -> Vec<NodeKey> {
        self.state.nodes_of_type(ty)
    }
    fn contains(&self, node: NodeKey) -> bool {
        self.state.contains(node)
    }
    fn outbound(&self, node: NodeKey) -> Vec<Edge> {
        self.state.outbound(node)
    }
    fn inbound(&self, node: NodeKey) -> Vec<Edge> {
        self.state.inbound(node)
    }
    fn node_type(&self, node: NodeKey) -> Option<String> {
        self.state.node_type(node)
    }
    fn node_property(&self, node: NodeKey, key: &str) -> Option<Value> {
        self.state.node_property(node, key)
    }
    fn node_properties(&self, node: NodeKey) -> Option<Map<String, Value>> {
        self.state.node_properties(node)
    }
    fn resolve_id(&self, id: DocId) -> Option<NodeKey> {
        self.state.resolve_id(id)
    }
    fn seed_by_property(&self, ty: &str, field: &str, value: &Value) -> Option<Vec<NodeKey>> {
        self.state.seed_by_property(ty, field, value)
    }
    fn node_count(&self) -> usize {
        self.state.node_count()
    }
    fn edge_count(&self) -> usize {
        self.state.edge_count()
    }
}

/// The process-wide edge index. Readers share the lock; writers hold it
/// exclusively for the duration of one document's update.
#[derive(Debug)]
pub struct EdgeIndex {
    state: RwLock<GraphState>,
    mode: GraphMode,
    index_path: Option<PathBuf>,
}

impl EdgeIndex {
    pub fn new(mode: GraphMode, index_path: Option<PathBuf>) -> Self {
        let state = GraphState {
            indexed: mode == GraphMode::Indexed,
            ..GraphState::default()
        };
        Self {
            state: RwLock::new(state),
            mode,
            index_path,
        }
    }

    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    /// Populates the index at boot. In indexed mode the persisted file is
    /// tried first; a missing or corrupt file falls back to the scan.
    pub fn populate(&self, scan: impl FnOnce() -> Result<Vec<DocRecord>>) -> Result<()> {
        if self.mode == GraphMode::Indexed {
            if let Some(path) = &self.index_path {
                match index_file::load(path) {
                    Ok(Some(loaded)) => {
                        *self.state.write().unwrap() = loaded;
                        return Ok(());
                    }
                    Ok(None) => {}
                    Err(Error::IndexCorrupt(reason)) => {
                        tracing::warn!(path = %path.display(), reason, "rebuilding graph index");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        let records = scan()?;
        {
            let mut state = self.state.write().unwrap();
            for record in records {
                state.upsert_document(&record.entity, record.id, record.props, &record.refs);
            }
        }
        self.flush()
    }

    pub fn upsert_document(
        &self,
        entity: &str,
        id: DocId,
        props: Map<String, Value>,
        refs: &[(String, String, DocId)],
    ) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .upsert_document(entity, id, props, refs);
        self.flush()
    }

    pub fn remove_document(&self, entity: &str, id: DocId) -> Result<()> {
        self.state.write().unwrap().remove_document(entity, id);
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        if self.mode != GraphMode::Indexed {
            return Ok(());
        }
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let state = self.state.read().unwrap();
        index_file::save(path, &state)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            state: self.state.read().unwrap().clone(),
        }
    }

    pub fn statistics(&self) -> GraphStatistics {
        GraphStatistics::from_state(&self.state.read().unwrap())
    }

    pub(crate) fn read_state(&self) -> std::sync::RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap()
    }
}

impl GraphView for EdgeIndex {
    fn nodes(&self) -> Vec<NodeKey> {
        self.read_state().nodes()
    }
    fn nodes_of_type(&self, ty: &str) -> Vec<NodeKey> {
        self.read_state().nodes_of_type(ty)
    }
    fn contains(&self, node: NodeKey) -> bool {
        self.read_state().contains(node)
    }
    fn outbound(&self, node: NodeKey) -> Vec<Edge> {
        self.read_state().outbound(node)
    }
    fn inbound(&self, node: NodeKey) -> Vec<Edge> {
        self.read_state().inbound(node)
    }
    fn node_type(&self, node: NodeKey) -> Option<String> {
        self.read_state().node_type(node)
    }
    fn node_property(&self, node: NodeKey, key: &str) -> Option<Value> {
        self.read_state().node_property(node, key)
    }
    fn node_properties(&self, node: NodeKey) -> Option<Map<String, Value>> {
        self.read_state().node_properties(node)
    }
    fn resolve_id(&self, id: DocId) -> Option<NodeKey> {
        self.read_state().resolve_id(id)
    }
    fn seed_by_property(&self, ty: &str, field: &str, value: &Value) -> Option<Vec<NodeKey>> {
        self.read_state().seed_by_property(ty, field, value)
    }
    fn node_count(&self) -> usize {
        self.read_state().node_count()
    }
    fn edge_count(&self) -> usize {
        self.read_state().edge_count()
    }
}
