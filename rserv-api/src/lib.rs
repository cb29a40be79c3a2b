use serde::{Deserialize, Serialize};

/// Document id, unique within its entity.
pub type DocId = u64;
/// Interned entity name.
pub type EntityId = u32;
/// Interned edge label (upper-cased reference field name).
pub type LabelId = u32;

/// A document seen through the graph lens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub entity: EntityId,
    pub id: DocId,
}

impl NodeKey {
    pub const fn new(entity: EntityId, id: DocId) -> Self {
        Self { entity, id }
    }
}

/// An adjacency entry with its label resolved back to a string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub label: String,
    pub peer: NodeKey,
}

/// Direction selector for degree and link listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    All,
}

/// Read access to the graph overlay.
///
/// Implemented by the edge index and its snapshots. Adjacency listings are
/// returned sorted by (label ascending, peer ascending) so traversal order
/// is deterministic.
pub trait GraphView {
    fn nodes(&self) -> Vec<NodeKey>;

    /// Nodes whose entity matches `ty` under case/singular normalisation.
    fn nodes_of_type(&self, ty: &str) -> Vec<NodeKey>;

    fn contains(&self, node: NodeKey) -> bool;

    fn outbound(&self, node: NodeKey) -> Vec<Edge>;

    fn inbound(&self, node: NodeKey) -> Vec<Edge>;

    /// Node type name (title-cased singular of the entity name).
    fn node_type(&self, node: NodeKey) -> Option<String>;

    fn node_property(&self, node: NodeKey, key: &str) -> Option<serde_json::Value>;

    /// All non-reference fields of the backing document.
    fn node_properties(&self, node: NodeKey) -> Option<serde_json::Map<String, serde_json::Value>>;

    /// Resolves a bare document id against entities in ascending interned
    /// order; first entity containing the id wins.
    fn resolve_id(&self, id: DocId) -> Option<NodeKey>;

    /// Property-equality seed lookup. Only indexed deployments answer this;
    /// `None` means "scan instead".
    fn seed_by_property(
        &self,
        ty: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Option<Vec<NodeKey>> {
        let _ = (ty, field, value);
        None
    }

    fn node_count(&self) -> usize;

    fn edge_count(&self) -> usize;
}

/// Read-through per-document cache. The TTL and remote drivers live outside
/// this crate; the store only ever talks to this interface.
pub trait DocumentCache: Send + Sync {
    fn get(&self, entity: &str, id: DocId) -> Option<serde_json::Value>;
    fn put(&self, entity: &str, id: DocId, doc: serde_json::Value);
    fn invalidate(&self, entity: &str, id: DocId);
    fn clear(&self);
}

/// A full-text match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub entity: String,
    pub id: DocId,
    pub score: f32,
}

/// Full-text indexer interface backing `/search`.
pub trait SearchIndex: Send + Sync {
    fn index(&self, entity: &str, id: DocId, doc: &serde_json::Value);
    fn remove(&self, entity: &str, id: DocId);
    fn search(&self, query: &str, field: Option<&str>) -> Vec<SearchHit>;
}
