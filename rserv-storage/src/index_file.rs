//! Persisted edge index (`graph.index`).
//!
//! Frame layout: 8-byte magic, u32 version, u64 payload length, JSON
//! payload, u32 crc32 of the payload (all integers little-endian). The file
//! is replaced atomically after every write; any mismatch at load time
//! triggers a rebuild from a document scan.

use crate::graph::GraphState;
use crate::{Error, INDEX_MAGIC, INDEX_VERSION, Result, fsio};
use rserv_api::{LabelId, NodeKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    entities: Vec<String>,
    labels: Vec<String>,
    nodes: Vec<(NodeKey, Map<String, Value>)>,
    edges: Vec<(NodeKey, LabelId, NodeKey)>,
}

pub fn save(path: &Path, state: &GraphState) -> Result<()> {
    let payload = Payload {
        entities: state.entities.clone(),
        labels: state.labels.clone(),
        nodes: state
            .props
            .iter()
            .map(|(node, props)| (*node, props.clone()))
            .collect(),
        edges: state
            .out
            .iter()
            .flat_map(|(src, edges)| edges.iter().map(|(label, dst)| (*src, *label, *dst)))
            .collect(),
    };
    let body = serde_json::to_vec(&payload).map_err(|source| Error::CorruptJson {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let checksum = hasher.finalize();

    let mut bytes = Vec::with_capacity(body.len() + 24);
    bytes.extend_from_slice(&INDEX_MAGIC);
    bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    fsio::atomic_write(path, &bytes)
}

/// `Ok(None)` when the file does not exist; `Err(IndexCorrupt)` when it
/// exists but cannot be trusted.
pub fn load(path: &Path) -> Result<Option<GraphState>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < 24 || bytes[0..8] != INDEX_MAGIC {
        return Err(Error::IndexCorrupt("bad magic"));
    }
    let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    if version != INDEX_VERSION {
        return Err(Error::IndexCorrupt("unsupported version"));
    }
    let len = u64::from_le_bytes(bytes[12..20].try_into().unwrap()) as usize;
    if bytes.len() != 20 + len + 4 {
        return Err(Error::IndexCorrupt("truncated"));
    }
    let body = &bytes[20..20 + len];
    let stored = u32::from_le_bytes(bytes[20 + len..].try_into().unwrap());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored {
        return Err(Error::IndexCorrupt("checksum mismatch"));
    }

    let payload: Payload =
        serde_json::from_slice(body).map_err(|_| Error::IndexCorrupt("bad payload"))?;
    Ok(Some(rebuild(payload)))
}

fn rebuild(payload: Payload) -> GraphState {
    let mut state = GraphState {
        indexed: true,
        ..GraphState::default()
    };
    // Re-intern in stored order so edge endpoints keep their ids.
    for name in &payload.entities {
        state.intern_entity(name);
    }
    for name in &payload.labels {
        state.intern_label(name);
    }

    let mut refs_by_node: std::collections::BTreeMap<NodeKey, Vec<(String, String, u64)>> =
        std::collections::BTreeMap::new();
    for (src, label, dst) in &payload.edges {
        let field = payload
            .labels
            .get(*label as usize)
            .cloned()
            .unwrap_or_default();
        let target_entity = payload
            .entities
            .get(dst.entity as usize)
            .cloned()
            .unwrap_or_default();
        refs_by_node
            .entry(*src)
            .or_default()
            .push((field, target_entity, dst.id));
    }

    for (node, props) in payload.nodes {
        let entity = payload
            .entities
            .get(node.entity as usize)
            .cloned()
            .unwrap_or_default();
        let refs = refs_by_node.remove(&node).unwrap_or_default();
        state.upsert_document(&entity, node.id, props, &refs);
    }
    state
}
