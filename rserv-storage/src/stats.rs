use crate::graph::GraphState;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStatistics {
    pub node_count: u64,
    pub edge_count: u64,
    pub avg_out_degree: f64,
    pub nodes_by_type: BTreeMap<String, u64>,
    pub edges_by_label: BTreeMap<String, u64>,
}

impl GraphStatistics {
    pub(crate) fn from_state(state: &GraphState) -> Self {
        let mut nodes_by_type = BTreeMap::new();
        for (eid, ids) in &state.nodes_by_type {
            if ids.is_empty() {
                continue;
            }
            if let Some(name) = state.entity_name(*eid) {
                nodes_by_type.insert(name.to_string(), ids.len() as u64);
            }
        }

        let mut edges_by_label = BTreeMap::new();
        for edges in state.out.values() {
            for (label, _) in edges {
                if let Some(name) = state.label_name(*label) {
                    *edges_by_label.entry(name.to_string()).or_insert(0) += 1;
                }
            }
        }

        let node_count = state.props.len() as u64;
        let edge_count = state.edge_total as u64;
        let avg_out_degree = if node_count == 0 {
            0.0
        } else {
            edge_count as f64 / node_count as f64
        };

        Self {
            node_count,
            edge_count,
            avg_out_degree,
            nodes_by_type,
            edges_by_label,
        }
    }
}
