//! Graph algorithms exposed at the REST surface: pathfinding, degree,
//! common neighbours, and neighbourhood aggregation.

use crate::executor::Value;
use rserv_api::{Direction, GraphView, NodeKey};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// `sum`/`avg` hit a value they cannot add up.
#[derive(Debug, Clone, PartialEq)]
pub struct NonNumericProperty {
    pub property: String,
}

impl std::fmt::Display for NonNumericProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "property {} holds non-numeric values", self.property)
    }
}

impl std::error::Error for NonNumericProperty {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborhoodAgg {
    Count,
    Sum,
    Avg,
}

impl NeighborhoodAgg {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "count" => Some(Self::Count),
            "sum" => Some(Self::Sum),
            "avg" => Some(Self::Avg),
            _ => None,
        }
    }
}

fn undirected_neighbors(view: &dyn GraphView, node: NodeKey, labels: Option<&[String]>) -> Vec<NodeKey> {
    let mut peers = BTreeSet::new();
    for edge in view.outbound(node).into_iter().chain(view.inbound(node)) {
        if let Some(labels) = labels {
            if !labels.is_empty() && !labels.contains(&edge.label) {
                continue;
            }
        }
        peers.insert(edge.peer);
    }
    peers.into_iter().collect()
}

/// BFS over the undirected union of in- and outbound edges. Returns the
/// node sequence from `start` to `end`, or `None` within `max_depth`.
/// Edge labels are ignored unless a filter list is given.
pub fn shortest_path(
    view: &dyn GraphView,
    start: NodeKey,
    end: NodeKey,
    max_depth: u32,
    labels: Option<&[String]>,
) -> Option<Vec<NodeKey>> {
    if start == end {
        return view.contains(start).then(|| vec![start]);
    }
    if !view.contains(start) || !view.contains(end) {
        return None;
    }

    let mut parents: BTreeMap<NodeKey, NodeKey> = BTreeMap::new();
    let mut queue = VecDeque::from([(start, 0u32)]);
    let mut seen = BTreeSet::from([start]);

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for peer in undirected_neighbors(view, node, labels) {
            if !seen.insert(peer) {
                continue;
            }
            parents.insert(peer, node);
            if peer == end {
                let mut path = vec![end];
                let mut cursor = end;
                while let Some(parent) = parents.get(&cursor) {
                    path.push(*parent);
                    cursor = *parent;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back((peer, depth + 1));
        }
    }
    None
}

/// Same traversal as [`shortest_path`], answering only reachability.
pub fn path_exists(
    view: &dyn GraphView,
    start: NodeKey,
    end: NodeKey,
    max_depth: u32,
    labels: Option<&[String]>,
) -> bool {
    shortest_path(view, start, end, max_depth, labels).is_some()
}

/// Intersection of the outbound neighbour sets of `a` and `b`.
pub fn common_neighbors(view: &dyn GraphView, a: NodeKey, b: NodeKey) -> Vec<NodeKey> {
    let of = |node: NodeKey| -> BTreeSet<NodeKey> {
        view.outbound(node).into_iter().map(|e| e.peer).collect()
    };
    of(a).intersection(&of(b)).copied().collect()
}

pub fn degree(view: &dyn GraphView, node: NodeKey, direction: Direction) -> usize {
    match direction {
        Direction::Out => view.outbound(node).len(),
        Direction::In => view.inbound(node).len(),
        Direction::All => view.outbound(node).len() + view.inbound(node).len(),
    }
}

/// Outbound BFS to `depth`; collects `property` from each distinct visited
/// node (seed excluded), skipping nodes without it, then aggregates.
/// `sum` of nothing is 0; `avg` of nothing is null.
pub fn neighborhood_aggregate(
    view: &dyn GraphView,
    node: NodeKey,
    depth: u32,
    property: &str,
    aggregation: NeighborhoodAgg,
) -> Result<Value, NonNumericProperty> {
    let mut visited = BTreeSet::from([node]);
    let mut queue = VecDeque::from([(node, 0u32)]);
    let mut values = Vec::new();

    while let Some((current, level)) = queue.pop_front() {
        if level >= depth {
            continue;
        }
        for edge in view.outbound(current) {
            if !visited.insert(edge.peer) {
                continue;
            }
            if let Some(value) = view.node_property(edge.peer, property) {
                if !value.is_null() {
                    values.push(value);
                }
            }
            queue.push_back((edge.peer, level + 1));
        }
    }

    match aggregation {
        NeighborhoodAgg::Count => Ok(Value::Int(values.len() as i64)),
        NeighborhoodAgg::Sum | NeighborhoodAgg::Avg => {
            let mut total = 0.0;
            let mut integral = true;
            for value in &values {
                let Some(n) = value.as_f64() else {
                    return Err(NonNumericProperty {
                        property: property.to_string(),
                    });
                };
                if !(value.is_i64() || value.is_u64()) {
                    integral = false;
                }
                total += n;
            }
            if aggregation == NeighborhoodAgg::Sum {
                if integral {
                    Ok(Value::Int(total as i64))
                } else {
                    Ok(Value::Float(total))
                }
            } else if values.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::Float(total / values.len() as f64))
            }
        }
    }
}
