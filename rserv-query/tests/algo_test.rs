use rserv_api::{Direction, GraphView};
use rserv_query::Value;
use rserv_query::algo::{
    NeighborhoodAgg, common_neighbors, degree, neighborhood_aggregate, path_exists, shortest_path,
};
use rserv_storage::graph::{EdgeIndex, GraphMode};
use serde_json::json;

fn props(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().unwrap().clone()
}

fn chain(n: u64) -> EdgeIndex {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    for id in 1..=n {
        let refs = if id < n {
            vec![("next".to_string(), "items".to_string(), id + 1)]
        } else {
            Vec::new()
        };
        index
            .upsert_document("items", id, props(json!({"id": id})), &refs)
            .unwrap();
    }
    index
}

#[test]
fn shortest_path_on_a_chain() {
    let index = chain(4);
    let start = index.resolve_id(1).unwrap();
    let end = index.resolve_id(4).unwrap();

    let path = shortest_path(&index, start, end, 10, None).unwrap();
    let ids: Vec<u64> = path.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    // Too shallow a depth bound finds nothing.
    assert!(shortest_path(&index, start, end, 2, None).is_none());
}

#[test]
fn shortest_path_agrees_with_path_exists() {
    let index = chain(5);
    let start = index.resolve_id(1).unwrap();
    let end = index.resolve_id(5).unwrap();
    for depth in 0..6 {
        let found = shortest_path(&index, start, end, depth, None);
        assert_eq!(found.is_some(), path_exists(&index, start, end, depth, None));
        if let Some(path) = found {
            assert!(path.len() as u32 - 1 <= depth);
        }
    }
}

#[test]
fn shortest_path_ignores_edge_direction() {
    let index = chain(3);
    let start = index.resolve_id(3).unwrap();
    let end = index.resolve_id(1).unwrap();
    let path = shortest_path(&index, start, end, 10, None).unwrap();
    let ids: Vec<u64> = path.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[test]
fn zero_depth_only_matches_the_same_node() {
    let index = chain(2);
    let start = index.resolve_id(1).unwrap();
    let end = index.resolve_id(2).unwrap();
    assert!(!path_exists(&index, start, end, 0, None));
    let path = shortest_path(&index, start, start, 0, None).unwrap();
    assert_eq!(path.len(), 1);
}

#[test]
fn degree_counts_each_direction() {
    // Star: 1 -> 2, 1 -> 3, 4 -> 1.
    let index = EdgeIndex::new(GraphMode::Memory, None);
    index
        .upsert_document(
            "users",
            1,
            props(json!({"id": 1})),
            &[
                ("follows".into(), "users".into(), 2),
                ("follows".into(), "users".into(), 3),
            ],
        )
        .unwrap();
    for id in [2u64, 3] {
        index
            .upsert_document("users", id, props(json!({"id": id})), &[])
            .unwrap();
    }
    index
        .upsert_document(
            "users",
            4,
            props(json!({"id": 4})),
            &[("follows".into(), "users".into(), 1)],
        )
        .unwrap();

    let hub = index.resolve_id(1).unwrap();
    assert_eq!(degree(&index, hub, Direction::Out), 2);
    assert_eq!(degree(&index, hub, Direction::In), 1);
    assert_eq!(degree(&index, hub, Direction::All), 3);
}

#[test]
fn common_neighbors_intersects_outbound_sets() {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    index
        .upsert_document(
            "users",
            1,
            props(json!({"id": 1})),
            &[
                ("friends".into(), "users".into(), 3),
                ("friends".into(), "users".into(), 4),
            ],
        )
        .unwrap();
    index
        .upsert_document(
            "users",
            2,
            props(json!({"id": 2})),
            &[
                ("friends".into(), "users".into(), 3),
                ("friends".into(), "users".into(), 5),
            ],
        )
        .unwrap();
    for id in [3u64, 4, 5] {
        index
            .upsert_document("users", id, props(json!({"id": id})), &[])
            .unwrap();
    }

    let a = index.resolve_id(1).unwrap();
    let b = index.resolve_id(2).unwrap();
    let shared = common_neighbors(&index, a, b);
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].id, 3);
}

fn aged_tree() -> EdgeIndex {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    index
        .upsert_document(
            "users",
            1,
            props(json!({"id": 1, "age": 50})),
            &[
                ("reports".into(), "users".into(), 2),
                ("reports".into(), "users".into(), 3),
            ],
        )
        .unwrap();
    index
        .upsert_document(
            "users",
            2,
            props(json!({"id": 2, "age": 30})),
            &[("reports".into(), "users".into(), 4)],
        )
        .unwrap();
    index
        .upsert_document("users", 3, props(json!({"id": 3, "age": 40})), &[])
        .unwrap();
    index
        .upsert_document("users", 4, props(json!({"id": 4})), &[])
        .unwrap();
    index
}

#[test]
fn neighborhood_aggregate_counts_and_sums() {
    let index = aged_tree();
    let root = index.resolve_id(1).unwrap();

    // Depth 1: nodes 2 and 3. Node 4 appears at depth 2; it has no age
    // and is skipped by the collectors.
    let sum = neighborhood_aggregate(&index, root, 1, "age", NeighborhoodAgg::Sum).unwrap();
    assert_eq!(sum, Value::Int(70));
    let count = neighborhood_aggregate(&index, root, 2, "age", NeighborhoodAgg::Count).unwrap();
    assert_eq!(count, Value::Int(2));
    let avg = neighborhood_aggregate(&index, root, 2, "age", NeighborhoodAgg::Avg).unwrap();
    assert_eq!(avg, Value::Float(35.0));
}

#[test]
fn neighborhood_aggregate_at_depth_zero_is_empty() {
    let index = aged_tree();
    let root = index.resolve_id(1).unwrap();
    let count = neighborhood_aggregate(&index, root, 0, "age", NeighborhoodAgg::Count).unwrap();
    assert_eq!(count, Value::Int(0));
    let avg = neighborhood_aggregate(&index, root, 0, "age", NeighborhoodAgg::Avg).unwrap();
    assert_eq!(avg, Value::Null);
}

#[test]
fn neighborhood_sum_rejects_non_numeric_values() {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    index
        .upsert_document(
            "users",
            1,
            props(json!({"id": 1})),
            &[("friends".into(), "users".into(), 2)],
        )
        .unwrap();
    index
        .upsert_document("users", 2, props(json!({"id": 2, "age": "old"})), &[])
        .unwrap();
    let root = index.resolve_id(1).unwrap();
    assert!(neighborhood_aggregate(&index, root, 1, "age", NeighborhoodAgg::Sum).is_err());
}
