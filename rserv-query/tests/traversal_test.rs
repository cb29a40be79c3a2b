use rserv_query::{ExecOptions, query_collect};
use rserv_storage::graph::{EdgeIndex, GraphMode};
use serde_json::json;

fn props(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().unwrap().clone()
}

fn friends_chain() -> EdgeIndex {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    index
        .upsert_document(
            "users",
            1,
            props(json!({"id": 1, "name": "Alice"})),
            &[("friends".into(), "users".into(), 2)],
        )
        .unwrap();
    index
        .upsert_document(
            "users",
            2,
            props(json!({"id": 2, "name": "Bob"})),
            &[("friends".into(), "users".into(), 3)],
        )
        .unwrap();
    index
        .upsert_document("users", 3, props(json!({"id": 3, "name": "Carol"})), &[])
        .unwrap();
    index
}

#[test]
fn friends_of_friends() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (u:User)-[:FRIENDS]->(f)-[:FRIENDS]->(g) WHERE u.name='Alice' RETURN g.name",
        ExecOptions::default(),
    )
    .unwrap();
    let rows: Vec<_> = output.rows.iter().map(|r| r.to_json()).collect();
    assert_eq!(rows, vec![json!({"g.name": "Carol"})]);
}

#[test]
fn label_filter_excludes_other_edges() {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    index
        .upsert_document(
            "users",
            1,
            props(json!({"id": 1})),
            &[
                ("friends".into(), "users".into(), 2),
                ("blocked".into(), "users".into(), 3),
            ],
        )
        .unwrap();
    index
        .upsert_document("users", 2, props(json!({"id": 2})), &[])
        .unwrap();
    index
        .upsert_document("users", 3, props(json!({"id": 3})), &[])
        .unwrap();

    let output = query_collect(
        &index,
        "MATCH (a)-[:FRIENDS]->(b) RETURN b.id",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows.len(), 1);
    assert_eq!(output.rows[0].to_json(), json!({"b.id": 2}));

    let output = query_collect(
        &index,
        "MATCH (a)-[:FRIENDS|BLOCKED]->(b) RETURN b.id",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows.len(), 2);
}

#[test]
fn inline_property_map_constrains_the_seed() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (u:User {name: 'Bob'})-[:FRIENDS]->(f) RETURN f.name",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows[0].to_json(), json!({"f.name": "Carol"}));
}

#[test]
fn where_equality_on_the_tail_traverses_backwards() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (u:User)-[:FRIENDS]->(f) WHERE f.name = 'Carol' RETURN u.name",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows[0].to_json(), json!({"u.name": "Bob"}));
}

#[test]
fn variable_length_range_bounds() {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    for id in 1..=4u64 {
        let refs = if id < 4 {
            vec![("next".to_string(), "items".to_string(), id + 1)]
        } else {
            Vec::new()
        };
        index
            .upsert_document("items", id, props(json!({"id": id})), &refs)
            .unwrap();
    }

    let ids = |input: &str| -> Vec<serde_json::Value> {
        query_collect(&index, input, ExecOptions::default())
            .unwrap()
            .rows
            .iter()
            .map(|r| r.to_json()["b.id"].clone())
            .collect()
    };

    // Zero hops yields the seed alone.
    assert_eq!(ids("MATCH (a {id: 1})-[:NEXT*0..0]->(b) RETURN b.id"), vec![json!(1)]);
    assert_eq!(
        ids("MATCH (a {id: 1})-[:NEXT*1..2]->(b) RETURN b.id"),
        vec![json!(2), json!(3)]
    );
    // A range as wide as the graph diameter reaches everything.
    assert_eq!(
        ids("MATCH (a {id: 1})-[:NEXT*0..3]->(b) RETURN b.id"),
        vec![json!(1), json!(2), json!(3), json!(4)]
    );
    // Bare `*` defaults to one-or-more, capped by max_depth.
    assert_eq!(
        ids("MATCH (a {id: 1})-[*]->(b) RETURN b.id"),
        vec![json!(2), json!(3), json!(4)]
    );
}

#[test]
fn max_depth_caps_unbounded_ranges() {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    for id in 1..=6u64 {
        let refs = if id < 6 {
            vec![("next".to_string(), "items".to_string(), id + 1)]
        } else {
            Vec::new()
        };
        index
            .upsert_document("items", id, props(json!({"id": id})), &refs)
            .unwrap();
    }
    let output = query_collect(
        &index,
        "MATCH (a {id: 1})-[:NEXT*1..]->(b) RETURN b.id",
        ExecOptions {
            max_depth: 2,
            ..ExecOptions::default()
        },
    )
    .unwrap();
    assert_eq!(output.rows.len(), 2);
}

#[test]
fn negated_pattern_finds_leaves() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (x:User) WHERE NOT (x)-[:FRIENDS]->() RETURN x.name",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows.len(), 1);
    assert_eq!(output.rows[0].to_json(), json!({"x.name": "Carol"}));
}

#[test]
fn shared_variable_joins_two_match_clauses() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (a:User)-[:FRIENDS]->(b) MATCH (b)-[:FRIENDS]->(c) RETURN a.name, c.name",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(
        output.rows[0].to_json(),
        json!({"a.name": "Alice", "c.name": "Carol"})
    );
}

#[test]
fn edge_property_specs_match_nothing() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (a)-[:FRIENDS {since: 2020}]->(b) RETURN b",
        ExecOptions::default(),
    )
    .unwrap();
    assert!(output.rows.is_empty());
}

#[test]
fn returning_a_variable_materialises_the_node() {
    let index = friends_chain();
    let output = query_collect(
        &index,
        "MATCH (u:User) WHERE u.name = 'Alice' RETURN u",
        ExecOptions::default(),
    )
    .unwrap();
    let row = output.rows[0].to_json();
    assert_eq!(row["u"]["name"], json!("Alice"));
    assert_eq!(row["u"]["type"], json!("User"));
    assert_eq!(row["u"]["id"], json!(1));
}

#[test]
fn timeout_aborts_execution() {
    let index = friends_chain();
    let err = query_collect(
        &index,
        "MATCH (u:User)-[:FRIENDS]->(f) RETURN f",
        ExecOptions {
            max_depth: 10,
            deadline: Some(std::time::Instant::now() - std::time::Duration::from_secs(1)),
        },
    )
    .unwrap_err();
    assert_eq!(err, rserv_query::Error::Timeout);
}

#[test]
fn syntax_errors_carry_position() {
    let index = friends_chain();
    let err = query_collect(&index, "MATCH u RETURN u", ExecOptions::default()).unwrap_err();
    assert!(matches!(err, rserv_query::Error::Syntax { .. }));
}
