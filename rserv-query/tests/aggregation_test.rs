use rserv_query::{Error, ExecOptions, query_collect};
use rserv_storage::graph::{EdgeIndex, GraphMode};
use serde_json::json;

fn props(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().unwrap().clone()
}

fn city_index() -> EdgeIndex {
    let index = EdgeIndex::new(GraphMode::Memory, None);
    let people = [
        (1, "Alice", "Oslo", 30),
        (2, "Bob", "Oslo", 40),
        (3, "Carol", "Bergen", 50),
        (4, "Dave", "Bergen", 20),
    ];
    for (id, name, city, age) in people {
        index
            .upsert_document(
                "users",
                id,
                props(json!({"id": id, "name": name, "city": city, "age": age})),
                &[],
            )
            .unwrap();
    }
    index
}

#[test]
fn count_star_groups_by_plain_columns() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) RETURN n.city, COUNT(*) ORDER BY n.city",
        ExecOptions::default(),
    )
    .unwrap();
    let rows: Vec<_> = output.rows.iter().map(|r| r.to_json()).collect();
    assert_eq!(
        rows,
        vec![
            json!({"n.city": "Bergen", "count(*)": 2}),
            json!({"n.city": "Oslo", "count(*)": 2}),
        ]
    );
}

#[test]
fn sum_and_avg_over_groups() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) RETURN n.city, SUM(n.age) AS total, AVG(n.age) AS mean ORDER BY n.city",
        ExecOptions::default(),
    )
    .unwrap();
    let rows: Vec<_> = output.rows.iter().map(|r| r.to_json()).collect();
    assert_eq!(
        rows,
        vec![
            json!({"n.city": "Bergen", "total": 70, "mean": 35.0}),
            json!({"n.city": "Oslo", "total": 70, "mean": 35.0}),
        ]
    );
}

#[test]
fn global_aggregate_yields_one_row() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) RETURN COUNT(*), MIN(n.age), MAX(n.age)",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows.len(), 1);
    let row = output.rows[0].to_json();
    assert_eq!(row["count(*)"], json!(4));
    assert_eq!(row["min(n.age)"], json!(20));
    assert_eq!(row["max(n.age)"], json!(50));
}

#[test]
fn distinct_collects_sorted_unique_values() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) RETURN DISTINCT(n.city) AS cities",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(
        output.rows[0].to_json(),
        json!({"cities": ["Bergen", "Oslo"]})
    );
}

#[test]
fn sum_over_non_numeric_is_a_runtime_error() {
    let index = city_index();
    let err = query_collect(
        &index,
        "MATCH (n:User) RETURN SUM(n.name)",
        ExecOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}

#[test]
fn with_projects_before_return() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) WITH n.age AS a RETURN AVG(a) AS mean",
        ExecOptions::default(),
    )
    .unwrap();
    assert_eq!(output.rows[0].to_json(), json!({"mean": 35.0}));
}

#[test]
fn nested_aggregation_is_rejected() {
    let index = city_index();
    let err = query_collect(
        &index,
        "MATCH (n:User) WITH COUNT(n) AS c RETURN AVG(c)",
        ExecOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Syntax { .. }));
}

#[test]
fn order_by_desc_with_limit() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) RETURN n.name, n.age ORDER BY n.age DESC LIMIT 2",
        ExecOptions::default(),
    )
    .unwrap();
    let names: Vec<_> = output
        .rows
        .iter()
        .map(|r| r.to_json()["n.name"].clone())
        .collect();
    assert_eq!(names, vec![json!("Carol"), json!("Bob")]);
}

#[test]
fn order_by_alias_of_projected_column() {
    let index = city_index();
    let output = query_collect(
        &index,
        "MATCH (n:User) RETURN n.name AS who ORDER BY who",
        ExecOptions::default(),
    )
    .unwrap();
    let first = output.rows[0].to_json();
    assert_eq!(first["who"], json!("Alice"));
}

#[test]
fn same_query_is_deterministic() {
    let index = city_index();
    let run = || {
        query_collect(
            &index,
            "MATCH (n:User) RETURN n.name",
            ExecOptions::default(),
        )
        .unwrap()
        .rows
        .iter()
        .map(|r| r.to_json())
        .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}
