use rserv::storage::store::PatchNull;
use rserv::{Config, JobStatus, Rserv, SubmitOutcome};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn write_schema(base: &Path, entity: &str, fields: Value) {
    let dir = base.join("schema").join("default");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join(format!("{entity}.json")),
        serde_json::to_vec(&fields).unwrap(),
    )
    .unwrap();
}

fn social_schema(base: &Path) {
    write_schema(
        base,
        "users",
        json!({
            "name": {"type": "string"},
            "friends": {"type": "REF", "entity": "users"}
        }),
    );
    write_schema(
        base,
        "posts",
        json!({
            "title": {"type": "string"},
            "author_id": {"type": "REF", "entity": "users"}
        }),
    );
}

fn open(base: &Path, tweak: impl FnOnce(&mut Config)) -> Rserv {
    let mut config = Config {
        data_dir: base.to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);
    Rserv::open(config).unwrap()
}

fn wait_terminal(rserv: &Rserv, id: Uuid) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let view = rserv.graph_query_status(id).unwrap();
        match view.status {
            JobStatus::Completed | JobStatus::Failed => return view.status,
            _ if Instant::now() > deadline => panic!("job {id} never finished"),
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

fn friends_chain(rserv: &Rserv) {
    rserv
        .create_document("users", json!({"name": "Alice"}))
        .unwrap();
    rserv
        .create_document("users", json!({"name": "Bob"}))
        .unwrap();
    rserv
        .create_document("users", json!({"name": "Carol"}))
        .unwrap();
    rserv
        .patch_document("users", 1, json!({"friends": {"id": 2}}))
        .unwrap();
    rserv
        .patch_document("users", 2, json!({"friends": {"id": 3}}))
        .unwrap();
}

#[test]
fn friends_of_friends_query() {
    let dir = tempfile::tempdir().unwrap();
    social_schema(dir.path());
    let rserv = open(dir.path(), |_| {});
    friends_chain(&rserv);

    let outcome = rserv
        .submit_graph_query(
            "MATCH (u:User)-[:FRIENDS]->(f)-[:FRIENDS]->(g) WHERE u.name='Alice' RETURN g.name",
            None,
        )
        .unwrap();
    let SubmitOutcome::Accepted { query_id } = outcome else {
        panic!("expected a fresh job");
    };
    assert_eq!(wait_terminal(&rserv, query_id), JobStatus::Completed);
    let result = rserv.graph_query_result(query_id).unwrap();
    assert_eq!(result["results"], json!([{"g.name": "Carol"}]));
}

#[test]
fn cascade_delete_shrinks_the_graph() {
    let dir = tempfile::tempdir().unwrap();
    social_schema(dir.path());
    let rserv = open(dir.path(), |c| c.cascading_delete = true);

    rserv
        .create_document("users", json!({"name": "Alice"}))
        .unwrap();
    rserv
        .save_document("posts", 10, json!({"title": "a", "author_id": {"id": 1}}))
        .unwrap();
    rserv
        .save_document("posts", 11, json!({"title": "b", "author_id": {"id": 1}}))
        .unwrap();

    let before = rserv.statistics().unwrap().node_count;
    rserv.delete_document("users", 1, true).unwrap();

    let err = rserv.get_document("posts", 10).unwrap_err();
    assert_eq!(err.status_code(), 404);
    let after = rserv.statistics().unwrap().node_count;
    assert_eq!(before - after, 3);
}

#[test]
fn shortest_path_with_depth_bound() {
    let dir = tempfile::tempdir().unwrap();
    social_schema(dir.path());
    let rserv = open(dir.path(), |_| {});

    for name in ["a", "b", "c", "d"] {
        rserv
            .create_document("users", json!({"name": name}))
            .unwrap();
    }
    for (from, to) in [(1u64, 2u64), (2, 3), (3, 4)] {
        rserv
            .patch_document("users", from, json!({"friends": {"id": to}}))
            .unwrap();
    }

    assert_eq!(rserv.shortest_path(1, 4, None).unwrap(), vec![1, 2, 3, 4]);
    let err = rserv.shortest_path(1, 4, Some(2)).unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(rserv.path_exists(1, 4, Some(3)).unwrap());
    assert!(!rserv.path_exists(1, 4, Some(2)).unwrap());
}

#[test]
fn degree_directions_on_a_star() {
    let dir = tempfile::tempdir().unwrap();
    social_schema(dir.path());
    let rserv = open(dir.path(), |_| {});

    for name in ["hub", "b", "c", "d"] {
        rserv
            .create_document("users", json!({"name": name}))
            .unwrap();
    }
    rserv
        .patch_document("users", 1, json!({"friends": [{"id": 2}, {"id": 3}]}))
        .unwrap();
    rserv
        .patch_document("users", 4, json!({"friends": {"id": 1}}))
        .unwrap();

    let degree = |direction: Option<&str>| {
        rserv.node_degree(1, direction).unwrap()["degree"]
            .as_u64()
            .unwrap()
    };
    assert_eq!(degree(Some("out")), 2);
    assert_eq!(degree(Some("in")), 1);
    assert_eq!(degree(Some("all")), 3);
    assert_eq!(degree(None), 3);
}

#[test]
fn async_query_caching_and_write_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    social_schema(dir.path());
    let rserv = open(dir.path(), |_| {});
    friends_chain(&rserv);

    let query = "MATCH (u:User) WHERE u.name = 'Alice' RETURN u.name";
    let SubmitOutcome::Accepted { query_id } = rserv.submit_graph_query(query, None).unwrap()
    else {
        panic!("expected a fresh job");
    };
    assert_eq!(wait_terminal(&rserv, query_id), JobStatus::Completed);
    let first = rserv.graph_query_result(query_id).unwrap();

    // Identical query (modulo whitespace and keyword case) hits the cache.
    let cached = rserv
        .submit_graph_query(
            "match (u:User)  where u.name = 'Alice'  return u.name",
            None,
        )
        .unwrap();
    match cached {
        SubmitOutcome::Cached { results } => assert_eq!(json!(results), first["results"]),
        SubmitOutcome::Accepted { .. } => panic!("expected a cache hit"),
    }

    // Any write evicts the cache; the same query becomes a new job.
    rserv
        .create_document("users", json!({"name": "Mallory"}))
        .unwrap();
    assert!(matches!(
        rserv.submit_graph_query(query, None).unwrap(),
        SubmitOutcome::Accepted { .. }
    ));
}

#[test]
fn patch_null_policies() {
    let delete_dir = tempfile::tempdir().unwrap();
    social_schema(delete_dir.path());
    let rserv = open(delete_dir.path(), |c| c.patch_null = PatchNull::Delete);
    rserv
        .create_document("users", json!({"name": "Alice", "age": 30}))
        .unwrap();
    rserv
        .patch_document("users", 1, json!({"age": null}))
        .unwrap();
    assert!(rserv.get_document("users", 1).unwrap().get("age").is_none());

    let store_dir = tempfile::tempdir().unwrap();
    social_schema(store_dir.path());
    let rserv = open(store_dir.path(), |c| c.patch_null = PatchNull::Store);
    rserv
        .create_document("users", json!({"name": "Alice", "age": 30}))
        .unwrap();
    rserv
        .patch_document("users", 1, json!({"age": null}))
        .unwrap();
    assert_eq!(rserv.get_document("users", 1).unwrap()["age"], Value::Null);
}
